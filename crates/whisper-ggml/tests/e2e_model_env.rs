use whisper_ggml::constants::MULTILINGUAL_N_VOCAB;
use whisper_ggml::model::{self, ModelBundle, SourceLayout};
use whisper_ggml::{ContainerReader, Dtype};

/// Optional integration test.
///
/// Expects an OpenAI layout model (`model.safetensors` + `dims.json`) whose
/// directory also holds, or is, the whisper assets checkout.
///
/// Run locally with:
/// `WHISPER_GGML_MODEL_DIR=/path/to/model cargo test -p whisper-ggml --test e2e_model_env -- --nocapture`
#[test]
fn model_dir_env_smoke() {
    let Some(model_dir) = std::env::var_os("WHISPER_GGML_MODEL_DIR") else {
        eprintln!("skipping: WHISPER_GGML_MODEL_DIR is not set");
        return;
    };
    let assets = std::env::var_os("WHISPER_GGML_ASSETS_DIR").unwrap_or_else(|| model_dir.clone());

    let bundle =
        ModelBundle::load(SourceLayout::OpenAi, &model_dir, &assets, true).expect("load bundle");
    let meta = &bundle.metadata;
    assert_eq!(meta.mel_filters.rows(), meta.hparams.n_mels as usize);
    if meta.hparams.n_vocab >= MULTILINGUAL_N_VOCAB {
        assert!(meta.vocab.len() >= 50_257);
    }

    let names = bundle.weights.names().expect("list tensor names");
    assert!(
        names.iter().any(|n| n == "encoder.conv1.bias"),
        "missing encoder conv1 bias"
    );

    let out = tempfile::tempdir().expect("tempdir");
    let path = model::convert(SourceLayout::OpenAi, &model_dir, &assets, out.path(), true)
        .expect("convert");

    let file = std::fs::File::open(&path).expect("open container");
    let mut reader = ContainerReader::new(std::io::BufReader::new(file)).expect("header");
    assert_eq!(reader.vocab().len(), meta.vocab.len());
    let mut count = 0;
    for record in reader.tensors() {
        let record = record.expect("record");
        if record.name == "encoder.conv1.bias" {
            assert_eq!(record.dtype, Dtype::F32);
            assert_eq!(record.shape.len(), 2);
        }
        count += 1;
    }
    assert_eq!(count, names.len());
}
