//! Source checkpoint discovery and end-to-end conversion.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::constants::{
    CONTAINER_F16_FILE, CONTAINER_F32_FILE, DIMS_FILE, HF_CONFIG_FILE, HF_VOCAB_FILE,
    MEL_FILTERS_FILE, WEIGHTS_FILE,
};
use crate::container::{ContainerReader, ContainerWriter, EncodeSummary};
use crate::hparams::Hyperparameters;
use crate::mel::MelFilters;
use crate::remap::KeyRemapper;
use crate::tensor::{Dtype, TensorPolicy, TensorRecord};
use crate::tokenizer::{EndOfText, Vocabulary};
use crate::weights::{WeightStore, write_safetensors};

/// How tensor names and metadata are laid out in the model directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceLayout {
    /// `model.safetensors` + `dims.json`, container tensor names.
    OpenAi,
    /// `model.safetensors` + `config.json` + `vocab.json`, Transformers tensor names.
    HuggingFace,
}

impl SourceLayout {
    pub fn remapper(self) -> KeyRemapper {
        match self {
            Self::OpenAi => KeyRemapper::identity(),
            Self::HuggingFace => KeyRemapper::whisper_hf(),
        }
    }
}

#[derive(Debug)]
pub struct ModelMetadata {
    pub layout: SourceLayout,
    pub hparams: Hyperparameters,
    pub mel_filters: MelFilters,
    pub vocab: Vocabulary,
}

#[derive(Debug)]
pub struct ModelBundle {
    pub metadata: ModelMetadata,
    pub weights: WeightStore,
    pub remapper: KeyRemapper,
}

/// `path` itself when it is a file, otherwise `path/default_name`.
fn resolve_input(path: &Path, default_name: &str) -> PathBuf {
    if path.is_file() {
        path.to_path_buf()
    } else {
        path.join(default_name)
    }
}

fn model_dir(path: &Path) -> &Path {
    if path.is_file() {
        path.parent().unwrap_or(Path::new("."))
    } else {
        path
    }
}

/// A whisper checkout keeps its assets under `whisper/assets`.
fn assets_root(dir: &Path) -> PathBuf {
    let nested = dir.join("whisper").join("assets");
    if nested.is_dir() { nested } else { dir.to_path_buf() }
}

fn read_text(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))
}

/// Tokenizer for the OpenAI layout: tiktoken first, then `vocab.json`.
fn load_openai_vocab(assets: &Path, multilingual: bool) -> Result<Vocabulary> {
    let name = if multilingual { "multilingual" } else { "gpt2" };
    let tiktoken = assets.join(format!("{name}.tiktoken"));
    if tiktoken.is_file() {
        tracing::info!(path = %tiktoken.display(), "loading tiktoken vocabulary");
        let text = read_text(&tiktoken)?;
        return Vocabulary::from_tiktoken_str(&text)
            .with_context(|| format!("parse {}", tiktoken.display()));
    }

    let json = assets.join(name).join(HF_VOCAB_FILE);
    tracing::warn!(
        missing = %tiktoken.display(),
        fallback = %json.display(),
        "tiktoken file not found, falling back to vocab.json"
    );
    let text = read_text(&json)?;
    Vocabulary::from_vocab_json_str(&text, EndOfText::Drop)
        .with_context(|| format!("parse {}", json.display()))
}

impl ModelMetadata {
    pub fn load(
        layout: SourceLayout,
        model: impl AsRef<Path>,
        assets: impl AsRef<Path>,
        use_f16: bool,
    ) -> Result<Self> {
        let dir = model_dir(model.as_ref());
        let assets = assets_root(assets.as_ref());

        let (hparams, vocab) = match layout {
            SourceLayout::OpenAi => {
                let path = dir.join(DIMS_FILE);
                let hparams = Hyperparameters::from_dims_json(&read_text(&path)?, use_f16)
                    .with_context(|| format!("parse {}", path.display()))?;
                let vocab = load_openai_vocab(&assets, hparams.is_multilingual())?;
                (hparams, vocab)
            }
            SourceLayout::HuggingFace => {
                let path = dir.join(HF_CONFIG_FILE);
                let hparams = Hyperparameters::from_hf_config_json(&read_text(&path)?, use_f16)
                    .with_context(|| format!("parse {}", path.display()))?;
                let path = dir.join(HF_VOCAB_FILE);
                let vocab = Vocabulary::from_vocab_json_str(&read_text(&path)?, EndOfText::Keep)
                    .with_context(|| format!("parse {}", path.display()))?;
                (hparams, vocab)
            }
        };

        let n_mels = usize::try_from(hparams.n_mels)
            .with_context(|| format!("invalid n_mels {}", hparams.n_mels))?;
        let mel_path = assets.join(MEL_FILTERS_FILE);
        let mel_filters = MelFilters::from_npz_path(&mel_path, n_mels)
            .with_context(|| format!("load {}", mel_path.display()))?;

        tracing::info!(
            ?layout,
            n_vocab = hparams.n_vocab,
            n_tokens = vocab.len(),
            n_mels,
            "loaded model metadata"
        );
        Ok(Self {
            layout,
            hparams,
            mel_filters,
            vocab,
        })
    }
}

impl ModelBundle {
    pub fn load(
        layout: SourceLayout,
        model: impl AsRef<Path>,
        assets: impl AsRef<Path>,
        use_f16: bool,
    ) -> Result<Self> {
        let model = model.as_ref();
        let metadata = ModelMetadata::load(layout, model, assets, use_f16)?;
        let path = resolve_input(model, WEIGHTS_FILE);
        let weights =
            WeightStore::open(&path).with_context(|| format!("open {}", path.display()))?;
        Ok(Self {
            metadata,
            weights,
            remapper: layout.remapper(),
        })
    }

    /// Streams the container, one source tensor in memory at a time.
    pub fn write_container<W: Write>(&self, writer: W) -> Result<EncodeSummary> {
        let meta = &self.metadata;
        let policy = TensorPolicy::whisper(meta.hparams.use_f16);
        let mut out = ContainerWriter::new(
            writer,
            &meta.hparams,
            &meta.mel_filters,
            &meta.vocab,
            &policy,
        )?;

        for source in self.weights.names().context("list tensors")? {
            let Some(name) = self.remapper.remap(&source)? else {
                tracing::info!(name = %source, "skipping tensor");
                continue;
            };
            let tensor = self
                .weights
                .tensor_f32(&source)
                .with_context(|| format!("load tensor {source}"))?;
            if name != source {
                tracing::debug!(%source, %name, "renamed tensor");
            }
            out.push(&name, &tensor)
                .with_context(|| format!("encode tensor {name}"))?;
        }

        let (_, summary) = out.finish()?;
        Ok(summary)
    }
}

pub fn output_file_name(use_f16: bool) -> &'static str {
    if use_f16 {
        CONTAINER_F16_FILE
    } else {
        CONTAINER_F32_FILE
    }
}

/// Converts a source checkpoint and returns the path of the written container.
pub fn convert(
    layout: SourceLayout,
    model: impl AsRef<Path>,
    assets: impl AsRef<Path>,
    out_dir: impl AsRef<Path>,
    use_f16: bool,
) -> Result<PathBuf> {
    let bundle = ModelBundle::load(layout, model, assets, use_f16)?;
    let out_dir = out_dir.as_ref();
    std::fs::create_dir_all(out_dir)
        .with_context(|| format!("create {}", out_dir.display()))?;

    let path = out_dir.join(output_file_name(use_f16));
    // Staged next to the target so a failed conversion leaves no container.
    let mut staged = tempfile::NamedTempFile::new_in(out_dir)
        .with_context(|| format!("create temporary file in {}", out_dir.display()))?;
    let summary = bundle.write_container(BufWriter::new(staged.as_file_mut()))?;
    staged
        .persist(&path)
        .map_err(|e| e.error)
        .with_context(|| format!("persist {}", path.display()))?;
    tracing::info!(
        path = %path.display(),
        tensors = summary.tensors,
        f16 = summary.f16_tensors,
        f32 = summary.f32_tensors,
        "wrote container"
    );
    Ok(path)
}

/// Writes `model.safetensors` and `dims.json` from a container.
pub fn export_safetensors(
    container: impl AsRef<Path>,
    out_dir: impl AsRef<Path>,
) -> Result<PathBuf> {
    let container = container.as_ref();
    let out_dir = out_dir.as_ref();
    let file = File::open(container).with_context(|| format!("open {}", container.display()))?;
    let mut reader = ContainerReader::new(BufReader::new(file))
        .with_context(|| format!("read header of {}", container.display()))?;

    let policy = TensorPolicy::whisper(reader.hparams().use_f16);
    let mut records: Vec<TensorRecord> = Vec::new();
    for record in reader.tensors() {
        let record = record.with_context(|| format!("read {}", container.display()))?;
        records.push(record.restore_source_shape(&policy));
    }

    std::fs::create_dir_all(out_dir)
        .with_context(|| format!("create {}", out_dir.display()))?;
    let weights = out_dir.join(WEIGHTS_FILE);
    write_safetensors(&records, &weights)
        .with_context(|| format!("write {}", weights.display()))?;
    let dims = out_dir.join(DIMS_FILE);
    std::fs::write(&dims, reader.hparams().to_dims_json()?)
        .with_context(|| format!("write {}", dims.display()))?;

    tracing::info!(
        path = %weights.display(),
        tensors = records.len(),
        "exported safetensors"
    );
    Ok(weights)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordInfo {
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: Dtype,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContainerInfo {
    pub hparams: Hyperparameters,
    pub mel_rows: usize,
    pub mel_cols: usize,
    pub n_tokens: usize,
    pub records: Vec<RecordInfo>,
}

/// Reads the header and every record header, keeping no tensor data.
pub fn inspect(container: impl AsRef<Path>) -> Result<ContainerInfo> {
    let container = container.as_ref();
    let file = File::open(container).with_context(|| format!("open {}", container.display()))?;
    let mut reader = ContainerReader::new(BufReader::new(file))
        .with_context(|| format!("read header of {}", container.display()))?;

    let mut records = Vec::new();
    for record in reader.tensors() {
        let record = record.with_context(|| format!("read {}", container.display()))?;
        records.push(RecordInfo {
            name: record.name,
            shape: record.shape,
            dtype: record.dtype,
        });
    }
    Ok(ContainerInfo {
        hparams: *reader.hparams(),
        mel_rows: reader.mel_filters().rows(),
        mel_cols: reader.mel_filters().cols(),
        n_tokens: reader.vocab().len(),
        records,
    })
}
