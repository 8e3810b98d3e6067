use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use whisper_ggml::model::{self, SourceLayout};

#[derive(Debug, Parser)]
#[command(name = "whisper-ggml")]
#[command(about = "Convert Whisper checkpoints to and from the ggml model container", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Convert an OpenAI layout checkpoint (model.safetensors + dims.json).
    FromOpenai(ConvertArgs),
    /// Convert a Hugging Face checkpoint (model.safetensors + config.json + vocab.json).
    FromHf(ConvertArgs),
    /// Write model.safetensors and dims.json from a container.
    ToSafetensors {
        /// Container file.
        container: PathBuf,
        /// Output directory.
        out_dir: PathBuf,
    },
    /// Print the container header and tensor records.
    Inspect {
        /// Container file.
        container: PathBuf,
    },
}

#[derive(Debug, ClapArgs)]
struct ConvertArgs {
    /// Model directory, or its model.safetensors file.
    model: PathBuf,
    /// Whisper checkout or directory holding mel_filters.npz and the tokenizer files.
    assets: PathBuf,
    /// Output directory.
    out_dir: PathBuf,
    /// Any value stores every tensor as f32 and writes ggml-model-f32.bin.
    use_f32: Option<String>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match args.command {
        Command::FromOpenai(c) => run_convert(SourceLayout::OpenAi, c),
        Command::FromHf(c) => run_convert(SourceLayout::HuggingFace, c),
        Command::ToSafetensors { container, out_dir } => {
            let path = model::export_safetensors(&container, &out_dir)
                .context("export safetensors")?;
            info!(path = %path.display(), "done");
            Ok(())
        }
        Command::Inspect { container } => inspect(&container),
    }
}

fn run_convert(layout: SourceLayout, args: ConvertArgs) -> Result<()> {
    let use_f16 = args.use_f32.is_none();
    let path = model::convert(layout, &args.model, &args.assets, &args.out_dir, use_f16)
        .with_context(|| format!("convert {}", args.model.display()))?;
    info!(path = %path.display(), "done");
    Ok(())
}

fn inspect(container: &Path) -> Result<()> {
    let info = model::inspect(container).context("inspect container")?;
    let h = &info.hparams;
    info!(
        n_vocab = h.n_vocab,
        n_audio_ctx = h.n_audio_ctx,
        n_audio_state = h.n_audio_state,
        n_audio_head = h.n_audio_head,
        n_audio_layer = h.n_audio_layer,
        n_text_ctx = h.n_text_ctx,
        n_text_state = h.n_text_state,
        n_text_head = h.n_text_head,
        n_text_layer = h.n_text_layer,
        n_mels = h.n_mels,
        use_f16 = h.use_f16,
        "hyperparameters"
    );
    info!(
        mel_rows = info.mel_rows,
        mel_cols = info.mel_cols,
        tokens = info.n_tokens,
        tensors = info.records.len(),
        "sections"
    );
    for r in &info.records {
        info!(name = %r.name, shape = ?r.shape, dtype = ?r.dtype, "tensor");
    }
    Ok(())
}
