//! Whisper ggml model container (Rust) core library.
//!
//! This crate provides:
//! - Container encode/decode (hyperparameters, mel filters, vocabulary, tensors)
//! - Source checkpoint loading (OpenAI and Hugging Face safetensors layouts)
//! - Safetensors export of a decoded container

pub mod constants;
pub mod container;
pub mod hparams;
pub mod mel;
pub mod model;
pub mod remap;
pub mod tensor;
pub mod tokenizer;
pub mod weights;
pub mod wire;

pub use container::{
    Container, ContainerReader, ContainerWriter, EncodeSummary, decode, encode, encode_into,
};
pub use hparams::Hyperparameters;
pub use mel::MelFilters;
pub use remap::{KeyRemapper, RemapTable};
pub use tensor::{Dtype, TensorPolicy, TensorReader, TensorRecord, TrailingBytes};
pub use tokenizer::{EndOfText, Vocabulary};
pub use weights::TensorF32;

use thiserror::Error;

/// Where in the container an error was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Magic,
    Hyperparams,
    MelFilters,
    Vocab { token: usize },
    Tensor { record: usize },
}

impl std::fmt::Display for Section {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Magic => write!(f, "magic"),
            Self::Hyperparams => write!(f, "hyperparameters"),
            Self::MelFilters => write!(f, "mel filters"),
            Self::Vocab { token } => write!(f, "vocabulary (token {token})"),
            Self::Tensor { record } => write!(f, "tensor record {record}"),
        }
    }
}

/// The part of a tensor record being read when the stream ran out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordPart {
    Header,
    Dims,
    Name,
    Data,
}

impl std::fmt::Display for RecordPart {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Header => "header",
            Self::Dims => "dims",
            Self::Name => "name",
            Self::Data => "data",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("bad magic: expected {expected:#010x}, found {found:#010x}")]
    BadMagic { expected: u32, found: u32 },
    #[error("missing hyperparameter `{0}`")]
    MissingField(String),
    #[error("cannot map tensor `{name}`: unknown role `{segment}`")]
    UnmappableName { name: String, segment: String },
    #[error("truncated stream in {section} at offset {offset}: needed {needed} bytes, got {got}")]
    TruncatedStream {
        section: Section,
        offset: u64,
        needed: usize,
        got: usize,
    },
    #[error("truncated tensor record {record} ({part}) at offset {offset}: needed {needed} bytes, got {got}")]
    TruncatedRecord {
        record: usize,
        part: RecordPart,
        offset: u64,
        needed: usize,
        got: usize,
    },
    #[error("malformed vocabulary token {rank}: character {ch:?} has no byte mapping")]
    MalformedToken { rank: usize, ch: char },
    #[error("unsupported dtype tag {tag} in tensor record {record}")]
    UnsupportedDtype { record: usize, tag: i32 },
    #[error("invalid {section}: {reason}")]
    InvalidSection { section: Section, reason: String },
    #[error("invalid tensor `{name}`: {reason}")]
    InvalidRecord { name: String, reason: String },
    #[error("invalid vocabulary: {0}")]
    InvalidVocabulary(String),
    #[error("invalid npy array `{name}`: {reason}")]
    Npy { name: String, reason: String },
    #[error("base64 error in {context}: {source}")]
    Base64 {
        context: String,
        source: base64::DecodeError,
    },
    #[error("weights error: {0}")]
    Weights(#[from] weights::WeightError),
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
