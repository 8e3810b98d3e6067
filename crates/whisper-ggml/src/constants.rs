//! Container and conversion constants.

// "ggml" in hex, written as a little-endian i32 at offset 0.
pub const MAGIC: u32 = 0x6767_6d6c;

// Number of i32 hyperparameter fields, not counting the f16 flag.
pub const HPARAM_FIELD_COUNT: usize = 10;

// Vocabulary sizes at or above this select the multilingual tokenizer assets.
pub const MULTILINGUAL_N_VOCAB: i32 = 51_865;

// Fallback text context when a Hugging Face config carries no usable `max_length`.
pub const DEFAULT_TEXT_CTX: i64 = 448;

pub const END_OF_TEXT_TOKEN: &str = "<|endoftext|>";

// 1-D conv biases persisted as [n, 1].
pub const COLUMN_BIAS_TENSORS: [&str; 2] = ["encoder.conv1.bias", "encoder.conv2.bias"];

// Always stored as f32, even when the container is f16.
pub const F32_TENSORS: [&str; 4] = [
    "encoder.conv1.bias",
    "encoder.conv2.bias",
    "encoder.positional_embedding",
    "decoder.positional_embedding",
];

// Tied to the token embedding, dropped from Hugging Face checkpoints.
pub const SKIPPED_HF_TENSORS: [&str; 1] = ["proj_out.weight"];

// File names.
pub const CONTAINER_F16_FILE: &str = "ggml-model.bin";
pub const CONTAINER_F32_FILE: &str = "ggml-model-f32.bin";
pub const WEIGHTS_FILE: &str = "model.safetensors";
pub const DIMS_FILE: &str = "dims.json";
pub const HF_CONFIG_FILE: &str = "config.json";
pub const HF_VOCAB_FILE: &str = "vocab.json";
pub const MEL_FILTERS_FILE: &str = "mel_filters.npz";
