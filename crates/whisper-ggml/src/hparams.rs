//! Hyperparameter section and its JSON sources (`dims.json`, Hugging Face `config.json`).

use std::collections::BTreeMap;
use std::io::{Read, Write};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::{DEFAULT_TEXT_CTX, HPARAM_FIELD_COUNT};
use crate::wire::{WireReader, write_i32};
use crate::{Error, Result, Section};

/// Field order on disk.
pub const FIELD_NAMES: [&str; HPARAM_FIELD_COUNT] = [
    "n_vocab",
    "n_audio_ctx",
    "n_audio_state",
    "n_audio_head",
    "n_audio_layer",
    "n_text_ctx",
    "n_text_state",
    "n_text_head",
    "n_text_layer",
    "n_mels",
];

// (container field, Hugging Face config key)
const HF_FIELD_KEYS: [(&str, &str); HPARAM_FIELD_COUNT] = [
    ("n_vocab", "vocab_size"),
    ("n_audio_ctx", "max_source_positions"),
    ("n_audio_state", "d_model"),
    ("n_audio_head", "encoder_attention_heads"),
    ("n_audio_layer", "encoder_layers"),
    ("n_text_ctx", "max_length"),
    ("n_text_state", "d_model"),
    ("n_text_head", "decoder_attention_heads"),
    ("n_text_layer", "decoder_layers"),
    ("n_mels", "num_mel_bins"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hyperparameters {
    pub n_vocab: i32,
    pub n_audio_ctx: i32,
    pub n_audio_state: i32,
    pub n_audio_head: i32,
    pub n_audio_layer: i32,
    pub n_text_ctx: i32,
    pub n_text_state: i32,
    pub n_text_head: i32,
    pub n_text_layer: i32,
    pub n_mels: i32,
    /// Whether tensor payloads default to f16. Not part of `dims.json`.
    #[serde(skip)]
    pub use_f16: bool,
}

impl Hyperparameters {
    /// Builds the section from a name → value map. Extra keys are ignored.
    pub fn from_fields(fields: &BTreeMap<String, i64>, use_f16: bool) -> Result<Self> {
        let mut values = [0i32; HPARAM_FIELD_COUNT];
        for (slot, name) in values.iter_mut().zip(FIELD_NAMES) {
            let raw = *fields
                .get(name)
                .ok_or_else(|| Error::MissingField(name.to_string()))?;
            *slot = i32::try_from(raw).map_err(|_| Error::InvalidSection {
                section: Section::Hyperparams,
                reason: format!("{name}={raw} does not fit in i32"),
            })?;
        }
        Ok(Self::from_array(values, use_f16))
    }

    fn from_array(v: [i32; HPARAM_FIELD_COUNT], use_f16: bool) -> Self {
        Self {
            n_vocab: v[0],
            n_audio_ctx: v[1],
            n_audio_state: v[2],
            n_audio_head: v[3],
            n_audio_layer: v[4],
            n_text_ctx: v[5],
            n_text_state: v[6],
            n_text_head: v[7],
            n_text_layer: v[8],
            n_mels: v[9],
            use_f16,
        }
    }

    /// Fields in on-disk order.
    pub fn fields(&self) -> [(&'static str, i32); HPARAM_FIELD_COUNT] {
        let v = [
            self.n_vocab,
            self.n_audio_ctx,
            self.n_audio_state,
            self.n_audio_head,
            self.n_audio_layer,
            self.n_text_ctx,
            self.n_text_state,
            self.n_text_head,
            self.n_text_layer,
            self.n_mels,
        ];
        let mut out = [("", 0); HPARAM_FIELD_COUNT];
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = (FIELD_NAMES[i], v[i]);
        }
        out
    }

    pub fn with_f16(mut self, use_f16: bool) -> Self {
        self.use_f16 = use_f16;
        self
    }

    pub fn is_multilingual(&self) -> bool {
        self.n_vocab >= crate::constants::MULTILINGUAL_N_VOCAB
    }

    pub fn encode<W: Write>(&self, w: &mut W) -> Result<()> {
        for (_, value) in self.fields() {
            write_i32(w, value)?;
        }
        write_i32(w, i32::from(self.use_f16))?;
        Ok(())
    }

    pub fn decode<R: Read>(r: &mut WireReader<R>) -> Result<Self> {
        let mut values = [0i32; HPARAM_FIELD_COUNT];
        for slot in &mut values {
            *slot = r.read_i32(Section::Hyperparams)?;
        }
        let use_f16 = match r.read_i32(Section::Hyperparams)? {
            0 => false,
            1 => true,
            other => {
                return Err(Error::InvalidSection {
                    section: Section::Hyperparams,
                    reason: format!("f16 flag must be 0 or 1, got {other}"),
                });
            }
        };
        Ok(Self::from_array(values, use_f16))
    }

    /// Parses an OpenAI-style `dims.json` (keys are the container field names).
    pub fn from_dims_json(json: &str, use_f16: bool) -> Result<Self> {
        let raw: BTreeMap<String, Value> = serde_json::from_str(json)?;
        let mut fields = BTreeMap::new();
        for (key, value) in raw {
            if let Some(v) = value.as_i64() {
                fields.insert(key, v);
            }
        }
        Self::from_fields(&fields, use_f16)
    }

    /// Parses a Hugging Face Whisper `config.json`.
    pub fn from_hf_config_json(json: &str, use_f16: bool) -> Result<Self> {
        let raw: BTreeMap<String, Value> = serde_json::from_str(json)?;
        let text_ctx = resolve_max_length(&raw);

        let mut fields = BTreeMap::new();
        for (field, key) in HF_FIELD_KEYS {
            let value = if key == "max_length" {
                Some(text_ctx)
            } else {
                raw.get(key).and_then(Value::as_i64)
            };
            match value {
                Some(v) => {
                    fields.insert(field.to_string(), v);
                }
                None => return Err(Error::MissingField(key.to_string())),
            }
        }
        Self::from_fields(&fields, use_f16)
    }

    pub fn to_dims_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// `max_length`, falling back to `max_target_positions` and then the default.
fn resolve_max_length(raw: &BTreeMap<String, Value>) -> i64 {
    let fallback = raw
        .get("max_target_positions")
        .and_then(Value::as_i64)
        .unwrap_or(DEFAULT_TEXT_CTX);

    match raw.get("max_length") {
        None | Some(Value::Null) => fallback,
        Some(Value::Number(n)) => match (n.as_i64(), n.as_f64()) {
            (Some(v), _) => v,
            (None, Some(f)) => f as i64,
            _ => fallback,
        },
        Some(Value::String(s)) => s.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(value = %s, "invalid max_length, using {DEFAULT_TEXT_CTX}");
            DEFAULT_TEXT_CTX
        }),
        Some(other) => {
            tracing::warn!(value = %other, "invalid max_length, using {DEFAULT_TEXT_CTX}");
            DEFAULT_TEXT_CTX
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::{FIELD_NAMES, Hyperparameters};
    use crate::Error;
    use crate::wire::WireReader;

    fn tiny() -> Hyperparameters {
        Hyperparameters {
            n_vocab: 51865,
            n_audio_ctx: 1500,
            n_audio_state: 384,
            n_audio_head: 6,
            n_audio_layer: 4,
            n_text_ctx: 448,
            n_text_state: 384,
            n_text_head: 6,
            n_text_layer: 4,
            n_mels: 80,
            use_f16: true,
        }
    }

    #[test]
    fn encodes_fields_in_fixed_order_then_flag() {
        let mut buf = Vec::new();
        tiny().encode(&mut buf).expect("encode");
        assert_eq!(buf.len(), 11 * 4);

        let ints: Vec<i32> = buf
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(ints, vec![51865, 1500, 384, 6, 4, 448, 384, 6, 4, 80, 1]);

        let back = Hyperparameters::decode(&mut WireReader::new(buf.as_slice())).expect("decode");
        assert_eq!(back, tiny());
    }

    #[test]
    fn missing_field_is_reported_by_name() {
        let mut fields: BTreeMap<String, i64> = FIELD_NAMES
            .iter()
            .map(|name| (name.to_string(), 1))
            .collect();
        fields.remove("n_text_head");
        let err = Hyperparameters::from_fields(&fields, false).expect_err("missing");
        assert!(matches!(err, Error::MissingField(ref f) if f == "n_text_head"));
    }

    #[test]
    fn truncated_hyperparameters_fail() {
        let mut buf = Vec::new();
        tiny().encode(&mut buf).expect("encode");
        buf.truncate(30);
        let err = Hyperparameters::decode(&mut WireReader::new(buf.as_slice())).expect_err("short");
        assert!(matches!(err, Error::TruncatedStream { .. }));
    }

    #[test]
    fn rejects_flag_outside_zero_one() {
        let mut buf = Vec::new();
        tiny().encode(&mut buf).expect("encode");
        let n = buf.len();
        buf[n - 4..].copy_from_slice(&7i32.to_le_bytes());
        assert!(Hyperparameters::decode(&mut WireReader::new(buf.as_slice())).is_err());
    }

    #[test]
    fn parses_dims_json() {
        let json = r#"{"n_mels": 80, "n_vocab": 51865, "n_audio_ctx": 1500, "n_audio_state": 384,
            "n_audio_head": 6, "n_audio_layer": 4, "n_text_ctx": 448, "n_text_state": 384,
            "n_text_head": 6, "n_text_layer": 4}"#;
        let h = Hyperparameters::from_dims_json(json, true).expect("dims");
        assert_eq!(h, tiny());
        assert!(h.is_multilingual());

        let out = h.to_dims_json().expect("json");
        let again = Hyperparameters::from_dims_json(&out, true).expect("reparse");
        assert_eq!(again, h);
    }

    #[test]
    fn parses_hf_config_with_max_length_fallbacks() {
        let base = r#""vocab_size": 51865, "max_source_positions": 1500, "d_model": 384,
            "encoder_attention_heads": 6, "encoder_layers": 4, "decoder_attention_heads": 6,
            "decoder_layers": 4, "num_mel_bins": 80"#;

        let with_len = format!("{{{base}, \"max_length\": 448}}");
        let h = Hyperparameters::from_hf_config_json(&with_len, true).expect("config");
        assert_eq!(h, tiny());

        let null_len = format!("{{{base}, \"max_length\": null, \"max_target_positions\": 224}}");
        let h = Hyperparameters::from_hf_config_json(&null_len, true).expect("config");
        assert_eq!(h.n_text_ctx, 224);

        let str_len = format!("{{{base}, \"max_length\": \"300\"}}");
        let h = Hyperparameters::from_hf_config_json(&str_len, true).expect("config");
        assert_eq!(h.n_text_ctx, 300);

        let bad_len = format!("{{{base}, \"max_length\": \"long\"}}");
        let h = Hyperparameters::from_hf_config_json(&bad_len, true).expect("config");
        assert_eq!(h.n_text_ctx, 448);
    }

    #[test]
    fn hf_config_missing_key_names_the_source_key() {
        let json = r#"{"vocab_size": 51865}"#;
        let err = Hyperparameters::from_hf_config_json(json, false).expect_err("missing");
        assert!(matches!(err, Error::MissingField(ref k) if k == "max_source_positions"));
    }
}
