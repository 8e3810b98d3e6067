//! Tensor-name remapping from Hugging Face Whisper checkpoints to container names.
//!
//! Block tensors (`{encoder,decoder}.layers.N.<role>.<param>`) are classified
//! into a [`PathRole`] by [`parse_tensor_path`] and re-rendered with the layer
//! index preserved. Every other name goes through an ordered substring
//! substitution table ([`RemapTable`]).

use crate::{Error, Result};

/// Hugging Face → OpenAI substitutions, in application order.
///
/// `layers` appears twice, as in the table this was taken from; see
/// [`RemapTable::new`] for how duplicates resolve.
const WHISPER_HF_TABLE: &[(&str, &str)] = &[
    ("layers", "blocks"),
    ("fc1", "mlp.0"),
    ("fc2", "mlp.2"),
    ("final_layer_norm", "mlp_ln"),
    ("layers", "blocks"),
    (".self_attn.q_proj", ".attn.query"),
    (".self_attn.k_proj", ".attn.key"),
    (".self_attn.v_proj", ".attn.value"),
    (".self_attn_layer_norm", ".attn_ln"),
    (".self_attn.out_proj", ".attn.out"),
    (".encoder_attn.q_proj", ".cross_attn.query"),
    (".encoder_attn.k_proj", ".cross_attn.key"),
    (".encoder_attn.v_proj", ".cross_attn.value"),
    (".encoder_attn_layer_norm", ".cross_attn_ln"),
    (".encoder_attn.out_proj", ".cross_attn.out"),
    ("decoder.layer_norm.", "decoder.ln."),
    ("encoder.layer_norm.", "encoder.ln_post."),
    ("embed_tokens", "token_embedding"),
    ("encoder.embed_positions.weight", "encoder.positional_embedding"),
    ("decoder.embed_positions.weight", "decoder.positional_embedding"),
    ("layer_norm", "ln_post"),
];

/// Ordered substring substitution table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemapTable {
    rules: Vec<(String, String)>,
}

impl RemapTable {
    /// Builds a table from rules in order.
    ///
    /// A pattern defined more than once keeps the position of its first
    /// definition and the replacement of its last. Empty patterns are dropped.
    pub fn new<I, P, R>(rules: I) -> Self
    where
        I: IntoIterator<Item = (P, R)>,
        P: Into<String>,
        R: Into<String>,
    {
        let mut out: Vec<(String, String)> = Vec::new();
        for (pattern, replacement) in rules {
            let pattern = pattern.into();
            let replacement = replacement.into();
            if pattern.is_empty() {
                tracing::warn!(%replacement, "dropping remap rule with empty pattern");
                continue;
            }
            match out.iter_mut().find(|(p, _)| *p == pattern) {
                Some(existing) => existing.1 = replacement,
                None => out.push((pattern, replacement)),
            }
        }
        Self { rules: out }
    }

    pub fn whisper_hf() -> Self {
        Self::new(WHISPER_HF_TABLE.iter().copied())
    }

    pub fn rules(&self) -> &[(String, String)] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Applies every rule in order; each rule sees the output of the previous ones.
    pub fn apply(&self, name: &str) -> String {
        let mut current = name.to_string();
        for (pattern, replacement) in &self.rules {
            if current.contains(pattern.as_str()) {
                current = current.replace(pattern.as_str(), replacement);
            }
        }
        current
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stack {
    Encoder,
    Decoder,
}

impl Stack {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Encoder => "encoder",
            Self::Decoder => "decoder",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Projection {
    Query,
    Key,
    Value,
    Out,
}

impl Projection {
    fn parse(segment: &str) -> Option<Self> {
        match segment {
            "q_proj" => Some(Self::Query),
            "k_proj" => Some(Self::Key),
            "v_proj" => Some(Self::Value),
            "out_proj" => Some(Self::Out),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::Key => "key",
            Self::Value => "value",
            Self::Out => "out",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedForwardLayer {
    /// `fc1`, the expanding projection.
    Up,
    /// `fc2`, the contracting projection.
    Down,
}

/// Role of a tensor inside one transformer block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathRole {
    SelfAttention(Projection),
    CrossAttention(Projection),
    SelfAttentionNorm,
    CrossAttentionNorm,
    FeedForward(FeedForwardLayer),
    FeedForwardNorm,
}

impl PathRole {
    /// Classifies the role segment between the layer index and the parameter name.
    pub fn classify(stack: Stack, segment: &str) -> Option<Self> {
        let role = match segment.split_once('.') {
            Some(("self_attn", proj)) => Self::SelfAttention(Projection::parse(proj)?),
            Some(("encoder_attn", proj)) => Self::CrossAttention(Projection::parse(proj)?),
            Some(_) => return None,
            None => match segment {
                "self_attn_layer_norm" => Self::SelfAttentionNorm,
                "encoder_attn_layer_norm" => Self::CrossAttentionNorm,
                "fc1" => Self::FeedForward(FeedForwardLayer::Up),
                "fc2" => Self::FeedForward(FeedForwardLayer::Down),
                "final_layer_norm" => Self::FeedForwardNorm,
                _ => return None,
            },
        };
        // The encoder has no cross-attention.
        let cross = matches!(role, Self::CrossAttention(_) | Self::CrossAttentionNorm);
        if cross && stack == Stack::Encoder {
            return None;
        }
        Some(role)
    }

    pub fn render(self) -> String {
        match self {
            Self::SelfAttention(p) => format!("attn.{}", p.as_str()),
            Self::CrossAttention(p) => format!("cross_attn.{}", p.as_str()),
            Self::SelfAttentionNorm => "attn_ln".to_string(),
            Self::CrossAttentionNorm => "cross_attn_ln".to_string(),
            Self::FeedForward(FeedForwardLayer::Up) => "mlp.0".to_string(),
            Self::FeedForward(FeedForwardLayer::Down) => "mlp.2".to_string(),
            Self::FeedForwardNorm => "mlp_ln".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TensorPath {
    Block {
        stack: Stack,
        index: usize,
        role: PathRole,
        param: String,
    },
    /// A block path whose role segment is not recognised.
    UnknownBlock {
        stack: Stack,
        index: usize,
        segment: String,
    },
    Other(String),
}

impl TensorPath {
    pub fn container_name(&self) -> Option<String> {
        match self {
            Self::Block {
                stack,
                index,
                role,
                param,
            } => Some(format!(
                "{}.blocks.{index}.{}.{param}",
                stack.as_str(),
                role.render()
            )),
            _ => None,
        }
    }
}

/// Parses a Hugging Face tensor name; a leading `model.` segment is dropped.
pub fn parse_tensor_path(name: &str) -> TensorPath {
    let name = name.strip_prefix("model.").unwrap_or(name);
    let parts: Vec<&str> = name.split('.').collect();

    let stack = match parts.first() {
        Some(&"encoder") => Stack::Encoder,
        Some(&"decoder") => Stack::Decoder,
        _ => return TensorPath::Other(name.to_string()),
    };
    if parts.len() < 5 || parts[1] != "layers" {
        return TensorPath::Other(name.to_string());
    }
    let Ok(index) = parts[2].parse::<usize>() else {
        return TensorPath::Other(name.to_string());
    };

    let segment = parts[3..parts.len() - 1].join(".");
    let param = parts[parts.len() - 1].to_string();
    match PathRole::classify(stack, &segment) {
        Some(role) => TensorPath::Block {
            stack,
            index,
            role,
            param,
        },
        None => TensorPath::UnknownBlock {
            stack,
            index,
            segment,
        },
    }
}

/// Rewrites source tensor names to container names.
#[derive(Debug, Clone)]
pub struct KeyRemapper {
    table: RemapTable,
    structural: bool,
    strict: bool,
    skip: Vec<String>,
}

impl KeyRemapper {
    /// Names are already in container form.
    pub fn identity() -> Self {
        Self {
            table: RemapTable::default(),
            structural: false,
            strict: false,
            skip: Vec::new(),
        }
    }

    /// Hugging Face Whisper layout.
    pub fn whisper_hf() -> Self {
        Self {
            table: RemapTable::whisper_hf(),
            structural: true,
            strict: false,
            skip: crate::constants::SKIPPED_HF_TENSORS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }

    pub fn with_table(mut self, table: RemapTable) -> Self {
        self.table = table;
        self
    }

    /// In strict mode an unknown block role fails instead of falling back to the table.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn table(&self) -> &RemapTable {
        &self.table
    }

    /// Container name for `name`, or `None` when the tensor is skipped.
    pub fn remap(&self, name: &str) -> Result<Option<String>> {
        if self.skip.iter().any(|s| s == name) {
            return Ok(None);
        }
        if !self.structural {
            return Ok(Some(self.table.apply(name)));
        }

        let path = parse_tensor_path(name);
        let mapped = match &path {
            TensorPath::Block { .. } => path.container_name(),
            TensorPath::UnknownBlock { segment, .. } if self.strict => {
                return Err(Error::UnmappableName {
                    name: name.to_string(),
                    segment: segment.clone(),
                });
            }
            TensorPath::UnknownBlock { .. } | TensorPath::Other(_) => {
                let stripped = name.strip_prefix("model.").unwrap_or(name);
                Some(self.table.apply(stripped))
            }
        };
        Ok(mapped)
    }
}
