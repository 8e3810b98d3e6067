//! Byte-level BPE vocabulary section.
//!
//! Two sources feed the same [`Vocabulary`]:
//! - tiktoken rank tables (`base64(token) rank` per line), already byte-exact
//! - `vocab.json` tables whose keys are tokens escaped through the GPT-2
//!   byte→unicode bijection
//!
//! On disk the vocabulary is a count followed by length-prefixed token bytes in
//! rank order; the rank itself is implicit.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use base64::{Engine as _, engine::general_purpose::STANDARD};

use crate::constants::END_OF_TEXT_TOKEN;
use crate::wire::{WireReader, to_i32, to_usize, write_i32};
use crate::{Error, Result, Section};

const fn is_visible(b: u8) -> bool {
    matches!(b, b'!'..=b'~' | 0xA1..=0xAC | 0xAE..=0xFF)
}

// Bytes without a visible glyph get code points 256, 257, ... in byte order.
const SYNTHETIC_BASE: u32 = 256;
const SYNTHETIC_COUNT: usize = 68;

const BYTE_TO_CHAR: [char; 256] = {
    let mut table = ['\0'; 256];
    let mut next = SYNTHETIC_BASE;
    let mut b = 0;
    while b < 256 {
        let cp = if is_visible(b as u8) {
            b as u32
        } else {
            next += 1;
            next - 1
        };
        table[b] = match char::from_u32(cp) {
            Some(c) => c,
            None => panic!("byte table code point out of range"),
        };
        b += 1;
    }
    table
};

const SYNTHETIC_TO_BYTE: [u8; SYNTHETIC_COUNT] = {
    let mut table = [0u8; SYNTHETIC_COUNT];
    let mut n = 0;
    let mut b = 0;
    while b < 256 {
        if !is_visible(b as u8) {
            table[n] = b as u8;
            n += 1;
        }
        b += 1;
    }
    assert!(n == SYNTHETIC_COUNT);
    table
};

/// Escapes one byte to its printable stand-in.
pub fn encode_byte(b: u8) -> char {
    BYTE_TO_CHAR[b as usize]
}

/// Inverse of [`encode_byte`]; `None` for characters outside the 256 mappings.
pub fn decode_char(c: char) -> Option<u8> {
    let cp = c as u32;
    if cp < SYNTHETIC_BASE {
        let b = cp as u8;
        return is_visible(b).then_some(b);
    }
    SYNTHETIC_TO_BYTE
        .get((cp - SYNTHETIC_BASE) as usize)
        .copied()
}

pub fn escape_token(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| encode_byte(b)).collect()
}

/// Recovers raw token bytes from an escaped token; `rank` is only for error context.
pub fn unescape_token(escaped: &str, rank: usize) -> Result<Vec<u8>> {
    escaped
        .chars()
        .map(|ch| decode_char(ch).ok_or(Error::MalformedToken { rank, ch }))
        .collect()
}

/// What to do with an explicit `<|endoftext|>` entry in an escaped table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndOfText {
    /// Drop it so the count matches the rank-table form of the same model.
    Drop,
    Keep,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Vocabulary {
    tokens: Vec<Vec<u8>>,
}

impl Vocabulary {
    /// Tokens in rank order.
    pub fn from_tokens(tokens: Vec<Vec<u8>>) -> Self {
        Self { tokens }
    }

    /// Builds from `(token, rank)` pairs; ranks must be unique and contiguous from 0.
    pub fn from_rank_table<I>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = (Vec<u8>, u32)>,
    {
        let mut by_rank = BTreeMap::new();
        for (token, rank) in entries {
            if by_rank.insert(rank, token).is_some() {
                return Err(Error::InvalidVocabulary(format!("duplicate rank {rank}")));
            }
        }
        let mut tokens = Vec::with_capacity(by_rank.len());
        for (expected, (rank, token)) in by_rank.into_iter().enumerate() {
            if rank as usize != expected {
                return Err(Error::InvalidVocabulary(format!(
                    "ranks are not contiguous: expected {expected}, found {rank}"
                )));
            }
            tokens.push(token);
        }
        Ok(Self { tokens })
    }

    /// Parses a tiktoken file: one `base64(token) rank` pair per non-empty line.
    pub fn from_tiktoken_str(text: &str) -> Result<Self> {
        let mut entries = Vec::new();
        for (line_no, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut parts = line.split_whitespace();
            let (Some(encoded), Some(rank), None) = (parts.next(), parts.next(), parts.next())
            else {
                return Err(Error::InvalidVocabulary(format!(
                    "line {}: expected `<base64> <rank>`",
                    line_no + 1
                )));
            };
            let rank: u32 = rank.parse().map_err(|_| {
                Error::InvalidVocabulary(format!("line {}: bad rank `{rank}`", line_no + 1))
            })?;
            let token = STANDARD
                .decode(encoded.as_bytes())
                .map_err(|source| Error::Base64 {
                    context: format!("tiktoken line {}", line_no + 1),
                    source,
                })?;
            entries.push((token, rank));
        }
        Self::from_rank_table(entries)
    }

    /// Builds from `(escaped token, rank)` pairs.
    pub fn from_escaped_table<I>(entries: I, end_of_text: EndOfText) -> Result<Self>
    where
        I: IntoIterator<Item = (String, u32)>,
    {
        let mut raw = Vec::new();
        for (escaped, rank) in entries {
            if end_of_text == EndOfText::Drop && escaped == END_OF_TEXT_TOKEN {
                tracing::debug!(rank, "dropping end-of-text entry");
                continue;
            }
            raw.push((unescape_token(&escaped, rank as usize)?, rank));
        }
        Self::from_rank_table(raw)
    }

    /// Parses a `vocab.json` object of escaped token → rank.
    pub fn from_vocab_json_str(json: &str, end_of_text: EndOfText) -> Result<Self> {
        let table: BTreeMap<String, u32> = serde_json::from_str(json)?;
        Self::from_escaped_table(table, end_of_text)
    }

    /// `(escaped token, rank)` pairs in rank order.
    pub fn to_escaped_table(&self) -> Vec<(String, u32)> {
        self.tokens
            .iter()
            .enumerate()
            .map(|(rank, token)| (escape_token(token), rank as u32))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn token(&self, rank: usize) -> Option<&[u8]> {
        self.tokens.get(rank).map(Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = &[u8]> {
        self.tokens.iter().map(Vec::as_slice)
    }

    pub fn encode<W: Write>(&self, w: &mut W) -> Result<()> {
        write_i32(w, to_i32(self.tokens.len(), Section::Vocab { token: 0 }, "token count")?)?;
        for (rank, token) in self.tokens.iter().enumerate() {
            let section = Section::Vocab { token: rank };
            write_i32(w, to_i32(token.len(), section, "token length")?)?;
            w.write_all(token)?;
        }
        Ok(())
    }

    pub fn decode<R: Read>(r: &mut WireReader<R>) -> Result<Self> {
        let head = Section::Vocab { token: 0 };
        let count = to_usize(r.read_i32(head)?, head, "token count")?;
        let mut tokens = Vec::with_capacity(count.min(1 << 16));
        for rank in 0..count {
            let section = Section::Vocab { token: rank };
            let len = to_usize(r.read_i32(section)?, section, "token length")?;
            tokens.push(r.read_bytes_in(len, section)?);
        }
        Ok(Self { tokens })
    }
}
