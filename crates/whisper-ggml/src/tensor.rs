//! Tensor record stream.
//!
//! Each record is
//!
//! ```text
//! ndim:i32 name_len:i32 dtype_tag:i32
//! dims:i32[ndim]      innermost axis first
//! name:u8[name_len]   UTF-8
//! data                row-major, f32 or f16
//! ```
//!
//! Records repeat until the stream ends. Fewer than 12 bytes where a header
//! would start also end it, unless [`TrailingBytes::Reject`] is requested.

use std::io::{Read, Write};

use half::f16;

use crate::constants::{COLUMN_BIAS_TENSORS, F32_TENSORS};
use crate::weights::TensorF32;
use crate::wire::{WireReader, write_i32};
use crate::{Error, RecordPart, Result, Section};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dtype {
    F32,
    F16,
}

impl Dtype {
    pub fn tag(self) -> i32 {
        match self {
            Self::F32 => 0,
            Self::F16 => 1,
        }
    }

    pub fn from_tag(tag: i32) -> Option<Self> {
        match tag {
            0 => Some(Self::F32),
            1 => Some(Self::F16),
            _ => None,
        }
    }

    pub fn width(self) -> usize {
        match self {
            Self::F32 => 4,
            Self::F16 => 2,
        }
    }
}

/// One named, typed, shaped block of weight data.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorRecord {
    pub name: String,
    /// Outermost axis first.
    pub shape: Vec<usize>,
    pub dtype: Dtype,
    /// Little-endian element bytes.
    pub data: Vec<u8>,
}

fn element_count(name: &str, shape: &[usize]) -> Result<usize> {
    shape
        .iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d))
        .ok_or_else(|| Error::InvalidRecord {
            name: name.to_string(),
            reason: format!("shape {shape:?} overflows"),
        })
}

impl TensorRecord {
    pub fn new(
        name: impl Into<String>,
        shape: Vec<usize>,
        dtype: Dtype,
        data: Vec<u8>,
    ) -> Result<Self> {
        let record = Self {
            name: name.into(),
            shape,
            dtype,
            data,
        };
        record.validate()?;
        Ok(record)
    }

    /// Narrows or copies `values` into `dtype` storage.
    pub fn from_f32(
        name: impl Into<String>,
        shape: Vec<usize>,
        values: &[f32],
        dtype: Dtype,
    ) -> Result<Self> {
        let mut data = Vec::with_capacity(values.len() * dtype.width());
        match dtype {
            Dtype::F32 => {
                for v in values {
                    data.extend_from_slice(&v.to_le_bytes());
                }
            }
            Dtype::F16 => {
                for &v in values {
                    data.extend_from_slice(&f16::from_f32(v).to_le_bytes());
                }
            }
        }
        Self::new(name, shape, dtype, data)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::InvalidRecord {
                name: String::new(),
                reason: "empty name".into(),
            });
        }
        let expected = element_count(&self.name, &self.shape)?
            .checked_mul(self.dtype.width())
            .ok_or_else(|| Error::InvalidRecord {
                name: self.name.clone(),
                reason: "byte size overflows".into(),
            })?;
        if self.data.len() != expected {
            return Err(Error::InvalidRecord {
                name: self.name.clone(),
                reason: format!(
                    "shape {:?} as {:?} needs {expected} bytes, got {}",
                    self.shape,
                    self.dtype,
                    self.data.len()
                ),
            });
        }
        Ok(())
    }

    pub fn element_count(&self) -> usize {
        self.data.len() / self.dtype.width()
    }

    /// Element values widened to f32.
    pub fn to_f32(&self) -> Vec<f32> {
        match self.dtype {
            Dtype::F32 => crate::wire::f32s_from_le(&self.data),
            Dtype::F16 => self
                .data
                .chunks_exact(2)
                .map(|c| f16::from_le_bytes([c[0], c[1]]).to_f32())
                .collect(),
        }
    }

    /// Raw half values; `None` for f32 records.
    pub fn f16_values(&self) -> Option<Vec<f16>> {
        match self.dtype {
            Dtype::F16 => Some(
                self.data
                    .chunks_exact(2)
                    .map(|c| f16::from_le_bytes([c[0], c[1]]))
                    .collect(),
            ),
            Dtype::F32 => None,
        }
    }

    /// Undoes the `[n] -> [n, 1]` column-bias reshape applied at encode.
    pub fn restore_source_shape(mut self, policy: &TensorPolicy) -> Self {
        if policy.is_column_bias(&self.name) && self.shape.len() == 2 && self.shape[1] == 1 {
            self.shape.truncate(1);
        }
        self
    }

    /// Writes one record; dims are written innermost first.
    pub fn encode<W: Write>(&self, w: &mut W, index: usize) -> Result<()> {
        self.validate()?;
        let section = Section::Tensor { record: index };
        let name = self.name.as_bytes();
        write_i32(w, crate::wire::to_i32(self.shape.len(), section, "ndim")?)?;
        write_i32(w, crate::wire::to_i32(name.len(), section, "name length")?)?;
        write_i32(w, self.dtype.tag())?;
        for &d in self.shape.iter().rev() {
            write_i32(w, crate::wire::to_i32(d, section, "dimension")?)?;
        }
        w.write_all(name)?;
        w.write_all(&self.data)?;
        Ok(())
    }
}

/// Removes every unit axis.
pub fn squeeze(shape: &[usize]) -> Vec<usize> {
    shape.iter().copied().filter(|&d| d != 1).collect()
}

/// Per-tensor shape and dtype rules applied at encode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorPolicy {
    pub use_f16: bool,
    /// 1-D tensors stored as `[n, 1]`.
    pub column_bias: Vec<String>,
    /// Tensors kept at f32 regardless of `use_f16`.
    pub keep_f32: Vec<String>,
}

impl TensorPolicy {
    pub fn whisper(use_f16: bool) -> Self {
        Self {
            use_f16,
            column_bias: COLUMN_BIAS_TENSORS.iter().map(|s| s.to_string()).collect(),
            keep_f32: F32_TENSORS.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn is_column_bias(&self, name: &str) -> bool {
        self.column_bias.iter().any(|n| n == name)
    }

    pub fn is_kept_f32(&self, name: &str) -> bool {
        self.keep_f32.iter().any(|n| n == name)
    }

    /// Squeezed shape, with column biases lifted to `[n, 1]`.
    pub fn stored_shape(&self, name: &str, shape: &[usize]) -> Vec<usize> {
        let mut shape = squeeze(shape);
        if self.is_column_bias(name) && shape.len() == 1 {
            shape.push(1);
        }
        shape
    }

    pub fn stored_dtype(&self, name: &str, stored_ndim: usize) -> Dtype {
        if self.use_f16 && stored_ndim >= 2 && !self.is_kept_f32(name) {
            Dtype::F16
        } else {
            Dtype::F32
        }
    }

    /// Builds the record persisted for a source tensor.
    pub fn prepare(&self, name: &str, tensor: &TensorF32) -> Result<TensorRecord> {
        let shape = self.stored_shape(name, &tensor.shape);
        let dtype = self.stored_dtype(name, shape.len());
        tracing::debug!(
            name,
            source_shape = ?tensor.shape,
            stored_shape = ?shape,
            ?dtype,
            "prepared tensor"
        );
        TensorRecord::from_f32(name, shape, &tensor.data, dtype)
    }
}

/// How to treat a partial record header after the last complete record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TrailingBytes {
    /// A short header read ends the stream, as the ggml loader does.
    #[default]
    Ignore,
    /// Only a clean record boundary ends the stream.
    Reject,
}

fn truncated(record: usize, part: RecordPart, offset: u64, needed: usize, got: usize) -> Error {
    Error::TruncatedRecord {
        record,
        part,
        offset,
        needed,
        got,
    }
}

fn invalid(record: usize, reason: String) -> Error {
    Error::InvalidSection {
        section: Section::Tensor { record },
        reason,
    }
}

/// Reads one record, or `None` at end of stream.
pub fn read_record<R: Read>(
    r: &mut WireReader<R>,
    index: usize,
    trailing: TrailingBytes,
) -> Result<Option<TensorRecord>> {
    let start = r.offset();
    let mut header = [0u8; 12];
    let got = r.fill(&mut header)?;
    if got == 0 {
        return Ok(None);
    }
    if got < header.len() {
        return match trailing {
            TrailingBytes::Ignore => {
                tracing::warn!(bytes = got, offset = start, "ignoring trailing partial header");
                Ok(None)
            }
            TrailingBytes::Reject => Err(truncated(index, RecordPart::Header, start, 12, got)),
        };
    }

    let word = |i: usize| {
        i32::from_le_bytes([
            header[i * 4],
            header[i * 4 + 1],
            header[i * 4 + 2],
            header[i * 4 + 3],
        ])
    };
    let (ndim, name_len, tag) = (word(0), word(1), word(2));
    let ndim = usize::try_from(ndim).map_err(|_| invalid(index, format!("negative ndim {ndim}")))?;
    let name_len = usize::try_from(name_len)
        .map_err(|_| invalid(index, format!("negative name length {name_len}")))?;
    let dtype = Dtype::from_tag(tag).ok_or(Error::UnsupportedDtype { record: index, tag })?;

    let mut shape = Vec::with_capacity(ndim.min(8));
    for _ in 0..ndim {
        let at = r.offset();
        let mut b = [0u8; 4];
        let got = r.fill(&mut b)?;
        if got < 4 {
            return Err(truncated(index, RecordPart::Dims, at, 4, got));
        }
        let d = i32::from_le_bytes(b);
        shape.push(usize::try_from(d).map_err(|_| invalid(index, format!("negative dim {d}")))?);
    }
    shape.reverse();

    let at = r.offset();
    let name_bytes = r.read_up_to(name_len)?;
    if name_bytes.len() < name_len {
        return Err(truncated(index, RecordPart::Name, at, name_len, name_bytes.len()));
    }
    let name = String::from_utf8(name_bytes)
        .map_err(|e| invalid(index, format!("name is not UTF-8: {e}")))?;
    if name.is_empty() {
        return Err(invalid(index, "empty name".into()));
    }

    let data_len = element_count(&name, &shape)?
        .checked_mul(dtype.width())
        .ok_or_else(|| invalid(index, format!("{name}: byte size overflows")))?;
    let at = r.offset();
    let data = r.read_up_to(data_len)?;
    if data.len() < data_len {
        return Err(truncated(index, RecordPart::Data, at, data_len, data.len()));
    }

    Ok(Some(TensorRecord {
        name,
        shape,
        dtype,
        data,
    }))
}

/// Streams records one at a time until end of stream.
#[derive(Debug)]
pub struct TensorReader<R> {
    reader: WireReader<R>,
    next_index: usize,
    trailing: TrailingBytes,
    done: bool,
}

impl<R: Read> TensorReader<R> {
    pub fn new(reader: WireReader<R>, trailing: TrailingBytes) -> Self {
        Self {
            reader,
            next_index: 0,
            trailing,
            done: false,
        }
    }

    /// Records yielded so far.
    pub fn records_read(&self) -> usize {
        self.next_index
    }

    pub fn offset(&self) -> u64 {
        self.reader.offset()
    }
}

impl<R: Read> Iterator for TensorReader<R> {
    type Item = Result<TensorRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match read_record(&mut self.reader, self.next_index, self.trailing) {
            Ok(Some(record)) => {
                self.next_index += 1;
                Some(Ok(record))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
