//! Safetensors-backed source weights and safetensors export of decoded records.

use std::borrow::Cow;
use std::path::Path;

use half::{bf16, f16};
use memmap2::MmapOptions;
use safetensors::tensor::{Dtype as StDtype, SafeTensorError, View, serialize_to_file};
use thiserror::Error;

use crate::tensor::{Dtype, TensorRecord};

#[derive(Debug, Clone, PartialEq)]
pub struct TensorF32 {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

/// A memory-mapped `model.safetensors` source checkpoint.
#[derive(Debug)]
pub struct WeightStore {
    mmap: memmap2::Mmap,
}

/// Errors from reading or writing safetensors files.
#[derive(Debug, Error)]
pub enum WeightError {
    #[error("cannot map weights file: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed safetensors: {0}")]
    Format(#[from] SafeTensorError),
    #[error("source tensor `{tensor}` has dtype {dtype:?}; only F32, F16 and BF16 convert")]
    UnsupportedDtype { tensor: String, dtype: StDtype },
    #[error("source tensor `{tensor}`: {len} bytes is not a whole number of {width}-byte elements")]
    Misaligned {
        tensor: String,
        len: usize,
        width: usize,
    },
}

impl WeightStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, WeightError> {
        let file = std::fs::File::open(path)?;
        // SAFETY: the map is read-only and lives as long as the store; the
        // checkpoint must not be modified while a conversion runs.
        let mmap = unsafe { MmapOptions::new().map(&file)? };
        Ok(Self { mmap })
    }

    /// Tensor names in payload order (ascending data offset).
    pub fn names(&self) -> Result<Vec<String>, WeightError> {
        let st = safetensors::SafeTensors::deserialize(&self.mmap)?;
        let mut named: Vec<(usize, String)> = st
            .tensors()
            .into_iter()
            .map(|(name, view)| (view.data().as_ptr() as usize, name))
            .collect();
        named.sort();
        Ok(named.into_iter().map(|(_, name)| name).collect())
    }

    /// Loads one tensor, widening half-precision payloads to f32.
    pub fn tensor_f32(&self, name: &str) -> Result<TensorF32, WeightError> {
        let st = safetensors::SafeTensors::deserialize(&self.mmap)?;
        let view = st.tensor(name)?;
        let raw = view.data();
        let data = match view.dtype() {
            StDtype::F32 => crate::wire::f32s_from_le(aligned(name, raw, 4)?),
            StDtype::F16 => aligned(name, raw, 2)?
                .chunks_exact(2)
                .map(|c| f16::from_le_bytes([c[0], c[1]]).to_f32())
                .collect(),
            StDtype::BF16 => aligned(name, raw, 2)?
                .chunks_exact(2)
                .map(|c| bf16::from_le_bytes([c[0], c[1]]).to_f32())
                .collect(),
            dtype => {
                return Err(WeightError::UnsupportedDtype {
                    tensor: name.to_string(),
                    dtype,
                });
            }
        };
        Ok(TensorF32 {
            shape: view.shape().to_vec(),
            data,
        })
    }

    /// Every tensor as f32, in payload order.
    pub fn tensors_f32(&self) -> Result<Vec<(String, TensorF32)>, WeightError> {
        self.names()?
            .into_iter()
            .map(|name| {
                let t = self.tensor_f32(&name)?;
                Ok((name, t))
            })
            .collect()
    }
}

fn aligned<'a>(tensor: &str, raw: &'a [u8], width: usize) -> Result<&'a [u8], WeightError> {
    if raw.len() % width != 0 {
        return Err(WeightError::Misaligned {
            tensor: tensor.to_string(),
            len: raw.len(),
            width,
        });
    }
    Ok(raw)
}

struct RecordView<'a>(&'a TensorRecord);

impl View for RecordView<'_> {
    fn dtype(&self) -> StDtype {
        match self.0.dtype {
            Dtype::F32 => StDtype::F32,
            Dtype::F16 => StDtype::F16,
        }
    }

    fn shape(&self) -> &[usize] {
        &self.0.shape
    }

    fn data(&self) -> Cow<'_, [u8]> {
        Cow::Borrowed(&self.0.data)
    }

    fn data_len(&self) -> usize {
        self.0.data.len()
    }
}

/// Writes records to a safetensors file in their stored dtype.
pub fn write_safetensors(
    records: &[TensorRecord],
    path: impl AsRef<Path>,
) -> Result<(), WeightError> {
    let views = records.iter().map(|r| (r.name.as_str(), RecordView(r)));
    serialize_to_file(views, &None, path.as_ref())?;
    Ok(())
}
