//! Container framing: magic, the three header sections, then the tensor stream.

use std::io::{Read, Write};

use crate::constants::MAGIC;
use crate::hparams::Hyperparameters;
use crate::mel::MelFilters;
use crate::tensor::{Dtype, TensorPolicy, TensorReader, TensorRecord, TrailingBytes};
use crate::tokenizer::Vocabulary;
use crate::weights::TensorF32;
use crate::wire::{WireReader, write_i32};
use crate::{Error, Result, Section};

/// A fully materialized container.
#[derive(Debug, Clone, PartialEq)]
pub struct Container {
    pub hparams: Hyperparameters,
    pub mel_filters: MelFilters,
    pub vocab: Vocabulary,
    pub tensors: Vec<TensorRecord>,
}

impl Container {
    /// Serializes the container with every record exactly as stored.
    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        write_header(w, &self.hparams, &self.mel_filters, &self.vocab)?;
        for (index, record) in self.tensors.iter().enumerate() {
            record.encode(w, index)?;
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.write_to(&mut out)?;
        Ok(out)
    }

    pub fn tensor(&self, name: &str) -> Option<&TensorRecord> {
        self.tensors.iter().find(|t| t.name == name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncodeSummary {
    pub tensors: usize,
    pub f16_tensors: usize,
    pub f32_tensors: usize,
}

fn write_header<W: Write>(
    w: &mut W,
    hparams: &Hyperparameters,
    mel_filters: &MelFilters,
    vocab: &Vocabulary,
) -> Result<()> {
    write_i32(w, MAGIC as i32)?;
    hparams.encode(w)?;
    mel_filters.encode(w)?;
    vocab.encode(w)?;
    Ok(())
}

/// Writes the header sections up front, then one tensor at a time.
pub struct ContainerWriter<'p, W> {
    writer: W,
    policy: &'p TensorPolicy,
    summary: EncodeSummary,
}

impl<'p, W: Write> ContainerWriter<'p, W> {
    /// The hyperparameter flag is taken from `policy.use_f16`.
    pub fn new(
        mut writer: W,
        hparams: &Hyperparameters,
        mel_filters: &MelFilters,
        vocab: &Vocabulary,
        policy: &'p TensorPolicy,
    ) -> Result<Self> {
        let hparams = hparams.with_f16(policy.use_f16);
        write_header(&mut writer, &hparams, mel_filters, vocab)?;
        tracing::debug!(
            n_mels = mel_filters.rows(),
            n_tokens = vocab.len(),
            use_f16 = policy.use_f16,
            "wrote container header"
        );
        Ok(Self {
            writer,
            policy,
            summary: EncodeSummary::default(),
        })
    }

    pub fn push(&mut self, name: &str, tensor: &TensorF32) -> Result<Dtype> {
        let record = self.policy.prepare(name, tensor)?;
        record.encode(&mut self.writer, self.summary.tensors)?;
        self.summary.tensors += 1;
        match record.dtype {
            Dtype::F16 => self.summary.f16_tensors += 1,
            Dtype::F32 => self.summary.f32_tensors += 1,
        }
        Ok(record.dtype)
    }

    pub fn summary(&self) -> EncodeSummary {
        self.summary
    }

    pub fn finish(mut self) -> Result<(W, EncodeSummary)> {
        self.writer.flush()?;
        Ok((self.writer, self.summary))
    }
}

/// Encodes into `writer`, tensors in iteration order.
pub fn encode_into<W, I, N>(
    writer: W,
    hparams: &Hyperparameters,
    mel_filters: &MelFilters,
    vocab: &Vocabulary,
    tensors: I,
    policy: &TensorPolicy,
) -> Result<EncodeSummary>
where
    W: Write,
    I: IntoIterator<Item = (N, TensorF32)>,
    N: AsRef<str>,
{
    let mut out = ContainerWriter::new(writer, hparams, mel_filters, vocab, policy)?;
    for (name, tensor) in tensors {
        out.push(name.as_ref(), &tensor)?;
    }
    let (_, summary) = out.finish()?;
    Ok(summary)
}

/// Encodes a whole container in memory with the Whisper tensor policy.
pub fn encode(
    hparams: &Hyperparameters,
    mel_filters: &MelFilters,
    vocab: &Vocabulary,
    tensors: &[(String, TensorF32)],
    use_f16: bool,
) -> Result<Vec<u8>> {
    let policy = TensorPolicy::whisper(use_f16);
    let mut out = ContainerWriter::new(Vec::new(), hparams, mel_filters, vocab, &policy)?;
    for (name, tensor) in tensors {
        out.push(name, tensor)?;
    }
    let (bytes, _) = out.finish()?;
    Ok(bytes)
}

/// Decodes a whole container. A partial header after the last record ends the stream.
pub fn decode(bytes: &[u8]) -> Result<Container> {
    ContainerReader::new(bytes)?.into_container()
}

/// Streaming decoder. Header sections are read eagerly; records on demand.
#[derive(Debug)]
pub struct ContainerReader<R> {
    hparams: Hyperparameters,
    mel_filters: MelFilters,
    vocab: Vocabulary,
    tensors: TensorReader<R>,
}

impl<R: Read> ContainerReader<R> {
    pub fn new(reader: R) -> Result<Self> {
        Self::with_trailing(reader, TrailingBytes::default())
    }

    pub fn with_trailing(reader: R, trailing: TrailingBytes) -> Result<Self> {
        let mut r = WireReader::new(reader);
        let found = r.read_i32(Section::Magic)? as u32;
        if found != MAGIC {
            return Err(Error::BadMagic {
                expected: MAGIC,
                found,
            });
        }
        let hparams = Hyperparameters::decode(&mut r)?;
        let mel_filters = MelFilters::decode(&mut r)?;
        let vocab = Vocabulary::decode(&mut r)?;
        tracing::debug!(
            offset = r.offset(),
            n_tokens = vocab.len(),
            "decoded container header"
        );
        Ok(Self {
            hparams,
            mel_filters,
            vocab,
            tensors: TensorReader::new(r, trailing),
        })
    }

    pub fn hparams(&self) -> &Hyperparameters {
        &self.hparams
    }

    pub fn mel_filters(&self) -> &MelFilters {
        &self.mel_filters
    }

    pub fn vocab(&self) -> &Vocabulary {
        &self.vocab
    }

    /// Remaining records, one at a time.
    pub fn tensors(&mut self) -> &mut TensorReader<R> {
        &mut self.tensors
    }

    pub fn into_container(self) -> Result<Container> {
        let tensors = self.tensors.collect::<Result<Vec<_>>>()?;
        Ok(Container {
            hparams: self.hparams,
            mel_filters: self.mel_filters,
            vocab: self.vocab,
            tensors,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{ContainerReader, decode, encode, encode_into};
    use crate::hparams::Hyperparameters;
    use crate::mel::MelFilters;
    use crate::tensor::{Dtype, TensorPolicy, TrailingBytes};
    use crate::tokenizer::Vocabulary;
    use crate::weights::TensorF32;
    use crate::{Error, Section};

    fn tiny_hparams() -> Hyperparameters {
        Hyperparameters {
            n_vocab: 3,
            n_audio_ctx: 4,
            n_audio_state: 2,
            n_audio_head: 1,
            n_audio_layer: 1,
            n_text_ctx: 4,
            n_text_state: 2,
            n_text_head: 1,
            n_text_layer: 1,
            n_mels: 2,
            use_f16: false,
        }
    }

    fn vocab() -> Vocabulary {
        Vocabulary::from_tokens(vec![b"a".to_vec(), b"b".to_vec(), vec![0xff, 0x00]])
    }

    fn tensors() -> Vec<(String, TensorF32)> {
        vec![
            (
                "encoder.conv1.bias".to_string(),
                TensorF32 {
                    shape: vec![2],
                    data: vec![0.5, -0.5],
                },
            ),
            (
                "decoder.token_embedding.weight".to_string(),
                TensorF32 {
                    shape: vec![3, 2],
                    data: vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0],
                },
            ),
        ]
    }

    #[test]
    fn magic_is_little_endian_ggml() {
        let bytes = encode(&tiny_hparams(), &MelFilters::zeros(2, 2), &vocab(), &[], false)
            .expect("encode");
        assert_eq!(&bytes[..4], b"lmgg");
    }

    #[test]
    fn roundtrips_header_and_records() {
        let mel = MelFilters::new(2, 2, vec![0.1, 0.2, 0.3, 0.4]).expect("mel");
        let bytes = encode(&tiny_hparams(), &mel, &vocab(), &tensors(), true).expect("encode");
        let c = decode(&bytes).expect("decode");

        assert_eq!(c.hparams, tiny_hparams().with_f16(true));
        assert_eq!(c.mel_filters, mel);
        assert_eq!(c.vocab, vocab());
        assert_eq!(c.tensors.len(), 2);

        let bias = c.tensor("encoder.conv1.bias").expect("bias");
        assert_eq!(bias.shape, vec![2, 1]);
        assert_eq!(bias.dtype, Dtype::F32);
        assert_eq!(bias.to_f32(), vec![0.5, -0.5]);

        let emb = c.tensor("decoder.token_embedding.weight").expect("emb");
        assert_eq!(emb.dtype, Dtype::F16);
        assert_eq!(emb.to_f32(), vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);

        assert_eq!(c.to_bytes().expect("re-encode"), bytes);
    }

    #[test]
    fn summary_counts_stored_dtypes() {
        let mut out = Vec::new();
        let summary = encode_into(
            &mut out,
            &tiny_hparams(),
            &MelFilters::zeros(2, 2),
            &vocab(),
            tensors(),
            &TensorPolicy::whisper(true),
        )
        .expect("encode");
        assert_eq!(summary.tensors, 2);
        assert_eq!(summary.f16_tensors, 1);
        assert_eq!(summary.f32_tensors, 1);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = encode(&tiny_hparams(), &MelFilters::zeros(0, 0), &vocab(), &[], false)
            .expect("encode");
        bytes[0] ^= 0xff;
        let err = decode(&bytes).expect_err("bad magic");
        assert!(matches!(err, Error::BadMagic { .. }));
    }

    #[test]
    fn truncated_header_section_names_the_section() {
        let bytes = encode(&tiny_hparams(), &MelFilters::zeros(2, 2), &vocab(), &[], false)
            .expect("encode");
        let err = decode(&bytes[..4 + 11 * 4 + 6]).expect_err("short");
        assert!(matches!(
            err,
            Error::TruncatedStream {
                section: Section::MelFilters,
                ..
            }
        ));
    }

    #[test]
    fn streams_records_and_honours_trailing_policy() {
        let mut bytes =
            encode(&tiny_hparams(), &MelFilters::zeros(2, 2), &vocab(), &tensors(), false)
                .expect("encode");
        bytes.extend_from_slice(&[1, 0, 0]);

        let mut lenient = ContainerReader::new(bytes.as_slice()).expect("open");
        assert_eq!(lenient.vocab().len(), 3);
        let names: Vec<String> = lenient
            .tensors()
            .map(|r| r.expect("record").name)
            .collect();
        assert_eq!(
            names,
            vec!["encoder.conv1.bias", "decoder.token_embedding.weight"]
        );

        assert_eq!(decode(&bytes).expect("lenient decode").tensors.len(), 2);

        let strict =
            ContainerReader::with_trailing(bytes.as_slice(), TrailingBytes::Reject).expect("open");
        assert!(strict.into_container().is_err());
    }
}
