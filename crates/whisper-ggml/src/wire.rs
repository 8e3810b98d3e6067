//! Little-endian primitives shared by the section codecs.

use std::io::{self, Read, Write};

use crate::{Error, Result, Section};

pub fn write_i32<W: Write>(w: &mut W, value: i32) -> io::Result<()> {
    w.write_all(&value.to_le_bytes())
}

pub fn write_f32s<W: Write>(w: &mut W, values: &[f32]) -> io::Result<()> {
    let mut buf = Vec::with_capacity(values.len() * 4);
    for v in values {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    w.write_all(&buf)
}

/// Converts a length or dimension to the on-disk `i32`.
pub fn to_i32(value: usize, section: Section, what: &str) -> Result<i32> {
    i32::try_from(value).map_err(|_| Error::InvalidSection {
        section,
        reason: format!("{what} {value} does not fit in i32"),
    })
}

/// Converts an on-disk `i32` length or dimension back to `usize`.
pub fn to_usize(value: i32, section: Section, what: &str) -> Result<usize> {
    usize::try_from(value).map_err(|_| Error::InvalidSection {
        section,
        reason: format!("negative {what}: {value}"),
    })
}

pub fn f32s_from_le(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Reader that tracks its byte offset and reports short reads precisely.
#[derive(Debug)]
pub struct WireReader<R> {
    inner: R,
    offset: u64,
}

impl<R: Read> WireReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, offset: 0 }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Reads until `buf` is full or the source is exhausted; returns the count read.
    pub fn fill(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut got = 0;
        while got < buf.len() {
            match self.inner.read(&mut buf[got..]) {
                Ok(0) => break,
                Ok(n) => got += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        self.offset += got as u64;
        Ok(got)
    }

    /// Reads up to `len` bytes without preallocating `len` up front.
    pub fn read_up_to(&mut self, len: usize) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        let got = (&mut self.inner).take(len as u64).read_to_end(&mut buf)?;
        self.offset += got as u64;
        Ok(buf)
    }

    pub fn read_exact_in(&mut self, buf: &mut [u8], section: Section) -> Result<()> {
        let start = self.offset;
        let got = self.fill(buf)?;
        if got < buf.len() {
            return Err(Error::TruncatedStream {
                section,
                offset: start,
                needed: buf.len(),
                got,
            });
        }
        Ok(())
    }

    pub fn read_bytes_in(&mut self, len: usize, section: Section) -> Result<Vec<u8>> {
        let start = self.offset;
        let buf = self.read_up_to(len)?;
        if buf.len() < len {
            return Err(Error::TruncatedStream {
                section,
                offset: start,
                needed: len,
                got: buf.len(),
            });
        }
        Ok(buf)
    }

    pub fn read_i32(&mut self, section: Section) -> Result<i32> {
        let mut b = [0u8; 4];
        self.read_exact_in(&mut b, section)?;
        Ok(i32::from_le_bytes(b))
    }

    pub fn read_f32s(&mut self, count: usize, section: Section) -> Result<Vec<f32>> {
        let len = count.checked_mul(4).ok_or_else(|| Error::InvalidSection {
            section,
            reason: format!("{count} floats overflow the address space"),
        })?;
        let bytes = self.read_bytes_in(len, section)?;
        Ok(f32s_from_le(&bytes))
    }
}
