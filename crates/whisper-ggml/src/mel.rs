//! Mel filterbank section.
//!
//! The matrix is stored verbatim (row-major f32, always full precision). The
//! source is the `mel_<n>.npy` entry of Whisper's `mel_filters.npz` asset.

use std::io::{Read, Seek, Write};
use std::path::Path;

use crate::wire::{WireReader, f32s_from_le, to_i32, to_usize, write_f32s, write_i32};
use crate::{Error, Result, Section};

#[derive(Debug, Clone, PartialEq)]
pub struct MelFilters {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl MelFilters {
    pub fn new(rows: usize, cols: usize, data: Vec<f32>) -> Result<Self> {
        let expected = rows.checked_mul(cols);
        if expected != Some(data.len()) {
            return Err(Error::InvalidSection {
                section: Section::MelFilters,
                reason: format!("{rows}x{cols} matrix given {} values", data.len()),
            });
        }
        Ok(Self { rows, cols, data })
    }

    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn row(&self, i: usize) -> Option<&[f32]> {
        if i >= self.rows {
            return None;
        }
        Some(&self.data[i * self.cols..(i + 1) * self.cols])
    }

    pub fn encode<W: Write>(&self, w: &mut W) -> Result<()> {
        write_i32(w, to_i32(self.rows, Section::MelFilters, "rows")?)?;
        write_i32(w, to_i32(self.cols, Section::MelFilters, "cols")?)?;
        write_f32s(w, &self.data)?;
        Ok(())
    }

    pub fn decode<R: Read>(r: &mut WireReader<R>) -> Result<Self> {
        let rows = to_usize(r.read_i32(Section::MelFilters)?, Section::MelFilters, "rows")?;
        let cols = to_usize(r.read_i32(Section::MelFilters)?, Section::MelFilters, "cols")?;
        let count = rows.checked_mul(cols).ok_or_else(|| Error::InvalidSection {
            section: Section::MelFilters,
            reason: format!("{rows}x{cols} overflows"),
        })?;
        let data = r.read_f32s(count, Section::MelFilters)?;
        Ok(Self { rows, cols, data })
    }

    /// Loads `mel_<n_mels>.npy` from a `mel_filters.npz` archive.
    pub fn from_npz_path(path: impl AsRef<Path>, n_mels: usize) -> Result<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        Self::from_npz_reader(std::io::BufReader::new(file), n_mels)
    }

    pub fn from_npz_reader<R: Read + Seek>(reader: R, n_mels: usize) -> Result<Self> {
        let name = format!("mel_{n_mels}.npy");
        let mut archive = zip::ZipArchive::new(reader)?;
        let mut entry = archive.by_name(&name)?;
        let mut bytes = Vec::new();
        entry.read_to_end(&mut bytes)?;

        let filters = parse_npy_f32_2d(&bytes, &name)?;
        if filters.rows != n_mels {
            return Err(Error::Npy {
                name,
                reason: format!("expected {n_mels} rows, found {}", filters.rows),
            });
        }
        tracing::debug!(rows = filters.rows, cols = filters.cols, "loaded mel filters");
        Ok(filters)
    }
}

/// Parses a version 1-3 `.npy` holding a C-order little-endian f32 matrix.
pub fn parse_npy_f32_2d(bytes: &[u8], name: &str) -> Result<MelFilters> {
    let bad = |reason: String| Error::Npy {
        name: name.to_string(),
        reason,
    };

    if bytes.len() < 10 || &bytes[0..6] != b"\x93NUMPY" {
        return Err(bad("missing NUMPY magic".into()));
    }
    let major = bytes[6];
    let (header_len, header_start) = match major {
        1 => (u16::from_le_bytes([bytes[8], bytes[9]]) as usize, 10),
        2 | 3 => {
            if bytes.len() < 12 {
                return Err(bad("short header length".into()));
            }
            (
                u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize,
                12,
            )
        }
        other => return Err(bad(format!("unsupported npy version {other}"))),
    };
    let data_start = header_start + header_len;
    let header = bytes
        .get(header_start..data_start)
        .ok_or_else(|| bad("header runs past end of file".into()))?;
    let header = String::from_utf8_lossy(header);

    let descr = dict_value(&header, "descr").ok_or_else(|| bad("no descr".into()))?;
    if descr.trim_matches(|c| c == '\'' || c == '"') != "<f4" {
        return Err(bad(format!("expected dtype <f4, found {descr}")));
    }
    let fortran = dict_value(&header, "fortran_order").unwrap_or("False");
    if fortran != "False" {
        return Err(bad("fortran-order arrays are not supported".into()));
    }
    let shape = dict_value(&header, "shape").ok_or_else(|| bad("no shape".into()))?;
    let dims: Vec<usize> = shape
        .trim_matches(|c| c == '(' || c == ')')
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<usize>())
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| bad(format!("bad shape {shape}: {e}")))?;
    let &[rows, cols] = dims.as_slice() else {
        return Err(bad(format!("expected a 2-D array, found shape {shape}")));
    };

    let len = rows
        .checked_mul(cols)
        .and_then(|count| count.checked_mul(4))
        .ok_or_else(|| bad(format!("shape {shape} overflows")))?;
    let raw = &bytes[data_start..];
    if raw.len() < len {
        return Err(bad(format!(
            "data too short: expected {len} bytes, got {}",
            raw.len()
        )));
    }
    MelFilters::new(rows, cols, f32s_from_le(&raw[..len]))
}

/// Value text for `key` in a numpy header dict such as
/// `{'descr': '<f4', 'fortran_order': False, 'shape': (80, 201), }`.
fn dict_value<'a>(header: &'a str, key: &str) -> Option<&'a str> {
    let pattern = format!("'{key}':");
    let start = header.find(&pattern)? + pattern.len();
    let rest = header[start..].trim_start();
    let end = if rest.starts_with('(') {
        rest.find(')')? + 1
    } else {
        rest.find([',', '}'])?
    };
    Some(rest[..end].trim())
}

#[cfg(test)]
pub(crate) mod tests {
    use std::io::{Cursor, Write};

    use super::{MelFilters, parse_npy_f32_2d};
    use crate::Error;
    use crate::wire::WireReader;

    pub(crate) fn npy_bytes(rows: usize, cols: usize, values: &[f32]) -> Vec<u8> {
        let mut header =
            format!("{{'descr': '<f4', 'fortran_order': False, 'shape': ({rows}, {cols}), }}");
        while (10 + header.len() + 1) % 64 != 0 {
            header.push(' ');
        }
        header.push('\n');

        let mut out = b"\x93NUMPY\x01\x00".to_vec();
        out.extend_from_slice(&(header.len() as u16).to_le_bytes());
        out.extend_from_slice(header.as_bytes());
        for v in values {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }

    #[test]
    fn roundtrips_row_major_matrix() {
        let m = MelFilters::new(2, 3, vec![0.0, 0.5, 1.0, -1.0, 2.0, 3.5]).expect("matrix");
        let mut buf = Vec::new();
        m.encode(&mut buf).expect("encode");
        assert_eq!(buf.len(), 8 + 6 * 4);
        assert_eq!(&buf[0..4], &2i32.to_le_bytes());
        assert_eq!(&buf[4..8], &3i32.to_le_bytes());

        let back = MelFilters::decode(&mut WireReader::new(buf.as_slice())).expect("decode");
        assert_eq!(back, m);
        assert_eq!(back.row(1), Some(&[-1.0, 2.0, 3.5][..]));
    }

    #[test]
    fn zero_sized_matrix_has_empty_data_region() {
        let m = MelFilters::zeros(0, 201);
        let mut buf = Vec::new();
        m.encode(&mut buf).expect("encode");
        assert_eq!(buf.len(), 8);
        let back = MelFilters::decode(&mut WireReader::new(buf.as_slice())).expect("decode");
        assert_eq!(back.rows(), 0);
        assert!(back.data().is_empty());
    }

    #[test]
    fn truncated_data_is_an_error() {
        let mut buf = Vec::new();
        MelFilters::zeros(4, 4).encode(&mut buf).expect("encode");
        buf.truncate(buf.len() - 1);
        let err = MelFilters::decode(&mut WireReader::new(buf.as_slice())).expect_err("short");
        assert!(matches!(err, Error::TruncatedStream { .. }));
    }

    #[test]
    fn rejects_mismatched_dimensions() {
        assert!(MelFilters::new(2, 2, vec![0.0; 3]).is_err());
    }

    #[test]
    fn parses_npy_header_and_data() {
        let values: Vec<f32> = (0..6).map(|i| i as f32 * 0.25).collect();
        let bytes = npy_bytes(2, 3, &values);
        let m = parse_npy_f32_2d(&bytes, "mel_2.npy").expect("npy");
        assert_eq!((m.rows(), m.cols()), (2, 3));
        assert_eq!(m.data(), values.as_slice());
    }

    #[test]
    fn rejects_non_f32_npy() {
        let mut bytes = npy_bytes(1, 1, &[1.0]);
        let pos = bytes.windows(3).position(|w| w == b"<f4").expect("descr");
        bytes[pos + 2] = b'8';
        assert!(parse_npy_f32_2d(&bytes, "mel_1.npy").is_err());
    }

    #[test]
    fn oversized_npy_shape_is_an_error() {
        // rows * cols fits in usize, the byte length does not
        let bytes = npy_bytes(usize::MAX / 2, 1, &[]);
        let err = parse_npy_f32_2d(&bytes, "mel_x.npy").expect_err("overflow");
        assert!(matches!(err, Error::Npy { .. }), "{err}");

        let bytes = npy_bytes(2, 2, &[1.0, 2.0, 3.0]);
        let err = parse_npy_f32_2d(&bytes, "mel_2.npy").expect_err("short");
        assert!(err.to_string().contains("expected 16 bytes, got 12"), "{err}");
    }

    #[test]
    fn loads_selected_entry_from_npz() {
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut zip = zip::ZipWriter::new(&mut cursor);
            let opts = || {
                zip::write::SimpleFileOptions::default()
                    .compression_method(zip::CompressionMethod::Stored)
            };
            zip.start_file("mel_2.npy", opts()).expect("start");
            zip.write_all(&npy_bytes(2, 2, &[1.0, 2.0, 3.0, 4.0]))
                .expect("write");
            zip.start_file("mel_3.npy", opts()).expect("start");
            zip.write_all(&npy_bytes(3, 1, &[5.0, 6.0, 7.0]))
                .expect("write");
            zip.finish().expect("finish");
        }
        cursor.set_position(0);

        let m = MelFilters::from_npz_reader(cursor, 3).expect("npz");
        assert_eq!(m.data(), &[5.0, 6.0, 7.0]);
    }
}
