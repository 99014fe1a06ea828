//! Weight file format (`.mlw`).
//!
//! Layout:
//! - magic `MINILLM1`
//! - version: u32
//! - chunks until EOF, each `tag [u8;4] | len u32 | uncompressed_len u32 | lz4 bytes`
//!
//! Chunks: `CONF` (config JSON), `VOCB` (vocabulary JSON), `PARM` (named f32
//! tensors). Unknown tags are skipped.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::array::Array2;
use crate::config::ModelConfig;
use crate::error::StorageError;
use crate::tokenizer::VocabJson;

pub const MAGIC: &[u8; 8] = b"MINILLM1";
pub const VERSION: u32 = 1;

const TAG_CONFIG: [u8; 4] = *b"CONF";
const TAG_VOCAB: [u8; 4] = *b"VOCB";
const TAG_PARAMS: [u8; 4] = *b"PARM";

pub fn compress_lz4(input: &[u8]) -> Vec<u8> {
    lz4_flex::compress(input)
}

pub fn decompress_lz4(input: &[u8], expected_size: usize) -> io::Result<Vec<u8>> {
    lz4_flex::decompress(input, expected_size)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "lz4 decompression failed"))
}

pub fn write_u32_le<W: Write>(w: &mut W, v: u32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub fn read_exact<const N: usize, R: Read>(r: &mut R) -> io::Result<[u8; N]> {
    let mut buf = [0u8; N];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

pub fn read_u32_le<R: Read>(r: &mut R) -> io::Result<u32> {
    Ok(u32::from_le_bytes(read_exact::<4, _>(r)?))
}

fn len_u32(n: usize) -> io::Result<u32> {
    u32::try_from(n).map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "length overflows u32"))
}

pub fn write_string<W: Write>(w: &mut W, s: &str) -> io::Result<()> {
    write_u32_le(w, len_u32(s.len())?)?;
    w.write_all(s.as_bytes())
}

pub fn read_string<R: Read>(r: &mut R) -> io::Result<String> {
    let n = read_u32_le(r)? as usize;
    let mut buf = vec![0u8; n];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid utf-8 string"))
}

/// `tag | len | uncompressed_len | lz4 payload`, where `len` counts the
/// bytes after itself.
pub fn write_chunk_lz4<W: Write>(w: &mut W, tag: [u8; 4], payload: &[u8]) -> io::Result<()> {
    let compressed = compress_lz4(payload);
    let total_len = 4u32.saturating_add(len_u32(compressed.len())?);
    w.write_all(&tag)?;
    write_u32_le(w, total_len)?;
    write_u32_le(w, len_u32(payload.len())?)?;
    w.write_all(&compressed)
}

pub fn read_chunk_header<R: Read>(r: &mut R) -> io::Result<([u8; 4], u32)> {
    let tag = read_exact::<4, _>(r)?;
    let len = read_u32_le(r)?;
    Ok((tag, len))
}

/// A named parameter tensor as stored on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    pub name: String,
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<f32>,
}

impl Tensor {
    pub fn from_array(name: &str, a: &Array2) -> Self {
        Self {
            name: name.to_string(),
            rows: a.rows(),
            cols: a.cols(),
            data: a.data().to_vec(),
        }
    }

    /// Copy the overlapping top-left region into `dst`. Returns whether the
    /// shapes matched exactly.
    pub fn copy_into(&self, dst: &mut Array2) -> bool {
        let rows = self.rows.min(dst.rows());
        let cols = self.cols.min(dst.cols());
        for r in 0..rows {
            let src = &self.data[r * self.cols..r * self.cols + cols];
            dst.row_mut(r)[..cols].copy_from_slice(src);
        }
        self.rows == dst.rows() && self.cols == dst.cols()
    }
}

#[derive(Debug, Clone)]
pub struct WeightFile {
    pub config: ModelConfig,
    pub vocab: VocabJson,
    pub tensors: Vec<Tensor>,
}

fn encode_tensors(tensors: &[Tensor]) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    write_u32_le(&mut out, len_u32(tensors.len())?)?;
    for t in tensors {
        write_string(&mut out, &t.name)?;
        write_u32_le(&mut out, len_u32(t.rows)?)?;
        write_u32_le(&mut out, len_u32(t.cols)?)?;
        for v in &t.data {
            out.write_all(&v.to_le_bytes())?;
        }
    }
    Ok(out)
}

fn decode_tensors(bytes: &[u8]) -> Result<Vec<Tensor>, StorageError> {
    let mut r = io::Cursor::new(bytes);
    let n = read_u32_le(&mut r)? as usize;
    let mut out = Vec::with_capacity(n.min(1024));
    for _ in 0..n {
        let name = read_string(&mut r)?;
        let rows = read_u32_le(&mut r)? as usize;
        let cols = read_u32_le(&mut r)? as usize;
        let count = rows.saturating_mul(cols);
        let remaining = bytes.len().saturating_sub(r.position() as usize) / 4;
        if count > remaining {
            return Err(StorageError::ShapeMismatch {
                name,
                rows,
                cols,
                values: remaining,
            });
        }
        let mut data = Vec::with_capacity(count);
        for _ in 0..count {
            data.push(f32::from_le_bytes(read_exact::<4, _>(&mut r)?));
        }
        out.push(Tensor {
            name,
            rows,
            cols,
            data,
        });
    }
    Ok(out)
}

pub fn write_weights<W: Write>(w: &mut W, file: &WeightFile) -> Result<(), StorageError> {
    w.write_all(MAGIC)?;
    write_u32_le(w, VERSION)?;
    write_chunk_lz4(w, TAG_CONFIG, &serde_json::to_vec(&file.config)?)?;
    write_chunk_lz4(w, TAG_VOCAB, &serde_json::to_vec(&file.vocab)?)?;
    write_chunk_lz4(w, TAG_PARAMS, &encode_tensors(&file.tensors)?)?;
    Ok(())
}

pub fn read_weights<R: Read>(r: &mut R) -> Result<WeightFile, StorageError> {
    let magic = read_exact::<8, _>(r)?;
    if &magic != MAGIC {
        return Err(StorageError::BadMagic);
    }
    let version = read_u32_le(r)?;
    if version != VERSION {
        return Err(StorageError::UnsupportedVersion(version));
    }

    let mut config = None;
    let mut vocab = None;
    let mut tensors = None;

    loop {
        let (tag, len) = match read_chunk_header(r) {
            Ok(v) => v,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        };

        let mut take = r.take(u64::from(len));
        let uncompressed_len = read_u32_le(&mut take)? as usize;
        let mut compressed = Vec::with_capacity((len as usize).saturating_sub(4));
        take.read_to_end(&mut compressed)?;
        let buf = decompress_lz4(&compressed, uncompressed_len)?;

        match tag {
            TAG_CONFIG => config = Some(serde_json::from_slice::<ModelConfig>(&buf)?),
            TAG_VOCAB => vocab = Some(serde_json::from_slice::<VocabJson>(&buf)?),
            TAG_PARAMS => tensors = Some(decode_tensors(&buf)?),
            _ => {}
        }
    }

    Ok(WeightFile {
        config: config.ok_or(StorageError::MissingChunk("CONF"))?,
        vocab: vocab.ok_or(StorageError::MissingChunk("VOCB"))?,
        tensors: tensors.ok_or(StorageError::MissingChunk("PARM"))?,
    })
}

pub fn save_to_path(path: &Path, file: &WeightFile) -> Result<(), StorageError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let mut w = BufWriter::new(File::create(path)?);
    write_weights(&mut w, file)?;
    w.flush()?;
    Ok(())
}

pub fn load_from_path(path: &Path) -> Result<WeightFile, StorageError> {
    let mut r = BufReader::new(File::open(path)?);
    read_weights(&mut r)
}
