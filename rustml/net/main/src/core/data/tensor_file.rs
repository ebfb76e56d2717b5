//! Binary tensor file: a 64-byte little-endian header followed by row-major f32 data.
//!
//! | offset | size | field                         |
//! |--------|------|-------------------------------|
//! | 0      | 16   | magic `RUSTML-TENSOR\0\0\0`   |
//! | 16     | 4    | version (1)                   |
//! | 20     | 4    | dtype (0 = f32)               |
//! | 24     | 8    | rows                          |
//! | 32     | 8    | cols                          |
//! | 40     | 8    | data offset (>= 64, 4-aligned)|
//! | 48     | 16   | reserved                      |

use std::borrow::Cow;
use std::fs::File;
use std::io::Write;
use std::path::Path;

use memmap2::{Mmap, MmapOptions};

use crate::api::error::{NetError, NetResult};

pub const TENSOR_FILE_MAGIC: [u8; 16] = *b"RUSTML-TENSOR\0\0\0";
pub const TENSOR_FILE_VERSION: u32 = 1;
pub const TENSOR_FILE_HEADER_LEN: usize = 64;
pub const DTYPE_F32: u32 = 0;

/// Parsed header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TensorFileHeader {
    pub version: u32,
    pub dtype: u32,
    pub rows: u64,
    pub cols: u64,
    pub data_offset: u64,
}

fn read_u32(b: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&b[at..at + 4]);
    u32::from_le_bytes(buf)
}

fn read_u64(b: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&b[at..at + 8]);
    u64::from_le_bytes(buf)
}

impl TensorFileHeader {
    /// Parses and validates a header against the total file length.
    pub fn parse(bytes: &[u8]) -> NetResult<Self> {
        if bytes.len() < TENSOR_FILE_HEADER_LEN {
            return Err(NetError::BuildFailed(format!(
                "tensor file is {} bytes, shorter than the {}-byte header",
                bytes.len(),
                TENSOR_FILE_HEADER_LEN
            )));
        }
        if bytes[..16] != TENSOR_FILE_MAGIC {
            return Err(NetError::BuildFailed("tensor file magic mismatch".into()));
        }
        let header = Self {
            version: read_u32(bytes, 16),
            dtype: read_u32(bytes, 20),
            rows: read_u64(bytes, 24),
            cols: read_u64(bytes, 32),
            data_offset: read_u64(bytes, 40),
        };
        if header.version != TENSOR_FILE_VERSION {
            return Err(NetError::VersionMismatch { found: header.version, supported: TENSOR_FILE_VERSION });
        }
        if header.dtype != DTYPE_F32 {
            return Err(NetError::BuildFailed(format!("unsupported tensor dtype {}", header.dtype)));
        }
        if header.data_offset < TENSOR_FILE_HEADER_LEN as u64 || header.data_offset % 4 != 0 {
            return Err(NetError::BuildFailed(format!(
                "data offset {} must be >= 64 and 4-byte aligned",
                header.data_offset
            )));
        }
        let data_bytes = header
            .rows
            .checked_mul(header.cols)
            .and_then(|n| n.checked_mul(4))
            .and_then(|n| n.checked_add(header.data_offset))
            .ok_or_else(|| NetError::BuildFailed("tensor file dimensions overflow".into()))?;
        if data_bytes > bytes.len() as u64 {
            return Err(NetError::BuildFailed(format!(
                "tensor file truncated: header describes {} bytes, file has {}",
                data_bytes,
                bytes.len()
            )));
        }
        Ok(header)
    }

    pub fn to_bytes(&self) -> [u8; TENSOR_FILE_HEADER_LEN] {
        let mut out = [0u8; TENSOR_FILE_HEADER_LEN];
        out[..16].copy_from_slice(&TENSOR_FILE_MAGIC);
        out[16..20].copy_from_slice(&self.version.to_le_bytes());
        out[20..24].copy_from_slice(&self.dtype.to_le_bytes());
        out[24..32].copy_from_slice(&self.rows.to_le_bytes());
        out[32..40].copy_from_slice(&self.cols.to_le_bytes());
        out[40..48].copy_from_slice(&self.data_offset.to_le_bytes());
        out
    }
}

/// Writes `rows * cols` values as a tensor file with the data right after the header.
pub fn write_tensor_file<P: AsRef<Path>>(path: P, rows: usize, cols: usize, data: &[f32]) -> NetResult<()> {
    if data.len() != rows * cols {
        return Err(NetError::InvalidArgument(format!(
            "tensor data has {} values, {}x{} needs {}",
            data.len(),
            rows,
            cols,
            rows * cols
        )));
    }
    let header = TensorFileHeader {
        version: TENSOR_FILE_VERSION,
        dtype: DTYPE_F32,
        rows: rows as u64,
        cols: cols as u64,
        data_offset: TENSOR_FILE_HEADER_LEN as u64,
    };
    let mut file = std::io::BufWriter::new(File::create(path)?);
    file.write_all(&header.to_bytes())?;
    for v in data {
        file.write_all(&v.to_le_bytes())?;
    }
    file.flush()?;
    Ok(())
}

/// Read-only memory-mapped tensor file.
#[derive(Debug)]
pub struct TensorFile {
    mmap: Mmap,
    header: TensorFileHeader,
}

impl TensorFile {
    pub fn open<P: AsRef<Path>>(path: P) -> NetResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(NetError::MissingFile(path.to_path_buf()));
        }
        let file = File::open(path)?;
        // SAFETY: the file is mapped read-only; callers must not truncate or
        // rewrite it while the mapping is alive.
        let mmap = unsafe { MmapOptions::new().map(&file) }?;
        let header = TensorFileHeader::parse(&mmap)?;
        Ok(Self { mmap, header })
    }

    pub fn header(&self) -> &TensorFileHeader {
        &self.header
    }

    pub fn rows(&self) -> usize {
        self.header.rows as usize
    }

    pub fn cols(&self) -> usize {
        self.header.cols as usize
    }

    /// Row `idx`, borrowed straight from the mapping on little-endian hosts.
    pub fn row(&self, idx: usize) -> Cow<'_, [f32]> {
        let cols = self.cols();
        let start = self.header.data_offset as usize + idx * cols * 4;
        let bytes = &self.mmap[start..start + cols * 4];
        #[cfg(target_endian = "little")]
        if let Ok(floats) = bytemuck::try_cast_slice::<u8, f32>(bytes) {
            return Cow::Borrowed(floats);
        }
        Cow::Owned(
            bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        )
    }
}
