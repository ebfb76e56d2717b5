//! Named tensor records shared by `weights.bin` and checkpoint shards.
//!
//! Layout, little-endian:
//! `[u32 name_len][name][u32 ndim][u64 dim; ndim][u64 count][f32; count]`.

use std::io::Write;

use crate::api::error::{NetError, NetResult};

#[derive(Debug, Clone, PartialEq)]
pub struct TensorRecord {
    pub name: String,
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

/// Encoded size of one record.
pub fn record_len(name: &str, ndim: usize, count: usize) -> u64 {
    (4 + name.len() + 4 + 8 * ndim + 8 + 4 * count) as u64
}

/// Writes one record and returns the number of bytes written.
pub fn write_record<W: Write>(w: &mut W, name: &str, shape: &[usize], data: &[f32]) -> NetResult<u64> {
    w.write_all(&(name.len() as u32).to_le_bytes())?;
    w.write_all(name.as_bytes())?;
    w.write_all(&(shape.len() as u32).to_le_bytes())?;
    for &dim in shape {
        w.write_all(&(dim as u64).to_le_bytes())?;
    }
    w.write_all(&(data.len() as u64).to_le_bytes())?;
    let mut buf = Vec::with_capacity(4 * data.len().min(16 * 1024));
    for chunk in data.chunks(16 * 1024) {
        buf.clear();
        for v in chunk {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        w.write_all(&buf)?;
    }
    Ok(record_len(name, shape.len(), data.len()))
}

/// Sequential reader over a fully loaded weights or shard file.
pub struct RecordReader<'a> {
    data: &'a [u8],
    pos: usize,
    source: &'a str,
}

impl<'a> RecordReader<'a> {
    pub fn new(data: &'a [u8], source: &'a str) -> Self {
        Self { data, pos: 0, source }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    fn truncated(&self, what: &str) -> NetError {
        NetError::BuildFailed(format!("{}: truncated {} at byte {}", self.source, what, self.pos))
    }

    fn take(&mut self, len: usize, what: &str) -> NetResult<&'a [u8]> {
        if self.data.len() - self.pos < len {
            return Err(self.truncated(what));
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    fn read_u32(&mut self, what: &str) -> NetResult<u32> {
        let b = self.take(4, what)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_u64(&mut self, what: &str) -> NetResult<u64> {
        let b = self.take(8, what)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_le_bytes(arr))
    }

    /// Next record, or `None` at a clean end of file.
    pub fn next_record(&mut self) -> NetResult<Option<TensorRecord>> {
        if self.pos == self.data.len() {
            return Ok(None);
        }
        let name_len = self.read_u32("record name length")? as usize;
        let name_bytes = self.take(name_len, "record name")?;
        let name = String::from_utf8(name_bytes.to_vec())
            .map_err(|_| NetError::BuildFailed(format!("{}: tensor name is not UTF-8", self.source)))?;
        let ndim = self.read_u32("record rank")? as usize;
        let mut shape = Vec::with_capacity(ndim.min(8));
        for _ in 0..ndim {
            shape.push(self.read_u64("record shape")? as usize);
        }
        let count = self.read_u64("element count")? as usize;
        let bytes_needed = count
            .checked_mul(4)
            .ok_or_else(|| NetError::BuildFailed(format!("{}: element count {} overflows", self.source, count)))?;
        let raw = self.take(bytes_needed, &format!("data of '{}'", name))?;
        let data = raw.chunks_exact(4).map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]])).collect();
        Ok(Some(TensorRecord { name, shape, data }))
    }
}
