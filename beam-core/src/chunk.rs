//! Chunk geometry, the sender-side chunk source, and receiver-side reassembly.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

/// Number of chunks a file of `total_len` bytes splits into (ceil).
pub fn chunk_count(total_len: u64, chunk_size: u64) -> u64 {
    if chunk_size == 0 {
        return 0;
    }
    total_len.div_ceil(chunk_size)
}

/// Byte range `(offset, len)` of chunk `index`, or `None` past the end of the file.
pub fn chunk_span(index: u64, total_len: u64, chunk_size: u64) -> Option<(u64, usize)> {
    let offset = index.checked_mul(chunk_size)?;
    if offset >= total_len {
        return None;
    }
    let len = (total_len - offset).min(chunk_size);
    Some((offset, len as usize))
}

/// Random-access content of an outgoing file. Reads are the only suspension point on the send path.
#[async_trait]
pub trait ChunkSource: Send + Sync {
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn read_at(&self, offset: u64, len: usize) -> std::io::Result<Vec<u8>>;
}

/// In-memory source, for small payloads and tests.
#[derive(Debug, Clone)]
pub struct MemorySource(Arc<[u8]>);

impl MemorySource {
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        MemorySource(bytes.into())
    }

    pub fn slice(&self, offset: u64, len: usize) -> std::io::Result<Vec<u8>> {
        let start = usize::try_from(offset).map_err(|_| out_of_range(offset))?;
        let end = start.saturating_add(len).min(self.0.len());
        if start > self.0.len() {
            return Err(out_of_range(offset));
        }
        Ok(self.0[start..end].to_vec())
    }
}

fn out_of_range(offset: u64) -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        format!("offset {offset} past end of source"),
    )
}

#[async_trait]
impl ChunkSource for MemorySource {
    fn len(&self) -> u64 {
        self.0.len() as u64
    }

    async fn read_at(&self, offset: u64, len: usize) -> std::io::Result<Vec<u8>> {
        self.slice(offset, len)
    }
}

/// Outcome of storing a received chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stored {
    /// New range; carries the byte delta added to the received count.
    New(u64),
    /// Same offset and length already present; nothing counted.
    Duplicate,
    /// Empty, past the end of the file, or overlapping a stored range.
    Rejected,
}

/// Sparse receive buffer keyed by byte offset. Stored ranges never overlap, so each byte is
/// counted at most once whatever chunk size the sender picked.
#[derive(Debug)]
pub struct Reassembly {
    total_size: u64,
    received_bytes: u64,
    chunks: BTreeMap<u64, Vec<u8>>,
}

impl Reassembly {
    pub fn new(total_size: u64) -> Self {
        Self {
            total_size,
            received_bytes: 0,
            chunks: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, offset: u64, payload: Vec<u8>) -> Stored {
        let len = payload.len() as u64;
        let end = match offset.checked_add(len) {
            Some(end) if len > 0 && end <= self.total_size => end,
            _ => return Stored::Rejected,
        };
        if let Some(existing) = self.chunks.get(&offset) {
            return if existing.len() as u64 == len {
                Stored::Duplicate
            } else {
                Stored::Rejected
            };
        }
        if let Some((&before, bytes)) = self.chunks.range(..offset).next_back() {
            if before + bytes.len() as u64 > offset {
                return Stored::Rejected;
            }
        }
        if let Some((&after, _)) = self.chunks.range(offset..).next() {
            if after < end {
                return Stored::Rejected;
            }
        }
        self.received_bytes += len;
        self.chunks.insert(offset, payload);
        Stored::New(len)
    }

    pub fn received_bytes(&self) -> u64 {
        self.received_bytes
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn is_complete(&self) -> bool {
        self.received_bytes >= self.total_size
    }

    /// Concatenate stored ranges in offset order.
    pub fn assemble(self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.received_bytes as usize);
        for payload in self.chunks.into_values() {
            out.extend_from_slice(&payload);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spans_cover_file() {
        assert_eq!(chunk_count(100, 30), 4);
        assert_eq!(chunk_span(0, 100, 30), Some((0, 30)));
        assert_eq!(chunk_span(3, 100, 30), Some((90, 10)));
        assert_eq!(chunk_span(4, 100, 30), None);
    }

    #[test]
    fn exact_multiple_and_empty() {
        assert_eq!(chunk_count(90, 30), 3);
        assert_eq!(chunk_span(2, 90, 30), Some((60, 30)));
        assert_eq!(chunk_count(0, 30), 0);
        assert_eq!(chunk_span(0, 0, 30), None);
    }

    #[test]
    fn million_bytes_at_default_chunk() {
        let c = 255 * 1024;
        assert_eq!(chunk_count(1_000_000, c), 4);
        assert_eq!(chunk_span(3, 1_000_000, c), Some((3 * c, 216_640)));
    }

    #[test]
    fn reassembly_out_of_order() {
        let data: Vec<u8> = (0..100u32).map(|i| i as u8).collect();
        let mut r = Reassembly::new(100);
        for index in [3u64, 0, 2, 1] {
            let (offset, len) = chunk_span(index, 100, 30).unwrap();
            let o = offset as usize;
            r.insert(offset, data[o..o + len].to_vec());
        }
        assert!(r.is_complete());
        assert_eq!(r.assemble(), data);
    }

    #[test]
    fn duplicate_not_double_counted() {
        let mut r = Reassembly::new(60);
        assert_eq!(r.insert(0, vec![1; 30]), Stored::New(30));
        assert_eq!(r.insert(0, vec![1; 30]), Stored::Duplicate);
        assert_eq!(r.received_bytes(), 30);
        assert!(!r.is_complete());
    }

    #[test]
    fn overlapping_or_out_of_bounds_rejected() {
        let mut r = Reassembly::new(60);
        assert_eq!(r.insert(10, vec![1; 20]), Stored::New(20));
        assert_eq!(r.insert(0, vec![1; 11]), Stored::Rejected);
        assert_eq!(r.insert(29, vec![1; 5]), Stored::Rejected);
        assert_eq!(r.insert(10, vec![1; 5]), Stored::Rejected);
        assert_eq!(r.insert(50, vec![1; 11]), Stored::Rejected);
        assert_eq!(r.insert(40, Vec::new()), Stored::Rejected);
        assert_eq!(r.insert(u64::MAX, vec![1]), Stored::Rejected);
        assert_eq!(r.insert(0, vec![1; 10]), Stored::New(10));
        assert_eq!(r.insert(30, vec![1; 30]), Stored::New(30));
        assert!(r.is_complete());
    }

    #[test]
    fn split_then_reassemble_round_trips() {
        let data: Vec<u8> = (0..10_007u32).map(|i| (i * 31 % 256) as u8).collect();
        for chunk_size in [1u64, 7, 1000, 4096, 10_007, 20_000] {
            let source = MemorySource::new(data.clone());
            let mut r = Reassembly::new(data.len() as u64);
            let n = chunk_count(data.len() as u64, chunk_size);
            for index in (0..n).rev() {
                let (offset, len) = chunk_span(index, data.len() as u64, chunk_size).unwrap();
                r.insert(offset, source.slice(offset, len).unwrap());
            }
            assert!(r.is_complete());
            assert_eq!(r.assemble(), data, "chunk size {chunk_size}");
        }
    }

    #[tokio::test]
    async fn memory_source_reads() {
        let s = MemorySource::new(vec![1u8, 2, 3, 4, 5]);
        assert_eq!(s.len(), 5);
        assert_eq!(s.read_at(3, 10).await.unwrap(), vec![4, 5]);
        assert!(s.read_at(9, 1).await.is_err());
    }
}
