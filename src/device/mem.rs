//! In-memory implementation of the segment device.
//!
//! Note that this is not a faithful model of a block device: safe Rust
//! requires the buffers to be behind locks, so pathological interleavings of
//! concurrent device access cannot occur. Segments are preallocated
//! zero-filled at open, like a device would present erased blocks.

use std::{
    collections::{btree_map, BTreeMap},
    io,
    sync::{Arc, RwLock},
};

use crate::types::SegmentId;

use super::{SegmentHandle, SegmentManager, SegmentRead};

type SharedLock<T> = Arc<RwLock<T>>;
type SharedBytes = SharedLock<Vec<u8>>;

/// In-memory [`SegmentManager`] and [`SegmentRead`].
#[derive(Clone, Debug)]
pub struct Memory {
    segments: SharedLock<BTreeMap<SegmentId, SharedBytes>>,
    segment_size: u64,
    block_size: u64,
}

impl Memory {
    pub fn new(segment_size: u64, block_size: u64) -> Self {
        assert!(block_size > 0 && segment_size % block_size == 0);
        Self {
            segments: Default::default(),
            segment_size,
            block_size,
        }
    }

    /// Snapshot of the raw bytes of `id`, if the segment exists.
    pub fn segment_data(&self, id: SegmentId) -> Option<Vec<u8>> {
        let segments = self.segments.read().unwrap();
        segments.get(&id).map(|buf| buf.read().unwrap().clone())
    }

    /// Mutate the raw bytes of `id`.
    ///
    /// This is intended for tests which deliberately corrupt segment data.
    pub fn corrupt(&self, id: SegmentId, f: impl FnOnce(&mut Vec<u8>)) {
        let segments = self.segments.read().unwrap();
        let buf = segments.get(&id).expect("no such segment");
        f(&mut buf.write().unwrap());
    }

    /// Ids of all segments ever opened, in ascending order.
    pub fn existing_segments(&self) -> Vec<SegmentId> {
        self.segments.read().unwrap().keys().copied().collect()
    }
}

impl SegmentManager for Memory {
    type Segment = Segment;

    fn segment_size(&self) -> u64 {
        self.segment_size
    }

    fn block_size(&self) -> u64 {
        self.block_size
    }

    async fn open(&self, id: SegmentId) -> io::Result<Segment> {
        let mut segments = self.segments.write().unwrap();
        let buf = match segments.entry(id) {
            btree_map::Entry::Occupied(entry) => Arc::clone(entry.get()),
            btree_map::Entry::Vacant(entry) => {
                let buf = Arc::new(RwLock::new(vec![0; self.segment_size as usize]));
                Arc::clone(entry.insert(buf))
            }
        };
        Ok(Segment {
            id,
            buf,
            size: self.segment_size,
        })
    }
}

impl SegmentRead for Memory {
    async fn read(&self, segment: SegmentId, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let segments = self.segments.read().unwrap();
        let Some(buf) = segments.get(&segment) else {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{segment} does not exist"),
            ));
        };
        let buf = buf.read().unwrap();
        let end = offset as usize + len;
        if end > buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("read past the end of {segment}"),
            ));
        }
        Ok(buf[offset as usize..end].to_vec())
    }
}

/// A log segment backed by a `Vec<u8>`.
#[derive(Clone, Debug)]
pub struct Segment {
    id: SegmentId,
    buf: SharedBytes,
    size: u64,
}

impl SegmentHandle for Segment {
    fn segment_id(&self) -> SegmentId {
        self.id
    }

    fn write_capacity(&self) -> u64 {
        self.size
    }

    async fn write(&self, offset: u64, buf: Vec<u8>) -> io::Result<()> {
        let mut inner = self.buf.write().unwrap();
        let end = offset as usize + buf.len();
        if end > inner.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("write past the end of {}", self.id),
            ));
        }
        inner[offset as usize..end].copy_from_slice(&buf);
        Ok(())
    }

    async fn close(&self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_read_roundtrip() {
        let mem = Memory::new(4096, 512);
        let segment = mem.open(SegmentId(0)).await.unwrap();
        segment.write(512, vec![7; 512]).await.unwrap();

        let bytes = mem.read(SegmentId(0), 512, 512).await.unwrap();
        assert_eq!(bytes, vec![7; 512]);
        // Unwritten space reads as zeroes.
        assert_eq!(mem.read(SegmentId(0), 1024, 512).await.unwrap(), vec![0; 512]);
    }

    #[tokio::test]
    async fn bounds_are_enforced() {
        let mem = Memory::new(4096, 512);
        let segment = mem.open(SegmentId(0)).await.unwrap();
        assert!(segment.write(4096, vec![0; 512]).await.is_err());
        assert!(mem.read(SegmentId(0), 3584, 1024).await.is_err());
    }
}
