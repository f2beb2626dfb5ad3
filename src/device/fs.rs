//! A segment device backed by ordinary files, one per segment.
//!
//! Segments are preallocated to their full size on open, so unwritten space
//! reads as zeroes just like an erased device would. Positioned I/O runs on
//! the blocking pool.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use log::debug;

use crate::types::SegmentId;

use super::{SegmentHandle, SegmentManager, SegmentRead};

const SEGMENT_FILE_EXT: &str = "seg";

/// A [`SegmentManager`] which stores each segment in a file under a root
/// directory.
#[derive(Clone, Debug)]
pub struct Fs {
    root: PathBuf,
    segment_size: u64,
    block_size: u64,
}

impl Fs {
    /// Create a segment device rooted at `root`, creating the directory if
    /// needed.
    pub fn new(root: impl Into<PathBuf>, segment_size: u64, block_size: u64) -> io::Result<Self> {
        assert!(block_size > 0 && segment_size % block_size == 0);
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            segment_size,
            block_size,
        })
    }

    fn segment_path(&self, id: SegmentId) -> PathBuf {
        self.root.join(format!("{:010}.{}", id.0, SEGMENT_FILE_EXT))
    }
}

impl SegmentManager for Fs {
    type Segment = FsSegment;

    fn segment_size(&self) -> u64 {
        self.segment_size
    }

    fn block_size(&self) -> u64 {
        self.block_size
    }

    async fn open(&self, id: SegmentId) -> io::Result<FsSegment> {
        let path = self.segment_path(id);
        let size = self.segment_size;
        let file = tokio::task::spawn_blocking(move || -> io::Result<File> {
            let file = OpenOptions::new().read(true).write(true).create(true).open(&path)?;
            if file.metadata()?.len() < size {
                file.set_len(size)?;
            }
            Ok(file)
        })
        .await
        .map_err(join_error)??;
        debug!("opened {id} at {}", self.segment_path(id).display());

        Ok(FsSegment {
            id,
            file: Arc::new(Mutex::new(file)),
            size,
        })
    }
}

impl SegmentRead for Fs {
    async fn read(&self, segment: SegmentId, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let path = self.segment_path(segment);
        tokio::task::spawn_blocking(move || -> io::Result<Vec<u8>> {
            let mut file = File::open(path)?;
            file.seek(SeekFrom::Start(offset))?;
            let mut buf = vec![0; len];
            file.read_exact(&mut buf)?;
            Ok(buf)
        })
        .await
        .map_err(join_error)?
    }
}

/// An open segment file.
#[derive(Clone, Debug)]
pub struct FsSegment {
    id: SegmentId,
    file: Arc<Mutex<File>>,
    size: u64,
}

impl SegmentHandle for FsSegment {
    fn segment_id(&self) -> SegmentId {
        self.id
    }

    fn write_capacity(&self) -> u64 {
        self.size
    }

    async fn write(&self, offset: u64, buf: Vec<u8>) -> io::Result<()> {
        let file = Arc::clone(&self.file);
        tokio::task::spawn_blocking(move || -> io::Result<()> {
            let mut file = file.lock().unwrap();
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(&buf)
        })
        .await
        .map_err(join_error)?
    }

    async fn close(&self) -> io::Result<()> {
        let file = Arc::clone(&self.file);
        tokio::task::spawn_blocking(move || file.lock().unwrap().sync_all())
            .await
            .map_err(join_error)?
    }
}

fn join_error(e: tokio::task::JoinError) -> io::Error {
    io::Error::other(e)
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[tokio::test]
    async fn segments_are_preallocated() {
        let tmp = tempdir().unwrap();
        let device = Fs::new(tmp.path().join("journal"), 8192, 512).unwrap();

        let segment = device.open(SegmentId(3)).await.unwrap();
        segment.write(1024, vec![9; 512]).await.unwrap();
        segment.close().await.unwrap();

        assert_eq!(device.read(SegmentId(3), 1024, 512).await.unwrap(), vec![9; 512]);
        assert_eq!(device.read(SegmentId(3), 7680, 512).await.unwrap(), vec![0; 512]);
    }

    #[tokio::test]
    async fn reopen_preserves_contents() {
        let tmp = tempdir().unwrap();
        let device = Fs::new(tmp.path(), 8192, 512).unwrap();
        let segment = device.open(SegmentId(0)).await.unwrap();
        segment.write(0, vec![5; 1024]).await.unwrap();
        segment.close().await.unwrap();
        drop(segment);

        let device = Fs::new(tmp.path(), 8192, 512).unwrap();
        let _ = device.open(SegmentId(0)).await.unwrap();
        assert_eq!(device.read(SegmentId(0), 0, 1024).await.unwrap(), vec![5; 1024]);
    }
}
