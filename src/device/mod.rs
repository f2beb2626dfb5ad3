//! External collaborators of the journal: the segment device and the policy
//! that names segments.
//!
//! These are mainly traits to allow testing against an in-memory
//! representation; [`Fs`] is a file-backed implementation suitable for
//! single-node deployments.

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use crate::types::{JournalSeq, SegmentId};

pub mod fs;
#[cfg(any(test, feature = "test"))]
pub mod mem;

pub use fs::Fs;
#[cfg(any(test, feature = "test"))]
pub use mem::Memory;

/// A block-addressable device of fixed-size segments.
pub trait SegmentManager: Send + Sync + 'static {
    type Segment: SegmentHandle;

    /// Size of every segment, in bytes.
    fn segment_size(&self) -> u64;

    /// Write granularity and alignment, in bytes.
    fn block_size(&self) -> u64;

    /// Open the segment `id` for writing, allocating it if necessary.
    fn open(&self, id: SegmentId) -> impl Future<Output = io::Result<Self::Segment>> + Send;
}

/// An open segment.
///
/// Writes at distinct offsets may be issued concurrently and may complete in
/// any order; offset allocation is the journal's business.
pub trait SegmentHandle: Send + Sync + 'static {
    fn segment_id(&self) -> SegmentId;

    /// Usable bytes in this segment.
    fn write_capacity(&self) -> u64;

    /// Write `buf` at `offset`. Both must be block-aligned.
    fn write(&self, offset: u64, buf: Vec<u8>) -> impl Future<Output = io::Result<()>> + Send;

    /// Finalize the segment. Writes issued before the close may still land.
    fn close(&self) -> impl Future<Output = io::Result<()>> + Send;
}

/// Read access to persisted segments, used by the scanner during replay.
pub trait SegmentRead: Send + Sync + 'static {
    /// Read exactly `len` bytes at `offset` of `segment`.
    fn read(
        &self,
        segment: SegmentId,
        offset: u64,
        len: usize,
    ) -> impl Future<Output = io::Result<Vec<u8>>> + Send;
}

/// Policy component naming the segments the journal writes to.
///
/// The provider owns segment lifecycle beyond the journal: which segment
/// comes next, and what happens to closed ones. It must outlive the journal
/// it serves.
pub trait SegmentProvider: Send + Sync {
    /// The segment to roll into next.
    ///
    /// An error here means no segment has room; it surfaces to the submitter
    /// as backpressure (a failed submission).
    fn next_segment_id(&self) -> io::Result<SegmentId>;

    /// Notification that the journal closed `id`, having written it up to
    /// `last_seq`.
    fn close_segment(&self, id: SegmentId, last_seq: Option<JournalSeq>);
}

/// A [`SegmentProvider`] handing out sequentially numbered segments.
///
/// Sufficient for single-journal deployments where the device namespace is
/// not shared; also the provider used throughout the tests.
#[derive(Debug, Default)]
pub struct LinearProvider {
    next: AtomicU32,
    closed: Mutex<Vec<(SegmentId, Option<JournalSeq>)>>,
}

impl LinearProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// A provider whose first segment is `first`, for devices that already
    /// hold replayed segments below it.
    pub fn starting_at(first: SegmentId) -> Self {
        Self {
            next: AtomicU32::new(first.0),
            closed: Mutex::default(),
        }
    }

    /// Segments the journal has closed so far, in closure order.
    pub fn closed_segments(&self) -> Vec<(SegmentId, Option<JournalSeq>)> {
        self.closed.lock().unwrap().clone()
    }
}

impl SegmentProvider for LinearProvider {
    fn next_segment_id(&self) -> io::Result<SegmentId> {
        Ok(SegmentId(self.next.fetch_add(1, Ordering::Relaxed)))
    }

    fn close_segment(&self, id: SegmentId, last_seq: Option<JournalSeq>) {
        self.closed.lock().unwrap().push((id, last_seq));
    }
}
