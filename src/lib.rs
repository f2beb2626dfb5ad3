//! A segmented write-ahead journal for a transactional object-storage engine.
//!
//! Records -- bundles of metadata deltas plus optional data extents -- are
//! appended atomically to fixed-size segments of a block device, and replayed
//! in commit order on restart. A record is durable exactly when its encoded
//! bytes have been written to the segment device; the replay stream observes
//! records in the order they were accepted.
//!
//! The storage device, the policy that names the next segment, and the
//! cross-transaction ordering pipeline are external collaborators, consumed
//! through the traits in [`device`] and the [`WritePipeline`] handed to the
//! journal after construction.

mod batch;
mod manager;
mod scan;
mod submitter;
mod varint;

pub mod device;
pub mod error;
pub mod pipeline;
pub mod record;
pub mod replay;
pub mod segment;
pub mod types;

mod journal;

pub use crate::{
    journal::{Journal, RecordLocator},
    pipeline::{OrderingHandle, WritePipeline},
    record::{DeltaInfo, Record},
    replay::DeltaHandler,
    types::{JournalSeq, Paddr, RecordSize, SegmentId, SegmentNonce, SegmentSeq},
};

#[cfg(test)]
mod tests;

/// [`Journal`] options.
#[derive(Clone, Copy, Debug)]
pub struct Options {
    /// The maximum number of device writes the journal keeps in flight.
    ///
    /// Submissions beyond this bound either accumulate into the current batch
    /// or suspend until an in-flight write completes.
    ///
    /// Default: 4
    pub io_depth_limit: usize,
    /// The maximum number of records coalesced into a single device write.
    ///
    /// Default: 16
    pub batch_capacity: usize,
    /// Soft cap on the encoded size of a batch, in bytes.
    ///
    /// A record is never refused because of this cap when the batch is empty,
    /// so a single large record can still form a (oversized) batch of one.
    ///
    /// Default: 64 KiB, a typical device stripe.
    pub batch_flush_size: u64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            io_depth_limit: 4,
            batch_capacity: 16,
            batch_flush_size: 64 * 1024,
        }
    }
}
