use std::io;

use thiserror::Error;

use crate::types::{Paddr, SegmentSeq};

/// Error returned by [`crate::Journal::submit_record`].
#[derive(Debug, Error)]
pub enum Submit {
    /// The record's encoded length exceeds what a single segment write can
    /// carry, even with the record alone in the write.
    ///
    /// The submission is rejected; the journal remains usable.
    #[error("record of {encoded_len} bytes exceeds max write length {max_write_length}")]
    OversizeRecord { encoded_len: u64, max_write_length: u64 },
    /// The device, segment provider, or journal state reported a failure.
    ///
    /// The journal is unsafe for further writes until reopened.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Error returned by [`crate::Journal::replay`].
#[derive(Debug, Error)]
pub enum Replay {
    #[error("duplicate segment sequence {segment_seq} in replay set")]
    DuplicateSegmentSeq { segment_seq: SegmentSeq },
    /// A record before the journal tail failed to decode.
    ///
    /// A decode failure in the final segment is a torn tail and is recovered
    /// silently; anywhere else it is fatal.
    #[error("corrupt record at {at} before the journal tail")]
    CorruptRecord {
        at: Paddr,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A checksum mismatch was detected.
///
/// Usually wrapped in another error, such as [`io::Error`].
#[derive(Debug, Error)]
#[error("checksum mismatch")]
pub struct ChecksumMismatch;

pub(crate) fn invalid_data<E>(e: E) -> io::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    io::Error::new(io::ErrorKind::InvalidData, e)
}
