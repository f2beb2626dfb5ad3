//! Replaying the persisted journal at startup.
//!
//! The driver takes the set of segments the segment manager attributes to
//! this journal, orders them by logical sequence, and walks their records,
//! handing every delta to the caller's handler strictly in journal order.
//! The handler is awaited per delta before the driver advances.

use std::future::Future;
use std::io;

use itertools::Itertools;
use log::{debug, info, warn};

use crate::{
    device::SegmentRead,
    error,
    record::DeltaInfo,
    scan::{RecordScanner, ScanError},
    segment,
    types::{JournalSeq, Paddr, SegmentId},
};

/// Applies replayed deltas.
///
/// `seq` is the record's journal position, `record_base` the physical address
/// of the record's first block; deltas of one record share both.
pub trait DeltaHandler {
    fn apply(
        &mut self,
        seq: JournalSeq,
        record_base: Paddr,
        delta: DeltaInfo,
    ) -> impl Future<Output = io::Result<()>> + Send;
}

impl<F, Fut> DeltaHandler for F
where
    F: FnMut(JournalSeq, Paddr, DeltaInfo) -> Fut,
    Fut: Future<Output = io::Result<()>> + Send,
{
    fn apply(
        &mut self,
        seq: JournalSeq,
        record_base: Paddr,
        delta: DeltaInfo,
    ) -> impl Future<Output = io::Result<()>> + Send {
        self(seq, record_base, delta)
    }
}

/// Order the replay set and apply every persisted delta.
///
/// Returns the position of the last replayed record, or `None` for an empty
/// journal.
pub(crate) async fn replay_segments<S, H>(
    device: &S,
    block_size: u64,
    segment_size: u64,
    segments: Vec<(SegmentId, segment::Header)>,
    handler: &mut H,
) -> Result<Option<JournalSeq>, error::Replay>
where
    S: SegmentRead,
    H: DeltaHandler,
{
    let segments = segments
        .into_iter()
        .sorted_by_key(|(_, header)| header.segment_seq)
        .collect::<Vec<_>>();
    if let Some(((_, dup), _)) = segments
        .iter()
        .tuple_windows()
        .find(|((_, a), (_, b))| a.segment_seq == b.segment_seq)
    {
        return Err(error::Replay::DuplicateSegmentSeq {
            segment_seq: dup.segment_seq,
        });
    }

    let mut last = None;
    let num_segments = segments.len();
    for (i, (id, header)) in segments.into_iter().enumerate() {
        let at_tail = i + 1 == num_segments;
        debug!("replaying {id} seq={} tail={at_tail}", header.segment_seq);

        let mut scanner = RecordScanner::new(device, id, header, block_size, segment_size);
        loop {
            match scanner.next_record().await {
                Ok(Some(record)) => {
                    debug_assert!(last < Some(record.seq));
                    debug!(
                        "record at {}: {} deltas, md {} data {}",
                        record.seq,
                        record.deltas.len(),
                        record.header.mdlength,
                        record.header.dlength
                    );
                    for delta in record.deltas {
                        handler.apply(record.seq, record.seq.paddr, delta).await?;
                    }
                    last = Some(record.seq);
                }
                Ok(None) => break,
                Err(ScanError::Torn(e)) if at_tail => {
                    // A partial write at the very end of the journal; whatever
                    // precedes it replayed fine.
                    warn!("torn tail in {id}: {e}");
                    break;
                }
                Err(ScanError::Torn(e)) => {
                    return Err(error::Replay::CorruptRecord {
                        at: Paddr {
                            segment: id,
                            offset: scanner.offset(),
                        },
                        source: e,
                    });
                }
                Err(ScanError::Io(e)) => return Err(e.into()),
            }
        }
    }

    match last {
        Some(last) => info!("replayed up to {last}"),
        None => info!("journal is empty"),
    }
    Ok(last)
}
