//! A reusable slot accumulating pending records into a single device write.
//!
//! One batch is the unit of I/O. Contributors hold one-shot completion
//! channels, all fired when the batch's write resolves; contributor *i*'s
//! position is the batch's write start advanced by the cumulative encoded
//! length of contributors `[0..i)`.

use tokio::sync::oneshot;

use crate::{
    record::{self, Record},
    types::{JournalSeq, RecordSize, SegmentNonce},
};

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) enum BatchState {
    /// In the free pool; no records, no promises.
    #[default]
    Empty,
    /// Holds at least one record; the submitter may still append.
    Pending,
    /// Encoded and handed to the segment manager; appending is forbidden.
    Submitting,
}

struct Contributor {
    tx: oneshot::Sender<Option<JournalSeq>>,
    /// Cumulative encoded length of earlier contributors.
    base: u64,
}

#[derive(Default)]
pub(crate) struct RecordBatch {
    state: BatchState,
    records: Vec<(Record, RecordSize)>,
    contributors: Vec<Contributor>,
    encoded_length: u64,
}

impl RecordBatch {
    #[cfg(test)]
    pub fn state(&self) -> BatchState {
        self.state
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn num_records(&self) -> usize {
        self.records.len()
    }

    pub fn encoded_length(&self) -> u64 {
        self.encoded_length
    }

    /// The encoded length the batch would reach if a record of `size` were
    /// added, or `0` if adding would exceed `batch_capacity` records or
    /// `batch_flush_size` bytes.
    ///
    /// The first record always fits: the flush size is a soft cap.
    pub fn can_batch(&self, size: &RecordSize, batch_capacity: usize, batch_flush_size: u64) -> u64 {
        debug_assert_ne!(self.state, BatchState::Submitting);
        if self.records.is_empty() {
            return size.encoded_len();
        }
        let projected = self.encoded_length + size.encoded_len();
        if self.records.len() + 1 > batch_capacity || projected > batch_flush_size {
            return 0;
        }
        projected
    }

    /// Append `record` and return the deferred position, resolved when the
    /// batch's write completes (`None` on write failure).
    pub fn add_pending(
        &mut self,
        record: Record,
        size: RecordSize,
    ) -> oneshot::Receiver<Option<JournalSeq>> {
        debug_assert_ne!(self.state, BatchState::Submitting);
        let (tx, rx) = oneshot::channel();
        self.contributors.push(Contributor {
            tx,
            base: self.encoded_length,
        });
        self.encoded_length += size.encoded_len();
        self.records.push((record, size));
        self.state = BatchState::Pending;
        rx
    }

    /// Serialize the accumulated records into one block-aligned buffer and
    /// freeze the batch.
    pub fn encode_records(
        &mut self,
        block_size: u64,
        committed_to: Option<JournalSeq>,
        segment_nonce: SegmentNonce,
    ) -> Vec<u8> {
        debug_assert_eq!(self.state, BatchState::Pending);
        self.state = BatchState::Submitting;

        let mut out = Vec::with_capacity(self.encoded_length as usize);
        for (record, _) in self.records.drain(..) {
            record::encode_record(&record, &mut out, block_size, committed_to, segment_nonce);
        }
        debug_assert_eq!(out.len() as u64, self.encoded_length);
        out
    }

    /// Fire every contributor's promise with its resolved position (from the
    /// write start) or with failure, and return the slot to `Empty`.
    pub fn set_result(&mut self, write_start: Option<JournalSeq>) {
        debug_assert_eq!(self.state, BatchState::Submitting);
        for contributor in self.contributors.drain(..) {
            let seq = write_start.map(|start| start.advance(contributor.base));
            let _ = contributor.tx.send(seq);
        }
        self.reset();
    }

    /// Fail all contributors without the batch having been submitted.
    ///
    /// Used when the journal enters the failed state with records stranded in
    /// an unflushed batch.
    pub fn fail_pending(&mut self) {
        for contributor in self.contributors.drain(..) {
            let _ = contributor.tx.send(None);
        }
        self.reset();
    }

    /// Encode a single record without going through the pending state.
    ///
    /// Valid only on an `Empty` batch, with an I/O slot already acquired by
    /// the caller; the slot is immediately reusable afterwards.
    pub fn submit_pending_fast(
        &mut self,
        record: &Record,
        block_size: u64,
        committed_to: Option<JournalSeq>,
        segment_nonce: SegmentNonce,
    ) -> Vec<u8> {
        debug_assert_eq!(self.state, BatchState::Empty);
        debug_assert!(self.records.is_empty() && self.contributors.is_empty());

        let size = record.size(block_size);
        let mut out = Vec::with_capacity(size.encoded_len() as usize);
        record::encode_record(record, &mut out, block_size, committed_to, segment_nonce);
        out
    }

    fn reset(&mut self) {
        self.records.clear();
        self.encoded_length = 0;
        self.state = BatchState::Empty;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::DeltaInfo;
    use crate::types::{Paddr, SegmentId};

    const BLOCK: u64 = 512;

    fn record(extent_blocks: usize) -> Record {
        Record {
            deltas: vec![DeltaInfo::from(vec![1; 16])],
            data_extents: vec![vec![2; extent_blocks * BLOCK as usize]],
        }
    }

    fn start() -> JournalSeq {
        JournalSeq {
            segment_seq: 0,
            paddr: Paddr {
                segment: SegmentId(0),
                offset: BLOCK,
            },
        }
    }

    #[test]
    fn capacity_and_flush_size_bound_the_batch() {
        let mut batch = RecordBatch::default();
        let size = record(1).size(BLOCK);

        // The first record fits regardless of the flush size.
        assert_eq!(batch.can_batch(&size, 2, 512), size.encoded_len());
        let _rx = batch.add_pending(record(1), size);

        // A second record would blow the byte cap.
        assert_eq!(batch.can_batch(&size, 2, size.encoded_len()), 0);
        // With a generous byte cap, the record cap kicks in.
        assert_eq!(batch.can_batch(&size, 2, 1 << 20), 2 * size.encoded_len());
        let _rx = batch.add_pending(record(1), size);
        assert_eq!(batch.can_batch(&size, 2, 1 << 20), 0);
    }

    #[test]
    fn contributors_resolve_at_cumulative_offsets() {
        let mut batch = RecordBatch::default();
        let sizes: Vec<_> = [1, 3, 2]
            .into_iter()
            .map(|blocks| record(blocks).size(BLOCK))
            .collect();
        let mut rxs = Vec::new();
        for (blocks, size) in [1, 3, 2].into_iter().zip(&sizes) {
            rxs.push(batch.add_pending(record(blocks), *size));
        }
        assert_eq!(batch.state(), BatchState::Pending);

        let bytes = batch.encode_records(BLOCK, None, 7);
        assert_eq!(batch.state(), BatchState::Submitting);
        assert_eq!(
            bytes.len() as u64,
            sizes.iter().map(RecordSize::encoded_len).sum::<u64>()
        );

        batch.set_result(Some(start()));
        assert_eq!(batch.state(), BatchState::Empty);

        let mut expect = start();
        for (rx, size) in rxs.iter_mut().zip(&sizes) {
            let seq = rx.try_recv().unwrap().unwrap();
            assert_eq!(seq, expect);
            expect = expect.advance(size.encoded_len());
        }
    }

    #[test]
    fn failure_fans_out_to_all_contributors() {
        let mut batch = RecordBatch::default();
        let size = record(1).size(BLOCK);
        let mut a = batch.add_pending(record(1), size);
        let mut b = batch.add_pending(record(1), size);
        batch.encode_records(BLOCK, None, 7);
        batch.set_result(None);

        assert_eq!(a.try_recv().unwrap(), None);
        assert_eq!(b.try_recv().unwrap(), None);
    }

    #[test]
    fn fast_path_leaves_the_batch_empty() {
        let mut batch = RecordBatch::default();
        let rec = record(2);
        let bytes = batch.submit_pending_fast(&rec, BLOCK, None, 7);
        assert_eq!(bytes.len() as u64, rec.size(BLOCK).encoded_len());
        assert_eq!(batch.state(), BatchState::Empty);
        assert!(batch.is_empty());
    }
}
