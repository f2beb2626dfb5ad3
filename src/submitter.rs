//! The record submitter: admits concurrent submissions, groups them into
//! batches, and enforces the outstanding-I/O bound.
//!
//! The scheduling decision runs under the write pipeline's device-submission
//! stage, so at most one submission is deciding at a time; completions race
//! only for the state lock. While a slot is free and the batch is empty, a
//! record fast-paths as its own write. While all slots are busy, records
//! accumulate into the current batch, which is flushed as a single write by
//! the next completion (or sooner, if it fills up and a submission must
//! wait). The only suspension points are the device writes themselves and
//! the single-slot `wait_submit` rendezvous.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use log::{trace, warn};
use tokio::sync::{oneshot, Notify};

use crate::{
    batch::RecordBatch,
    device::SegmentManager,
    error,
    manager::Manager,
    record::Record,
    types::JournalSeq,
    Options,
};

/// Outcome of a scheduling decision.
pub(crate) enum Submission<M: SegmentManager> {
    /// The record was submitted alone; the caller drives the device write
    /// and reports its outcome through the slot.
    Fast {
        seq: JournalSeq,
        write: Pin<Box<dyn Future<Output = io::Result<()>> + Send>>,
        slot: FastSlot<M>,
    },
    /// The record joined the current batch; the position resolves when the
    /// batch's write completes (`None` on failure).
    Batched {
        rx: oneshot::Receiver<Option<JournalSeq>>,
    },
}

/// The I/O slot held by a fast-path submission.
///
/// Settled explicitly via [`Self::finish`] once the device write resolved;
/// dropping it unsettled (the caller vanished mid-write) releases the slot
/// and marks the journal failed, since the device state is unknown.
pub(crate) struct FastSlot<M: SegmentManager> {
    shared: Option<Arc<Shared<M>>>,
}

impl<M: SegmentManager> FastSlot<M> {
    pub fn finish(mut self, result: &io::Result<()>) {
        if let Err(e) = result {
            warn!("fast path write failed: {e}");
        }
        let shared = self.shared.take().expect("slot already settled");
        Self::settle(&shared, result.is_err());
    }

    fn settle(shared: &Arc<Shared<M>>, failed: bool) {
        let mut st = shared.state.lock().unwrap();
        if failed {
            st.failed = true;
        }
        RecordSubmitter::decrement_io_with_flush(shared, &mut st);
    }
}

impl<M: SegmentManager> Drop for FastSlot<M> {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            warn!("fast path abandoned before its write settled");
            Self::settle(&shared, true);
        }
    }
}

/// What a submission attempt must await before retrying.
enum Blocked {
    /// An I/O slot, via the `wait_submit` rendezvous.
    Slot,
    /// A segment roll.
    Roll,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum IoState {
    Idle,
    Pending,
    Full,
}

struct State {
    num_outstanding_io: usize,
    /// Fixed pool of batch slots; in-flight batches keep their index until
    /// their write settles.
    batches: Vec<RecordBatch>,
    free: Vec<usize>,
    current: usize,
    /// A device write failed; the journal is unsafe until reopened.
    failed: bool,
    closing: bool,
}

impl State {
    fn io_state(&self, limit: usize) -> IoState {
        debug_assert!(self.num_outstanding_io <= limit);
        match self.num_outstanding_io {
            0 => IoState::Idle,
            n if n == limit => IoState::Full,
            _ => IoState::Pending,
        }
    }
}

struct Shared<M: SegmentManager> {
    segments: Arc<Manager<M>>,
    opts: Options,
    state: Mutex<State>,
    /// Single-slot rendezvous waking a submission blocked on FULL. Relies on
    /// the permit a `notify_one` leaves behind, so registration after
    /// releasing the state lock cannot miss a wakeup.
    wait_submit: Notify,
    /// Signalled whenever `num_outstanding_io` drops to zero.
    quiesced: Notify,
}

pub(crate) struct RecordSubmitter<M: SegmentManager> {
    shared: Arc<Shared<M>>,
}

impl<M: SegmentManager> RecordSubmitter<M> {
    pub fn new(segments: Arc<Manager<M>>, opts: Options) -> Self {
        assert!(opts.io_depth_limit > 0 && opts.batch_capacity > 0);
        // One slot per possible in-flight write, plus the accumulating batch.
        let pool = opts.io_depth_limit + 1;
        let batches = (0..pool).map(|_| RecordBatch::default()).collect();
        Self {
            shared: Arc::new(Shared {
                segments,
                opts,
                state: Mutex::new(State {
                    num_outstanding_io: 0,
                    batches,
                    free: (1..pool).collect(),
                    current: 0,
                    failed: false,
                    closing: false,
                }),
                wait_submit: Notify::new(),
                quiesced: Notify::new(),
            }),
        }
    }

    /// Make the scheduling decision for `record`.
    ///
    /// Must be called under the write pipeline's device-submission stage;
    /// acceptance order equals offset-reservation order.
    pub async fn submit(&self, record: Record) -> Result<Submission<M>, error::Submit> {
        let shared = &*self.shared;
        let limit = shared.opts.io_depth_limit;
        let block_size = shared.segments.block_size();
        let max_write_length = shared.segments.max_write_length();
        let size = record.size(block_size);
        if size.encoded_len() > max_write_length {
            return Err(error::Submit::OversizeRecord {
                encoded_len: size.encoded_len(),
                max_write_length,
            });
        }

        loop {
            // The state lock is confined to this block; every `await` below
            // happens with the lock released.
            let blocked = {
                let mut st = shared.state.lock().unwrap();
                if st.closing {
                    return Err(io::Error::other("journal closed").into());
                }
                if st.failed {
                    return Err(io::Error::other("journal failed; reopen required").into());
                }

                // Roll first: the record, plus whatever has accumulated, must
                // fit the segment it will be reserved in.
                let pending = st.batches[st.current].encoded_length();
                if shared.segments.needs_roll(pending + size.encoded_len()) {
                    if st.batches[st.current].is_empty() {
                        Blocked::Roll
                    } else if st.io_state(limit) == IoState::Full {
                        trace!("submit waits for a slot to flush before rolling");
                        Blocked::Slot
                    } else {
                        Self::flush_current_batch(&self.shared, &mut st);
                        Blocked::Roll
                    }
                } else {
                    match st.io_state(limit) {
                        IoState::Full => {
                            let projected = st.batches[st.current].can_batch(
                                &size,
                                shared.opts.batch_capacity,
                                shared.opts.batch_flush_size,
                            );
                            if projected == 0 || projected > max_write_length {
                                trace!("submit waits for an I/O slot");
                                Blocked::Slot
                            } else {
                                let current = st.current;
                                let rx = st.batches[current].add_pending(record, size);
                                trace!("record batched; batch now {projected} bytes");
                                return Ok(Submission::Batched { rx });
                            }
                        }
                        state => {
                            if !st.batches[st.current].is_empty() {
                                // Left over from a FULL phase; push it out
                                // and retry with the slot freshly taken.
                                Self::flush_current_batch(&self.shared, &mut st);
                                continue;
                            }
                            st.num_outstanding_io += 1;
                            let context = shared.segments.write_context();
                            let (committed_to, nonce) = match context {
                                Ok(context) => context,
                                Err(e) => {
                                    st.failed = true;
                                    Self::decrement_io_with_flush(&self.shared, &mut st);
                                    return Err(e.into());
                                }
                            };
                            let current = st.current;
                            let bytes = st.batches[current].submit_pending_fast(
                                &record,
                                block_size,
                                committed_to,
                                nonce,
                            );
                            match shared.segments.write(bytes) {
                                Ok((seq, write)) => {
                                    trace!("fast path from {state:?} submitted at {seq}");
                                    return Ok(Submission::Fast {
                                        seq,
                                        write: Box::pin(write),
                                        slot: FastSlot {
                                            shared: Some(Arc::clone(&self.shared)),
                                        },
                                    });
                                }
                                Err(e) => {
                                    st.failed = true;
                                    Self::decrement_io_with_flush(&self.shared, &mut st);
                                    return Err(e.into());
                                }
                            }
                        }
                    }
                }
            };

            match blocked {
                Blocked::Slot => shared.wait_submit.notified().await,
                Blocked::Roll => shared.segments.roll().await?,
            }
        }
    }

    /// Reject new submissions and wait until all in-flight writes, including
    /// a stranded batch, have settled.
    pub async fn shutdown(&self) {
        let shared = &*self.shared;
        loop {
            {
                let mut st = shared.state.lock().unwrap();
                st.closing = true;
                if !st.batches[st.current].is_empty() {
                    if st.failed {
                        let current = st.current;
                        st.batches[current].fail_pending();
                    } else if st.io_state(shared.opts.io_depth_limit) != IoState::Full {
                        Self::flush_current_batch(&self.shared, &mut st);
                    }
                }
                if st.num_outstanding_io == 0 && st.batches[st.current].is_empty() {
                    return;
                }
            }
            shared.quiesced.notified().await;
        }
    }

    /// Encode the current batch, reserve its position, and spawn the device
    /// write. The caller must have verified a free I/O slot.
    fn flush_current_batch(shared: &Arc<Shared<M>>, st: &mut State) {
        debug_assert!(!st.batches[st.current].is_empty());
        debug_assert!(st.num_outstanding_io < shared.opts.io_depth_limit);

        let idx = st.current;
        st.current = st.free.pop().expect("batch pool exhausted");
        st.num_outstanding_io += 1;

        let (committed_to, nonce) = match shared.segments.write_context() {
            Ok(context) => context,
            Err(e) => {
                warn!("batch flush failed: {e}");
                st.batches[idx].fail_pending();
                Self::retire_batch(shared, st, idx);
                return;
            }
        };
        let num_records = st.batches[idx].num_records();
        let bytes = st.batches[idx].encode_records(shared.segments.block_size(), committed_to, nonce);
        match shared.segments.write(bytes) {
            Ok((start, write)) => {
                let Ok(rt) = tokio::runtime::Handle::try_current() else {
                    // Runtime teardown: nothing left to drive the write.
                    warn!("no runtime to drive the batch write");
                    st.batches[idx].set_result(None);
                    Self::retire_batch(shared, st, idx);
                    return;
                };
                trace!("flushing batch of {num_records} records at {start}");
                let shared = Arc::clone(shared);
                rt.spawn(async move {
                    let result = write.await;
                    let mut st = shared.state.lock().unwrap();
                    if let Err(e) = &result {
                        warn!("batch write failed: {e}");
                        st.failed = true;
                    }
                    st.batches[idx].set_result(result.is_ok().then_some(start));
                    st.free.push(idx);
                    Self::decrement_io_with_flush(&shared, &mut st);
                });
            }
            Err(e) => {
                warn!("batch reservation failed: {e}");
                st.batches[idx].set_result(None);
                Self::retire_batch(shared, st, idx);
            }
        }
    }

    /// Return a batch slot whose write never launched, then release its I/O
    /// slot through the common path so waiters learn about it.
    fn retire_batch(shared: &Arc<Shared<M>>, st: &mut State, idx: usize) {
        st.free.push(idx);
        st.failed = true;
        Self::decrement_io_with_flush(shared, st);
    }

    /// Release an I/O slot: wake a waiting submission, signal quiescence,
    /// and push out whatever has accumulated so a stranded record is never
    /// held indefinitely.
    fn decrement_io_with_flush(shared: &Arc<Shared<M>>, st: &mut State) {
        debug_assert!(st.num_outstanding_io > 0);
        st.num_outstanding_io -= 1;
        shared.wait_submit.notify_one();
        if st.num_outstanding_io == 0 {
            shared.quiesced.notify_one();
        }
        if !st.batches[st.current].is_empty() {
            if st.failed {
                st.batches[st.current].fail_pending();
            } else {
                Self::flush_current_batch(shared, st);
            }
        }
    }
}
