//! The journal facade tying the segment manager, submitter, and replay
//! driver together.

use std::io;
use std::sync::{Arc, Mutex, OnceLock};

use log::info;

use crate::{
    device::{SegmentManager, SegmentProvider, SegmentRead},
    error,
    manager::Manager,
    pipeline::{OrderingHandle, WritePipeline},
    record::Record,
    replay::{self, DeltaHandler},
    segment,
    submitter::{RecordSubmitter, Submission},
    types::{JournalSeq, Paddr, SegmentId, SegmentSeq},
    Options,
};

/// Where an accepted record landed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RecordLocator {
    /// Physical address of the record's first block.
    pub record_block_base: Paddr,
    /// The record's journal position; strictly greater than that of any
    /// record accepted before it.
    pub seq: JournalSeq,
}

#[derive(Clone, Copy, Debug)]
enum Phase {
    New,
    Opening,
    Open { first: JournalSeq },
    Closed,
}

/// A segmented write-ahead journal over the segment device `M`.
///
/// Constructed closed; [`Self::replay`] may run once, then
/// [`Self::open_for_write`] admits submissions. The segment provider and
/// write pipeline are injected after construction (their owner also owns the
/// journal); the journal must not outlive the provider.
pub struct Journal<M: SegmentManager, S: SegmentRead> {
    scanner: S,
    segments: Arc<Manager<M>>,
    submitter: RecordSubmitter<M>,
    pipeline: OnceLock<Arc<WritePipeline>>,
    phase: Mutex<Phase>,
}

impl<M: SegmentManager, S: SegmentRead> Journal<M, S> {
    pub fn new(device: M, scanner: S, opts: Options) -> Self {
        let segments = Arc::new(Manager::new(Arc::new(device)));
        let submitter = RecordSubmitter::new(Arc::clone(&segments), opts);
        Self {
            scanner,
            segments,
            submitter,
            pipeline: OnceLock::new(),
            phase: Mutex::new(Phase::New),
        }
    }

    /// Inject the policy component naming journal segments.
    ///
    /// Must be called before [`Self::open_for_write`].
    pub fn set_segment_provider(&self, provider: Arc<dyn SegmentProvider>) {
        self.segments.set_provider(provider);
    }

    /// Share an externally owned ordering pipeline.
    ///
    /// Without this, the journal lazily creates its own; all handles must
    /// come from the one pipeline either way.
    pub fn set_write_pipeline(&self, pipeline: Arc<WritePipeline>) {
        let _ = self.pipeline.set(pipeline);
    }

    /// Register an ordering handle on the journal's pipeline.
    pub fn handle(&self) -> OrderingHandle {
        self.pipeline.get_or_init(WritePipeline::new).register()
    }

    /// Roll into the first writable segment and return the position of the
    /// first record-writable byte.
    ///
    /// Idempotent once per journal instance: a second call returns the same
    /// position without touching the device.
    pub async fn open_for_write(&self) -> Result<JournalSeq, error::Submit> {
        {
            let mut phase = self.phase.lock().unwrap();
            match *phase {
                Phase::Open { first } => return Ok(first),
                Phase::Opening => return Err(io::Error::other("open already in progress").into()),
                Phase::Closed => return Err(io::Error::other("journal closed").into()),
                Phase::New => *phase = Phase::Opening,
            }
        }
        match self.segments.open().await {
            Ok(first) => {
                info!("journal open for writes at {first}");
                *self.phase.lock().unwrap() = Phase::Open { first };
                Ok(first)
            }
            Err(e) => {
                *self.phase.lock().unwrap() = Phase::New;
                Err(e.into())
            }
        }
    }

    /// Append `record` to the journal.
    ///
    /// Resolves once the record's bytes are durable, with commit
    /// acknowledgements through `handle` delivered in submission order.
    pub async fn submit_record(
        &self,
        record: Record,
        handle: &OrderingHandle,
    ) -> Result<RecordLocator, error::Submit> {
        if !matches!(*self.phase.lock().unwrap(), Phase::Open { .. }) {
            return Err(io::Error::other("journal not open for writes").into());
        }
        debug_assert!(self
            .pipeline
            .get()
            .is_some_and(|p| Arc::ptr_eq(p, handle.pipeline())));

        let ds = handle.enter_device_submission().await;
        let submission = self.submitter.submit(record).await?;
        let mut finalize = handle.finalize_ticket();
        drop(ds);

        let seq = match submission {
            Submission::Fast { seq, write, slot } => {
                let result = write.await;
                slot.finish(&result);
                result?;
                seq
            }
            Submission::Batched { rx } => rx
                .await
                .map_err(|_| io::Error::other("journal shut down before the write resolved"))?
                .ok_or_else(|| io::Error::other("batch write failed"))?,
        };

        finalize.enter().await;
        self.segments.mark_committed(seq);
        drop(finalize);

        Ok(RecordLocator {
            record_block_base: seq.paddr,
            seq,
        })
    }

    /// Replay the persisted journal, invoking `handler` per delta strictly in
    /// journal order.
    ///
    /// `segments` is the set the segment manager attributes to this journal.
    /// Must run before [`Self::open_for_write`]; on success the next roll
    /// lands just past the last replayed segment.
    pub async fn replay<H: DeltaHandler>(
        &self,
        segments: Vec<(SegmentId, segment::Header)>,
        handler: &mut H,
    ) -> Result<Option<JournalSeq>, error::Replay> {
        if !matches!(*self.phase.lock().unwrap(), Phase::New) {
            return Err(error::Replay::Io(io::Error::other(
                "replay requires a journal not yet opened for writes",
            )));
        }
        let last = replay::replay_segments(
            &self.scanner,
            self.segments.block_size(),
            self.segments.segment_size(),
            segments,
            handler,
        )
        .await?;
        if let Some(last) = last {
            self.segments.set_segment_seq(last.segment_seq);
            self.segments.mark_committed(last);
        }
        Ok(last)
    }

    /// Quiesce and close the journal.
    ///
    /// New submissions are rejected, in-flight writes (including a stranded
    /// batch) are drained, then the current segment is finalized.
    pub async fn close(&self) -> io::Result<()> {
        {
            let mut phase = self.phase.lock().unwrap();
            if matches!(*phase, Phase::Closed) {
                return Ok(());
            }
            *phase = Phase::Closed;
        }
        self.submitter.shutdown().await;
        self.segments.close().await
    }

    /// Sequence of the current segment (or of the last replayed one before
    /// [`Self::open_for_write`]).
    pub fn segment_seq(&self) -> Option<SegmentSeq> {
        self.segments.segment_seq()
    }

    /// The highest journal position known to be durable in order.
    pub fn committed_to(&self) -> Option<JournalSeq> {
        self.segments.committed_to()
    }

    pub fn block_size(&self) -> u64 {
        self.segments.block_size()
    }

    /// Usable bytes per segment write; a lone record above this is rejected.
    pub fn max_write_length(&self) -> u64 {
        self.segments.max_write_length()
    }
}
