//! Cross-transaction ordering around the journal's hand-off points.
//!
//! A [`WritePipeline`] carries two FIFO stages. `device_submission` is held
//! across the submitter's scheduling decision, making the submitter
//! effectively single-writer; `finalize` is entered after a write becomes
//! durable and serializes commit acknowledgements in acceptance order, even
//! when device writes complete out of order.
//!
//! Stages are chains of one-shot tickets. A ticket releases its successor
//! when dropped, so a stage is guaranteed to be released on every exit path,
//! including cancellation and error returns.

use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

#[derive(Default)]
struct Stage {
    tail: Mutex<Option<oneshot::Receiver<()>>>,
}

impl Stage {
    /// Append a ticket to the stage's FIFO.
    ///
    /// The ticket's turn comes when its predecessor exits (or immediately if
    /// the stage is idle).
    fn ticket(&self) -> StageTicket {
        let (tx, rx) = oneshot::channel();
        let turn = self.tail.lock().unwrap().replace(rx);
        StageTicket {
            turn,
            exit: Some(tx),
        }
    }
}

pub(crate) struct StageTicket {
    turn: Option<oneshot::Receiver<()>>,
    exit: Option<oneshot::Sender<()>>,
}

impl StageTicket {
    /// Wait for every earlier ticket of this stage to exit.
    pub(crate) async fn enter(&mut self) {
        if let Some(turn) = self.turn.take() {
            // An Err means the predecessor chain was torn down; proceed.
            let _ = turn.await;
        }
    }
}

impl Drop for StageTicket {
    fn drop(&mut self) {
        if let Some(exit) = self.exit.take() {
            let _ = exit.send(());
        }
    }
}

/// The ordering domain shared by transactions that must observe each other's
/// commit order.
#[derive(Default)]
pub struct WritePipeline {
    device_submission: Stage,
    finalize: Stage,
}

impl WritePipeline {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register an [`OrderingHandle`] on this pipeline.
    pub fn register(self: &Arc<Self>) -> OrderingHandle {
        OrderingHandle {
            pipeline: Arc::clone(self),
        }
    }
}

/// A caller-held token serializing its transactions through the journal's
/// stages.
///
/// Clones share the ordering domain: submissions through any clone observe
/// one total acknowledgement order.
#[derive(Clone)]
pub struct OrderingHandle {
    pipeline: Arc<WritePipeline>,
}

impl OrderingHandle {
    pub(crate) fn pipeline(&self) -> &Arc<WritePipeline> {
        &self.pipeline
    }

    /// Enter the device-submission stage, waiting for earlier transactions
    /// to pass their scheduling decision.
    pub(crate) async fn enter_device_submission(&self) -> StageTicket {
        let mut ticket = self.pipeline.device_submission.ticket();
        ticket.enter().await;
        ticket
    }

    /// Take a position in the finalize queue.
    ///
    /// Must be called while still holding the device-submission ticket so the
    /// finalize order matches the acceptance order.
    pub(crate) fn finalize_ticket(&self) -> StageTicket {
        self.pipeline.finalize.ticket()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn tickets_enter_in_fifo_order() {
        let pipeline = WritePipeline::new();
        let handle = pipeline.register();

        let first = handle.enter_device_submission().await;
        let mut second = handle.pipeline.device_submission.ticket();

        let entered = Arc::new(AtomicUsize::new(0));
        let waiter = tokio::spawn({
            let entered = Arc::clone(&entered);
            async move {
                second.enter().await;
                entered.store(1, Ordering::SeqCst);
            }
        });

        tokio::task::yield_now().await;
        assert_eq!(entered.load(Ordering::SeqCst), 0);

        drop(first);
        waiter.await.unwrap();
        assert_eq!(entered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dropped_ticket_releases_successors() {
        let pipeline = WritePipeline::new();
        let handle = pipeline.register();

        // Never entered, dropped immediately: must not wedge the stage.
        let abandoned = handle.pipeline.finalize.ticket();
        drop(abandoned);

        let mut next = handle.finalize_ticket();
        next.enter().await;
    }
}
