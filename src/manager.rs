//! The journal segment manager: append-only writer to the current segment
//! and owner of segment transitions.
//!
//! Offset reservation and device submission are split: reservation happens
//! under the state lock, in acceptance order, while the returned future
//! performs the device write without holding any lock. Multiple writes may
//! thus be in flight and complete out of order; the resolved position of a
//! write is fixed at reservation time.

use std::future::Future;
use std::io;
use std::sync::{Arc, Mutex, OnceLock};

use log::{debug, trace, warn};

use crate::{
    device::{SegmentHandle, SegmentManager, SegmentProvider},
    segment,
    types::{JournalSeq, Paddr, SegmentNonce, SegmentSeq},
};

pub(crate) struct Manager<M: SegmentManager> {
    device: Arc<M>,
    provider: OnceLock<Arc<dyn SegmentProvider>>,
    state: Mutex<State<M::Segment>>,
}

struct State<H> {
    current: Option<OpenSegment<H>>,
    next_segment_seq: SegmentSeq,
    committed_to: Option<JournalSeq>,
    closed: bool,
}

struct OpenSegment<H> {
    handle: Arc<H>,
    segment_seq: SegmentSeq,
    nonce: SegmentNonce,
    written_to: u64,
}

impl<H: SegmentHandle> OpenSegment<H> {
    fn end(&self) -> JournalSeq {
        JournalSeq {
            segment_seq: self.segment_seq,
            paddr: Paddr {
                segment: self.handle.segment_id(),
                offset: self.written_to,
            },
        }
    }
}

impl<M: SegmentManager> Manager<M> {
    pub fn new(device: Arc<M>) -> Self {
        Self {
            device,
            provider: OnceLock::new(),
            state: Mutex::new(State {
                current: None,
                next_segment_seq: 0,
                committed_to: None,
                closed: false,
            }),
        }
    }

    pub fn set_provider(&self, provider: Arc<dyn SegmentProvider>) {
        if self.provider.set(provider).is_err() {
            warn!("segment provider already set; ignoring");
        }
    }

    pub fn block_size(&self) -> u64 {
        self.device.block_size()
    }

    pub fn segment_size(&self) -> u64 {
        self.device.segment_size()
    }

    /// Usable bytes per segment: the segment size less the header block.
    pub fn max_write_length(&self) -> u64 {
        self.device.segment_size() - self.device.block_size()
    }

    /// Sequence of the segment currently open for writing, or of the last
    /// replayed segment before [`Self::open`].
    pub fn segment_seq(&self) -> Option<SegmentSeq> {
        let state = self.state.lock().unwrap();
        state
            .current
            .as_ref()
            .map(|c| c.segment_seq)
            .or_else(|| state.next_segment_seq.checked_sub(1))
    }

    /// Seed the sequence counter so the next roll lands just past `seq`.
    ///
    /// Called once after replay, before [`Self::open`].
    pub fn set_segment_seq(&self, seq: SegmentSeq) {
        let mut state = self.state.lock().unwrap();
        debug_assert!(state.current.is_none());
        state.next_segment_seq = seq + 1;
    }

    /// The highest journal position known to be durable in order.
    pub fn committed_to(&self) -> Option<JournalSeq> {
        self.state.lock().unwrap().committed_to
    }

    /// Advance the committed cursor to `seq`.
    ///
    /// The submitter calls this in strictly increasing order; the cursor
    /// never moves backwards.
    pub fn mark_committed(&self, seq: JournalSeq) {
        let mut state = self.state.lock().unwrap();
        debug_assert!(state.committed_to < Some(seq));
        state.committed_to = state.committed_to.max(Some(seq));
    }

    /// `true` iff appending `len` bytes would exceed the current segment's
    /// remaining capacity (or no segment is open).
    pub fn needs_roll(&self, len: u64) -> bool {
        let state = self.state.lock().unwrap();
        match &state.current {
            None => true,
            Some(c) => c.written_to + len > c.handle.write_capacity(),
        }
    }

    /// The values a record must be encoded against: the durable cursor and
    /// the current segment's nonce.
    pub fn write_context(&self) -> io::Result<(Option<JournalSeq>, SegmentNonce)> {
        let state = self.state.lock().unwrap();
        let current = state.current.as_ref().ok_or_else(no_open_segment)?;
        Ok((state.committed_to, current.nonce))
    }

    /// Reserve space for `buf` at the current write offset and return the
    /// reserved position together with the device write.
    ///
    /// The caller drives the returned future; reservation is already done
    /// when this returns.
    pub fn write(
        &self,
        buf: Vec<u8>,
    ) -> io::Result<(JournalSeq, impl Future<Output = io::Result<()>> + Send)> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(journal_closed());
        }
        let current = state.current.as_mut().ok_or_else(no_open_segment)?;
        debug_assert_eq!(buf.len() as u64 % self.device.block_size(), 0);
        if current.written_to + buf.len() as u64 > current.handle.write_capacity() {
            return Err(io::Error::other("write exceeds segment capacity"));
        }
        let seq = current.end();
        current.written_to += buf.len() as u64;
        let handle = Arc::clone(&current.handle);
        drop(state);

        trace!("reserved {} bytes at {seq}", buf.len());
        let offset = seq.paddr.offset;
        Ok((seq, async move { handle.write(offset, buf).await }))
    }

    /// Roll into the first segment and return the position of the first
    /// record-writable byte.
    pub async fn open(&self) -> io::Result<JournalSeq> {
        self.roll().await?;
        let state = self.state.lock().unwrap();
        let current = state.current.as_ref().ok_or_else(no_open_segment)?;
        Ok(current.end())
    }

    /// Close the current segment (if any) and open the next one named by the
    /// segment provider.
    ///
    /// On failure the current segment remains closed and no new segment is
    /// open; writes fail until a roll succeeds. At most one roll runs at a
    /// time -- the submitter is serialized by the write pipeline.
    pub async fn roll(&self) -> io::Result<()> {
        let (prev, segment_seq, tail_hint) = {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return Err(journal_closed());
            }
            (state.current.take(), state.next_segment_seq, state.committed_to)
        };

        if let Some(prev) = prev {
            self.retire(prev).await?;
        }

        let provider = self
            .provider
            .get()
            .ok_or_else(|| io::Error::other("no segment provider configured"))?;
        let id = provider.next_segment_id()?;
        let handle = self.device.open(id).await?;
        let nonce = rand::random::<SegmentNonce>();
        let header = segment::Header {
            segment_seq,
            segment_nonce: nonce,
            journal_tail_hint: tail_hint,
        };
        if let Err(e) = handle.write(0, header.encode(self.device.block_size())).await {
            warn!("initializing {id} failed: {e}");
            let _ = handle.close().await;
            return Err(e);
        }
        debug!("rolled into {id} seq={segment_seq} nonce={nonce:#x}");

        {
            let mut state = self.state.lock().unwrap();
            if !state.closed {
                debug_assert!(state.current.is_none());
                state.current = Some(OpenSegment {
                    handle: Arc::new(handle),
                    segment_seq,
                    nonce,
                    written_to: self.device.block_size(),
                });
                state.next_segment_seq = segment_seq + 1;
                return Ok(());
            }
        }
        // The journal was closed while the roll was in flight.
        let _ = handle.close().await;
        Err(journal_closed())
    }

    /// Finalize the current segment; further writes fail.
    pub async fn close(&self) -> io::Result<()> {
        let prev = {
            let mut state = self.state.lock().unwrap();
            state.closed = true;
            state.current.take()
        };
        match prev {
            Some(prev) => self.retire(prev).await,
            None => Ok(()),
        }
    }

    async fn retire(&self, prev: OpenSegment<M::Segment>) -> io::Result<()> {
        let id = prev.handle.segment_id();
        let end = prev.end();
        prev.handle.close().await?;
        if let Some(provider) = self.provider.get() {
            provider.close_segment(id, Some(end));
        }
        debug!("closed {id} at {end}");
        Ok(())
    }
}

fn no_open_segment() -> io::Error {
    io::Error::other("no segment open for writes")
}

fn journal_closed() -> io::Error {
    io::Error::other("journal closed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{LinearProvider, Memory};
    use crate::segment::Header;
    use crate::types::SegmentId;

    const SEGMENT: u64 = 16 * 512;
    const BLOCK: u64 = 512;

    fn manager(mem: &Memory) -> (Manager<Memory>, Arc<LinearProvider>) {
        let manager = Manager::new(Arc::new(mem.clone()));
        let provider = Arc::new(LinearProvider::new());
        manager.set_provider(provider.clone());
        (manager, provider)
    }

    #[tokio::test]
    async fn open_writes_header_and_reserves_block_zero() {
        let mem = Memory::new(SEGMENT, BLOCK);
        let (manager, _) = manager(&mem);

        let start = manager.open().await.unwrap();
        assert_eq!(start.segment_seq, 0);
        assert_eq!(start.paddr.offset, BLOCK);

        let data = mem.segment_data(SegmentId(0)).unwrap();
        let header = Header::decode(&data).unwrap();
        assert_eq!(header.segment_seq, 0);
        assert_eq!(header.journal_tail_hint, None);
    }

    #[tokio::test]
    async fn writes_advance_sequentially() {
        let mem = Memory::new(SEGMENT, BLOCK);
        let (manager, _) = manager(&mem);
        manager.open().await.unwrap();

        let (a, fut_a) = manager.write(vec![1; 512]).unwrap();
        let (b, fut_b) = manager.write(vec![2; 1024]).unwrap();
        // Reservation order holds even though b's write lands first.
        fut_b.await.unwrap();
        fut_a.await.unwrap();

        assert_eq!(a.paddr.offset, BLOCK);
        assert_eq!(b.paddr.offset, BLOCK + 512);
        let data = mem.segment_data(SegmentId(0)).unwrap();
        assert_eq!(&data[BLOCK as usize..BLOCK as usize + 512], &[1; 512][..]);
        assert_eq!(&data[(BLOCK + 512) as usize..(BLOCK + 1536) as usize], &[2; 1024][..]);
    }

    #[tokio::test]
    async fn roll_bumps_sequence_and_notifies_provider() {
        let mem = Memory::new(SEGMENT, BLOCK);
        let (manager, provider) = manager(&mem);
        manager.open().await.unwrap();
        let (seq, fut) = manager.write(vec![1; 512]).unwrap();
        fut.await.unwrap();
        manager.mark_committed(seq);

        assert!(!manager.needs_roll(SEGMENT - BLOCK - 512));
        assert!(manager.needs_roll(SEGMENT - BLOCK));
        manager.roll().await.unwrap();
        assert_eq!(manager.segment_seq(), Some(1));

        let closed = provider.closed_segments();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].0, SegmentId(0));
        assert_eq!(closed[0].1.unwrap().paddr.offset, BLOCK + 512);

        // The new segment's header records the durable cursor.
        let data = mem.segment_data(SegmentId(1)).unwrap();
        let header = Header::decode(&data).unwrap();
        assert_eq!(header.segment_seq, 1);
        assert_eq!(header.journal_tail_hint, Some(seq));
    }

    #[tokio::test]
    async fn close_rejects_further_writes() {
        let mem = Memory::new(SEGMENT, BLOCK);
        let (manager, _) = manager(&mem);
        manager.open().await.unwrap();
        manager.close().await.unwrap();

        assert!(manager.write(vec![0; 512]).is_err());
        assert!(manager.roll().await.is_err());
    }

    #[tokio::test]
    async fn seeded_sequence_rolls_past_replayed_segments() {
        let mem = Memory::new(SEGMENT, BLOCK);
        let (manager, _) = manager(&mem);
        manager.set_segment_seq(7);
        assert_eq!(manager.segment_seq(), Some(7));

        let start = manager.open().await.unwrap();
        assert_eq!(start.segment_seq, 8);
    }
}
