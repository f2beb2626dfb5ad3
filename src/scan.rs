//! Iterating the records persisted in one segment.
//!
//! The cursor walks record headers from just past the segment header. An
//! all-zero header or a stale nonce ends the segment cleanly (segment reuse
//! leaves records of earlier incarnations behind the new header); damaged
//! lengths or checksum mismatches classify as *torn*, which replay tolerates
//! only at the journal's tail.

use std::io;

use log::trace;

use crate::{
    device::SegmentRead,
    record::{self, DeltaInfo, RecordHeader},
    segment,
    types::{JournalSeq, Paddr, SegmentId},
};

/// A record as found in a persisted segment.
pub(crate) struct ScannedRecord {
    pub seq: JournalSeq,
    pub header: RecordHeader,
    pub deltas: Vec<DeltaInfo>,
}

#[derive(Debug)]
pub(crate) enum ScanError {
    /// The record's persisted form is damaged (bad lengths, failed checksum,
    /// undecodable deltas).
    Torn(io::Error),
    /// The device itself failed.
    Io(io::Error),
}

pub(crate) struct RecordScanner<'a, S> {
    device: &'a S,
    segment: SegmentId,
    header: segment::Header,
    offset: u64,
    block_size: u64,
    segment_size: u64,
}

impl<'a, S: SegmentRead> RecordScanner<'a, S> {
    /// A cursor over `segment`, starting just past its header block.
    pub fn new(device: &'a S, segment: SegmentId, header: segment::Header, block_size: u64, segment_size: u64) -> Self {
        Self {
            device,
            segment,
            header,
            offset: block_size,
            block_size,
            segment_size,
        }
    }

    /// Offset of the next record to scan.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// The next record, `None` at the clean end of the segment.
    pub async fn next_record(&mut self) -> Result<Option<ScannedRecord>, ScanError> {
        if self.offset + self.block_size > self.segment_size {
            return Ok(None);
        }
        let first_block = self
            .device
            .read(self.segment, self.offset, self.block_size as usize)
            .await
            .map_err(ScanError::Io)?;
        let header = RecordHeader::decode(&mut first_block.as_slice()).map_err(ScanError::Torn)?;
        let Some(header) = header else {
            trace!("end of {}: unwritten space at {}", self.segment, self.offset);
            return Ok(None);
        };
        if header.segment_nonce != self.header.segment_nonce {
            trace!("end of {}: stale nonce at {}", self.segment, self.offset);
            return Ok(None);
        }
        self.check_lengths(&header)?;

        let mdata = if header.mdlength as u64 > self.block_size {
            let mut mdata = first_block[RecordHeader::LEN..].to_vec();
            let rest = self
                .device
                .read(
                    self.segment,
                    self.offset + self.block_size,
                    (header.mdlength as u64 - self.block_size) as usize,
                )
                .await
                .map_err(ScanError::Io)?;
            mdata.extend_from_slice(&rest);
            mdata
        } else {
            first_block[RecordHeader::LEN..header.mdlength as usize].to_vec()
        };
        let data = self
            .device
            .read(
                self.segment,
                self.offset + header.mdlength as u64,
                header.dlength as usize,
            )
            .await
            .map_err(ScanError::Io)?;

        record::verify_checksums(&header, &mdata, &data).map_err(ScanError::Torn)?;
        let deltas = record::decode_deltas(&mdata, header.deltas_count).map_err(ScanError::Torn)?;

        let seq = JournalSeq {
            segment_seq: self.header.segment_seq,
            paddr: Paddr {
                segment: self.segment,
                offset: self.offset,
            },
        };
        self.offset += header.mdlength as u64 + header.dlength as u64;
        trace!("scanned record at {seq}: {} deltas", deltas.len());

        Ok(Some(ScannedRecord { seq, header, deltas }))
    }

    fn check_lengths(&self, header: &RecordHeader) -> Result<(), ScanError> {
        let md = header.mdlength as u64;
        let d = header.dlength as u64;
        let sane = md >= self.block_size
            && md % self.block_size == 0
            && d % self.block_size == 0
            && self.offset + md + d <= self.segment_size;
        if sane {
            Ok(())
        } else {
            Err(ScanError::Torn(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("implausible record lengths md={md} d={d}"),
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        device::{LinearProvider, Memory},
        manager::Manager,
        record::Record,
        segment::Header,
    };

    const SEGMENT: u64 = 32 * 512;
    const BLOCK: u64 = 512;

    fn record(tag: u8) -> Record {
        Record {
            deltas: vec![DeltaInfo::from(vec![tag; 24])],
            data_extents: vec![vec![tag; 512]],
        }
    }

    async fn write_records(mem: &Memory, records: &[Record]) -> Header {
        let manager = Manager::new(Arc::new(mem.clone()));
        manager.set_provider(Arc::new(LinearProvider::new()));
        manager.open().await.unwrap();
        for r in records {
            let (committed_to, nonce) = manager.write_context().unwrap();
            let mut buf = Vec::new();
            record::encode_record(r, &mut buf, BLOCK, committed_to, nonce);
            let (_, fut) = manager.write(buf).unwrap();
            fut.await.unwrap();
        }
        Header::decode(&mem.segment_data(SegmentId(0)).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn scans_records_in_offset_order() {
        let mem = Memory::new(SEGMENT, BLOCK);
        let records = [record(1), record(2), record(3)];
        let header = write_records(&mem, &records).await;

        let mut scanner = RecordScanner::new(&mem, SegmentId(0), header, BLOCK, SEGMENT);
        let mut offset = BLOCK;
        for r in &records {
            let scanned = scanner.next_record().await.ok().unwrap().unwrap();
            assert_eq!(scanned.seq.paddr.offset, offset);
            assert_eq!(scanned.deltas, r.deltas);
            offset += r.size(BLOCK).encoded_len();
        }
        assert!(scanner.next_record().await.ok().unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_nonce_ends_the_segment() {
        let mem = Memory::new(SEGMENT, BLOCK);
        let header = write_records(&mem, &[record(1), record(2)]).await;

        // Pretend the second record is from an earlier incarnation.
        let second = BLOCK + record(1).size(BLOCK).encoded_len();
        mem.corrupt(SegmentId(0), |buf| {
            let nonce_at = second as usize + RecordHeader::LEN - 4;
            buf[nonce_at..nonce_at + 4].copy_from_slice(&(!header.segment_nonce).to_le_bytes());
        });

        let mut scanner = RecordScanner::new(&mem, SegmentId(0), header, BLOCK, SEGMENT);
        assert!(scanner.next_record().await.ok().unwrap().is_some());
        assert!(scanner.next_record().await.ok().unwrap().is_none());
    }

    #[tokio::test]
    async fn damaged_data_classifies_as_torn() {
        let mem = Memory::new(SEGMENT, BLOCK);
        let header = write_records(&mem, &[record(1)]).await;

        let data_start = BLOCK + record(1).size(BLOCK).mdlength;
        mem.corrupt(SegmentId(0), |buf| {
            buf[data_start as usize] ^= 0xff;
        });

        let mut scanner = RecordScanner::new(&mem, SegmentId(0), header, BLOCK, SEGMENT);
        match scanner.next_record().await {
            Err(ScanError::Torn(_)) => {}
            _ => panic!("expected a torn record"),
        }
    }
}
