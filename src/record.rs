//! Records and their on-disk representation.
//!
//! A record is encoded as a block-aligned metadata region -- the
//! [`RecordHeader`] followed by varint-framed delta payloads and zero padding
//! -- and a block-aligned data region holding the raw data extents:
//!
//! ```text
//! [record_header | delta frames | pad]  [extent_0 .. extent_n | pad]
//!  `-- mdlength bytes ---------------'   `-- dlength bytes --------'
//! ```
//!
//! Checksums are crc32c, following the commit framing convention: the
//! metadata checksum covers the delta frames and padding, the full checksum
//! additionally covers the data region. The header itself is covered by
//! neither (it carries the checksums), but is validated structurally on
//! decode.

use std::io;

use crate::{
    error::{invalid_data, ChecksumMismatch},
    types::{get_u32, JournalSeq, RecordSize, SegmentNonce},
    varint::{decode_varint, encode_varint, varint_len},
};

/// A serialized state change, carried verbatim through the journal and
/// interpreted only by the delta applier above it.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DeltaInfo {
    pub payload: Vec<u8>,
}

impl From<Vec<u8>> for DeltaInfo {
    fn from(payload: Vec<u8>) -> Self {
        Self { payload }
    }
}

/// The atomic unit of submission: metadata deltas plus optional data extents.
///
/// Data extents must be block-aligned in length; the journal never splits or
/// pads an individual extent.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Record {
    pub deltas: Vec<DeltaInfo>,
    pub data_extents: Vec<Vec<u8>>,
}

impl Record {
    /// Block-aligned encoded lengths of this record.
    pub fn size(&self, block_size: u64) -> RecordSize {
        let raw_md = RecordHeader::LEN as u64
            + self
                .deltas
                .iter()
                .map(|d| (varint_len(d.payload.len()) + d.payload.len()) as u64)
                .sum::<u64>();
        let raw_data = self.data_extents.iter().map(|x| x.len() as u64).sum::<u64>();
        RecordSize {
            mdlength: raw_md.next_multiple_of(block_size),
            dlength: raw_data.next_multiple_of(block_size),
        }
    }
}

/// Header prepended to every encoded record.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RecordHeader {
    /// Length of the metadata region, including this header. Block-aligned.
    pub mdlength: u32,
    /// Length of the data region. Block-aligned.
    pub dlength: u32,
    /// Number of delta frames in the metadata region.
    pub deltas_count: u32,
    /// The journal position durable at the moment the record was encoded.
    pub committed_to: Option<JournalSeq>,
    /// crc32c over metadata and data regions (header excluded).
    pub full_checksum: u32,
    /// crc32c over the metadata region (header excluded).
    pub mdata_checksum: u32,
    /// Nonce of the segment incarnation the record was written into.
    pub segment_nonce: SegmentNonce,
}

impl RecordHeader {
    pub const LEN: usize = 4 + 4 + 4 + JournalSeq::ENCODED_LEN + 4 + 4 + 4;

    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.mdlength.to_le_bytes());
        out.extend_from_slice(&self.dlength.to_le_bytes());
        out.extend_from_slice(&self.deltas_count.to_le_bytes());
        JournalSeq::encode_opt(self.committed_to, out);
        out.extend_from_slice(&self.full_checksum.to_le_bytes());
        out.extend_from_slice(&self.mdata_checksum.to_le_bytes());
        out.extend_from_slice(&self.segment_nonce.to_le_bytes());
    }

    /// Read [`Self::LEN`] bytes from `buf` and interpret them as a record
    /// header.
    ///
    /// Returns `None` if the bytes are all zeroes, denoting unwritten space
    /// in a preallocated segment.
    pub fn decode(buf: &mut &[u8]) -> io::Result<Option<Self>> {
        if buf.len() < Self::LEN {
            return Err(invalid_data("short record header"));
        }
        if buf[..Self::LEN].iter().all(|&b| b == 0) {
            *buf = &buf[Self::LEN..];
            return Ok(None);
        }
        let mdlength = get_u32(buf)?;
        let dlength = get_u32(buf)?;
        let deltas_count = get_u32(buf)?;
        let committed_to = JournalSeq::decode_opt(buf)?;
        let full_checksum = get_u32(buf)?;
        let mdata_checksum = get_u32(buf)?;
        let segment_nonce = get_u32(buf)?;

        Ok(Some(Self {
            mdlength,
            dlength,
            deltas_count,
            committed_to,
            full_checksum,
            mdata_checksum,
            segment_nonce,
        }))
    }
}

/// Serialize `record` into `out`.
///
/// Both regions are padded to the block size; the total appended length is
/// exactly `record.size(block_size).encoded_len()`.
pub(crate) fn encode_record(
    record: &Record,
    out: &mut Vec<u8>,
    block_size: u64,
    committed_to: Option<JournalSeq>,
    segment_nonce: SegmentNonce,
) -> RecordSize {
    let size = record.size(block_size);

    let mut mdata = Vec::with_capacity((size.mdlength as usize) - RecordHeader::LEN);
    for delta in &record.deltas {
        encode_varint(delta.payload.len(), &mut mdata);
        mdata.extend_from_slice(&delta.payload);
    }
    mdata.resize((size.mdlength as usize) - RecordHeader::LEN, 0);

    let mdata_checksum = crc32c::crc32c(&mdata);
    let mut full_checksum = mdata_checksum;
    let mut data_len = 0u64;
    for extent in &record.data_extents {
        debug_assert_eq!(extent.len() as u64 % block_size, 0, "unaligned data extent");
        full_checksum = crc32c::crc32c_append(full_checksum, extent);
        data_len += extent.len() as u64;
    }
    let data_pad = (size.dlength - data_len) as usize;
    full_checksum = crc32c::crc32c_append(full_checksum, &vec![0; data_pad]);

    RecordHeader {
        mdlength: size.mdlength as u32,
        dlength: size.dlength as u32,
        deltas_count: record.deltas.len() as u32,
        committed_to,
        full_checksum,
        mdata_checksum,
        segment_nonce,
    }
    .write(out);
    out.extend_from_slice(&mdata);
    for extent in &record.data_extents {
        out.extend_from_slice(extent);
    }
    out.resize(out.len() + data_pad, 0);

    size
}

/// Verify both checksums of a scanned record.
///
/// `mdata` is the metadata region with the header stripped, `data` the full
/// data region.
pub(crate) fn verify_checksums(header: &RecordHeader, mdata: &[u8], data: &[u8]) -> io::Result<()> {
    if crc32c::crc32c(mdata) != header.mdata_checksum {
        return Err(invalid_data(ChecksumMismatch));
    }
    if crc32c::crc32c_append(header.mdata_checksum, data) != header.full_checksum {
        return Err(invalid_data(ChecksumMismatch));
    }
    Ok(())
}

/// Decode `count` delta frames from the metadata region (header stripped).
///
/// Trailing padding is ignored.
pub(crate) fn decode_deltas(mdata: &[u8], count: u32) -> io::Result<Vec<DeltaInfo>> {
    let mut cursor = mdata;
    let mut deltas = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let len = decode_varint(&mut cursor)?;
        if cursor.len() < len {
            return Err(invalid_data("delta frame exceeds metadata region"));
        }
        let (payload, rest) = cursor.split_at(len);
        deltas.push(DeltaInfo {
            payload: payload.to_vec(),
        });
        cursor = rest;
    }
    Ok(deltas)
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU8;

    use proptest::prelude::*;

    use super::*;

    const BLOCK: u64 = 512;

    fn sample_record() -> Record {
        Record {
            deltas: vec![DeltaInfo::from(vec![1; 40]), DeltaInfo::from(vec![2; 200])],
            data_extents: vec![vec![3; 512], vec![4; 1024]],
        }
    }

    fn decode(buf: &[u8]) -> (RecordHeader, Vec<DeltaInfo>) {
        let mut cursor = buf;
        let header = RecordHeader::decode(&mut cursor).unwrap().unwrap();
        let mdata = &buf[RecordHeader::LEN..header.mdlength as usize];
        let data = &buf[header.mdlength as usize..(header.mdlength + header.dlength) as usize];
        verify_checksums(&header, mdata, data).unwrap();
        (header, decode_deltas(mdata, header.deltas_count).unwrap())
    }

    #[test]
    fn size_is_block_aligned() {
        let size = sample_record().size(BLOCK);
        assert_eq!(size.mdlength % BLOCK, 0);
        assert_eq!(size.dlength, 1536);
        // Header + two frames fit in a single block.
        assert_eq!(size.mdlength, BLOCK);
    }

    #[test]
    fn record_roundtrip() {
        let record = sample_record();
        let mut buf = Vec::new();
        let size = encode_record(&record, &mut buf, BLOCK, None, 0xfeed);
        assert_eq!(buf.len() as u64, size.encoded_len());

        let (header, deltas) = decode(&buf);
        assert_eq!(header.segment_nonce, 0xfeed);
        assert_eq!(header.committed_to, None);
        assert_eq!(deltas, record.deltas);
        let data = &buf[header.mdlength as usize..];
        assert_eq!(&data[..512], &record.data_extents[0][..]);
        assert_eq!(&data[512..1536], &record.data_extents[1][..]);
    }

    #[test]
    fn zero_header_decodes_to_none() {
        let buf = vec![0u8; RecordHeader::LEN];
        assert!(RecordHeader::decode(&mut buf.as_slice()).unwrap().is_none());
    }

    proptest! {
        #[test]
        fn bitflip(pos in RecordHeader::LEN..2048usize, mask in any::<NonZeroU8>()) {
            let mut buf = Vec::new();
            encode_record(&sample_record(), &mut buf, BLOCK, None, 42);
            prop_assume!(pos < buf.len());

            // Flip a bit past the header, so verification fails with a
            // checksum mismatch rather than a structural error.
            buf[pos] ^= mask.get();

            let mut cursor = buf.as_slice();
            let header = RecordHeader::decode(&mut cursor).unwrap().unwrap();
            let mdata = &buf[RecordHeader::LEN..header.mdlength as usize];
            let data = &buf[header.mdlength as usize..];
            let err = verify_checksums(&header, mdata, data).unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::InvalidData);
            err.into_inner()
                .unwrap()
                .downcast::<ChecksumMismatch>()
                .expect("inner error should be a checksum mismatch");
        }
    }
}
