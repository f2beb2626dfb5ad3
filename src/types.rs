use std::fmt;
use std::io;

use crate::error::invalid_data;

/// Opaque identifier of a physical segment, assigned by the segment provider.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct SegmentId(pub u32);

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "segment-{}", self.0)
    }
}

/// Monotonically increasing number identifying a logical journal segment.
///
/// Incremented on every roll, unlike [`SegmentId`], which the provider may
/// recycle.
pub type SegmentSeq = u64;

/// Random value distinguishing reincarnations of the same [`SegmentId`].
pub type SegmentNonce = u32;

/// A physical address: byte offset within a segment.
///
/// Write addresses are always multiples of the device block size.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Paddr {
    pub segment: SegmentId,
    pub offset: u64,
}

impl fmt::Display for Paddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}", self.segment, self.offset)
    }
}

/// An ordered journal position.
///
/// The total order is lexicographic: segment sequence first, then the
/// physical address. Positions are immutable once issued.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct JournalSeq {
    pub segment_seq: SegmentSeq,
    pub paddr: Paddr,
}

impl JournalSeq {
    /// Encoded length on disk, including the NULL sentinel representation.
    pub const ENCODED_LEN: usize = 8 + 4 + 8;

    /// The sentinel encoding `None` on disk.
    const NULL_SEGMENT_SEQ: SegmentSeq = SegmentSeq::MAX;

    /// The position `bytes` past `self` within the same segment.
    pub fn advance(self, bytes: u64) -> Self {
        Self {
            segment_seq: self.segment_seq,
            paddr: Paddr {
                segment: self.paddr.segment,
                offset: self.paddr.offset + bytes,
            },
        }
    }

    pub(crate) fn encode_opt(seq: Option<Self>, out: &mut Vec<u8>) {
        match seq {
            Some(seq) => {
                out.extend_from_slice(&seq.segment_seq.to_le_bytes());
                out.extend_from_slice(&seq.paddr.segment.0.to_le_bytes());
                out.extend_from_slice(&seq.paddr.offset.to_le_bytes());
            }
            None => {
                out.extend_from_slice(&Self::NULL_SEGMENT_SEQ.to_le_bytes());
                out.extend_from_slice(&[0; 12]);
            }
        }
    }

    pub(crate) fn decode_opt(buf: &mut &[u8]) -> io::Result<Option<Self>> {
        let segment_seq = get_u64(buf)?;
        let segment = SegmentId(get_u32(buf)?);
        let offset = get_u64(buf)?;
        if segment_seq == Self::NULL_SEGMENT_SEQ {
            return Ok(None);
        }
        Ok(Some(Self {
            segment_seq,
            paddr: Paddr { segment, offset },
        }))
    }
}

impl fmt::Display for JournalSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.segment_seq, self.paddr)
    }
}

/// Block-aligned encoded lengths of a [`crate::Record`].
///
/// `mdlength` covers the record header plus the varint-framed deltas,
/// `dlength` the concatenated data extents. Both are multiples of the device
/// block size.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RecordSize {
    pub mdlength: u64,
    pub dlength: u64,
}

impl RecordSize {
    pub fn encoded_len(&self) -> u64 {
        self.mdlength + self.dlength
    }
}

pub(crate) fn get_u32(buf: &mut &[u8]) -> io::Result<u32> {
    let (bytes, rest) = buf
        .split_first_chunk::<4>()
        .ok_or_else(|| invalid_data("short buffer"))?;
    *buf = rest;
    Ok(u32::from_le_bytes(*bytes))
}

pub(crate) fn get_u64(buf: &mut &[u8]) -> io::Result<u64> {
    let (bytes, rest) = buf
        .split_first_chunk::<8>()
        .ok_or_else(|| invalid_data("short buffer"))?;
    *buf = rest;
    Ok(u64::from_le_bytes(*bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seq(segment_seq: u64, segment: u32, offset: u64) -> JournalSeq {
        JournalSeq {
            segment_seq,
            paddr: Paddr {
                segment: SegmentId(segment),
                offset,
            },
        }
    }

    #[test]
    fn journal_seq_total_order() {
        // Segment sequence dominates, even when the provider recycles a
        // segment id with a lower number.
        assert!(seq(0, 7, 4096) < seq(1, 0, 0));
        assert!(seq(1, 0, 4096) < seq(1, 0, 8192));
    }

    #[test]
    fn journal_seq_roundtrip() {
        for case in [None, Some(seq(3, 1, 12288))] {
            let mut buf = Vec::new();
            JournalSeq::encode_opt(case, &mut buf);
            assert_eq!(buf.len(), JournalSeq::ENCODED_LEN);
            assert_eq!(JournalSeq::decode_opt(&mut buf.as_slice()).unwrap(), case);
        }
    }

    #[test]
    fn advance_stays_in_segment() {
        let s = seq(2, 5, 4096).advance(8192);
        assert_eq!(s, seq(2, 5, 12288));
    }
}
