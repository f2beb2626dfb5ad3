//! The on-disk segment header.
//!
//! Every segment opens with one block holding a [`Header`]: the logical
//! sequence of the segment, the nonce of this incarnation, and a hint at the
//! journal position that was durable when the segment was initialized. The
//! remainder of the block is zero padding.

use std::io;

use crate::{
    error::invalid_data,
    types::{get_u32, get_u64, JournalSeq, SegmentNonce, SegmentSeq},
};

pub const MAGIC: [u8; 8] = *b"SEGJRNL1";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Header {
    pub segment_seq: SegmentSeq,
    pub segment_nonce: SegmentNonce,
    /// The `committed_to` cursor observed when this segment was initialized.
    ///
    /// Informational: replay trusts the segment set it is given and does not
    /// filter on the hint.
    pub journal_tail_hint: Option<JournalSeq>,
}

impl Header {
    pub const LEN: usize = MAGIC.len() + 8 + 4 + JournalSeq::ENCODED_LEN + /* crc32 */ 4;

    /// Serialize `self` into a single zero-padded block.
    pub fn encode(&self, block_size: u64) -> Vec<u8> {
        let mut out = Vec::with_capacity(block_size as usize);
        out.extend_from_slice(&MAGIC);
        out.extend_from_slice(&self.segment_seq.to_le_bytes());
        out.extend_from_slice(&self.segment_nonce.to_le_bytes());
        JournalSeq::encode_opt(self.journal_tail_hint, &mut out);
        let crc = crc32c::crc32c(&out);
        out.extend_from_slice(&crc.to_le_bytes());
        out.resize(block_size as usize, 0);
        out
    }

    pub fn decode(buf: &[u8]) -> io::Result<Self> {
        if buf.len() < Self::LEN {
            return Err(invalid_data("short segment header"));
        }
        if !buf.starts_with(&MAGIC) {
            return Err(invalid_data("segment header does not start with magic"));
        }
        let crc = crc32c::crc32c(&buf[..Self::LEN - 4]);
        let mut cursor = &buf[MAGIC.len()..];
        let segment_seq = get_u64(&mut cursor)?;
        let segment_nonce = get_u32(&mut cursor)?;
        let journal_tail_hint = JournalSeq::decode_opt(&mut cursor)?;
        let stored = get_u32(&mut cursor)?;
        if crc != stored {
            return Err(invalid_data("segment header checksum mismatch"));
        }

        Ok(Self {
            segment_seq,
            segment_nonce,
            journal_tail_hint,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Paddr, SegmentId};

    #[test]
    fn header_roundtrip() {
        let hdr = Header {
            segment_seq: 42,
            segment_nonce: 0xdead_beef,
            journal_tail_hint: Some(JournalSeq {
                segment_seq: 41,
                paddr: Paddr {
                    segment: SegmentId(7),
                    offset: 8192,
                },
            }),
        };

        let block = hdr.encode(4096);
        assert_eq!(block.len(), 4096);
        assert_eq!(Header::decode(&block).unwrap(), hdr);
    }

    #[test]
    fn decode_rejects_bad_magic() {
        let mut block = Header {
            segment_seq: 0,
            segment_nonce: 0,
            journal_tail_hint: None,
        }
        .encode(4096);
        block[0] ^= 0xff;
        assert!(Header::decode(&block).is_err());
    }

    #[test]
    fn decode_rejects_damaged_fields() {
        let mut block = Header {
            segment_seq: 1,
            segment_nonce: 2,
            journal_tail_hint: None,
        }
        .encode(4096);
        block[MAGIC.len()] ^= 0x01;
        assert!(Header::decode(&block).is_err());
    }
}
