//! Wire format for stop-and-wait and Go-Back-N frames.
//!
//! Every datagram exchanged by the ARQ and GBN endpoints is a [`Frame`].
//! This module is pure data transformation: no I/O happens here.
//!
//! # Wire format
//!
//! ```text
//!  +--------+-----------+-----------------+---------------------+
//!  | kind:1 | seq:0 / 1 | checksum:2 (BE) | payload ...         |
//!  +--------+-----------+-----------------+---------------------+
//! ```
//!
//! Whether the sequence byte is present depends on the protocol (see
//! [`SeqLayout`]).  The checksum covers kind, sequence and payload; it is
//! computed with the checksum field zeroed.

use thiserror::Error;

/// Frame type carried in the first byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Data,
    Ack,
    Nak,
}

impl FrameKind {
    fn to_u8(self) -> u8 {
        match self {
            FrameKind::Data => 0,
            FrameKind::Ack => 1,
            FrameKind::Nak => 2,
        }
    }

    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(FrameKind::Data),
            1 => Some(FrameKind::Ack),
            2 => Some(FrameKind::Nak),
            _ => None,
        }
    }
}

/// Whether frames of a given protocol carry a sequence byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqLayout {
    /// No sequence field (stop-and-wait variant A).
    Absent,
    /// One sequence byte after the kind byte.
    OneByte,
}

impl SeqLayout {
    fn header_len(self) -> usize {
        match self {
            SeqLayout::Absent => 3,
            SeqLayout::OneByte => 4,
        }
    }
}

/// Errors that can arise when parsing a raw frame.
///
/// Callers treat every variant the same way: the frame is corrupt.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("buffer of {0} bytes is too short to contain a frame header")]
    TooShort(usize),
    #[error("unknown frame kind {0:#04x}")]
    UnknownKind(u8),
    #[error("checksum mismatch (carried {carried:#06x}, computed {computed:#06x})")]
    ChecksumMismatch { carried: u16, computed: u16 },
}

/// Why an arriving frame was not delivered upward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Failed to decode.
    Corrupt,
    /// Valid, but a duplicate or out of sequence.
    Duplicate,
}

/// A decoded ARQ/GBN frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    /// Sequence number; `None` for protocols without a sequence field.
    pub seq: Option<u8>,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn data(seq: Option<u8>, payload: Vec<u8>) -> Self {
        Self {
            kind: FrameKind::Data,
            seq,
            payload,
        }
    }

    pub fn ack(seq: Option<u8>) -> Self {
        Self {
            kind: FrameKind::Ack,
            seq,
            payload: Vec::new(),
        }
    }

    pub fn nak(seq: Option<u8>) -> Self {
        Self {
            kind: FrameKind::Nak,
            seq,
            payload: Vec::new(),
        }
    }

    /// Layout implied by this frame's sequence field.
    pub fn layout(&self) -> SeqLayout {
        match self.seq {
            Some(_) => SeqLayout::OneByte,
            None => SeqLayout::Absent,
        }
    }

    /// Serialise this frame into a newly allocated byte vector.
    pub fn encode(&self) -> Vec<u8> {
        let layout = self.layout();
        let header_len = layout.header_len();
        let mut buf = Vec::with_capacity(header_len + self.payload.len());

        buf.push(self.kind.to_u8());
        if let Some(seq) = self.seq {
            buf.push(seq);
        }
        // Checksum field is zero while computing the checksum.
        buf.extend_from_slice(&[0, 0]);
        buf.extend_from_slice(&self.payload);

        let csum = internet_checksum(&buf);
        let off = header_len - 2;
        buf[off..off + 2].copy_from_slice(&csum.to_be_bytes());
        buf
    }

    /// Parse a frame laid out according to `layout`.
    ///
    /// Never panics: short buffers, unknown kinds and checksum mismatches
    /// are all reported as [`FrameError`].
    pub fn decode(buf: &[u8], layout: SeqLayout) -> Result<Self, FrameError> {
        let header_len = layout.header_len();
        if buf.len() < header_len {
            return Err(FrameError::TooShort(buf.len()));
        }

        let off = header_len - 2;
        let carried = u16::from_be_bytes([buf[off], buf[off + 1]]);

        let mut scratch = buf.to_vec();
        scratch[off] = 0;
        scratch[off + 1] = 0;
        let computed = internet_checksum(&scratch);
        if computed != carried {
            return Err(FrameError::ChecksumMismatch { carried, computed });
        }

        let kind = FrameKind::from_u8(buf[0]).ok_or(FrameError::UnknownKind(buf[0]))?;
        let seq = match layout {
            SeqLayout::Absent => None,
            SeqLayout::OneByte => Some(buf[1]),
        };

        Ok(Frame {
            kind,
            seq,
            payload: buf[header_len..].to_vec(),
        })
    }
}

/// Compute the Internet checksum (RFC 1071) over `data`.
///
/// Sum consecutive 16-bit big-endian words, fold the carry, return the
/// one's-complement.  The caller must zero any checksum field within `data`
/// before calling this function.
pub(crate) fn internet_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);

    for word in &mut chunks {
        sum += u32::from(u16::from_be_bytes([word[0], word[1]]));
    }
    // Odd trailing byte, padded with a zero byte on the right.
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }

    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }

    !(sum as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_frame_with_sequence_roundtrip() {
        let frame = Frame::data(Some(1), b"hello".to_vec());
        let decoded = Frame::decode(&frame.encode(), SeqLayout::OneByte).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn layout_without_sequence_has_three_byte_header() {
        let bytes = Frame::data(None, b"abc".to_vec()).encode();
        assert_eq!(bytes.len(), 3 + 3);
        assert_eq!(bytes[0], 0);
        let decoded = Frame::decode(&bytes, SeqLayout::Absent).unwrap();
        assert_eq!(decoded.seq, None);
        assert_eq!(decoded.payload, b"abc");
    }

    #[test]
    fn control_frames_have_empty_payload() {
        let ack = Frame::decode(&Frame::ack(Some(0)).encode(), SeqLayout::OneByte).unwrap();
        assert_eq!(ack.kind, FrameKind::Ack);
        assert!(ack.payload.is_empty());

        let nak = Frame::decode(&Frame::nak(None).encode(), SeqLayout::Absent).unwrap();
        assert_eq!(nak.kind, FrameKind::Nak);
    }

    #[test]
    fn empty_buffer_is_corrupt() {
        assert_eq!(
            Frame::decode(&[], SeqLayout::Absent),
            Err(FrameError::TooShort(0))
        );
        assert_eq!(
            Frame::decode(&[0, 0, 0], SeqLayout::OneByte),
            Err(FrameError::TooShort(3))
        );
    }

    #[test]
    fn every_single_byte_inversion_is_detected() {
        let bytes = Frame::data(Some(0), b"the quick brown fox".to_vec()).encode();
        for i in 0..bytes.len() {
            let mut corrupt = bytes.clone();
            corrupt[i] ^= 0xff;
            assert!(
                Frame::decode(&corrupt, SeqLayout::OneByte).is_err(),
                "inversion of byte {i} went undetected"
            );
        }
    }

    #[test]
    fn single_bit_flip_in_payload_is_detected() {
        let mut bytes = Frame::data(None, vec![0x55; 32]).encode();
        bytes[10] ^= 0x04;
        assert!(matches!(
            Frame::decode(&bytes, SeqLayout::Absent),
            Err(FrameError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn unknown_kind_with_valid_checksum_is_rejected() {
        let mut buf = vec![7u8, 0, 0, 0];
        let csum = internet_checksum(&buf);
        buf[2..4].copy_from_slice(&csum.to_be_bytes());
        assert_eq!(
            Frame::decode(&buf, SeqLayout::OneByte),
            Err(FrameError::UnknownKind(7))
        );
    }

    #[test]
    fn checksum_of_odd_length_input_pads_right() {
        // [0x01] is treated as the word 0x0100.
        assert_eq!(internet_checksum(&[0x01]), !0x0100);
    }
}
