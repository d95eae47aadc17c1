//! Wire-format definitions for connection segments.
//!
//! Every datagram exchanged by a [`crate::connection::Connection`] is a
//! [`Segment`].  This module is responsible for:
//! - Defining the on-wire binary layout (header fields, flags, payload).
//! - Serialising a [`Segment`] into a byte buffer ready for transmission.
//! - Deserialising a raw byte slice back into a [`Segment`], returning errors
//!   for malformed, truncated or corrupted input.
//!
//! # Wire format
//!
//! All multi-byte integers are **big-endian**.
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |          Source Port          |       Destination Port        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        Sequence Number                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                    Acknowledgment Number                      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     Flags     |            Window Size        |  Payload Len  |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  (cont.)      |            Checksum           |  Payload ...  |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Total header size: [`HEADER_LEN`] = 19 bytes.
//! src(2) + dst(2) + seq(4) + ack(4) + flags(1) + window(2) + payload_len(2) + checksum(2)

use thiserror::Error;

use crate::frame::internet_checksum;

/// Bit-flag constants for the `flags` header field.
pub mod flags {
    /// Synchronise sequence numbers (handshake initiation).
    pub const SYN: u8 = 0b0000_0001;
    /// Acknowledgement field is valid.
    pub const ACK: u8 = 0b0000_0010;
    /// Finish: sender has no more data to send.
    pub const FIN: u8 = 0b0000_0100;
}

/// Byte length of the fixed-size header on the wire.
pub const HEADER_LEN: usize = 19;

const OFF_SRC_PORT: usize = 0;
const OFF_DST_PORT: usize = 2;
const OFF_SEQ: usize = 4;
const OFF_ACK: usize = 8;
const OFF_FLAGS: usize = 12;
const OFF_WINDOW: usize = 13;
const OFF_PAYLOAD_LEN: usize = 15;
const OFF_CHECKSUM: usize = 17;

/// Fixed-size segment header, in host byte order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub src_port: u16,
    pub dst_port: u16,
    /// Sequence number of the first payload byte (or of the SYN/FIN).
    pub seq: u32,
    /// Next sequence number expected from the peer.
    pub ack: u32,
    /// Bitmask of [`flags`] constants.
    pub flags: u8,
    /// Advertised receive window in bytes.
    pub window: u16,
}

impl Header {
    pub fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}

/// A complete protocol datagram: header + payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub header: Header,
    pub payload: Vec<u8>,
}

impl Segment {
    /// Serialise this segment into a newly allocated byte vector.
    ///
    /// Fails only if the payload does not fit the 16-bit length field.
    pub fn encode(&self) -> Result<Vec<u8>, SegmentError> {
        let payload_len = u16::try_from(self.payload.len())
            .map_err(|_| SegmentError::PayloadTooLarge(self.payload.len()))?;
        let mut buf = vec![0u8; HEADER_LEN + self.payload.len()];

        buf[OFF_SRC_PORT..OFF_SRC_PORT + 2].copy_from_slice(&self.header.src_port.to_be_bytes());
        buf[OFF_DST_PORT..OFF_DST_PORT + 2].copy_from_slice(&self.header.dst_port.to_be_bytes());
        buf[OFF_SEQ..OFF_SEQ + 4].copy_from_slice(&self.header.seq.to_be_bytes());
        buf[OFF_ACK..OFF_ACK + 4].copy_from_slice(&self.header.ack.to_be_bytes());
        buf[OFF_FLAGS] = self.header.flags;
        buf[OFF_WINDOW..OFF_WINDOW + 2].copy_from_slice(&self.header.window.to_be_bytes());
        buf[OFF_PAYLOAD_LEN..OFF_PAYLOAD_LEN + 2].copy_from_slice(&payload_len.to_be_bytes());
        buf[HEADER_LEN..].copy_from_slice(&self.payload);

        let csum = internet_checksum(&buf);
        buf[OFF_CHECKSUM..OFF_CHECKSUM + 2].copy_from_slice(&csum.to_be_bytes());

        Ok(buf)
    }

    /// Parse a [`Segment`] from a raw byte slice.
    ///
    /// Returns [`Err`] if:
    /// - `buf` is shorter than [`HEADER_LEN`],
    /// - the `payload_len` field disagrees with `buf.len()`, or
    /// - the checksum does not verify.
    pub fn decode(buf: &[u8]) -> Result<Self, SegmentError> {
        if buf.len() < HEADER_LEN {
            return Err(SegmentError::BufferTooShort);
        }

        let be16 = |off: usize| u16::from_be_bytes([buf[off], buf[off + 1]]);
        let be32 =
            |off: usize| u32::from_be_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]]);

        let payload_len = be16(OFF_PAYLOAD_LEN);
        if buf.len() != HEADER_LEN + payload_len as usize {
            return Err(SegmentError::LengthMismatch);
        }

        let checksum = be16(OFF_CHECKSUM);
        let mut scratch = buf.to_vec();
        scratch[OFF_CHECKSUM..OFF_CHECKSUM + 2].copy_from_slice(&[0, 0]);
        if internet_checksum(&scratch) != checksum {
            return Err(SegmentError::ChecksumFailed);
        }

        Ok(Segment {
            header: Header {
                src_port: be16(OFF_SRC_PORT),
                dst_port: be16(OFF_DST_PORT),
                seq: be32(OFF_SEQ),
                ack: be32(OFF_ACK),
                flags: buf[OFF_FLAGS],
                window: be16(OFF_WINDOW),
            },
            payload: buf[HEADER_LEN..].to_vec(),
        })
    }
}

/// Errors that can arise when encoding or parsing a segment.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SegmentError {
    #[error("buffer too short to contain a header")]
    BufferTooShort,
    #[error("payload_len field does not match remaining bytes")]
    LengthMismatch,
    #[error("checksum verification failed")]
    ChecksumFailed,
    #[error("payload of {0} bytes does not fit in one segment")]
    PayloadTooLarge(usize),
}

/// Number of sequence numbers a segment with control bits `bits` and
/// `payload_len` bytes occupies.
///
/// Payload bytes count one each; SYN and FIN count one each.
pub fn seq_space(bits: u8, payload_len: usize) -> u32 {
    let mut len = payload_len as u32;
    if bits & flags::SYN != 0 {
        len += 1;
    }
    if bits & flags::FIN != 0 {
        len += 1;
    }
    len
}

/// Returns `true` when sequence number `a` is ≤ `b` in wrap-around space.
///
/// Valid as long as the two values are less than `u32::MAX / 2` apart.
#[inline]
pub fn seq_le(a: u32, b: u32) -> bool {
    b.wrapping_sub(a) <= (u32::MAX / 2)
}

/// Strict variant of [`seq_le`].
#[inline]
pub fn seq_lt(a: u32, b: u32) -> bool {
    a != b && seq_le(a, b)
}
