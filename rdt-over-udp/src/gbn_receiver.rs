//! Go-Back-N receive-side state machine.
//!
//! [`GbnReceiver`] implements the receiver side of Go-Back-N:
//!
//! - Only the **in-order** frame (seq == `expected`) is delivered.
//! - Anything else (corrupt, duplicate, out of order) is discarded and the
//!   previously sent ACK is repeated unchanged.  Nothing is buffered.
//! - Before the first delivery the stored ACK is ACK(`expected - 1`), i.e.
//!   ACK(255) on the wire, which acknowledges nothing.
//!
//! This module only manages state; all socket I/O is the caller's
//! responsibility.

use crate::frame::{Frame, FrameKind, Rejection, SeqLayout};

/// Outcome of one arriving datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GbnArrival {
    /// Hand `payload` upward and send `ack`.
    Delivered { payload: Vec<u8>, ack: Vec<u8> },
    /// Discarded; send `ack` (the stored previous ACK).
    Rejected { reason: Rejection, ack: Vec<u8> },
}

#[derive(Debug)]
pub struct GbnReceiver {
    /// Next in-order sequence number.
    expected: u64,
    /// Encoded ACK most recently sent.
    last_ack: Vec<u8>,
}

impl Default for GbnReceiver {
    fn default() -> Self {
        Self::new()
    }
}

impl GbnReceiver {
    pub fn new() -> Self {
        Self {
            expected: 0,
            last_ack: Frame::ack(Some(u8::MAX)).encode(),
        }
    }

    pub fn expected(&self) -> u64 {
        self.expected
    }

    pub fn on_frame(&mut self, bytes: &[u8]) -> GbnArrival {
        let reason = match Frame::decode(bytes, SeqLayout::OneByte) {
            Ok(frame) if frame.kind == FrameKind::Data && frame.seq == Some(self.expected as u8) => {
                self.last_ack = Frame::ack(frame.seq).encode();
                self.expected += 1;
                return GbnArrival::Delivered {
                    payload: frame.payload,
                    ack: self.last_ack.clone(),
                };
            }
            Ok(_) => Rejection::Duplicate,
            Err(_) => Rejection::Corrupt,
        };
        GbnArrival::Rejected {
            reason,
            ack: self.last_ack.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(seq: u8, payload: &[u8]) -> Vec<u8> {
        Frame::data(Some(seq), payload.to_vec()).encode()
    }

    fn ack_seq(bytes: &[u8]) -> Option<u8> {
        Frame::decode(bytes, SeqLayout::OneByte).unwrap().seq
    }

    #[test]
    fn in_order_frames_are_delivered() {
        let mut r = GbnReceiver::new();
        for (i, payload) in [&b"abc"[..], b"de", b"f"].iter().enumerate() {
            match r.on_frame(&data(i as u8, payload)) {
                GbnArrival::Delivered { payload: got, ack } => {
                    assert_eq!(&got, payload);
                    assert_eq!(ack_seq(&ack), Some(i as u8));
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(r.expected(), 3);
    }

    #[test]
    fn out_of_order_repeats_initial_ack() {
        let mut r = GbnReceiver::new();
        match r.on_frame(&data(1, b"future")) {
            GbnArrival::Rejected { reason, ack } => {
                assert_eq!(reason, Rejection::Duplicate);
                assert_eq!(ack_seq(&ack), Some(255));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(r.expected(), 0);
    }

    #[test]
    fn duplicate_is_not_redelivered() {
        let mut r = GbnReceiver::new();
        assert!(matches!(r.on_frame(&data(0, b"x")), GbnArrival::Delivered { .. }));
        match r.on_frame(&data(0, b"x")) {
            GbnArrival::Rejected { reason, ack } => {
                assert_eq!(reason, Rejection::Duplicate);
                assert_eq!(ack_seq(&ack), Some(0));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(r.expected(), 1);
    }

    #[test]
    fn corrupt_frame_repeats_last_ack() {
        let mut r = GbnReceiver::new();
        r.on_frame(&data(0, b"ok"));
        let mut bad = data(1, b"bad");
        bad[4] ^= 0xff;
        assert!(matches!(
            r.on_frame(&bad),
            GbnArrival::Rejected { reason: Rejection::Corrupt, ref ack } if ack_seq(ack) == Some(0)
        ));
    }

    #[test]
    fn wire_sequence_wraps() {
        let mut r = GbnReceiver::new();
        for seq in 0..260u64 {
            assert!(matches!(
                r.on_frame(&data(seq as u8, b"")),
                GbnArrival::Delivered { .. }
            ));
        }
        assert_eq!(r.expected(), 260);
    }
}
