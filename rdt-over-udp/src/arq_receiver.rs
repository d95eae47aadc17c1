//! Stop-and-wait receive-side state machine.
//!
//! [`StopAndWaitReceiver`] decides, for every arriving datagram, whether a
//! payload is delivered upward and which reply goes back.  It does not own
//! a socket.
//!
//! - [`Variant::NoSequence`]: one state.  Corrupt → NAK; valid DATA →
//!   deliver + ACK.  A retransmission caused by a damaged ACK is delivered
//!   again.
//! - [`Variant::AlternatingBit`]: `Expect0` / `Expect1`.  Corrupt → NAK;
//!   expected bit → deliver, ACK it, flip; other bit → repeat the previous
//!   ACK without delivering.
//! - [`Variant::Timed`]: as above, but NAK-free: a corrupt frame is answered
//!   with the previous ACK.

use crate::arq_sender::Variant;
use crate::frame::{Frame, FrameKind, Rejection};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    Listening,
    Expect0,
    Expect1,
}

/// Outcome of one arriving datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arrival {
    /// Hand `payload` upward and send `reply`.
    Delivered { payload: Vec<u8>, reply: Vec<u8> },
    /// Nothing delivered; send `reply`.
    Rejected { reason: Rejection, reply: Vec<u8> },
    /// A valid frame that is not DATA; no reply.
    Ignored,
}

#[derive(Debug)]
pub struct StopAndWaitReceiver {
    variant: Variant,
    state: ReceiverState,
}

impl StopAndWaitReceiver {
    pub fn new(variant: Variant) -> Self {
        let state = match variant {
            Variant::NoSequence => ReceiverState::Listening,
            Variant::AlternatingBit | Variant::Timed => ReceiverState::Expect0,
        };
        Self { variant, state }
    }

    pub fn state(&self) -> ReceiverState {
        self.state
    }

    fn expected(&self) -> Option<u8> {
        match self.state {
            ReceiverState::Listening => None,
            ReceiverState::Expect0 => Some(0),
            ReceiverState::Expect1 => Some(1),
        }
    }

    /// The bit acknowledged most recently (`1 - expected`).
    fn previous(&self) -> Option<u8> {
        self.expected().map(|bit| 1 - bit)
    }

    pub fn on_frame(&mut self, bytes: &[u8]) -> Arrival {
        let frame = match Frame::decode(bytes, self.variant.layout()) {
            Ok(frame) => frame,
            Err(_) => {
                let reply = match self.variant {
                    Variant::Timed => Frame::ack(self.previous()),
                    Variant::NoSequence | Variant::AlternatingBit => Frame::nak(self.expected()),
                };
                return Arrival::Rejected {
                    reason: Rejection::Corrupt,
                    reply: reply.encode(),
                };
            }
        };

        if frame.kind != FrameKind::Data {
            return Arrival::Ignored;
        }

        if frame.seq != self.expected() {
            return Arrival::Rejected {
                reason: Rejection::Duplicate,
                reply: Frame::ack(frame.seq).encode(),
            };
        }

        let reply = Frame::ack(frame.seq).encode();
        self.state = match self.state {
            ReceiverState::Listening => ReceiverState::Listening,
            ReceiverState::Expect0 => ReceiverState::Expect1,
            ReceiverState::Expect1 => ReceiverState::Expect0,
        };
        Arrival::Delivered {
            payload: frame.payload,
            reply,
        }
    }
}
