//! Stop-and-wait (alternating-bit) send-side state machine.
//!
//! [`StopAndWaitSender`] holds at most one outstanding frame.  It does
//! **not** touch the socket: [`crate::arq_endpoint::ArqSender`] feeds it
//! replies and timeouts and transmits whatever it hands back.
//!
//! # Variants
//!
//! | Variant            | Sequence bit | Timer | Reaction to NAK / corrupt / wrong ACK |
//! |--------------------|--------------|-------|----------------------------------------|
//! | [`NoSequence`]     | no           | no    | retransmit (NAK / corrupt)             |
//! | [`AlternatingBit`] | yes          | no    | retransmit                             |
//! | [`Timed`]          | yes          | yes   | ignore; only the timer retransmits     |
//!
//! [`NoSequence`]: Variant::NoSequence
//! [`AlternatingBit`]: Variant::AlternatingBit
//! [`Timed`]: Variant::Timed

use std::fmt;

use thiserror::Error;

use crate::config::ConfigError;
use crate::frame::{Frame, FrameKind, SeqLayout};
use crate::socket::SocketError;

/// The three escalating stop-and-wait protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    /// No sequence number.  A corrupted ACK/NAK can cause a duplicate
    /// delivery at the receiver; that is a property of this protocol.
    NoSequence,
    /// One alternating sequence bit, NAK-driven recovery.
    AlternatingBit,
    /// One alternating sequence bit plus a retransmission timer.
    Timed,
}

impl Variant {
    /// Frame layout used on the wire by this variant.
    pub fn layout(self) -> SeqLayout {
        match self {
            Variant::NoSequence => SeqLayout::Absent,
            Variant::AlternatingBit | Variant::Timed => SeqLayout::OneByte,
        }
    }

    pub fn uses_timer(self) -> bool {
        matches!(self, Variant::Timed)
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Variant::NoSequence => "rdt2.0",
            Variant::AlternatingBit => "rdt2.1",
            Variant::Timed => "rdt3.0",
        })
    }
}

/// Sender FSM states.
///
/// [`Variant::NoSequence`] uses only the first two; the sequenced variants
/// cycle through the last four.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderState {
    ReadyToSend,
    AwaitingReply,
    ReadyToSend0,
    AwaitingAck0,
    ReadyToSend1,
    AwaitingAck1,
}

impl SenderState {
    fn initial(variant: Variant) -> Self {
        match variant {
            Variant::NoSequence => SenderState::ReadyToSend,
            Variant::AlternatingBit | Variant::Timed => SenderState::ReadyToSend0,
        }
    }

    pub fn is_ready(self) -> bool {
        matches!(
            self,
            SenderState::ReadyToSend | SenderState::ReadyToSend0 | SenderState::ReadyToSend1
        )
    }
}

/// What the endpoint must do after the FSM saw a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyAction {
    /// The outstanding frame is acknowledged; the sender is ready again.
    Acknowledged,
    /// Transmit these bytes (the outstanding frame) again.
    Retransmit(Vec<u8>),
    /// No action and no state change.
    Discard,
}

/// Errors raised by the stop-and-wait endpoints.
#[derive(Debug, Error)]
pub enum ArqError {
    #[error("a frame is already awaiting acknowledgement")]
    Busy,
    #[error(transparent)]
    Socket(#[from] SocketError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug)]
pub struct StopAndWaitSender {
    variant: Variant,
    state: SenderState,
    /// Encoded copy of the frame awaiting acknowledgement.
    outstanding: Option<Vec<u8>>,
}

impl StopAndWaitSender {
    pub fn new(variant: Variant) -> Self {
        Self {
            variant,
            state: SenderState::initial(variant),
            outstanding: None,
        }
    }

    pub fn variant(&self) -> Variant {
        self.variant
    }

    pub fn state(&self) -> SenderState {
        self.state
    }

    pub fn outstanding(&self) -> Option<&[u8]> {
        self.outstanding.as_deref()
    }

    /// Build the DATA frame for `payload` and move to the awaiting state.
    ///
    /// Returns the encoded frame for transmission.
    pub fn send(&mut self, payload: Vec<u8>) -> Result<Vec<u8>, ArqError> {
        let (seq, next) = match self.state {
            SenderState::ReadyToSend => (None, SenderState::AwaitingReply),
            SenderState::ReadyToSend0 => (Some(0), SenderState::AwaitingAck0),
            SenderState::ReadyToSend1 => (Some(1), SenderState::AwaitingAck1),
            SenderState::AwaitingReply | SenderState::AwaitingAck0 | SenderState::AwaitingAck1 => {
                return Err(ArqError::Busy)
            }
        };
        let bytes = Frame::data(seq, payload).encode();
        self.outstanding = Some(bytes.clone());
        self.state = next;
        Ok(bytes)
    }

    /// Feed one datagram received from the peer.
    pub fn on_reply(&mut self, bytes: &[u8]) -> ReplyAction {
        let awaited = match self.state {
            SenderState::AwaitingReply => None,
            SenderState::AwaitingAck0 => Some(0),
            SenderState::AwaitingAck1 => Some(1),
            _ => return ReplyAction::Discard,
        };

        let reply = Frame::decode(bytes, self.variant.layout());
        let accepted = matches!(
            &reply,
            Ok(frame) if frame.kind == FrameKind::Ack && frame.seq == awaited
        );

        if accepted {
            self.acknowledge();
            return ReplyAction::Acknowledged;
        }

        match (self.variant, reply) {
            // Only the timer recovers under the timed variant.
            (Variant::Timed, _) => ReplyAction::Discard,
            // A stray DATA frame is not a reply at all.
            (_, Ok(frame)) if frame.kind == FrameKind::Data => ReplyAction::Discard,
            // Corrupt reply, NAK, or (sequenced only) ACK for the other bit.
            _ => self.retransmission(),
        }
    }

    /// The retransmission deadline passed without an acceptable reply.
    ///
    /// Returns the frame to send again, or `None` when nothing is outstanding.
    pub fn on_timeout(&mut self) -> Option<Vec<u8>> {
        if self.state.is_ready() {
            return None;
        }
        self.outstanding.clone()
    }

    fn retransmission(&self) -> ReplyAction {
        match &self.outstanding {
            Some(bytes) => ReplyAction::Retransmit(bytes.clone()),
            None => ReplyAction::Discard,
        }
    }

    fn acknowledge(&mut self) {
        self.outstanding = None;
        self.state = match self.state {
            SenderState::AwaitingReply => SenderState::ReadyToSend,
            SenderState::AwaitingAck0 => SenderState::ReadyToSend1,
            SenderState::AwaitingAck1 => SenderState::ReadyToSend0,
            ready => ready,
        };
    }
}
