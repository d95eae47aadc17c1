//! Connection finite-state machine (FSM) types.
//!
//! This module defines every state a [`crate::connection::Connection`] can
//! occupy, mirroring the TCP state diagram (RFC 793 §3.2) without RST.
//! Transitions are driven by [`crate::tcb::Tcb`].
//!
//! ```text
//!                 connect                         listen
//!  CLOSED ───────▶ SYN_SENT              CLOSED ─────────▶ LISTEN
//!                    │ SYN+ACK / ACK                         │ SYN / SYN+ACK
//!                    ▼                                       ▼
//!               ESTABLISHED ◀──────── ACK ─────────── SYN_RECEIVED
//!                 │       │
//!   close / FIN   │       │ FIN / ACK
//!                 ▼       ▼
//!         FIN_WAIT_1     CLOSE_WAIT ── close / FIN ──▶ LAST_ACK ── ACK ──▶ CLOSED
//!          │      │
//!      ACK │      │ FIN / ACK
//!          ▼      ▼
//!   FIN_WAIT_2   CLOSING
//!          │      │
//!    FIN   │      │ ACK
//!          ▼      ▼
//!         TIME_WAIT ── timer ──▶ CLOSED
//! ```

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No connection exists; initial and final state.
    #[default]
    Closed,
    /// Waiting for a SYN.
    Listen,
    /// SYN sent; waiting for SYN+ACK.
    SynSent,
    /// SYN received and SYN+ACK sent; waiting for the final ACK.
    SynReceived,
    /// Handshake complete; data transfer in progress.
    Established,
    /// Local FIN sent; waiting for its ACK.
    FinWait1,
    /// Local FIN acknowledged; waiting for the peer's FIN.
    FinWait2,
    /// Peer's FIN received; waiting for the local close.
    CloseWait,
    /// Both sides sent FIN before seeing the other's ACK.
    Closing,
    /// Local FIN sent after the peer's; waiting for its ACK.
    LastAck,
    /// Both FINs acknowledged; lingering to absorb stray retransmissions.
    TimeWait,
}

impl ConnectionState {
    /// `true` once the handshake has completed (including teardown states).
    pub fn is_synchronized(self) -> bool {
        !matches!(
            self,
            ConnectionState::Closed
                | ConnectionState::Listen
                | ConnectionState::SynSent
                | ConnectionState::SynReceived
        )
    }

    /// `true` while the application may still queue data.
    pub fn can_send(self) -> bool {
        matches!(self, ConnectionState::Established | ConnectionState::CloseWait)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionState::Closed => "CLOSED",
            ConnectionState::Listen => "LISTEN",
            ConnectionState::SynSent => "SYN_SENT",
            ConnectionState::SynReceived => "SYN_RECEIVED",
            ConnectionState::Established => "ESTABLISHED",
            ConnectionState::FinWait1 => "FIN_WAIT_1",
            ConnectionState::FinWait2 => "FIN_WAIT_2",
            ConnectionState::CloseWait => "CLOSE_WAIT",
            ConnectionState::Closing => "CLOSING",
            ConnectionState::LastAck => "LAST_ACK",
            ConnectionState::TimeWait => "TIME_WAIT",
        })
    }
}
