//! `rdt-over-udp` — reliable data transfer over an unreliable UDP channel.
//!
//! Three families of protocol share one channel model and one timer:
//!
//! - stop-and-wait ARQ in three escalating variants (no sequence number,
//!   alternating bit, alternating bit with a retransmission timer),
//! - Go-Back-N sliding-window ARQ,
//! - a simplified TCP: three-way handshake, byte-stream transfer with flow
//!   control, adaptive RTO and four-step teardown.
//!
//! # Architecture
//!
//! ```text
//!  ┌──────────────┐ ┌──────────────┐ ┌──────────────┐
//!  │ arq_endpoint │ │ gbn_endpoint │ │  connection  │   async drivers
//!  └──────┬───────┘ └──────┬───────┘ └──────┬───────┘
//!  ┌──────▼───────┐ ┌──────▼───────┐ ┌──────▼───────┐
//!  │ arq_sender / │ │ gbn_sender / │ │ tcb + state  │   sans-IO FSMs
//!  │ arq_receiver │ │ gbn_receiver │ │ rtt + window │
//!  └──────┬───────┘ └──────┬───────┘ └──────┬───────┘
//!       frame            frame            segment       wire codecs
//!         └────────────────┼────────────────┘
//!                   ┌──────▼──────┐
//!                   │   Socket    │  tokio UdpSocket + Channel
//!                   └──────┬──────┘
//!                   ┌──────▼──────┐
//!                   │  simulator  │  loss / corruption / delay
//!                   └─────────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`frame`]         — ARQ frame wire format and Internet checksum
//! - [`segment`]       — connection segment wire format
//! - [`arq_sender`]    — stop-and-wait send-side FSM
//! - [`arq_receiver`]  — stop-and-wait receive-side FSM
//! - [`arq_endpoint`]  — stop-and-wait endpoints over a socket
//! - [`gbn_sender`]    — GBN outbound window state machine
//! - [`gbn_receiver`]  — GBN inbound cumulative-ACK state machine
//! - [`gbn_endpoint`]  — GBN driver task and receiving sink
//! - [`state`]         — connection finite-state-machine types
//! - [`tcb`]           — connection control block (sans-IO)
//! - [`connection`]    — socket-like connection API and driver task
//! - [`rtt`]           — smoothed RTT and retransmission timeout
//! - [`window`]        — fixed-capacity ring of outstanding entries
//! - [`timer`]         — generation-checked one-shot timers
//! - [`stats`]         — per-endpoint counters and snapshots
//! - [`config`]        — tunable parameters
//! - [`simulator`]     — unreliable channel model
//! - [`socket`]        — async UDP socket abstraction

pub mod arq_endpoint;
pub mod arq_receiver;
pub mod arq_sender;
pub mod config;
pub mod connection;
pub mod frame;
pub mod gbn_endpoint;
pub mod gbn_receiver;
pub mod gbn_sender;
pub mod rtt;
pub mod segment;
pub mod simulator;
pub mod socket;
pub mod state;
pub mod stats;
pub mod tcb;
pub mod timer;
pub mod window;
