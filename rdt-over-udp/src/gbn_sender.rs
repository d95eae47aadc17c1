//! Go-Back-N send-side state machine.
//!
//! [`GbnSender`] maintains a sliding window of up to `N` in-flight frames.
//! Unlike stop-and-wait, multiple frames may be outstanding simultaneously.
//!
//! # Protocol contract
//!
//! - `base ≤ next ≤ base + N` at all times.
//! - ACKs are **cumulative**: ACK(`a`) acknowledges every frame up to and
//!   including `a`.
//! - On timeout, the caller retransmits **all** frames in `[base, next)`
//!   (go back to N).
//! - Sequence numbers are absolute `u64` ordinals internally; the wire
//!   carries `seq mod 256`.  Because `N ≤ 255`, every in-flight frame has a
//!   distinct wire number and an ACK maps back to exactly one ordinal.
//!
//! This module only manages state; all socket I/O is the caller's responsibility.

use crate::frame::{Frame, FrameKind, SeqLayout};
use crate::window::SlotRing;

/// A frame accepted into the window by [`GbnSender::send`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub seq: u64,
    /// Encoded frame, ready to hand to the socket.
    pub frame: Vec<u8>,
    /// `true` when the window was empty before this frame, so the
    /// retransmission timer must be started.
    pub start_timer: bool,
}

/// Effect of one ACK datagram on the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// Failed checksum or was not an ACK.
    Corrupt,
    /// Acknowledged nothing new; state is unchanged.
    Stale,
    /// `base` moved forward by `acked` frames.  `drained` is `true` when no
    /// frame remains outstanding.
    Advanced { acked: usize, drained: bool },
}

/// Go-Back-N send-side state.
///
/// ```text
///    base                 next            base + N
///      │                    │                 │
///  ────┼────────────────────┼─────────────────┼────▶ seq space
///      │ <── in flight ───▶ │ <── usable ───▶ │
/// ```
#[derive(Debug)]
pub struct GbnSender {
    /// Encoded frames in `[base, next)`, indexed by `seq mod N`.
    window: SlotRing<Vec<u8>>,
}

impl GbnSender {
    /// Create a sender with window size `window_size` (1..=255).
    pub fn new(window_size: usize) -> Self {
        Self {
            window: SlotRing::new(window_size, 0),
        }
    }

    /// Oldest unacknowledged sequence number.
    pub fn base(&self) -> u64 {
        self.window.head()
    }

    /// Sequence number the next frame will receive.
    pub fn next(&self) -> u64 {
        self.window.tail()
    }

    pub fn window_size(&self) -> usize {
        self.window.capacity()
    }

    pub fn in_flight(&self) -> usize {
        self.window.len()
    }

    pub fn can_send(&self) -> bool {
        !self.window.is_full()
    }

    /// Assign `next` to `payload` and buffer the encoded frame.
    ///
    /// Returns `None` without touching any state when the window is full.
    pub fn send(&mut self, payload: Vec<u8>) -> Option<Outgoing> {
        if !self.can_send() {
            return None;
        }
        let start_timer = self.window.is_empty();
        let seq = self.next();
        let frame = Frame::data(Some(seq as u8), payload).encode();
        self.window.push_back(frame.clone()).ok()?;
        Some(Outgoing {
            seq,
            frame,
            start_timer,
        })
    }

    /// Process one datagram from the receiver.
    pub fn on_ack(&mut self, bytes: &[u8]) -> AckOutcome {
        let frame = match Frame::decode(bytes, SeqLayout::OneByte) {
            Ok(frame) if frame.kind == FrameKind::Ack => frame,
            _ => return AckOutcome::Corrupt,
        };
        let Some(wire) = frame.seq else {
            return AckOutcome::Corrupt;
        };

        // Distance from base in wire space; only frames in flight count.
        let offset = wire.wrapping_sub(self.base() as u8) as usize;
        if offset >= self.in_flight() {
            return AckOutcome::Stale;
        }

        let acked = offset + 1;
        for _ in 0..acked {
            self.window.pop_front();
        }
        AckOutcome::Advanced {
            acked,
            drained: self.window.is_empty(),
        }
    }

    /// In-flight frames from `base` to `next - 1`, ascending.
    pub fn outstanding(&self) -> impl Iterator<Item = (u64, &[u8])> + '_ {
        self.window.iter().map(|(seq, frame)| (seq, frame.as_slice()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ack(seq: u8) -> Vec<u8> {
        Frame::ack(Some(seq)).encode()
    }

    fn assert_window_invariant(s: &GbnSender) {
        assert!(s.base() <= s.next());
        assert!(s.next() <= s.base() + s.window_size() as u64);
    }

    #[test]
    fn initial_state() {
        let s = GbnSender::new(4);
        assert_eq!(s.base(), 0);
        assert_eq!(s.next(), 0);
        assert!(s.can_send());
        assert_eq!(s.in_flight(), 0);
    }

    #[test]
    fn only_first_frame_starts_timer() {
        let mut s = GbnSender::new(4);
        let first = s.send(b"a".to_vec()).unwrap();
        let second = s.send(b"b".to_vec()).unwrap();
        assert!(first.start_timer);
        assert!(!second.start_timer);
        assert_eq!((first.seq, second.seq), (0, 1));
        assert_eq!(s.next(), 2);
        assert_window_invariant(&s);
    }

    #[test]
    fn full_window_refuses_without_side_effects() {
        let mut s = GbnSender::new(2);
        s.send(vec![1]).unwrap();
        s.send(vec![2]).unwrap();
        assert!(s.send(vec![3]).is_none());
        assert_eq!(s.next(), 2);
        assert_eq!(s.in_flight(), 2);
        assert_window_invariant(&s);
    }

    #[test]
    fn cumulative_ack_slides_multiple() {
        let mut s = GbnSender::new(4);
        for i in 0..3u8 {
            s.send(vec![i]).unwrap();
        }
        assert_eq!(s.on_ack(&ack(1)), AckOutcome::Advanced { acked: 2, drained: false });
        assert_eq!(s.base(), 2);
        assert_eq!(s.on_ack(&ack(2)), AckOutcome::Advanced { acked: 1, drained: true });
        assert_eq!(s.base(), 3);
        assert_window_invariant(&s);
    }

    #[test]
    fn replayed_or_old_ack_is_stale() {
        let mut s = GbnSender::new(4);
        s.send(vec![0]).unwrap();
        s.send(vec![1]).unwrap();
        s.on_ack(&ack(0));
        let (base, next) = (s.base(), s.next());

        assert_eq!(s.on_ack(&ack(0)), AckOutcome::Stale);
        // The receiver's initial ACK(255) acknowledges nothing.
        assert_eq!(s.on_ack(&ack(255)), AckOutcome::Stale);
        assert_eq!((s.base(), s.next()), (base, next));
    }

    #[test]
    fn ack_beyond_next_is_stale() {
        let mut s = GbnSender::new(4);
        s.send(vec![0]).unwrap();
        assert_eq!(s.on_ack(&ack(3)), AckOutcome::Stale);
        assert_eq!(s.base(), 0);
    }

    #[test]
    fn corrupt_ack_is_reported() {
        let mut s = GbnSender::new(4);
        s.send(vec![0]).unwrap();
        let mut bytes = ack(0);
        bytes[1] ^= 0xff;
        assert_eq!(s.on_ack(&bytes), AckOutcome::Corrupt);
        assert_eq!(s.on_ack(&Frame::data(Some(0), vec![]).encode()), AckOutcome::Corrupt);
        assert_eq!(s.in_flight(), 1);
    }

    #[test]
    fn outstanding_lists_base_to_next() {
        let mut s = GbnSender::new(3);
        for i in 0..3u8 {
            s.send(vec![i]).unwrap();
        }
        s.on_ack(&ack(0));
        let seqs: Vec<u64> = s.outstanding().map(|(seq, _)| seq).collect();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[test]
    fn wire_numbers_wrap_past_255() {
        let mut s = GbnSender::new(5);
        for round in 0..300u64 {
            let out = s.send(vec![]).unwrap();
            assert_eq!(out.seq, round);
            let wire = Frame::decode(&out.frame, SeqLayout::OneByte).unwrap().seq;
            assert_eq!(wire, Some(round as u8));
            assert_eq!(
                s.on_ack(&ack(round as u8)),
                AckOutcome::Advanced { acked: 1, drained: true }
            );
            assert_window_invariant(&s);
        }
        assert_eq!(s.base(), 300);
    }
}
