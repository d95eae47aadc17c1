//! Single-shot, restartable, cancelable deadlines.
//!
//! A [`Timer`] does not call back into protocol code.  When it fires, it
//! posts an [`Expired`] event into the owner's channel, and the owner's
//! driver loop handles it alongside socket input and API commands.  This
//! keeps all protocol state in one task.
//!
//! Every arming of a timer gets a fresh generation number.  An expiry that
//! was already in flight when the timer was cancelled or restarted carries a
//! stale generation, and [`Timer::claim`] rejects it.  A fired-but-already-
//! acknowledged timer is therefore a no-op.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Generations are unique across all timers in the process.
static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// Event posted by a timer task when its deadline passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expired<K> {
    pub key: K,
    generation: u64,
}

/// A deadline owned by one protocol driver.
///
/// `K` identifies the timer to its owner (a sequence ordinal, or a tag such
/// as "time-wait").  Dropping the timer aborts its task.
#[derive(Debug)]
pub struct Timer<K: Copy + Send + 'static> {
    key: K,
    events: mpsc::UnboundedSender<Expired<K>>,
    generation: u64,
    task: Option<JoinHandle<()>>,
}

impl<K: Copy + Send + 'static> Timer<K> {
    pub fn new(key: K, events: mpsc::UnboundedSender<Expired<K>>) -> Self {
        Self {
            key,
            events,
            generation: 0,
            task: None,
        }
    }

    /// Arm the timer to fire `after` from now, replacing any pending deadline.
    pub fn start(&mut self, after: Duration) {
        self.cancel();
        let generation = NEXT_GENERATION.fetch_add(1, Ordering::Relaxed);
        self.generation = generation;

        let key = self.key;
        let events = self.events.clone();
        self.task = Some(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            // The owner may already be gone; nothing left to notify then.
            let _ = events.send(Expired { key, generation });
        }));
    }

    /// Disarm the timer.  Cancelling an idle timer is a no-op.
    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.generation = 0;
    }

    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }

    /// Accept `event` if it belongs to the current arming of this timer.
    ///
    /// On success the timer becomes idle.  Stale events (from an arming that
    /// was since cancelled or restarted) return `false` and change nothing.
    pub fn claim(&mut self, event: &Expired<K>) -> bool {
        if self.task.is_some() && self.generation != 0 && event.generation == self.generation {
            self.task = None;
            self.generation = 0;
            true
        } else {
            false
        }
    }
}

impl<K: Copy + Send + 'static> Drop for Timer<K> {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn fires_once_after_deadline() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timer = Timer::new(7u64, tx);
        timer.start(Duration::from_millis(100));
        assert!(timer.is_running());

        let event = rx.recv().await.unwrap();
        assert_eq!(event.key, 7);
        assert!(timer.claim(&event));
        assert!(!timer.is_running());
        // A second claim of the same event is rejected.
        assert!(!timer.claim(&event));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_never_fires() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timer = Timer::new((), tx);
        timer.start(Duration::from_millis(50));
        timer.cancel();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn restart_invalidates_in_flight_expiry() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timer = Timer::new(1u8, tx);

        timer.start(Duration::from_millis(10));
        let stale = rx.recv().await.unwrap();

        // The owner restarted before handling the first expiry.
        timer.start(Duration::from_millis(10));
        assert!(!timer.claim(&stale));

        let fresh = rx.recv().await.unwrap();
        assert!(timer.claim(&fresh));
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_timer_aborts_task() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        {
            let mut timer = Timer::new(0u32, tx);
            timer.start(Duration::from_millis(10));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Sender side is gone and nothing was posted.
        assert!(rx.recv().await.is_none());
    }
}
