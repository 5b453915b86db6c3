//! Grace-period scheduler.
//!
//! One timer per identity. Arming a timer replaces any timer already armed for
//! that identity; cancelling is idempotent. When a timer fires it does not act
//! on its own: it sends an [`Expiry`] back to the session loop, which must
//! [`claim`](GraceScheduler::claim) it before removing the player. A claim only
//! succeeds for the generation that is still armed, so an expiry that raced
//! with a reconnect (cancel) or a re-arm is dropped.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::protocol::Identity;

/// Default time a disconnected player keeps their seat.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(60);

/// Monotonic tag distinguishing successive timers for the same identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerGeneration(u64);

/// A fired timer, delivered to the session loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expiry {
    pub identity: Identity,
    pub generation: TimerGeneration,
}

#[derive(Debug)]
struct ArmedTimer {
    generation: TimerGeneration,
    task: JoinHandle<()>,
}

/// Owns the armed grace timers.
#[derive(Debug)]
pub struct GraceScheduler {
    grace: Duration,
    next_generation: u64,
    timers: HashMap<Identity, ArmedTimer>,
    expiry_tx: mpsc::UnboundedSender<Expiry>,
}

impl GraceScheduler {
    /// Create a scheduler and the receiver its expiries are delivered on.
    pub fn channel(grace: Duration) -> (Self, mpsc::UnboundedReceiver<Expiry>) {
        let (expiry_tx, expiry_rx) = mpsc::unbounded_channel();
        let scheduler = Self {
            grace,
            next_generation: 0,
            timers: HashMap::new(),
            expiry_tx,
        };
        (scheduler, expiry_rx)
    }

    pub fn grace_period(&self) -> Duration {
        self.grace
    }

    /// Start (or restart) the grace timer for `identity`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn arm(&mut self, identity: &Identity) -> TimerGeneration {
        self.next_generation += 1;
        let generation = TimerGeneration(self.next_generation);

        let expiry = Expiry {
            identity: identity.clone(),
            generation,
        };
        let grace = self.grace;
        // Counted from the arm call, not from the task's first poll.
        let deadline = Instant::now() + grace;
        let tx = self.expiry_tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            // Receiver gone means the session loop has stopped.
            let _ = tx.send(expiry);
        });

        if let Some(previous) = self
            .timers
            .insert(identity.clone(), ArmedTimer { generation, task })
        {
            previous.task.abort();
        }
        debug!(identity = %identity, grace_secs = grace.as_secs(), "grace timer armed");
        generation
    }

    /// Cancel the timer for `identity`. Returns `false` when none was armed.
    pub fn cancel(&mut self, identity: &Identity) -> bool {
        match self.timers.remove(identity) {
            Some(timer) => {
                timer.task.abort();
                debug!(identity = %identity, "grace timer cancelled");
                true
            }
            None => false,
        }
    }

    /// Accept a fired timer if it is still the armed one, disarming it.
    pub fn claim(&mut self, expiry: &Expiry) -> bool {
        let current = self
            .timers
            .get(&expiry.identity)
            .is_some_and(|timer| timer.generation == expiry.generation);
        if current {
            self.timers.remove(&expiry.identity);
        } else {
            debug!(identity = %expiry.identity, "stale grace expiry ignored");
        }
        current
    }

    pub fn is_armed(&self, identity: &Identity) -> bool {
        self.timers.contains_key(identity)
    }

    pub fn armed_count(&self) -> usize {
        self.timers.len()
    }
}

impl Drop for GraceScheduler {
    fn drop(&mut self) {
        for timer in self.timers.values() {
            timer.task.abort();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::error::TryRecvError;

    fn alice() -> Identity {
        Identity::new("alice")
    }

    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fires_after_grace_period() {
        let (mut scheduler, mut rx) = GraceScheduler::channel(Duration::from_secs(60));
        let generation = scheduler.arm(&alice());

        tokio::time::advance(Duration::from_secs(59)).await;
        settle().await;
        assert_eq!(rx.try_recv().unwrap_err(), TryRecvError::Empty);

        tokio::time::advance(Duration::from_secs(2)).await;
        settle().await;
        let expiry = rx.try_recv().unwrap();
        assert_eq!(expiry.identity, alice());
        assert_eq!(expiry.generation, generation);
        assert!(scheduler.claim(&expiry));
        assert!(!scheduler.is_armed(&alice()));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_never_fires() {
        let (mut scheduler, mut rx) = GraceScheduler::channel(Duration::from_secs(60));
        scheduler.arm(&alice());
        assert!(scheduler.cancel(&alice()));

        tokio::time::advance(Duration::from_secs(120)).await;
        settle().await;
        assert_eq!(rx.try_recv().unwrap_err(), TryRecvError::Empty);
        assert!(!scheduler.cancel(&alice()));
    }

    #[tokio::test(start_paused = true)]
    async fn rearm_replaces_previous_timer() {
        let (mut scheduler, mut rx) = GraceScheduler::channel(Duration::from_secs(60));
        let first = scheduler.arm(&alice());
        tokio::time::advance(Duration::from_secs(30)).await;
        let second = scheduler.arm(&alice());
        assert_ne!(first, second);
        assert_eq!(scheduler.armed_count(), 1);

        // The first deadline passes without a fire.
        tokio::time::advance(Duration::from_secs(31)).await;
        settle().await;
        assert_eq!(rx.try_recv().unwrap_err(), TryRecvError::Empty);

        tokio::time::advance(Duration::from_secs(30)).await;
        settle().await;
        assert_eq!(rx.try_recv().unwrap().generation, second);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_expiry_is_not_claimed() {
        let (mut scheduler, _rx) = GraceScheduler::channel(Duration::from_secs(60));
        let first = scheduler.arm(&alice());
        scheduler.arm(&alice());
        let stale = Expiry {
            identity: alice(),
            generation: first,
        };
        assert!(!scheduler.claim(&stale));
        assert!(scheduler.is_armed(&alice()));

        scheduler.cancel(&alice());
        assert!(!scheduler.claim(&stale));
    }
}
