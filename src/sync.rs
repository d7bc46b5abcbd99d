//! Small coordination primitives shared by the engine's background tasks

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

/// Auto-clearing update signal.
///
/// `set` marks the event; `wait` resumes once the event has been set at
/// least once since the previous `wait` returned. Intended for a single
/// waiter per event (each subscriber holds its own).
#[derive(Debug)]
pub struct Event {
    tx: watch::Sender<u64>,
    rx: tokio::sync::Mutex<watch::Receiver<u64>>,
}

impl Event {
    pub fn new() -> Event {
        let (tx, rx) = watch::channel(0);
        Event { tx, rx: tokio::sync::Mutex::new(rx) }
    }

    pub fn set(&self) {
        self.tx.send_modify(|version| *version += 1);
    }

    pub async fn wait(&self) {
        let mut rx = self.rx.lock().await;
        // Never errors while `self.tx` is alive.
        let _ = rx.changed().await;
    }
}

impl Default for Event {
    fn default() -> Self {
        Event::new()
    }
}

/// N-slot barrier with explicit release-per-slot.
///
/// Distinct from a count-down barrier: each keyed slot must be released
/// before `wait` resumes, slots can be added and deleted between rounds,
/// and `clear` arms the next round. Used by the multi-symbol trader to
/// collect one advice per tracked symbol per interval.
#[derive(Debug)]
pub struct SlotBarrier<K: Eq + Hash> {
    slots: parking_lot::Mutex<HashMap<K, bool>>,
    tx: watch::Sender<u64>,
}

impl<K: Eq + Hash + Clone> SlotBarrier<K> {
    pub fn new(keys: impl IntoIterator<Item = K>) -> Self {
        let slots = keys.into_iter().map(|k| (k, false)).collect();
        let (tx, _) = watch::channel(0);
        SlotBarrier { slots: parking_lot::Mutex::new(slots), tx }
    }

    pub fn add(&self, key: K) {
        self.slots.lock().insert(key, false);
    }

    pub fn delete(&self, key: &K) {
        self.slots.lock().remove(key);
        // Removal may complete the round for the remaining slots.
        self.tx.send_modify(|version| *version += 1);
    }

    pub fn release(&self, key: &K) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(key) {
            *slot = true;
        }
        drop(slots);
        self.tx.send_modify(|version| *version += 1);
    }

    pub fn clear(&self) {
        for slot in self.slots.lock().values_mut() {
            *slot = false;
        }
    }

    fn is_full(&self) -> bool {
        self.slots.lock().values().all(|released| *released)
    }

    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            if self.is_full() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Retry accounting for long-lived stream supervisors: allows up to
/// `max_attempts` consecutive failures with exponential backoff, and
/// forgets past failures once `reset_after` has elapsed since the last one.
#[derive(Debug)]
pub struct RetryBudget {
    max_attempts: u32,
    reset_after: Duration,
    attempts: u32,
    last_failure: Option<Instant>,
}

impl RetryBudget {
    pub fn new(max_attempts: u32, reset_after: Duration) -> Self {
        RetryBudget { max_attempts, reset_after, attempts: 0, last_failure: None }
    }

    /// Records a failure. Returns the backoff to sleep before the next
    /// attempt, or `None` when the budget is exhausted.
    pub fn fail(&mut self) -> Option<Duration> {
        let now = Instant::now();
        if let Some(last) = self.last_failure {
            if now.duration_since(last) >= self.reset_after {
                self.attempts = 0;
            }
        }
        self.last_failure = Some(now);
        self.attempts += 1;
        if self.attempts >= self.max_attempts {
            None
        } else {
            Some(backoff(self.attempts))
        }
    }
}

/// Exponential backoff: 1s, 2s, 4s, ... capped at 60s.
pub fn backoff(attempt: u32) -> Duration {
    let secs = 1u64 << attempt.saturating_sub(1).min(6);
    Duration::from_secs(secs.min(60))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_event_autoclears() {
        let event = Arc::new(Event::new());
        event.set();
        event.wait().await;

        // Without a new set, wait should pend.
        let waiter = {
            let event = event.clone();
            tokio::spawn(async move { event.wait().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        event.set();
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_slot_barrier_waits_for_all() {
        let barrier = Arc::new(SlotBarrier::new(["a", "b"]));
        let waiter = {
            let barrier = barrier.clone();
            tokio::spawn(async move { barrier.wait().await })
        };
        barrier.release(&"a");
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        barrier.release(&"b");
        waiter.await.unwrap();

        // Cleared barrier requires releases again.
        barrier.clear();
        barrier.release(&"a");
        barrier.release(&"b");
        barrier.wait().await;
    }

    #[tokio::test]
    async fn test_slot_barrier_delete_completes_round() {
        let barrier = SlotBarrier::new(["a", "b"]);
        barrier.release(&"a");
        barrier.delete(&"b");
        barrier.wait().await;
    }

    #[test]
    fn test_retry_budget_exhausts() {
        let mut budget = RetryBudget::new(3, Duration::from_secs(300));
        assert!(budget.fail().is_some());
        assert!(budget.fail().is_some());
        assert!(budget.fail().is_none());
    }

    #[test]
    fn test_backoff_caps() {
        assert_eq!(backoff(1), Duration::from_secs(1));
        assert_eq!(backoff(3), Duration::from_secs(4));
        assert_eq!(backoff(30), Duration::from_secs(60));
    }
}
