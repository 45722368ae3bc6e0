//! When to flush outbound operations.
//!
//! Edits are coalesced for up to `interval` after the first unsent one, or
//! until `max_batch` operations are waiting, whichever comes first. This
//! only changes how many frames carry the operations, never their order.

use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct FlushPolicy {
    interval: Duration,
    max_batch: usize,
    /// When the oldest unsent edit was made
    oldest: Option<Instant>,
}

impl FlushPolicy {
    pub fn new(interval: Duration, max_batch: usize) -> Self {
        Self {
            interval,
            max_batch: max_batch.max(1),
            oldest: None,
        }
    }

    pub fn max_batch(&self) -> usize {
        self.max_batch
    }

    /// Start the clock on the current batch if it is not running yet.
    pub fn note_edit(&mut self, now: Instant) {
        self.oldest.get_or_insert(now);
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.oldest.map(|t| t + self.interval)
    }

    pub fn is_due(&self, now: Instant, unsent: usize) -> bool {
        if unsent == 0 {
            return false;
        }
        unsent >= self.max_batch || self.deadline().is_some_and(|d| now >= d)
    }

    /// Everything unsent went out.
    pub fn reset(&mut self) {
        self.oldest = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_policy_is_never_due() {
        let policy = FlushPolicy::new(Duration::from_millis(20), 8);
        assert_eq!(policy.deadline(), None);
        assert!(!policy.is_due(Instant::now(), 0));
    }

    #[test]
    fn test_due_after_interval() {
        let mut policy = FlushPolicy::new(Duration::from_millis(20), 8);
        let start = Instant::now();
        policy.note_edit(start);
        policy.note_edit(start + Duration::from_millis(15));

        assert_eq!(policy.deadline(), Some(start + Duration::from_millis(20)));
        assert!(!policy.is_due(start + Duration::from_millis(19), 2));
        assert!(policy.is_due(start + Duration::from_millis(20), 2));
    }

    #[test]
    fn test_due_when_full() {
        let mut policy = FlushPolicy::new(Duration::from_secs(10), 3);
        let now = Instant::now();
        policy.note_edit(now);
        assert!(!policy.is_due(now, 2));
        assert!(policy.is_due(now, 3));
    }

    #[test]
    fn test_reset_clears_deadline() {
        let mut policy = FlushPolicy::new(Duration::from_millis(5), 0);
        assert_eq!(policy.max_batch(), 1);
        policy.note_edit(Instant::now());
        policy.reset();
        assert_eq!(policy.deadline(), None);
    }
}
