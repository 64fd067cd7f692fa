//! Start-failure tracking for stopped instances.
//!
//! Reconciliation tries to start every unreserved stopped instance. When
//! a [`RestartPolicy`] limits attempts, instances that keep failing are
//! quarantined until their failure window lapses.

use std::collections::HashMap;
use std::time::Instant;

use spore_core::InstanceId;

use crate::settings::RestartPolicy;

#[derive(Debug)]
pub struct StartFailures {
    policy: RestartPolicy,
    /// instance_id → (failure count, first failure in window).
    failures: HashMap<InstanceId, (u32, Instant)>,
}

impl StartFailures {
    pub fn new(policy: RestartPolicy) -> Self {
        Self {
            policy,
            failures: HashMap::new(),
        }
    }

    /// Record a failed start. Returns true if the instance is now quarantined.
    pub fn record_failure(&mut self, instance_id: &str) -> bool {
        let now = Instant::now();
        let window = self.policy.window;
        let (count, first) = self
            .failures
            .entry(instance_id.to_string())
            .or_insert((0, now));

        if now.duration_since(*first) > window {
            *count = 0;
            *first = now;
        }

        *count += 1;
        self.policy.max_attempts.is_some_and(|max| *count >= max)
    }

    /// Whether reconciliation should skip starting this instance.
    pub fn is_quarantined(&self, instance_id: &str) -> bool {
        let Some(max) = self.policy.max_attempts else {
            return false;
        };
        let Some((count, first)) = self.failures.get(instance_id) else {
            return false;
        };
        if Instant::now().duration_since(*first) > self.policy.window {
            return false;
        }
        *count >= max
    }

    pub fn failures(&self, instance_id: &str) -> u32 {
        self.failures.get(instance_id).map_or(0, |(count, _)| *count)
    }

    /// Forget an instance (on successful start or when it leaves Stopped).
    pub fn clear(&mut self, instance_id: &str) {
        self.failures.remove(instance_id);
    }

    /// Drop entries whose window has lapsed.
    pub fn prune(&mut self) {
        let now = Instant::now();
        let window = self.policy.window;
        self.failures
            .retain(|_, (_, first)| now.duration_since(*first) <= window);
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn unlimited_never_quarantines() {
        let mut tracker = StartFailures::new(RestartPolicy::unlimited());
        for _ in 0..100 {
            assert!(!tracker.record_failure("i-1"));
        }
        assert!(!tracker.is_quarantined("i-1"));
        assert_eq!(tracker.failures("i-1"), 100);
    }

    #[test]
    fn limited_quarantines_after_max() {
        let mut tracker =
            StartFailures::new(RestartPolicy::limited(3, Duration::from_secs(60)));

        assert!(!tracker.record_failure("i-1"));
        assert!(!tracker.record_failure("i-1"));
        assert!(tracker.record_failure("i-1"));

        assert!(tracker.is_quarantined("i-1"));
        assert!(!tracker.is_quarantined("i-2"));

        tracker.clear("i-1");
        assert!(!tracker.is_quarantined("i-1"));
        assert!(tracker.is_empty());
    }

    #[test]
    fn window_expiry_lifts_quarantine() {
        let mut tracker =
            StartFailures::new(RestartPolicy::limited(1, Duration::from_millis(20)));
        assert!(tracker.record_failure("i-1"));
        assert!(tracker.is_quarantined("i-1"));

        std::thread::sleep(Duration::from_millis(40));
        assert!(!tracker.is_quarantined("i-1"));

        tracker.prune();
        assert_eq!(tracker.len(), 0);
    }
}
