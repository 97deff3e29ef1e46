//! Host failure suppression
//!
//! Counts network-class failures per target id; once a host crosses the
//! threshold, further probes to it are short-circuited before any
//! transport call.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::debug;

use crate::error::ErrorX;

pub struct HostErrorsCache {
    threshold: usize,
    failures: Mutex<HashMap<String, usize>>,
}

impl HostErrorsCache {
    /// `threshold` consecutive failures suppress a host. A threshold of 0
    /// never suppresses.
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// True when probes against the target id should be skipped.
    pub fn check(&self, target_id: &str) -> bool {
        if self.threshold == 0 {
            return false;
        }
        self.failures
            .lock()
            .expect("host errors poisoned")
            .get(target_id)
            .is_some_and(|count| *count >= self.threshold)
    }

    /// Records a failure against a target. Only network-class and deadline
    /// errors count; template-logic noise is ignored.
    pub fn mark_failed(&self, target_id: &str, err: &ErrorX) {
        if !err.is_network_class() {
            return;
        }
        let mut failures = self.failures.lock().expect("host errors poisoned");
        let count = failures.entry(target_id.to_string()).or_insert(0);
        *count += 1;
        if *count == self.threshold {
            debug!("host {target_id} reached {count} failures, suppressing further probes");
        }
    }

    /// Number of recorded failures for a target.
    pub fn failure_count(&self, target_id: &str) -> usize {
        self.failures
            .lock()
            .expect("host errors poisoned")
            .get(target_id)
            .copied()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;

    #[test]
    fn suppresses_after_threshold() {
        let cache = HostErrorsCache::new(3);
        let err = ErrorX::with_class(ErrorClass::NetworkTemporary, "connection reset");
        for _ in 0..2 {
            cache.mark_failed("https://broken.example", &err);
        }
        assert!(!cache.check("https://broken.example"));
        cache.mark_failed("https://broken.example", &err);
        assert!(cache.check("https://broken.example"));
        assert!(!cache.check("https://other.example"));
    }

    #[test]
    fn template_logic_errors_do_not_count() {
        let cache = HostErrorsCache::new(1);
        cache.mark_failed("h", &ErrorX::unresolved_variables());
        assert!(!cache.check("h"));
    }
}
