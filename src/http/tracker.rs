//! In-flight request tracking.
//!
//! # Responsibilities
//! - Count requests currently inside the pipeline
//! - Release the slot even if the handler panics
//!
//! # Design Decisions
//! - One tracker per server generation: an old generation's count drains to
//!   zero independently of the new one

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Shared in-flight counter.
#[derive(Debug, Clone, Default)]
pub struct RequestTracker {
    active: Arc<AtomicU64>,
    served: Arc<AtomicU64>,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a request entering the pipeline. The guard releases it.
    pub fn track(&self) -> RequestGuard {
        self.active.fetch_add(1, Ordering::SeqCst);
        self.served.fetch_add(1, Ordering::SeqCst);
        RequestGuard {
            active: Arc::clone(&self.active),
        }
    }

    pub fn active_count(&self) -> u64 {
        self.active.load(Ordering::SeqCst)
    }

    /// Requests accepted since the generation started.
    pub fn served_count(&self) -> u64 {
        self.served.load(Ordering::SeqCst)
    }
}

/// Guard held for a request's lifetime.
#[derive(Debug)]
pub struct RequestGuard {
    active: Arc<AtomicU64>,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_counts() {
        let tracker = RequestTracker::new();
        assert_eq!(tracker.active_count(), 0);

        let guard1 = tracker.track();
        let guard2 = tracker.track();
        assert_eq!(tracker.active_count(), 2);

        drop(guard1);
        assert_eq!(tracker.active_count(), 1);

        drop(guard2);
        assert_eq!(tracker.active_count(), 0);
        assert_eq!(tracker.served_count(), 2);
    }

    #[test]
    fn guard_released_on_panic() {
        let tracker = RequestTracker::new();
        let cloned = tracker.clone();
        let result = std::panic::catch_unwind(move || {
            let _guard = cloned.track();
            panic!("handler failed");
        });
        assert!(result.is_err());
        assert_eq!(tracker.active_count(), 0);
    }
}
