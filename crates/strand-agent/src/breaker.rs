//! A sticky circuit breaker: closed until the first failure, then open for good.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

/// Clones share state. There is no half-open state.
#[derive(Clone, Debug)]
pub struct CircuitBreaker {
    name: &'static str,
    open: Arc<AtomicBool>,
}

impl CircuitBreaker {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            open: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A breaker that starts open, for features switched off up front
    pub fn opened(name: &'static str) -> Self {
        Self {
            name,
            open: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        !self.is_open()
    }

    /// Open the breaker. Returns `true` only for the call that opened it.
    pub fn trip(&self, reason: &str) -> bool {
        let opened = self
            .open
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if opened {
            tracing::warn!(breaker = self.name, "Disabled after failure: {}", reason);
        }
        opened
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trip_reports_transition_once() {
        let breaker = CircuitBreaker::new("test");
        let clone = breaker.clone();
        assert!(breaker.is_closed());
        assert!(clone.trip("boom"));
        assert!(!breaker.trip("again"));
        assert!(breaker.is_open());
        assert!(clone.is_open());
    }
}
