// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-entity-type in-flight request governor.
//!
//! Advisory throttling: when the in-flight count is at the cap, admission
//! sleeps for a fixed interval and then proceeds anyway. Callers see added
//! latency, never rejection.
//!
//! The count is decremented by [`InFlightGuard`]'s `Drop`, so every exit path
//! (success, error, cancellation of the awaiting future) releases its slot.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Soft cap on concurrent remote requests for one entity type.
#[derive(Debug, Clone)]
pub struct ConcurrencyGovernor {
    entity_type: Arc<str>,
    max_in_flight: usize,
    admission_wait: Duration,
    in_flight: Arc<AtomicUsize>,
}

impl ConcurrencyGovernor {
    pub fn new(entity_type: &str, max_in_flight: usize, admission_wait: Duration) -> Self {
        Self {
            entity_type: Arc::from(entity_type),
            max_in_flight: max_in_flight.max(1),
            admission_wait,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Take a slot, waiting `admission_wait` first if the cap is reached.
    pub async fn admit(&self) -> InFlightGuard {
        let mut waited = false;
        if self.in_flight.load(Ordering::SeqCst) >= self.max_in_flight {
            debug!(
                entity_type = %self.entity_type,
                in_flight = self.in_flight(),
                max = self.max_in_flight,
                "In-flight cap reached, delaying admission"
            );
            crate::metrics::record_admission_wait(&self.entity_type);
            tokio::time::sleep(self.admission_wait).await;
            waited = true;
        }

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        crate::metrics::set_in_flight(&self.entity_type, now);

        InFlightGuard {
            entity_type: Arc::clone(&self.entity_type),
            counter: Arc::clone(&self.in_flight),
            waited,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }
}

/// Holds one in-flight slot until dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    entity_type: Arc<str>,
    counter: Arc<AtomicUsize>,
    waited: bool,
}

impl InFlightGuard {
    /// Whether admission was delayed by the cap.
    pub fn waited(&self) -> bool {
        self.waited
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let prev = self.counter.fetch_sub(1, Ordering::SeqCst);
        crate::metrics::set_in_flight(&self.entity_type, prev.saturating_sub(1));
    }
}
