//! Per-relay reconnect gating.
//!
//! The supervisor scans at a fixed interval, but an endpoint that keeps
//! failing is only retried once its backoff delay has elapsed. A successful
//! connection resets the endpoint.

use crate::config::BackoffConfig;
use crate::endpoint::RelayEndpoint;
use dashmap::DashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct BackoffState {
    failures: u32,
    next_attempt: Instant,
}

/// Capped exponential backoff tracked independently for each endpoint.
#[derive(Debug)]
pub struct ReconnectBackoff {
    config: BackoffConfig,
    states: DashMap<RelayEndpoint, BackoffState>,
}

impl ReconnectBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            states: DashMap::new(),
        }
    }

    /// Delay applied after `failures` consecutive failures.
    ///
    /// `initial * multiplier^(failures - 1)`, capped at `max`.
    pub fn delay_for(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exponent = failures.saturating_sub(1).min(64) as i32;
        let delay_ms = self.config.initial_ms as f64 * self.config.multiplier.powi(exponent);
        let capped = delay_ms.min(self.config.max_ms as f64);
        Duration::from_millis(capped as u64)
    }

    /// Record a failed attempt and return the delay until the next one.
    pub fn record_failure(&self, endpoint: &RelayEndpoint) -> Duration {
        self.record_failure_at(endpoint, Instant::now())
    }

    fn record_failure_at(&self, endpoint: &RelayEndpoint, now: Instant) -> Duration {
        let mut entry = self.states.entry(endpoint.clone()).or_insert(BackoffState {
            failures: 0,
            next_attempt: now,
        });
        entry.failures = entry.failures.saturating_add(1);
        let delay = self.delay_for(entry.failures);
        entry.next_attempt = now + delay;
        delay
    }

    pub fn record_success(&self, endpoint: &RelayEndpoint) {
        self.states.remove(endpoint);
    }

    /// Whether the supervisor may retry `endpoint` now.
    pub fn is_ready(&self, endpoint: &RelayEndpoint) -> bool {
        self.is_ready_at(endpoint, Instant::now())
    }

    fn is_ready_at(&self, endpoint: &RelayEndpoint, now: Instant) -> bool {
        self.states
            .get(endpoint)
            .is_none_or(|state| state.next_attempt <= now)
    }

    pub fn failures(&self, endpoint: &RelayEndpoint) -> u32 {
        self.states.get(endpoint).map_or(0, |state| state.failures)
    }

    pub fn forget(&self, endpoint: &RelayEndpoint) {
        self.states.remove(endpoint);
    }
}
