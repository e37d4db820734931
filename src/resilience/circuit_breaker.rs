// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Circuit breaker for sync targets, using the recloser crate.
//!
//! A peer that keeps failing is not contacted again until `open_wait` has
//! passed; calls fail fast with [`TransportError::CircuitOpen`] instead of
//! waiting out a session timeout each time.
//!
//! States:
//! - Closed: calls pass through, outcomes fill a ring buffer of `closed_len`
//! - Open: calls are rejected without touching the peer
//! - HalfOpen: `half_open_len` trial calls decide between Closed and Open

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use recloser::{AsyncRecloser, Error as RecloserError, Recloser};
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::storage::traits::Checkpoint;
use crate::sync::{ExchangeRequest, ExchangeResponse, SyncInfo, SyncTarget};

/// Error type for circuit-protected operations
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// The circuit is open, the operation was not attempted
    #[error("circuit breaker open, request rejected")]
    Rejected,

    #[error("operation failed: {0}")]
    Inner(#[source] E),
}

impl<E> From<RecloserError<E>> for CircuitError<E> {
    fn from(err: RecloserError<E>) -> Self {
        match err {
            RecloserError::Rejected => CircuitError::Rejected,
            RecloserError::Inner(e) => CircuitError::Inner(e),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Failure rate (0.0 - 1.0) over the closed window that opens the circuit
    pub error_rate: f32,
    /// Calls observed while closed before the rate is evaluated
    pub closed_len: usize,
    /// Trial calls while half-open
    pub half_open_len: usize,
    /// Time spent open before trial calls are let through
    pub open_wait: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            error_rate: 0.5,
            closed_len: 10,
            half_open_len: 2,
            open_wait: Duration::from_secs(30),
        }
    }
}

impl CircuitConfig {
    /// Opens after two failures, recovers after 50ms.
    #[must_use]
    pub fn test() -> Self {
        Self {
            error_rate: 0.5,
            closed_len: 2,
            half_open_len: 1,
            open_wait: Duration::from_millis(50),
        }
    }
}

/// A named circuit breaker with call counters.
pub struct CircuitBreaker {
    name: String,
    inner: AsyncRecloser,
    calls_total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        let recloser = Recloser::custom()
            .error_rate(config.error_rate)
            .closed_len(config.closed_len)
            .half_open_len(config.half_open_len)
            .open_wait(config.open_wait)
            .build();

        Self {
            name: name.into(),
            inner: recloser.into(),
            calls_total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `f` through the breaker.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.calls_total.fetch_add(1, Ordering::Relaxed);

        match self.inner.call(f()).await {
            Ok(result) => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_circuit_call(&self.name, "success");
                Ok(result)
            }
            Err(RecloserError::Rejected) => {
                self.rejections.fetch_add(1, Ordering::Relaxed);
                warn!(circuit = %self.name, "Circuit open, call rejected");
                crate::metrics::record_circuit_call(&self.name, "rejected");
                Err(CircuitError::Rejected)
            }
            Err(RecloserError::Inner(e)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                debug!(circuit = %self.name, "Circuit call failed");
                crate::metrics::record_circuit_call(&self.name, "failure");
                Err(CircuitError::Inner(e))
            }
        }
    }

    #[must_use]
    pub fn calls_total(&self) -> u64 {
        self.calls_total.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }

    /// Failed share of all calls, rejections included in the total.
    #[must_use]
    pub fn failure_rate(&self) -> f64 {
        let total = self.calls_total();
        if total == 0 {
            return 0.0;
        }
        self.failures() as f64 / total as f64
    }
}

/// [`SyncTarget`] decorator that routes every call through a
/// [`CircuitBreaker`]. Rejected calls surface as
/// [`TransportError::CircuitOpen`], which a session does not retry.
pub struct CircuitTarget<T> {
    inner: T,
    breaker: CircuitBreaker,
}

impl<T: SyncTarget> CircuitTarget<T> {
    pub fn new(inner: T, name: impl Into<String>, config: CircuitConfig) -> Self {
        Self {
            inner,
            breaker: CircuitBreaker::new(name, config),
        }
    }

    #[must_use]
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    fn unwrap_err(&self, err: CircuitError<TransportError>) -> TransportError {
        match err {
            CircuitError::Rejected => TransportError::CircuitOpen(self.breaker.name().to_string()),
            CircuitError::Inner(e) => e,
        }
    }
}

#[async_trait]
impl<T: SyncTarget> SyncTarget for CircuitTarget<T> {
    async fn get_sync_info(&self, source_replica_uid: &str) -> Result<SyncInfo, TransportError> {
        self.breaker
            .call(|| self.inner.get_sync_info(source_replica_uid))
            .await
            .map_err(|e| self.unwrap_err(e))
    }

    async fn sync_exchange(&self, request: ExchangeRequest) -> Result<ExchangeResponse, TransportError> {
        self.breaker
            .call(|| self.inner.sync_exchange(request))
            .await
            .map_err(|e| self.unwrap_err(e))
    }

    async fn record_sync_info(&self, source_replica_uid: &str, checkpoint: Checkpoint) -> Result<(), TransportError> {
        self.breaker
            .call(|| self.inner.record_sync_info(source_replica_uid, checkpoint))
            .await
            .map_err(|e| self.unwrap_err(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DownTarget;

    #[async_trait]
    impl SyncTarget for DownTarget {
        async fn get_sync_info(&self, _: &str) -> Result<SyncInfo, TransportError> {
            Err(TransportError::Unavailable("connection refused".into()))
        }
        async fn sync_exchange(&self, _: ExchangeRequest) -> Result<ExchangeResponse, TransportError> {
            Err(TransportError::Unavailable("connection refused".into()))
        }
        async fn record_sync_info(&self, _: &str, _: Checkpoint) -> Result<(), TransportError> {
            Err(TransportError::Unavailable("connection refused".into()))
        }
    }

    fn never_recovers() -> CircuitConfig {
        CircuitConfig {
            open_wait: Duration::from_secs(60),
            ..CircuitConfig::test()
        }
    }

    #[tokio::test]
    async fn test_circuit_passes_successful_calls() {
        let cb = CircuitBreaker::new("peer", CircuitConfig::test());
        let result: Result<i32, CircuitError<&str>> = cb.call(|| async { Ok(42) }).await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(cb.successes(), 1);
        assert_eq!(cb.failures(), 0);
    }

    #[tokio::test]
    async fn test_circuit_opens_after_failures() {
        let cb = CircuitBreaker::new("peer", never_recovers());
        for _ in 0..2 {
            let _: Result<i32, CircuitError<&str>> = cb.call(|| async { Err("down") }).await;
        }

        let result: Result<i32, CircuitError<&str>> = cb.call(|| async { Ok(1) }).await;
        assert!(matches!(result, Err(CircuitError::Rejected)));
        assert_eq!(cb.failures(), 2);
        assert_eq!(cb.rejections(), 1);
        assert!((cb.failure_rate() - 2.0 / 3.0).abs() < 0.01);
    }

    #[tokio::test]
    async fn test_circuit_target_fails_fast_once_open() {
        let target = CircuitTarget::new(DownTarget, "peer-b", never_recovers());

        for _ in 0..2 {
            assert!(matches!(
                target.get_sync_info("a").await,
                Err(TransportError::Unavailable(_))
            ));
        }
        match target.get_sync_info("a").await {
            Err(TransportError::CircuitOpen(name)) => assert_eq!(name, "peer-b"),
            other => panic!("expected CircuitOpen, got {:?}", other),
        }
        assert_eq!(target.breaker().rejections(), 1);
    }

    #[tokio::test]
    async fn test_circuit_half_opens_after_wait() {
        let cb = CircuitBreaker::new("peer", CircuitConfig::test());
        for _ in 0..2 {
            let _: Result<i32, CircuitError<&str>> = cb.call(|| async { Err("down") }).await;
        }
        tokio::time::sleep(Duration::from_millis(80)).await;

        let result: Result<i32, CircuitError<&str>> = cb.call(|| async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }
}
