//! Retry with backoff and circuit breaking for sync targets.

pub mod circuit_breaker;
pub mod retry;
