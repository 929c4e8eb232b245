//! State store trait definition
//!
//! The state store is a shared key-value store holding tenant entities,
//! live status, incidents and the scheduler lease. Single-writer ownership
//! per key family is a convention enforced by the components, not the store;
//! cross-writer keys use `compare_and_swap`.

use std::time::Duration;

use async_trait::async_trait;

use super::error::StoreResult;

/// Health status of the store backend
#[derive(Debug, Clone)]
pub struct StoreHealth {
    pub healthy: bool,
    pub message: String,
}

/// Trait for key-value state store backends
///
/// All methods carry explicit timeouts at the transport level; callers can
/// assume no unbounded waits. Implementations must be `Send + Sync` as they
/// are shared across async tasks behind an `Arc`.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Fetch the raw value for a key, `None` when absent or expired
    async fn get_raw(&self, key: &str) -> StoreResult<Option<String>>;

    /// Set a key, optionally with a TTL after which it expires
    async fn put_raw(&self, key: &str, value: String, ttl: Option<Duration>) -> StoreResult<()>;

    /// Delete a key; deleting an absent key is not an error
    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Atomically set a key only when absent. Returns whether the set won.
    ///
    /// This is the primitive behind the scheduler leader lease.
    async fn set_if_absent(&self, key: &str, value: String, ttl: Duration) -> StoreResult<bool>;

    /// Atomically replace a key's value only when the current value matches
    /// `expected` (`None` = key must be absent). Returns whether the swap
    /// happened.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        value: String,
    ) -> StoreResult<bool>;

    /// Refresh a key's TTL; no-op when the key is absent
    async fn expire_in(&self, key: &str, ttl: Duration) -> StoreResult<()>;

    /// List all `(key, value)` pairs whose key starts with `prefix`.
    ///
    /// Used by the scheduler's service refresh and the registry's fleet view;
    /// prefixes are narrow enough that a full scan per poll is acceptable.
    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<(String, String)>>;

    /// Lightweight liveness probe of the backend
    async fn health_check(&self) -> StoreResult<StoreHealth>;
}
