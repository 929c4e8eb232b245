//! State store abstraction and backends
//!
//! The key-value state store owns Nest/Service/WorkerAnt/LiveStatus/Incident
//! rows (see `keys` for the schema). Backends implement the `StateStore`
//! trait; production uses redis, tests use the in-memory backend.

pub mod backend;
pub mod error;
pub mod keys;
pub mod memory;
pub mod redis;

use std::time::Duration;

pub use backend::{StateStore, StoreHealth};
pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
pub use redis::RedisStore;

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Fetch and deserialize a JSON value, `None` when the key is absent.
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn StateStore,
    key: &str,
) -> StoreResult<Option<T>> {
    match store.get_raw(key).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// Serialize and store a JSON value.
pub async fn put_json<T: Serialize>(
    store: &dyn StateStore,
    key: &str,
    value: &T,
    ttl: Option<Duration>,
) -> StoreResult<()> {
    let raw = serde_json::to_string(value)?;
    store.put_raw(key, raw, ttl).await
}
