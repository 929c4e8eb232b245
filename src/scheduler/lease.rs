//! Leader lease on the state store
//!
//! Active-passive scheduler pairs elect a leader through a TTL-bound
//! set-if-absent key. No consensus protocol: losing the lease simply means
//! the loser stops emitting within one tick and the winner rebuilds from
//! state. Duplicate emissions during a handover are absorbed by the
//! deduplication window.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::store::{StateStore, StoreResult, keys};

pub struct LeaderLease {
    store: Arc<dyn StateStore>,
    holder_id: String,
    ttl: Duration,
}

impl LeaderLease {
    pub fn new(store: Arc<dyn StateStore>, holder_id: String, ttl: Duration) -> Self {
        Self {
            store,
            holder_id,
            ttl,
        }
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Try to become (or stay) leader. Returns whether we hold the lease.
    pub async fn try_acquire(&self) -> StoreResult<bool> {
        let key = keys::scheduler_leader();
        if self
            .store
            .set_if_absent(&key, self.holder_id.clone(), self.ttl)
            .await?
        {
            debug!("acquired scheduler lease as {}", self.holder_id);
            return Ok(true);
        }
        // the key exists; it might already be ours from a previous life
        self.renew().await
    }

    /// Extend the lease if we still hold it. Returns false on loss.
    ///
    /// The check-and-keep is an atomic compare-and-swap against our own
    /// holder id, so a holder whose lease expired (and was taken over)
    /// cannot re-arm a TTL it no longer owns.
    pub async fn renew(&self) -> StoreResult<bool> {
        let key = keys::scheduler_leader();
        let still_ours = self
            .store
            .compare_and_swap(&key, Some(&self.holder_id), self.holder_id.clone())
            .await?;
        if !still_ours {
            return Ok(false);
        }
        self.store.expire_in(&key, self.ttl).await?;
        Ok(true)
    }

    /// Drop the lease on clean shutdown so the standby takes over quickly.
    pub async fn release(&self) -> StoreResult<()> {
        let key = keys::scheduler_leader();
        if self.store.get_raw(&key).await?.as_deref() == Some(self.holder_id.as_str()) {
            self.store.delete(&key).await?;
            debug!("released scheduler lease");
        }
        Ok(())
    }
}
