//! Heartbeat probe: pull-style check against a stored heartbeat timestamp
//!
//! Monitored jobs push their heartbeat through the public API, which writes
//! `heartbeat:{heartbeatId}` into the state store. The probe only reads.

use serde_json::json;

use crate::model::{ErrorClass, HeartbeatConfig};
use crate::store::{StateStore, keys};
use crate::util;

use super::Outcome;

pub(crate) async fn check(store: &dyn StateStore, config: &HeartbeatConfig) -> Outcome {
    let key = keys::heartbeat_source(&config.heartbeat_id);

    let raw = match store.get_raw(&key).await {
        Ok(Some(raw)) => raw,
        Ok(None) => {
            return Outcome::down(
                ErrorClass::ValidationError,
                format!("no heartbeat recorded for '{}'", config.heartbeat_id),
            );
        }
        Err(e) => return Outcome::down(ErrorClass::InternalError, e.to_string()),
    };

    let last_ms: i64 = match raw.trim().parse() {
        Ok(last_ms) => last_ms,
        Err(_) => {
            return Outcome::down(
                ErrorClass::ValidationError,
                format!("heartbeat value for '{}' is not a timestamp", config.heartbeat_id),
            );
        }
    };

    let age_ms = util::now_ms() - last_ms;
    if age_ms <= config.tolerance_ms {
        Outcome::up().with_details(json!({ "lastBeatMs": last_ms, "ageMs": age_ms }))
    } else {
        Outcome::down(
            ErrorClass::Timeout,
            format!(
                "heartbeat '{}' overdue: last seen {age_ms}ms ago (tolerance {}ms)",
                config.heartbeat_id, config.tolerance_ms
            ),
        )
        .with_details(json!({ "lastBeatMs": last_ms, "ageMs": age_ms }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ProbeStatus;
    use crate::store::MemoryStore;

    fn config(tolerance_ms: i64) -> HeartbeatConfig {
        HeartbeatConfig {
            heartbeat_id: "backup-job".to_string(),
            tolerance_ms,
        }
    }

    #[tokio::test]
    async fn test_fresh_heartbeat_is_up() {
        let store = MemoryStore::new();
        store
            .put_raw(
                &keys::heartbeat_source("backup-job"),
                util::now_ms().to_string(),
                None,
            )
            .await
            .unwrap();

        let outcome = check(&store, &config(60_000)).await;
        assert_eq!(outcome.status, ProbeStatus::Up);
    }

    #[tokio::test]
    async fn test_overdue_heartbeat_is_down() {
        let store = MemoryStore::new();
        store
            .put_raw(
                &keys::heartbeat_source("backup-job"),
                (util::now_ms() - 120_000).to_string(),
                None,
            )
            .await
            .unwrap();

        let outcome = check(&store, &config(60_000)).await;
        assert_eq!(outcome.status, ProbeStatus::Down);
        assert_eq!(outcome.error_class, Some(ErrorClass::Timeout));
    }

    #[tokio::test]
    async fn test_missing_heartbeat_is_down() {
        let store = MemoryStore::new();
        let outcome = check(&store, &config(60_000)).await;
        assert_eq!(outcome.status, ProbeStatus::Down);
        assert_eq!(outcome.error_class, Some(ErrorClass::ValidationError));
    }
}
