//! Key builders for the state store schema
//!
//! All keys used by the core are built here so the schema lives in one
//! place. Values are JSON unless noted on the builder.

use uuid::Uuid;

/// `nest:{nestId}` → Nest
pub fn nest(nest_id: Uuid) -> String {
    format!("nest:{nest_id}")
}

/// `nest:subdomain:{sub}` → nestId
pub fn nest_subdomain(subdomain: &str) -> String {
    format!("nest:subdomain:{subdomain}")
}

/// `service:{serviceId}` → Service
pub fn service(service_id: Uuid) -> String {
    format!("service:{service_id}")
}

/// `service:index:nest:{nestId}` → set of serviceIds
pub fn service_index_nest(nest_id: Uuid) -> String {
    format!("service:index:nest:{nest_id}")
}

/// `schedule:{serviceId}` → ScheduleEntry
pub fn schedule(service_id: Uuid) -> String {
    format!("schedule:{service_id}")
}

/// `status:{nestId}:{serviceId}` → LiveStatus (TTL 300s)
pub fn status(nest_id: Uuid, service_id: Uuid) -> String {
    format!("status:{nest_id}:{service_id}")
}

/// `incident:{nestId}:{serviceId}` → open Incident (absent when none)
pub fn incident(nest_id: Uuid, service_id: Uuid) -> String {
    format!("incident:{nest_id}:{service_id}")
}

/// `worker:{workerId}` → WorkerAnt
pub fn worker(worker_id: &str) -> String {
    format!("worker:{worker_id}")
}

/// `worker:heartbeat:{workerId}` → epoch ms of last heartbeat (TTL 90s)
pub fn worker_heartbeat(worker_id: &str) -> String {
    format!("worker:heartbeat:{worker_id}")
}

/// `scheduler:leader` → leader id (TTL 15s)
pub fn scheduler_leader() -> String {
    "scheduler:leader".to_string()
}

/// `heartbeat:{heartbeatId}` → epoch ms pushed by the monitored job
///
/// Read by the heartbeat probe; written by the public API on inbound pings.
pub fn heartbeat_source(heartbeat_id: &str) -> String {
    format!("heartbeat:{heartbeat_id}")
}

/// Prefix of all service rows; index keys share it and are filtered by the
/// caller (`service:index:...` does not parse as `service:{uuid}`).
pub const SERVICE_PREFIX: &str = "service:";

/// Prefix of all worker rows, excluding heartbeat keys
pub const WORKER_PREFIX: &str = "worker:";
