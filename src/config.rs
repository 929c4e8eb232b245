//! Environment-driven configuration for the worker and hub processes
//!
//! The core has no CLI surface: every operational flag comes from the
//! environment (optionally via a `.env` file loaded by the binaries).

use std::path::PathBuf;
use std::time::Duration;

use tracing::trace;

const BROKER_URL: &str = "GUARDANT_BROKER_URL";
const STORE_URL: &str = "GUARDANT_STORE_URL";
const REGION: &str = "GUARDANT_REGION";
const OWNER_EMAIL: &str = "GUARDANT_OWNER_EMAIL";
const HEARTBEAT_SECS: &str = "GUARDANT_HEARTBEAT_SECS";
const MAX_CONCURRENCY: &str = "GUARDANT_MAX_CONCURRENCY";
const CACHE_DIR: &str = "GUARDANT_CACHE_DIR";
const REGISTER_URL: &str = "GUARDANT_REGISTER_URL";
const HEALTH_PORT: &str = "GUARDANT_HEALTH_PORT";
const POLL_SECS: &str = "GUARDANT_POLL_SECS";
const DRAIN_DEADLINE_SECS: &str = "GUARDANT_DRAIN_DEADLINE_SECS";
const AGGREGATE_PATH: &str = "GUARDANT_AGGREGATE_PATH";

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    std::env::var(key).map_or(default, |raw| raw.parse().unwrap_or(default))
}

/// Configuration for a worker node process
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// AMQP broker URL
    pub broker_url: String,

    /// State store (redis) URL
    pub store_url: String,

    /// Region override; when unset the worker geolocates itself
    pub region_override: Option<String>,

    /// Contact for the operator approving this worker
    pub owner_email: String,

    /// Heartbeat publish interval
    pub heartbeat_secs: u64,

    /// Bounded probe pool size
    pub max_concurrency: u32,

    /// Directory for the local result cache log
    pub cache_dir: PathBuf,

    /// Registration endpoint on the public boundary
    pub register_url: String,

    /// Health endpoint port; 0 disables the endpoint
    pub health_port: u16,

    /// How long to wait for in-flight probes on shutdown
    pub drain_deadline: Duration,

    pub version: String,
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        let config = Self {
            broker_url: env_or(BROKER_URL, "amqp://127.0.0.1:5672/%2f"),
            store_url: env_or(STORE_URL, "redis://127.0.0.1:6379"),
            region_override: std::env::var(REGION).ok(),
            owner_email: env_or(OWNER_EMAIL, "operator@localhost"),
            heartbeat_secs: env_parse(HEARTBEAT_SECS, 30),
            max_concurrency: env_parse(MAX_CONCURRENCY, 4),
            cache_dir: PathBuf::from(env_or(CACHE_DIR, "./guardant-cache")),
            register_url: env_or(
                REGISTER_URL,
                "http://127.0.0.1:9600/api/public/workers/register",
            ),
            health_port: env_parse(HEALTH_PORT, 0),
            drain_deadline: Duration::from_secs(env_parse(DRAIN_DEADLINE_SECS, 30)),
            version: env!("CARGO_PKG_VERSION").to_string(),
        };
        trace!("loaded worker config: {config:?}");
        config
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.broker_url.is_empty() {
            return Err("broker URL must not be empty".to_string());
        }
        if self.store_url.is_empty() {
            return Err("state store URL must not be empty".to_string());
        }
        if self.heartbeat_secs < 5 {
            return Err("heartbeat interval must be at least 5 seconds".to_string());
        }
        if self.max_concurrency == 0 || self.max_concurrency > 256 {
            return Err("max concurrency must be between 1 and 256".to_string());
        }
        if self.owner_email.is_empty() || !self.owner_email.contains('@') {
            return Err("owner email must be a valid address".to_string());
        }
        Ok(())
    }
}

/// Configuration for the hub process (scheduler, ingestor, aggregator,
/// registry, notification dispatcher)
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub broker_url: String,
    pub store_url: String,

    /// Port for the health endpoint and the worker registration route
    pub health_port: u16,

    /// Service refresh poll interval for the scheduler
    pub poll_interval: Duration,

    /// Leader lease TTL; renewal happens at a third of it
    pub lease_ttl: Duration,

    pub drain_deadline: Duration,

    /// Sink file for sealed aggregate buckets
    pub aggregate_path: PathBuf,
}

impl HubConfig {
    pub fn from_env() -> Self {
        let config = Self {
            broker_url: env_or(BROKER_URL, "amqp://127.0.0.1:5672/%2f"),
            store_url: env_or(STORE_URL, "redis://127.0.0.1:6379"),
            health_port: env_parse(HEALTH_PORT, 9600),
            poll_interval: Duration::from_secs(env_parse(POLL_SECS, 5)),
            lease_ttl: Duration::from_secs(15),
            drain_deadline: Duration::from_secs(env_parse(DRAIN_DEADLINE_SECS, 30)),
            aggregate_path: PathBuf::from(env_or(AGGREGATE_PATH, "./aggregates.jsonl")),
        };
        trace!("loaded hub config: {config:?}");
        config
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.broker_url.is_empty() {
            return Err("broker URL must not be empty".to_string());
        }
        if self.store_url.is_empty() {
            return Err("state store URL must not be empty".to_string());
        }
        if self.poll_interval < Duration::from_secs(1) {
            return Err("poll interval must be at least 1 second".to_string());
        }
        if self.lease_ttl < Duration::from_secs(3) {
            return Err("lease TTL must be at least 3 seconds".to_string());
        }
        Ok(())
    }
}
