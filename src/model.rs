//! Core data model: tenant entities, probe wire messages and derived views
//!
//! Everything that crosses the broker or lands in the state store is defined
//! here with its exact JSON shape (camelCase field names on the wire).
//!
//! ## Design Principles
//!
//! 1. **Typed probe configs**: the per-type configuration is a tagged union
//!    keyed by `type`; unknown types fail deserialization, never probing
//! 2. **Immutability of results**: a `ProbeResult` is constructed once by the
//!    probe engine and never mutated downstream
//! 3. **Idempotency keys everywhere**: `commandId` and `resultId` make
//!    at-least-once delivery safe

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

// ============================================================================
// Tenant entities
// ============================================================================

/// A tenant account owning monitored services.
///
/// Created and mutated by the admin API; the core only reads it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Nest {
    pub id: Uuid,

    /// Unique lowercase DNS label, immutable after creation
    pub subdomain: String,

    pub name: String,

    pub owner_user_id: Uuid,

    /// Per-nest secret used to sign outgoing webhook payloads.
    /// Provisioned by the admin API; webhook delivery is skipped while absent.
    #[serde(default)]
    pub webhook_secret: Option<String>,

    pub created_at: DateTime<Utc>,
}

/// Check that a subdomain is a valid lowercase DNS label.
pub fn is_valid_subdomain(subdomain: &str) -> bool {
    // one label, 1-63 chars, no leading/trailing hyphen
    let re = regex::Regex::new(r"^[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?$").expect("static regex");
    re.is_match(subdomain)
}

/// HTTP method for web-family probes
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    #[default]
    Head,
}

/// DNS record type for dns probes
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DnsRecordType {
    #[default]
    A,
    #[serde(rename = "AAAA")]
    Aaaa,
    #[serde(rename = "MX")]
    Mx,
    #[serde(rename = "TXT")]
    Txt,
}

/// Probe type identifier, used in worker capabilities and histograms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProbeKind {
    Web,
    Tcp,
    Ping,
    Dns,
    Keyword,
    Heartbeat,
    Github,
    Port,
    UptimeApi,
}

impl ProbeKind {
    pub const ALL: [ProbeKind; 9] = [
        ProbeKind::Web,
        ProbeKind::Tcp,
        ProbeKind::Ping,
        ProbeKind::Dns,
        ProbeKind::Keyword,
        ProbeKind::Heartbeat,
        ProbeKind::Github,
        ProbeKind::Port,
        ProbeKind::UptimeApi,
    ];
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProbeKind::Web => "web",
            ProbeKind::Tcp => "tcp",
            ProbeKind::Ping => "ping",
            ProbeKind::Dns => "dns",
            ProbeKind::Keyword => "keyword",
            ProbeKind::Heartbeat => "heartbeat",
            ProbeKind::Github => "github",
            ProbeKind::Port => "port",
            ProbeKind::UptimeApi => "uptime-api",
        };
        write!(f, "{s}")
    }
}

/// Per-type probe configuration, tagged by `type` on the wire:
/// `{"type": "web", "typeConfig": {...}}`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "typeConfig", rename_all = "kebab-case")]
pub enum ProbeSpec {
    Web(WebConfig),
    Tcp(TcpConfig),
    Ping(PingConfig),
    Dns(DnsConfig),
    Keyword(KeywordConfig),
    Heartbeat(HeartbeatConfig),
    Github(GithubConfig),
    /// Alias of tcp, kept for UX parity
    Port(TcpConfig),
    UptimeApi(UptimeApiConfig),
}

impl ProbeSpec {
    pub fn kind(&self) -> ProbeKind {
        match self {
            ProbeSpec::Web(_) => ProbeKind::Web,
            ProbeSpec::Tcp(_) => ProbeKind::Tcp,
            ProbeSpec::Ping(_) => ProbeKind::Ping,
            ProbeSpec::Dns(_) => ProbeKind::Dns,
            ProbeSpec::Keyword(_) => ProbeKind::Keyword,
            ProbeSpec::Heartbeat(_) => ProbeKind::Heartbeat,
            ProbeSpec::Github(_) => ProbeKind::Github,
            ProbeSpec::Port(_) => ProbeKind::Port,
            ProbeSpec::UptimeApi(_) => ProbeKind::UptimeApi,
        }
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WebConfig {
    pub method: HttpMethod,

    /// 4xx status codes that count as degraded instead of down
    pub degraded_on: Vec<u16>,

    /// Expected status codes; any 2xx is success when empty
    pub expected_status: Vec<u16>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TcpConfig {}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PingConfig {}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DnsConfig {
    pub record_type: DnsRecordType,

    /// When set, at least one returned record must match
    pub expected_value: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeywordConfig {
    pub keyword: String,

    /// `true`: keyword must be present; `false`: keyword must be absent
    #[serde(default = "default_true")]
    pub should_contain: bool,

    #[serde(default = "default_true")]
    pub case_sensitive: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatConfig {
    pub heartbeat_id: String,

    /// Maximum silence before the heartbeat counts as missed
    pub tolerance_ms: i64,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GithubConfig {
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UptimeApiConfig {
    /// Dot-separated path into the response JSON, e.g. `"status.indicator"`
    pub json_path: String,

    /// Value the extracted field must equal
    pub expected: serde_json::Value,
}

fn default_true() -> bool {
    true
}

/// Rule converting per-region outcomes into one aggregated status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Down if any region is down, degraded if any degraded and none down
    All,
    /// A single region (the first configured) is authoritative
    Closest,
    /// Up if any region is up
    Any,
    /// Status held by at least `n` regions, ties broken by severity
    Quorum(u32),
}

impl Default for Strategy {
    fn default() -> Self {
        Strategy::All
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::All => write!(f, "all"),
            Strategy::Closest => write!(f, "closest"),
            Strategy::Any => write!(f, "any"),
            Strategy::Quorum(n) => write!(f, "quorum({n})"),
        }
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(Strategy::All),
            "closest" => Ok(Strategy::Closest),
            "any" => Ok(Strategy::Any),
            other => {
                let inner = other
                    .strip_prefix("quorum(")
                    .and_then(|rest| rest.strip_suffix(')'))
                    .ok_or_else(|| format!("unknown strategy: {other}"))?;
                let n: u32 = inner
                    .parse()
                    .map_err(|_| format!("invalid quorum size: {inner}"))?;
                if n == 0 {
                    return Err("quorum size must be at least 1".to_string());
                }
                Ok(Strategy::Quorum(n))
            }
        }
    }
}

impl Serialize for Strategy {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Strategy {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Monitoring {
    /// Non-empty set of region ids the service is probed from
    pub regions: Vec<String>,

    #[serde(default)]
    pub strategy: Strategy,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NotificationTargets {
    pub webhooks: Vec<String>,
    pub emails: Vec<String>,
}

/// A monitored target owned by exactly one Nest.
///
/// Written by the admin API; the scheduler observes changes via `updated_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub id: Uuid,
    pub nest_id: Uuid,
    pub name: String,

    #[serde(flatten)]
    pub probe: ProbeSpec,

    /// URL, host:port or hostname depending on the probe type
    pub target: String,

    pub interval_seconds: u32,
    pub timeout_ms: u64,

    pub monitoring: Monitoring,

    #[serde(default)]
    pub notifications: NotificationTargets,

    /// Consecutive aggregated downs before an incident opens (k)
    #[serde(default = "default_incident_threshold")]
    pub alert_threshold: u32,

    /// Consecutive aggregated ups before an incident resolves (r)
    #[serde(default = "default_incident_threshold")]
    pub recovery_threshold: u32,

    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_incident_threshold() -> u32 {
    2
}

impl Service {
    pub const MIN_INTERVAL_SECONDS: u32 = 10;

    /// Validate invariants the admin API must have enforced.
    ///
    /// The scheduler re-checks on load and skips invalid rows instead of
    /// emitting commands for them.
    pub fn validate(&self) -> Result<(), String> {
        if self.interval_seconds < Self::MIN_INTERVAL_SECONDS {
            return Err(format!(
                "intervalSeconds must be at least {}",
                Self::MIN_INTERVAL_SECONDS
            ));
        }
        if self.timeout_ms == 0 || self.timeout_ms > self.interval_seconds as u64 * 1000 {
            return Err("timeoutMs must be positive and at most intervalSeconds * 1000".to_string());
        }
        if self.target.is_empty() {
            return Err("target must not be empty".to_string());
        }
        if self.monitoring.regions.is_empty() {
            return Err("monitoring.regions must not be empty".to_string());
        }
        if let Strategy::Quorum(n) = self.monitoring.strategy
            && n as usize > self.monitoring.regions.len()
        {
            return Err(format!(
                "quorum({n}) exceeds the {} configured regions",
                self.monitoring.regions.len()
            ));
        }
        if self.alert_threshold == 0 || self.recovery_threshold == 0 {
            return Err("alertThreshold and recoveryThreshold must be at least 1".to_string());
        }
        Ok(())
    }

    pub fn interval_ms(&self) -> i64 {
        self.interval_seconds as i64 * 1000
    }

    pub fn snapshot(&self) -> ServiceSnapshot {
        ServiceSnapshot {
            id: self.id,
            nest_id: self.nest_id,
            name: self.name.clone(),
            probe: self.probe.clone(),
            target: self.target.clone(),
            timeout_ms: self.timeout_ms,
        }
    }
}

/// A geographic pool of workers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Region {
    pub id: String,
    pub display_name: String,
    pub continent: String,
}

// ============================================================================
// Worker fleet
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Pending,
    /// Operator approved, broker credentials issued, no heartbeat seen yet
    Approved,
    Active,
    Draining,
    Revoked,
    /// Derived: active but heartbeats stopped; never persisted
    Stale,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub types: Vec<ProbeKind>,
    pub max_concurrency: u32,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            types: ProbeKind::ALL.to_vec(),
            max_concurrency: 4,
        }
    }
}

/// A worker node as tracked by the registry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerAnt {
    /// Stable id in the form `hostname-uuid`
    pub id: String,
    pub region_id: String,
    pub capabilities: Capabilities,
    pub version: String,
    pub status: WorkerStatus,
    pub owner_email: String,
    #[serde(default)]
    pub broker_credentials: Option<BrokerCredentials>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub counters_completed: u64,
    pub counters_failed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerCredentials {
    pub username: String,
    pub password: String,
    pub vhost: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationRequest {
    pub worker_id: String,
    pub owner_email: String,
    pub region_hint: Option<String>,
    pub capabilities: Capabilities,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationResponse {
    pub status: WorkerStatus,
    /// Region the operator pinned on approval
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broker_credentials: Option<BrokerCredentials>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoints: Option<Endpoints>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoints {
    pub broker_url: String,
}

/// Periodic worker liveness report published to the heartbeat exchange
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    pub worker_id: String,
    pub ts: DateTime<Utc>,
    pub counters_completed: u64,
    pub counters_failed: u64,
    pub inflight: u32,
    pub cpu: f32,
    pub mem: u64,
}

/// Control message delivered on a worker's private control queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum ControlMessage {
    Pause,
    Resume,
    /// Stop receiving, let in-flight probes finish, then stop
    Drain,
    /// Close subscriptions immediately and force re-registration
    Revoke,
    Update {
        #[serde(rename = "binaryUrl")]
        binary_url: String,
    },
}

// ============================================================================
// Probe wire messages
// ============================================================================

/// Immutable copy of the Service fields a worker needs to probe it
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSnapshot {
    pub id: Uuid,
    pub nest_id: Uuid,
    pub name: String,
    #[serde(flatten)]
    pub probe: ProbeSpec,
    pub target: String,
    pub timeout_ms: u64,
}

/// Message from the scheduler to one worker in a region
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeCommand {
    /// Idempotency key
    pub command_id: Uuid,

    pub service_snapshot: ServiceSnapshot,

    /// When the scheduler emitted the command (epoch ms)
    pub scheduled_at: i64,

    /// Absolute deadline (epoch ms); late commands yield `down/timeout`
    pub deadline: i64,

    pub attempt: u32,

    /// Monotonic version of the service snapshot
    pub revision: u64,
}

impl ProbeCommand {
    pub const MAX_ATTEMPTS: u32 = 3;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStatus {
    Up,
    Down,
    Degraded,
}

/// Fixed classification of probe failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    DnsError,
    ConnectError,
    TlsError,
    Timeout,
    HttpStatus,
    ValidationError,
    InternalError,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorClass::DnsError => "dns_error",
            ErrorClass::ConnectError => "connect_error",
            ErrorClass::TlsError => "tls_error",
            ErrorClass::Timeout => "timeout",
            ErrorClass::HttpStatus => "http_status",
            ErrorClass::ValidationError => "validation_error",
            ErrorClass::InternalError => "internal_error",
        };
        write!(f, "{s}")
    }
}

/// Outcome of one probe, immutable once emitted.
///
/// Invariants (enforced by the constructors in `probe`):
/// - `status == up` implies `duration_ms <= timeout_ms` of the command
/// - `status == down` implies `message` is present
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResult {
    /// Idempotency key for the ingestor
    pub result_id: Uuid,
    pub command_id: Uuid,
    pub service_id: Uuid,
    pub nest_id: Uuid,
    pub worker_id: String,
    pub region_id: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub status: ProbeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_class: Option<ErrorClass>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

// ============================================================================
// Derived views
// ============================================================================

/// Aggregated service status after applying the monitoring strategy.
///
/// `unknown` and `stale` exist so platform faults (no results) are never
/// conflated with probe-reported downtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregatedStatus {
    Up,
    Down,
    Degraded,
    /// Not enough observations yet to be authoritative
    Unknown,
    /// Previously observed regions stopped reporting
    Stale,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegionObservation {
    pub last_status: ProbeStatus,
    pub last_duration_ms: u64,
    pub last_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_class: Option<ErrorClass>,
}

/// Short-lived current view of a service across regions (stored with TTL)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveStatus {
    pub service_id: Uuid,
    pub nest_id: Uuid,
    pub last_result: ProbeResult,
    pub per_region: HashMap<String, RegionObservation>,
    pub aggregated_status: AggregatedStatus,
    pub updated_at: DateTime<Utc>,
}

/// An ongoing disruption of one service; at most one open per service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Incident {
    pub incident_id: Uuid,
    pub service_id: Uuid,
    pub nest_id: Uuid,
    pub opened_at: DateTime<Utc>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
    /// Most common error class observed while the incident was building
    pub reason: ErrorClass,
    pub affected_checks: u64,
    pub last_seen_at: DateTime<Utc>,
}

// ============================================================================
// Aggregation
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    Minute,
    Hour,
    Day,
}

impl Period {
    pub fn duration_ms(&self) -> i64 {
        match self {
            Period::Minute => 60_000,
            Period::Hour => 3_600_000,
            Period::Day => 86_400_000,
        }
    }

    /// Grace window after period end during which late events are accepted
    pub fn grace_ms(&self) -> i64 {
        match self {
            Period::Minute => 2 * 60_000,
            Period::Hour => 10 * 60_000,
            Period::Day => 3_600_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketKey {
    pub nest_id: Uuid,
    pub service_id: Uuid,
    pub region_id: String,
    pub period: Period,
    /// Floor-aligned to the period boundary (epoch ms)
    pub period_start: i64,
}

/// Per-period roll-up, append-only per key, immutable once sealed
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedMetrics {
    #[serde(flatten)]
    pub key: BucketKey,
    pub total_checks: u64,
    pub up_checks: u64,
    pub down_checks: u64,
    pub degraded_checks: u64,
    pub avg_duration_ms: f64,
    pub min_duration_ms: u64,
    pub max_duration_ms: u64,
    pub status_code_histogram: HashMap<u16, u64>,
    pub error_class_histogram: HashMap<ErrorClass, u64>,
}

impl AggregatedMetrics {
    pub fn uptime_percent(&self) -> f64 {
        if self.total_checks == 0 {
            return 0.0;
        }
        self.up_checks as f64 / self.total_checks as f64 * 100.0
    }
}

// ============================================================================
// Scheduling
// ============================================================================

/// The scheduler's per-service cursor, persisted as `schedule:{serviceId}`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleEntry {
    pub service_id: Uuid,
    pub next_due_at: i64,
    pub interval_ms: i64,
    pub region_set: Vec<String>,
    pub revision: u64,
}

// ============================================================================
// Notifications
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NotificationKind {
    IncidentStarted,
    IncidentResolved,
    MaintenanceStarted,
    MaintenanceEnded,
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NotificationKind::IncidentStarted => "incident-started",
            NotificationKind::IncidentResolved => "incident-resolved",
            NotificationKind::MaintenanceStarted => "maintenance-started",
            NotificationKind::MaintenanceEnded => "maintenance-ended",
        };
        write!(f, "{s}")
    }
}

/// Incident transition event emitted by the ingestor onto the
/// notifications exchange
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEvent {
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub nest_id: Uuid,
    pub service_id: Uuid,
    pub service_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub incident: Option<Incident>,
    pub timestamp: DateTime<Utc>,
}

/// A single webhook delivery attempt unit
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookTask {
    pub url: String,
    /// Serialized `NotificationEvent` payload, signed as-is
    pub body: String,
    /// Epoch seconds string included in the signature
    pub timestamp: String,
    pub signature: String,
}

/// An email delivery task handed to the email channel queue
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailTask {
    pub address: String,
    pub subject: String,
    pub body: String,
}
