//! Probe engine: executes one probe command against its target
//!
//! `ProbeEngine::execute` is the single entry point. It never returns an
//! error and never retries: every failure mode is captured in the returned
//! `ProbeResult` with a fixed `ErrorClass`. Retrying is the scheduler's
//! concern.
//!
//! ## Contracts
//!
//! - returns within `timeoutMs + 250ms` (outer guard on top of the per-probe
//!   timeout)
//! - `up` results never exceed the command's timeout budget
//! - `down` results always carry a message

pub mod dns;
pub mod heartbeat;
pub mod net;
pub mod tls;
pub mod web;

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use tracing::{instrument, trace};
use uuid::Uuid;

use crate::model::{ErrorClass, ProbeCommand, ProbeResult, ProbeSpec, ProbeStatus, ServiceSnapshot};
use crate::store::StateStore;
use crate::util;

/// Extra wall-clock allowance on top of the probe budget before the engine
/// gives up and reports a timeout
pub const GRACE: Duration = Duration::from_millis(250);

/// Intermediate probe outcome before it is stamped into a `ProbeResult`
#[derive(Debug, Clone)]
pub(crate) struct Outcome {
    pub status: ProbeStatus,
    pub status_code: Option<u16>,
    pub message: Option<String>,
    pub error_class: Option<ErrorClass>,
    pub details: Option<serde_json::Value>,
}

impl Outcome {
    pub fn up() -> Self {
        Self {
            status: ProbeStatus::Up,
            status_code: None,
            message: None,
            error_class: None,
            details: None,
        }
    }

    pub fn down(error_class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            status: ProbeStatus::Down,
            status_code: None,
            message: Some(message.into()),
            error_class: Some(error_class),
            details: None,
        }
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self {
            status: ProbeStatus::Degraded,
            status_code: None,
            message: Some(message.into()),
            error_class: None,
            details: None,
        }
    }

    pub fn with_status_code(mut self, code: u16) -> Self {
        self.status_code = Some(code);
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Classify a reqwest error into the fixed error taxonomy
pub(crate) fn classify_http_error(err: &reqwest::Error) -> ErrorClass {
    if err.is_timeout() {
        return ErrorClass::Timeout;
    }
    // walk the source chain once; reqwest hides the cause behind hyper/rustls
    let mut chain = String::new();
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = source {
        chain.push_str(&e.to_string().to_lowercase());
        chain.push(' ');
        source = e.source();
    }
    if chain.contains("dns") || chain.contains("resolve") || chain.contains("lookup") {
        ErrorClass::DnsError
    } else if chain.contains("certificate") || chain.contains("tls") || chain.contains("handshake")
    {
        ErrorClass::TlsError
    } else if err.is_connect() {
        ErrorClass::ConnectError
    } else {
        ErrorClass::InternalError
    }
}

/// Executes probes of every supported type.
///
/// One engine per worker; the HTTP client and DNS resolver are built once
/// and reused across probes.
pub struct ProbeEngine {
    client: reqwest::Client,
    resolver: TokioAsyncResolver,
    store: Arc<dyn StateStore>,
}

impl ProbeEngine {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .redirect(reqwest::redirect::Policy::limited(5))
                .user_agent(crate::USER_AGENT)
                .build()
                .expect("Failed to build HTTP client"),
            resolver: TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default()),
            store,
        }
    }

    /// Execute one probe command and return its result.
    ///
    /// The effective budget is `min(timeoutMs, deadline - now)` so a command
    /// picked up late cannot run past its deadline.
    #[instrument(skip(self, command), fields(service = %command.service_snapshot.name, kind = %command.service_snapshot.probe.kind()))]
    pub async fn execute(
        &self,
        command: &ProbeCommand,
        worker_id: &str,
        region_id: &str,
    ) -> ProbeResult {
        let started_at = Utc::now();
        let start = Instant::now();

        let remaining = (command.deadline - util::now_ms()).max(0) as u64;
        let budget_ms = command.service_snapshot.timeout_ms.min(remaining).max(1);
        let budget = Duration::from_millis(budget_ms);

        trace!("executing probe with {budget_ms}ms budget");

        let outcome = match tokio::time::timeout(
            budget + GRACE,
            self.dispatch(&command.service_snapshot, budget),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => Outcome::down(
                ErrorClass::Timeout,
                format!("probe exceeded its {budget_ms}ms budget"),
            ),
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        self.finish(command, worker_id, region_id, started_at, duration_ms, outcome)
    }

    async fn dispatch(&self, snapshot: &ServiceSnapshot, timeout: Duration) -> Outcome {
        match &snapshot.probe {
            ProbeSpec::Web(config) => web::web(&self.client, &snapshot.target, config, timeout).await,
            ProbeSpec::Keyword(config) => {
                web::keyword(&self.client, &snapshot.target, config, timeout).await
            }
            ProbeSpec::Github(config) => {
                web::github(&self.client, &snapshot.target, config, timeout).await
            }
            ProbeSpec::UptimeApi(config) => {
                web::uptime_api(&self.client, &snapshot.target, config, timeout).await
            }
            ProbeSpec::Tcp(_) | ProbeSpec::Port(_) => net::tcp(&snapshot.target, timeout).await,
            ProbeSpec::Ping(_) => net::ping(&snapshot.target, timeout).await,
            ProbeSpec::Dns(config) => {
                dns::resolve(&self.resolver, &snapshot.target, config, timeout).await
            }
            ProbeSpec::Heartbeat(config) => heartbeat::check(self.store.as_ref(), config).await,
        }
    }

    fn finish(
        &self,
        command: &ProbeCommand,
        worker_id: &str,
        region_id: &str,
        started_at: chrono::DateTime<Utc>,
        duration_ms: u64,
        mut outcome: Outcome,
    ) -> ProbeResult {
        // an "up" slower than the timeout budget is a timeout in disguise
        if outcome.status == ProbeStatus::Up && duration_ms > command.service_snapshot.timeout_ms {
            outcome = Outcome::down(
                ErrorClass::Timeout,
                format!(
                    "response after {duration_ms}ms exceeded the {}ms timeout",
                    command.service_snapshot.timeout_ms
                ),
            );
        }

        if outcome.status == ProbeStatus::Down && outcome.message.is_none() {
            outcome.message = Some("probe failed".to_string());
        }

        ProbeResult {
            result_id: Uuid::new_v4(),
            command_id: command.command_id,
            service_id: command.service_snapshot.id,
            nest_id: command.service_snapshot.nest_id,
            worker_id: worker_id.to_string(),
            region_id: region_id.to_string(),
            started_at,
            duration_ms,
            status: outcome.status,
            status_code: outcome.status_code,
            message: outcome.message,
            error_class: outcome.error_class,
            details: outcome.details,
        }
    }
}
