//! Incident state machine
//!
//! Tracks one service's disruption lifecycle from the stream of aggregated
//! statuses:
//!
//! ```text
//!               all-up ──down-observed──▶ SUSPECTED
//!                 ▲                          │
//!                 │                 k consecutive downs
//!                 │                          ▼
//!                up-observed ──────────── OPEN
//!                                            │
//!                                  r consecutive ups
//!                                            ▼
//!                                        RESOLVED
//! ```
//!
//! `down-observed` means the aggregated status is down after applying the
//! strategy. `unknown` and `stale` never advance the machine in either
//! direction: platform faults must not open or resolve incidents. A
//! `degraded` observation breaks consecutiveness both ways.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::model::{AggregatedStatus, ErrorClass, Incident, Service};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AllUp,
    Suspected,
    Open,
}

/// What the state machine decided for one observation
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    None,
    /// A new incident opened; persist and notify
    Opened(Incident),
    /// The open incident accumulated another failed check; persist
    Updated(Incident),
    /// The incident closed; remove from the store and notify
    Resolved(Incident),
}

/// Per-service incident tracker, owned by the ingestor
#[derive(Debug)]
pub struct IncidentTracker {
    phase: Phase,
    consecutive_downs: u32,
    consecutive_ups: u32,
    error_counts: HashMap<ErrorClass, u64>,
    open: Option<Incident>,
}

impl IncidentTracker {
    pub fn new() -> Self {
        Self {
            phase: Phase::AllUp,
            consecutive_downs: 0,
            consecutive_ups: 0,
            error_counts: HashMap::new(),
            open: None,
        }
    }

    /// Resume tracking an incident found open in the store (ingestor restart
    /// or replica takeover).
    pub fn with_open(incident: Incident) -> Self {
        Self {
            phase: Phase::Open,
            consecutive_downs: 0,
            consecutive_ups: 0,
            error_counts: HashMap::new(),
            open: Some(incident),
        }
    }

    pub fn has_open(&self) -> bool {
        self.open.is_some()
    }

    fn dominant_error(&self) -> ErrorClass {
        self.error_counts
            .iter()
            .max_by_key(|(_, count)| **count)
            .map(|(class, _)| *class)
            .unwrap_or(ErrorClass::InternalError)
    }

    /// Feed one aggregated observation into the machine.
    pub fn observe(
        &mut self,
        service: &Service,
        status: AggregatedStatus,
        error_class: Option<ErrorClass>,
        now: DateTime<Utc>,
    ) -> Transition {
        match status {
            AggregatedStatus::Down => {
                self.consecutive_ups = 0;
                if let Some(class) = error_class {
                    *self.error_counts.entry(class).or_insert(0) += 1;
                }
                self.on_down(service, now)
            }

            AggregatedStatus::Up => {
                self.consecutive_downs = 0;
                self.on_up(service, now)
            }

            AggregatedStatus::Degraded => {
                // breaks consecutiveness in both directions
                self.consecutive_downs = 0;
                self.consecutive_ups = 0;
                if self.phase == Phase::Suspected {
                    self.phase = Phase::AllUp;
                    self.error_counts.clear();
                }
                Transition::None
            }

            // platform conditions: no effect
            AggregatedStatus::Unknown | AggregatedStatus::Stale => Transition::None,
        }
    }

    fn on_down(&mut self, service: &Service, now: DateTime<Utc>) -> Transition {
        self.consecutive_downs += 1;

        match self.phase {
            Phase::AllUp => {
                self.phase = Phase::Suspected;
                if self.consecutive_downs >= service.alert_threshold {
                    // k=1 opens immediately
                    return self.open_incident(service, now);
                }
                Transition::None
            }

            Phase::Suspected => {
                if self.consecutive_downs >= service.alert_threshold {
                    return self.open_incident(service, now);
                }
                Transition::None
            }

            Phase::Open => {
                if let Some(incident) = self.open.as_mut() {
                    incident.affected_checks += 1;
                    incident.last_seen_at = now;
                    Transition::Updated(incident.clone())
                } else {
                    // should not happen; heal by reopening
                    self.open_incident(service, now)
                }
            }
        }
    }

    fn on_up(&mut self, service: &Service, now: DateTime<Utc>) -> Transition {
        match self.phase {
            Phase::AllUp => Transition::None,

            Phase::Suspected => {
                self.phase = Phase::AllUp;
                self.error_counts.clear();
                Transition::None
            }

            Phase::Open => {
                self.consecutive_ups += 1;
                if self.consecutive_ups >= service.recovery_threshold {
                    let mut incident = self.open.take().expect("open phase has incident");
                    incident.closed_at = Some(now);
                    self.phase = Phase::AllUp;
                    self.consecutive_ups = 0;
                    self.error_counts.clear();
                    Transition::Resolved(incident)
                } else {
                    Transition::None
                }
            }
        }
    }

    fn open_incident(&mut self, service: &Service, now: DateTime<Utc>) -> Transition {
        self.phase = Phase::Open;
        let incident = Incident {
            incident_id: Uuid::new_v4(),
            service_id: service.id,
            nest_id: service.nest_id,
            opened_at: now,
            closed_at: None,
            reason: self.dominant_error(),
            affected_checks: self.consecutive_downs as u64,
            last_seen_at: now,
        };
        self.open = Some(incident.clone());
        Transition::Opened(incident)
    }
}

impl Default for IncidentTracker {
    fn default() -> Self {
        Self::new()
    }
}
