//! Property-based tests for invariants using proptest
//!
//! These verify that certain properties hold true for all inputs:
//! - strategy aggregation never invents observations
//! - period flooring is aligned and idempotent
//! - jitter stays within its band
//! - webhook signatures round-trip and reject tampering
//! - the incident machine never has two open incidents

use std::collections::HashMap;

use chrono::{Duration as ChronoDuration, Utc};
use guardant::ingest::incident::{IncidentTracker, Transition};
use guardant::ingest::strategy::aggregate;
use guardant::model::*;
use guardant::notify;
use guardant::util;
use proptest::prelude::*;
use proptest::strategy::Strategy;
use uuid::Uuid;

fn arb_probe_status() -> impl Strategy<Value = ProbeStatus> {
    prop_oneof![
        Just(ProbeStatus::Up),
        Just(ProbeStatus::Down),
        Just(ProbeStatus::Degraded),
    ]
}

fn arb_strategy() -> impl Strategy<Value = guardant::model::Strategy> {
    prop_oneof![
        Just(guardant::model::Strategy::All),
        Just(guardant::model::Strategy::Closest),
        Just(guardant::model::Strategy::Any),
        (1u32..4).prop_map(guardant::model::Strategy::Quorum),
    ]
}

fn observations(
    statuses: &[ProbeStatus],
) -> (HashMap<String, RegionObservation>, Vec<String>) {
    let now = Utc::now();
    let mut per_region = HashMap::new();
    let mut regions = Vec::new();
    for (i, status) in statuses.iter().enumerate() {
        let region = format!("region-{i}");
        per_region.insert(
            region.clone(),
            RegionObservation {
                last_status: *status,
                last_duration_ms: 10,
                last_at: now,
                last_error_class: None,
            },
        );
        regions.push(region);
    }
    (per_region, regions)
}

proptest! {
    // With fresh observations for every configured region, the aggregate is
    // never unknown or stale.
    #[test]
    fn prop_full_fresh_coverage_is_decisive_for_all(
        statuses in prop::collection::vec(arb_probe_status(), 1..6),
    ) {
        let (per_region, regions) = observations(&statuses);
        let result = aggregate(
            &per_region,
            guardant::model::Strategy::All,
            &regions,
            Utc::now(),
            ChronoDuration::seconds(120),
        );
        prop_assert!(result != AggregatedStatus::Unknown && result != AggregatedStatus::Stale);
    }

    // `all`: any down observation forces down.
    #[test]
    fn prop_all_any_down_is_down(
        statuses in prop::collection::vec(arb_probe_status(), 1..6),
        down_index in 0usize..6,
    ) {
        let mut statuses = statuses;
        let index = down_index % statuses.len();
        statuses[index] = ProbeStatus::Down;

        let (per_region, regions) = observations(&statuses);
        let result = aggregate(
            &per_region,
            guardant::model::Strategy::All,
            &regions,
            Utc::now(),
            ChronoDuration::seconds(120),
        );
        prop_assert_eq!(result, AggregatedStatus::Down);
    }

    // `any`: a single up observation is enough.
    #[test]
    fn prop_any_single_up_is_up(
        statuses in prop::collection::vec(arb_probe_status(), 1..6),
        up_index in 0usize..6,
    ) {
        let mut statuses = statuses;
        let index = up_index % statuses.len();
        statuses[index] = ProbeStatus::Up;

        let (per_region, regions) = observations(&statuses);
        let result = aggregate(
            &per_region,
            guardant::model::Strategy::Any,
            &regions,
            Utc::now(),
            ChronoDuration::seconds(120),
        );
        prop_assert_eq!(result, AggregatedStatus::Up);
    }

    // Aggregation is a pure function: same inputs, same output.
    #[test]
    fn prop_aggregate_is_deterministic(
        statuses in prop::collection::vec(arb_probe_status(), 1..6),
        strategy in arb_strategy(),
    ) {
        let (per_region, regions) = observations(&statuses);
        let now = Utc::now();
        let a = aggregate(&per_region, strategy, &regions, now, ChronoDuration::seconds(120));
        let b = aggregate(&per_region, strategy, &regions, now, ChronoDuration::seconds(120));
        prop_assert_eq!(a, b);
    }

    // floor_period lands on a boundary at or before the input and is
    // idempotent.
    #[test]
    fn prop_floor_period_alignment(
        ts in 0i64..4_000_000_000_000,
        period in prop_oneof![Just(60_000i64), Just(3_600_000i64), Just(86_400_000i64)],
    ) {
        let floored = util::floor_period(ts, period);
        prop_assert_eq!(floored % period, 0);
        prop_assert!(floored <= ts);
        prop_assert!(ts - floored < period);
        prop_assert_eq!(util::floor_period(floored, period), floored);
    }

    // jitter stays within the ±fraction band.
    #[test]
    fn prop_jitter_band(interval in 10_000i64..3_600_000) {
        let jittered = util::jitter(interval, 0.05);
        let spread = (interval as f64 * 0.05).round() as i64;
        prop_assert!(jittered >= interval - spread);
        prop_assert!(jittered <= interval + spread);
    }

    // signatures verify with the right inputs and fail with tampered ones.
    #[test]
    fn prop_signature_round_trip(
        secret in "[a-zA-Z0-9]{8,32}",
        body in ".{0,200}",
        ts in 1_600_000_000i64..1_900_000_000,
    ) {
        let timestamp = ts.to_string();
        let signature = notify::sign(&secret, &timestamp, &body);
        prop_assert!(notify::verify(&secret, &timestamp, &body, &signature, ts + 10, 300));
        // wrong secret fails
        prop_assert!(!notify::verify("other-secret", &timestamp, &body, &signature, ts + 10, 300));
        // stale timestamp fails
        prop_assert!(!notify::verify(&secret, &timestamp, &body, &signature, ts + 301, 300));
    }
}

fn arb_aggregated() -> impl Strategy<Value = AggregatedStatus> {
    prop_oneof![
        Just(AggregatedStatus::Up),
        Just(AggregatedStatus::Down),
        Just(AggregatedStatus::Degraded),
        Just(AggregatedStatus::Unknown),
        Just(AggregatedStatus::Stale),
    ]
}

fn tracker_service(k: u32, r: u32) -> Service {
    Service {
        id: Uuid::new_v4(),
        nest_id: Uuid::new_v4(),
        name: "svc".to_string(),
        probe: ProbeSpec::Web(WebConfig::default()),
        target: "https://example.com".to_string(),
        interval_seconds: 60,
        timeout_ms: 5_000,
        monitoring: Monitoring {
            regions: vec!["eu-west-1".to_string()],
            strategy: guardant::model::Strategy::All,
        },
        notifications: NotificationTargets::default(),
        alert_threshold: k,
        recovery_threshold: r,
        is_active: true,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

proptest! {
    // Over any observation sequence there is never a second Opened without a
    // Resolved in between, and transitions alternate correctly.
    #[test]
    fn prop_single_open_incident(
        sequence in prop::collection::vec(arb_aggregated(), 0..60),
        k in 1u32..4,
        r in 1u32..4,
    ) {
        let service = tracker_service(k, r);
        let mut tracker = IncidentTracker::new();
        let mut open = false;

        for status in sequence {
            match tracker.observe(&service, status, Some(ErrorClass::Timeout), Utc::now()) {
                Transition::Opened(incident) => {
                    prop_assert!(!open, "opened while already open");
                    prop_assert!(incident.closed_at.is_none());
                    open = true;
                }
                Transition::Resolved(incident) => {
                    prop_assert!(open, "resolved without an open incident");
                    prop_assert!(incident.closed_at.is_some());
                    open = false;
                }
                Transition::Updated(_) => {
                    prop_assert!(open, "updated without an open incident");
                }
                Transition::None => {}
            }
            prop_assert_eq!(tracker.has_open(), open);
        }
    }

    // k consecutive downs from a clean state always open exactly one
    // incident; fewer never do.
    #[test]
    fn prop_threshold_exactness(k in 1u32..6) {
        let service = tracker_service(k, 2);
        let mut tracker = IncidentTracker::new();

        for i in 1..=k {
            let transition = tracker.observe(
                &service,
                AggregatedStatus::Down,
                Some(ErrorClass::ConnectError),
                Utc::now(),
            );
            if i < k {
                prop_assert_eq!(transition, Transition::None);
            } else {
                prop_assert!(matches!(transition, Transition::Opened(_)));
            }
        }
    }
}
