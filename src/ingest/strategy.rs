//! Aggregation strategies: per-region outcomes → one status
//!
//! Pure function, no I/O. Regions whose last observation is older than the
//! freshness horizon (2× the service interval) are treated as missing: a
//! missing region never flips the status on its own. When nothing fresh is
//! left the result is `stale` (previously seen regions went quiet) or
//! `unknown` (never observed), both of which are platform conditions and do
//! not open incidents.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use crate::model::{AggregatedStatus, ProbeStatus, RegionObservation, Strategy};

fn to_aggregated(status: ProbeStatus) -> AggregatedStatus {
    match status {
        ProbeStatus::Up => AggregatedStatus::Up,
        ProbeStatus::Down => AggregatedStatus::Down,
        ProbeStatus::Degraded => AggregatedStatus::Degraded,
    }
}

/// Severity order for quorum tie-breaking: down > degraded > up
fn severity(status: ProbeStatus) -> u8 {
    match status {
        ProbeStatus::Down => 2,
        ProbeStatus::Degraded => 1,
        ProbeStatus::Up => 0,
    }
}

/// Compute the aggregated status for a service.
///
/// `regions` is the configured region set; observations from regions no
/// longer configured are ignored.
pub fn aggregate(
    per_region: &HashMap<String, RegionObservation>,
    strategy: Strategy,
    regions: &[String],
    now: DateTime<Utc>,
    freshness: Duration,
) -> AggregatedStatus {
    let fresh: Vec<(&str, ProbeStatus)> = regions
        .iter()
        .filter_map(|region| {
            per_region
                .get(region)
                .filter(|obs| now - obs.last_at <= freshness)
                .map(|obs| (region.as_str(), obs.last_status))
        })
        .collect();

    if fresh.is_empty() {
        let ever_seen = regions.iter().any(|region| per_region.contains_key(region));
        return if ever_seen {
            AggregatedStatus::Stale
        } else {
            AggregatedStatus::Unknown
        };
    }

    match strategy {
        Strategy::All => {
            if fresh.iter().any(|(_, s)| *s == ProbeStatus::Down) {
                AggregatedStatus::Down
            } else if fresh.iter().any(|(_, s)| *s == ProbeStatus::Degraded) {
                AggregatedStatus::Degraded
            } else {
                AggregatedStatus::Up
            }
        }

        Strategy::Closest => {
            // the first configured region is the authoritative one
            let authoritative = match regions.first() {
                Some(region) => region,
                None => return AggregatedStatus::Unknown,
            };
            match fresh.iter().find(|(region, _)| region == authoritative) {
                Some((_, status)) => to_aggregated(*status),
                None if per_region.contains_key(authoritative) => AggregatedStatus::Stale,
                None => AggregatedStatus::Unknown,
            }
        }

        Strategy::Any => {
            if fresh.iter().any(|(_, s)| *s == ProbeStatus::Up) {
                AggregatedStatus::Up
            } else {
                AggregatedStatus::Down
            }
        }

        Strategy::Quorum(n) => {
            let mut counts: HashMap<ProbeStatus, usize> = HashMap::new();
            for (_, status) in &fresh {
                *counts.entry(*status).or_insert(0) += 1;
            }
            counts
                .into_iter()
                .filter(|(_, count)| *count >= n as usize)
                .max_by_key(|(status, _)| severity(*status))
                .map(|(status, _)| to_aggregated(status))
                .unwrap_or(AggregatedStatus::Unknown)
        }
    }
}
