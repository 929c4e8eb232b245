//! DNS record probe
//!
//! Resolves the target hostname for a configured record type. NXDOMAIN,
//! SERVFAIL and resolver timeouts are all `down`; an optional expected value
//! turns the probe into a content check.

use std::time::Duration;

use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::error::{ResolveError, ResolveErrorKind};
use serde_json::json;

use crate::model::{DnsConfig, DnsRecordType, ErrorClass};

use super::Outcome;

async fn lookup_records(
    resolver: &TokioAsyncResolver,
    host: &str,
    record_type: DnsRecordType,
) -> Result<Vec<String>, ResolveError> {
    match record_type {
        DnsRecordType::A => Ok(resolver
            .ipv4_lookup(host)
            .await?
            .iter()
            .map(|a| a.0.to_string())
            .collect()),
        DnsRecordType::Aaaa => Ok(resolver
            .ipv6_lookup(host)
            .await?
            .iter()
            .map(|aaaa| aaaa.0.to_string())
            .collect()),
        DnsRecordType::Mx => Ok(resolver
            .mx_lookup(host)
            .await?
            .iter()
            .map(|mx| format!("{} {}", mx.preference(), mx.exchange()))
            .collect()),
        DnsRecordType::Txt => Ok(resolver
            .txt_lookup(host)
            .await?
            .iter()
            .map(|txt| txt.to_string())
            .collect()),
    }
}

pub(crate) async fn resolve(
    resolver: &TokioAsyncResolver,
    host: &str,
    config: &DnsConfig,
    timeout: Duration,
) -> Outcome {
    let records = match tokio::time::timeout(
        timeout,
        lookup_records(resolver, host, config.record_type),
    )
    .await
    {
        Ok(Ok(records)) => records,
        Ok(Err(e)) => {
            return match e.kind() {
                ResolveErrorKind::NoRecordsFound { .. } => Outcome::down(
                    ErrorClass::DnsError,
                    format!("no {:?} records for {host}", config.record_type),
                ),
                ResolveErrorKind::Timeout => {
                    Outcome::down(ErrorClass::Timeout, format!("resolving {host} timed out"))
                }
                _ => Outcome::down(ErrorClass::DnsError, e.to_string()),
            };
        }
        Err(_) => {
            return Outcome::down(ErrorClass::Timeout, format!("resolving {host} timed out"));
        }
    };

    if records.is_empty() {
        return Outcome::down(
            ErrorClass::DnsError,
            format!("no {:?} records for {host}", config.record_type),
        );
    }

    if let Some(expected) = &config.expected_value {
        let matched = records
            .iter()
            .any(|record| record == expected || record.contains(expected.as_str()));
        if !matched {
            return Outcome::down(
                ErrorClass::ValidationError,
                format!("no record matched expected value '{expected}'"),
            )
            .with_details(json!({ "records": records }));
        }
    }

    Outcome::up().with_details(json!({ "records": records }))
}
