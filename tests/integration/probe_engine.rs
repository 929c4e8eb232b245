//! Probe engine tests against mock HTTP targets
//!
//! These verify:
//! - status classification for web probes (2xx/4xx/5xx, degradedOn)
//! - keyword matching in both directions
//! - uptime-api JSON extraction
//! - the deadline safety contract (timeout + 250ms)

use std::sync::Arc;
use std::time::{Duration, Instant};

use guardant::model::*;
use guardant::probe::ProbeEngine;
use guardant::store::MemoryStore;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::{command_for, nest, web_service};

fn engine() -> ProbeEngine {
    ProbeEngine::new(Arc::new(MemoryStore::new()))
}

#[tokio::test]
async fn test_web_probe_up_on_200() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let service = web_service(nest().id, &format!("{}/health", server.uri()));
    let result = engine()
        .execute(&command_for(&service), "w1", "eu-west-1")
        .await;

    assert_eq!(result.status, ProbeStatus::Up);
    assert_eq!(result.status_code, Some(200));
    assert!(result.error_class.is_none());
    assert!(result.duration_ms <= service.timeout_ms);
}

#[tokio::test]
async fn test_web_probe_down_on_500() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let service = web_service(nest().id, &format!("{}/health", server.uri()));
    let result = engine()
        .execute(&command_for(&service), "w1", "eu-west-1")
        .await;

    assert_eq!(result.status, ProbeStatus::Down);
    assert_eq!(result.error_class, Some(ErrorClass::HttpStatus));
    assert!(result.message.is_some());
}

#[tokio::test]
async fn test_web_probe_degraded_on_configured_4xx() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;

    let mut service = web_service(nest().id, &server.uri());
    service.probe = ProbeSpec::Web(WebConfig {
        degraded_on: vec![429],
        ..Default::default()
    });

    let result = engine()
        .execute(&command_for(&service), "w1", "eu-west-1")
        .await;
    assert_eq!(result.status, ProbeStatus::Degraded);
}

#[tokio::test]
async fn test_web_probe_down_on_connection_refused() {
    // nothing listens on this port
    let service = web_service(nest().id, "http://127.0.0.1:9/");
    let result = engine()
        .execute(&command_for(&service), "w1", "eu-west-1")
        .await;

    assert_eq!(result.status, ProbeStatus::Down);
    assert_eq!(result.error_class, Some(ErrorClass::ConnectError));
}

#[tokio::test]
async fn test_keyword_probe_both_directions() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("status: OPERATIONAL"))
        .mount(&server)
        .await;

    let mut service = web_service(nest().id, &server.uri());
    service.probe = ProbeSpec::Keyword(KeywordConfig {
        keyword: "OPERATIONAL".to_string(),
        should_contain: true,
        case_sensitive: true,
    });
    let result = engine()
        .execute(&command_for(&service), "w1", "eu-west-1")
        .await;
    assert_eq!(result.status, ProbeStatus::Up);

    // forbidden keyword present
    service.probe = ProbeSpec::Keyword(KeywordConfig {
        keyword: "OPERATIONAL".to_string(),
        should_contain: false,
        case_sensitive: true,
    });
    let result = engine()
        .execute(&command_for(&service), "w1", "eu-west-1")
        .await;
    assert_eq!(result.status, ProbeStatus::Down);
    assert_eq!(result.error_class, Some(ErrorClass::ValidationError));

    // case sensitivity: lowercase needle misses uppercase body
    service.probe = ProbeSpec::Keyword(KeywordConfig {
        keyword: "operational".to_string(),
        should_contain: true,
        case_sensitive: true,
    });
    let result = engine()
        .execute(&command_for(&service), "w1", "eu-west-1")
        .await;
    assert_eq!(result.status, ProbeStatus::Down);
}

#[tokio::test]
async fn test_uptime_api_probe() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/status"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(r#"{"status":{"indicator":"none","description":"ok"}}"#),
        )
        .mount(&server)
        .await;

    let mut service = web_service(nest().id, &format!("{}/api/status", server.uri()));
    service.probe = ProbeSpec::UptimeApi(UptimeApiConfig {
        json_path: "status.indicator".to_string(),
        expected: serde_json::json!("none"),
    });
    let result = engine()
        .execute(&command_for(&service), "w1", "eu-west-1")
        .await;
    assert_eq!(result.status, ProbeStatus::Up);

    // mismatch
    service.probe = ProbeSpec::UptimeApi(UptimeApiConfig {
        json_path: "status.indicator".to_string(),
        expected: serde_json::json!("critical"),
    });
    let result = engine()
        .execute(&command_for(&service), "w1", "eu-west-1")
        .await;
    assert_eq!(result.status, ProbeStatus::Down);
    assert_eq!(result.error_class, Some(ErrorClass::ValidationError));
}

#[tokio::test]
async fn test_deadline_safety() {
    let server = MockServer::start().await;
    // target answers after 2s, but the probe budget is 300ms
    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;

    let mut service = web_service(nest().id, &server.uri());
    service.timeout_ms = 300;

    let start = Instant::now();
    let result = engine()
        .execute(&command_for(&service), "w1", "eu-west-1")
        .await;
    let elapsed = start.elapsed();

    assert_eq!(result.status, ProbeStatus::Down);
    assert_eq!(result.error_class, Some(ErrorClass::Timeout));
    // contract: timeoutMs + 250ms, with a little slack for the test runner
    assert!(
        elapsed < Duration::from_millis(300 + 250 + 200),
        "probe took {elapsed:?}"
    );
}

#[tokio::test]
async fn test_tcp_probe_against_live_listener() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let mut service = web_service(nest().id, &addr.to_string());
    service.probe = ProbeSpec::Tcp(TcpConfig::default());

    let result = engine()
        .execute(&command_for(&service), "w1", "eu-west-1")
        .await;
    assert_eq!(result.status, ProbeStatus::Up);

    // port alias behaves identically
    service.probe = ProbeSpec::Port(TcpConfig::default());
    let result = engine()
        .execute(&command_for(&service), "w1", "eu-west-1")
        .await;
    assert_eq!(result.status, ProbeStatus::Up);
}
