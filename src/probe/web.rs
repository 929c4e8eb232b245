//! HTTP-family probes: web, keyword, github and uptime-api
//!
//! All four share the engine's pooled client; each request carries the probe
//! budget as its timeout so a slow target cannot hold a worker slot.

use std::time::Duration;

use reqwest::Client;
use serde_json::{Value, json};
use tracing::trace;

use crate::model::{
    ErrorClass, GithubConfig, HttpMethod, KeywordConfig, UptimeApiConfig, WebConfig,
};

use super::{Outcome, classify_http_error, tls};

fn to_method(method: HttpMethod) -> reqwest::Method {
    match method {
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Head => reqwest::Method::HEAD,
    }
}

struct HttpProbeResponse {
    status: u16,
    final_url: String,
    body: String,
}

/// Issue the request; transport failures come back as ready-made outcomes.
async fn fetch(
    client: &Client,
    method: HttpMethod,
    url: &str,
    timeout: Duration,
    want_body: bool,
) -> Result<HttpProbeResponse, Outcome> {
    let response = client
        .request(to_method(method), url)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| Outcome::down(classify_http_error(&e), e.to_string()))?;

    let status = response.status().as_u16();
    let final_url = response.url().to_string();

    let body = if want_body && method != HttpMethod::Head {
        response
            .text()
            .await
            .map_err(|e| Outcome::down(classify_http_error(&e), e.to_string()))?
    } else {
        String::new()
    };

    Ok(HttpProbeResponse {
        status,
        final_url,
        body,
    })
}

fn evaluate_status(
    status: u16,
    final_url: &str,
    tls_expiry_days: Option<i64>,
    config: &WebConfig,
) -> Outcome {
    let mut details = json!({ "finalUrl": final_url });
    if let Some(days) = tls_expiry_days {
        details["tlsExpiryDays"] = json!(days);
    }

    if !config.expected_status.is_empty() {
        return if config.expected_status.contains(&status) {
            Outcome::up().with_status_code(status).with_details(details)
        } else {
            Outcome::down(
                ErrorClass::HttpStatus,
                format!("unexpected status code: {status}"),
            )
            .with_status_code(status)
        };
    }

    match status {
        200..=299 => Outcome::up().with_status_code(status).with_details(details),
        300..=399 => {
            // redirects are followed up to the cap; landing on a 3xx means
            // the chain never resolved
            Outcome::degraded(format!("redirect did not resolve (status {status})"))
                .with_status_code(status)
        }
        400..=499 if config.degraded_on.contains(&status) => {
            Outcome::degraded(format!("degraded status code: {status}")).with_status_code(status)
        }
        _ => Outcome::down(
            ErrorClass::HttpStatus,
            format!("HTTP error status: {status}"),
        )
        .with_status_code(status),
    }
}

/// `web` probe: up iff 2xx within the timeout.
/// HTTPS targets additionally get their certificate expiry captured; the
/// handshake runs concurrently with the request so it cannot stretch the
/// budget.
pub(crate) async fn web(
    client: &Client,
    target: &str,
    config: &WebConfig,
    timeout: Duration,
) -> Outcome {
    let (response, tls_expiry_days) = tokio::join!(
        fetch(client, config.method, target, timeout, false),
        tls::expiry_days(target, timeout),
    );
    match response {
        Ok(response) => {
            evaluate_status(response.status, &response.final_url, tls_expiry_days, config)
        }
        Err(outcome) => outcome,
    }
}

/// `keyword` probe: a web probe whose body must (or must not) contain a keyword
pub(crate) async fn keyword(
    client: &Client,
    target: &str,
    config: &KeywordConfig,
    timeout: Duration,
) -> Outcome {
    let response = match fetch(client, HttpMethod::Get, target, timeout, true).await {
        Ok(response) => response,
        Err(outcome) => return outcome,
    };

    if !(200..300).contains(&response.status) {
        return Outcome::down(
            ErrorClass::HttpStatus,
            format!("HTTP error status: {}", response.status),
        )
        .with_status_code(response.status);
    }

    let found = if config.case_sensitive {
        response.body.contains(&config.keyword)
    } else {
        response
            .body
            .to_lowercase()
            .contains(&config.keyword.to_lowercase())
    };

    trace!("keyword '{}' found={found}", config.keyword);

    if found == config.should_contain {
        Outcome::up().with_status_code(response.status)
    } else if config.should_contain {
        Outcome::down(
            ErrorClass::ValidationError,
            format!("keyword '{}' not found in response body", config.keyword),
        )
        .with_status_code(response.status)
    } else {
        Outcome::down(
            ErrorClass::ValidationError,
            format!("forbidden keyword '{}' present in response body", config.keyword),
        )
        .with_status_code(response.status)
    }
}

/// `github` probe: repository reachability plus stars/forks/issues telemetry
pub(crate) async fn github(
    client: &Client,
    target: &str,
    config: &GithubConfig,
    timeout: Duration,
) -> Outcome {
    let url = format!("https://api.github.com/repos/{target}");
    let mut request = client.get(&url).timeout(timeout);
    if let Some(token) = &config.token {
        request = request.bearer_auth(token);
    }

    let response = match request.send().await {
        Ok(response) => response,
        Err(e) => return Outcome::down(classify_http_error(&e), e.to_string()),
    };

    let status = response.status().as_u16();
    if !(200..300).contains(&status) {
        return Outcome::down(
            ErrorClass::HttpStatus,
            format!("GitHub API returned status {status}"),
        )
        .with_status_code(status);
    }

    let repo: Value = match response.json().await {
        Ok(repo) => repo,
        Err(e) => return Outcome::down(classify_http_error(&e), e.to_string()),
    };

    Outcome::up().with_status_code(status).with_details(json!({
        "stars": repo.get("stargazers_count").cloned().unwrap_or(Value::Null),
        "forks": repo.get("forks_count").cloned().unwrap_or(Value::Null),
        "openIssues": repo.get("open_issues_count").cloned().unwrap_or(Value::Null),
    }))
}

/// Traverse a dot-separated path through a JSON document.
/// Numeric segments index into arrays.
pub(crate) fn json_lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |current, segment| {
        if let Ok(index) = segment.parse::<usize>() {
            current.get(index).or_else(|| current.get(segment))
        } else {
            current.get(segment)
        }
    })
}

/// `uptime-api` probe: extract a JSON field and compare it to the expected value
pub(crate) async fn uptime_api(
    client: &Client,
    target: &str,
    config: &UptimeApiConfig,
    timeout: Duration,
) -> Outcome {
    let response = match fetch(client, HttpMethod::Get, target, timeout, true).await {
        Ok(response) => response,
        Err(outcome) => return outcome,
    };

    if !(200..300).contains(&response.status) {
        return Outcome::down(
            ErrorClass::HttpStatus,
            format!("HTTP error status: {}", response.status),
        )
        .with_status_code(response.status);
    }

    let document: Value = match serde_json::from_str(&response.body) {
        Ok(document) => document,
        Err(e) => {
            return Outcome::down(
                ErrorClass::ValidationError,
                format!("response is not valid JSON: {e}"),
            )
            .with_status_code(response.status);
        }
    };

    match json_lookup(&document, &config.json_path) {
        Some(actual) if *actual == config.expected => Outcome::up()
            .with_status_code(response.status)
            .with_details(json!({ "actual": actual })),
        Some(actual) => Outcome::down(
            ErrorClass::ValidationError,
            format!(
                "field '{}' is {actual} but {} was expected",
                config.json_path, config.expected
            ),
        )
        .with_status_code(response.status),
        None => Outcome::down(
            ErrorClass::ValidationError,
            format!("field '{}' not present in response", config.json_path),
        )
        .with_status_code(response.status),
    }
}
