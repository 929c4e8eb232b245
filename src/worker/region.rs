//! Region detection via IP geolocation
//!
//! Tried only when no region override is configured. Three independent
//! providers are consulted in order; the first usable answer wins. Providers
//! disagree on field names, so the extraction looks for a continent code
//! first and falls back to the timezone prefix.

use std::time::Duration;

use reqwest::Client;
use serde_json::Value;
use tracing::{debug, trace, warn};

const PROVIDERS: [&str; 3] = [
    "https://ipapi.co/json/",
    "https://ipwho.is/",
    "https://ipinfo.io/json",
];

const PROVIDER_TIMEOUT: Duration = Duration::from_secs(3);

/// Fallback when detection fails entirely
pub const DEFAULT_REGION: &str = "us-east-1";

/// Map a continent code onto the default region of that continent.
fn region_for_continent(code: &str) -> Option<&'static str> {
    match code {
        "EU" => Some("eu-west-1"),
        "NA" => Some("us-east-1"),
        "SA" => Some("sa-east-1"),
        "AS" => Some("ap-southeast-1"),
        "OC" => Some("ap-southeast-2"),
        "AF" => Some("af-south-1"),
        _ => None,
    }
}

fn continent_from_timezone(timezone: &str) -> Option<&'static str> {
    match timezone.split('/').next()? {
        "Europe" => Some("EU"),
        "America" => Some("NA"),
        "Asia" => Some("AS"),
        "Africa" => Some("AF"),
        "Australia" | "Pacific" => Some("OC"),
        _ => None,
    }
}

/// Pull a region out of one provider's response document.
fn extract_region(document: &Value) -> Option<&'static str> {
    if let Some(code) = document.get("continent_code").and_then(Value::as_str)
        && let Some(region) = region_for_continent(code)
    {
        return Some(region);
    }
    if let Some(timezone) = document.get("timezone").and_then(Value::as_str)
        && let Some(code) = continent_from_timezone(timezone)
    {
        return region_for_continent(code);
    }
    None
}

/// Detect the region this worker runs in. `None` when every provider fails.
pub async fn detect_region(client: &Client) -> Option<String> {
    for provider in PROVIDERS {
        trace!("querying geolocation provider {provider}");
        let response = match client
            .get(provider)
            .timeout(PROVIDER_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!("geolocation provider {provider} unreachable: {e}");
                continue;
            }
        };
        let document: Value = match response.json().await {
            Ok(document) => document,
            Err(e) => {
                warn!("geolocation provider {provider} returned garbage: {e}");
                continue;
            }
        };
        if let Some(region) = extract_region(&document) {
            debug!("detected region {region} via {provider}");
            return Some(region.to_string());
        }
    }
    None
}
