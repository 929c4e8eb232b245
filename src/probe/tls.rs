//! TLS certificate inspection for HTTPS probe targets
//!
//! A short handshake against the target host fetches the leaf certificate so
//! web results can report how many days remain before it expires. The
//! inspection runs concurrently with the HTTP request under the same budget;
//! any failure here leaves the field absent and never affects the probe
//! outcome.

use std::sync::Arc;
use std::time::Duration;

use rustls::RootCertStore;
use rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tracing::trace;
use x509_parser::prelude::*;

/// Days until the target's leaf certificate expires (negative once it has).
/// `None` for non-HTTPS targets or when the handshake does not complete
/// within the budget.
pub(crate) async fn expiry_days(target: &str, timeout: Duration) -> Option<i64> {
    let url = reqwest::Url::parse(target).ok()?;
    if url.scheme() != "https" {
        return None;
    }
    let host = url.host_str()?.to_string();
    let port = url.port().unwrap_or(443);

    match tokio::time::timeout(timeout, peer_expiry(host, port)).await {
        Ok(days) => days,
        Err(_) => {
            trace!("certificate inspection timed out");
            None
        }
    }
}

async fn peer_expiry(host: String, port: u16) -> Option<i64> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    let server_name = ServerName::try_from(host.clone()).ok()?;
    let tcp = tokio::net::TcpStream::connect((host.as_str(), port))
        .await
        .ok()?;
    let tls = TlsConnector::from(Arc::new(config))
        .connect(server_name, tcp)
        .await
        .ok()?;

    let (_, session) = tls.get_ref();
    let certificate = session.peer_certificates()?.first()?;
    let (_, parsed) = X509Certificate::from_der(certificate.as_ref()).ok()?;
    let remaining = parsed.validity().not_after.timestamp() - chrono::Utc::now().timestamp();
    Some(remaining.div_euclid(86_400))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_non_https_targets_are_skipped() {
        assert_eq!(
            expiry_days("http://example.com/health", Duration::from_secs(1)).await,
            None
        );
        assert_eq!(expiry_days("not a url", Duration::from_secs(1)).await, None);
        assert_eq!(
            expiry_days("127.0.0.1:8080", Duration::from_secs(1)).await,
            None
        );
    }

    #[tokio::test]
    async fn test_unreachable_host_yields_none_within_budget() {
        let start = std::time::Instant::now();
        let days = expiry_days("https://127.0.0.1:9/", Duration::from_millis(500)).await;
        assert_eq!(days, None);
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
