//! Socket-level probes: tcp/port connect checks and ping reachability
//!
//! The ping probe uses a UDP echo to a high port instead of raw ICMP:
//! workers cannot assume the privileges raw sockets require. An answer *or*
//! an ICMP port-unreachable rejection both prove the host is reachable; only
//! silence is down.

use std::io::ErrorKind;
use std::time::Duration;

use tokio::net::{TcpStream, UdpSocket, lookup_host};

use crate::model::ErrorClass;

use super::Outcome;

/// Port used for the UDP reachability probe (traceroute convention: almost
/// certainly closed, so a live host answers with port-unreachable)
const PING_PORT: u16 = 33434;

fn classify_io_error(err: &std::io::Error) -> (ErrorClass, String) {
    let message = err.to_string();
    let lowered = message.to_lowercase();
    if lowered.contains("lookup") || lowered.contains("resolve") || lowered.contains("dns") {
        (ErrorClass::DnsError, message)
    } else {
        (ErrorClass::ConnectError, message)
    }
}

/// `tcp` / `port` probe: up iff the connect succeeds within the timeout
pub(crate) async fn tcp(target: &str, timeout: Duration) -> Outcome {
    if !target.contains(':') {
        return Outcome::down(
            ErrorClass::ValidationError,
            format!("target '{target}' is not host:port"),
        );
    }

    match tokio::time::timeout(timeout, TcpStream::connect(target)).await {
        Ok(Ok(_stream)) => Outcome::up(),
        Ok(Err(e)) => {
            let (class, message) = classify_io_error(&e);
            Outcome::down(class, message)
        }
        Err(_) => Outcome::down(
            ErrorClass::Timeout,
            format!("connect to {target} timed out"),
        ),
    }
}

/// `ping` probe: UDP echo reachability check
pub(crate) async fn ping(target: &str, timeout: Duration) -> Outcome {
    let probe = async {
        // resolve explicitly so DNS failures classify as dns_error
        let addr = lookup_host((target, PING_PORT))
            .await
            .map_err(|e| Outcome::down(ErrorClass::DnsError, e.to_string()))?
            .next()
            .ok_or_else(|| {
                Outcome::down(
                    ErrorClass::DnsError,
                    format!("no addresses resolved for {target}"),
                )
            })?;

        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| Outcome::down(ErrorClass::InternalError, e.to_string()))?;
        socket.connect(addr).await.map_err(|e| {
            let (class, message) = classify_io_error(&e);
            Outcome::down(class, message)
        })?;
        socket
            .send(b"guardant-ping")
            .await
            .map_err(|e| Outcome::down(ErrorClass::ConnectError, e.to_string()))?;

        let mut buf = [0u8; 64];
        match socket.recv(&mut buf).await {
            // any reply proves the host is alive
            Ok(_) => Ok(Outcome::up()),
            // port unreachable is the kernel surfacing an ICMP rejection,
            // which also proves the host is alive
            Err(e) if e.kind() == ErrorKind::ConnectionRefused => Ok(Outcome::up()),
            Err(e) => Err(Outcome::down(ErrorClass::ConnectError, e.to_string())),
        }
    };

    match tokio::time::timeout(timeout, probe).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(outcome)) => outcome,
        Err(_) => Outcome::down(ErrorClass::Timeout, format!("no reply from {target}")),
    }
}
