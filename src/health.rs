//! Backend reachability probes.

use std::time::Duration;

use hyper::Uri;
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Dial timeout for a single reachability probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Extract the dialable `host:port` authority from a node url.
///
/// This is also the failure-signal format the proxy layer reports back to
/// the engine when a backend connection is refused.
pub fn authority(url: &str) -> Option<String> {
    let uri: Uri = url.parse().ok()?;
    let host = uri.host()?;
    let port = uri.port_u16().unwrap_or(match uri.scheme_str() {
        Some("https") => 443,
        _ => 80,
    });
    Some(format!("{host}:{port}"))
}

/// TCP reachability probe with a bounded dial timeout.
pub async fn probe(url: &str) -> bool {
    let Some(addr) = authority(url) else {
        return false;
    };
    matches!(timeout(PROBE_TIMEOUT, TcpStream::connect(&addr)).await, Ok(Ok(_)))
}
