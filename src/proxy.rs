//! The reverse-proxy surface: admission gate, routing, forwarding, and the
//! CONNECT tunnel.

use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::uri::Uri;
use axum::http::{request, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use http_body_util::BodyExt;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::TcpStream;
use tracing::{debug, error, warn};

use crate::engine::Engine;
use crate::error::Error;
use crate::health;
use crate::middleware;
use crate::response::GatewayReply;

pub type HttpClient = Client<HttpConnector, Body>;

/// Shared state behind every acceptor task.
#[derive(Clone)]
pub struct GatewayState {
    pub engine: Arc<Engine>,
    pub client: HttpClient,
    pub jwt_secret: String,
}

impl GatewayState {
    pub fn new(engine: Arc<Engine>, jwt_secret: String) -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        Self {
            engine,
            client,
            jwt_secret,
        }
    }
}

/// Handle one inbound request end to end.
///
/// Gate check and routing decision happen here; on a backend connection
/// refusal the engine rebuilds the domain ring and the request is re-routed
/// once before the degraded-domain response is synthesized.
pub async fn forward(State(state): State<GatewayState>, request: Request) -> Response {
    let domain = host_domain(&request);
    let key = middleware::client_key(&request);

    match state.engine.admit(&domain) {
        Ok(true) => {}
        Ok(false) => return GatewayReply::rate_limited(),
        Err(Error::DomainNotMatched) => return GatewayReply::domain_not_matched(),
        Err(_) => return GatewayReply::no_service_alive(),
    }

    let mut target = match state.engine.route(&domain, key.as_bytes()) {
        Ok(target) => target,
        Err(Error::DomainNotMatched) => return GatewayReply::domain_not_matched(),
        Err(_) => return GatewayReply::no_service_alive(),
    };

    if request.method() == Method::CONNECT {
        return tunnel(request, target).await;
    }

    // Buffer the body so the request can be replayed after a failover.
    let (parts, body) = request.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            debug!(error = %err, "client body read failed");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    for _attempt in 0..2 {
        let upstream = match upstream_request(&parts, &target, body.clone()) {
            Ok(upstream) => upstream,
            Err(err) => return GatewayReply::bad_gateway(err.to_string()),
        };

        match state.client.request(upstream).await {
            Ok(response) => return response.map(Body::new).into_response(),
            Err(err) if err.is_connect() => {
                warn!(target = %target, error = %err, "backend connect failed");
                if let Some(addr) = health::authority(&target) {
                    state.engine.report_failure(&domain, &addr).await;
                }
                match state.engine.route(&domain, key.as_bytes()) {
                    Ok(next) => target = next,
                    Err(_) => return GatewayReply::no_service_alive(),
                }
            }
            Err(err) => {
                error!(target = %target, error = %err, "upstream request failed");
                return GatewayReply::bad_gateway("upstream request failed");
            }
        }
    }

    GatewayReply::no_service_alive()
}

/// Rebuild the client request against the routed backend, preserving
/// method, headers and body.
fn upstream_request(
    parts: &request::Parts,
    target: &str,
    body: Bytes,
) -> crate::error::Result<Request> {
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let uri: Uri = format!("{}{}", target.trim_end_matches('/'), path)
        .parse()
        .map_err(|_| Error::Config(format!("invalid upstream url: {target}")))?;

    let mut request = Request::builder()
        .method(parts.method.clone())
        .uri(uri)
        .body(Body::from(body))
        .map_err(|err| Error::Config(err.to_string()))?;
    *request.headers_mut() = parts.headers.clone();
    Ok(request)
}

/// CONNECT is served as a raw bidirectional byte-copy between the upgraded
/// client connection and the routed backend (forward-proxy mode). Each copy
/// direction closes both ends when it completes.
async fn tunnel(request: Request, target: String) -> Response {
    let Some(addr) = health::authority(&target) else {
        return GatewayReply::no_service_alive();
    };

    tokio::spawn(async move {
        let upgraded = match hyper::upgrade::on(request).await {
            Ok(upgraded) => upgraded,
            Err(err) => {
                warn!(error = %err, "connect upgrade failed");
                return;
            }
        };
        match TcpStream::connect(&addr).await {
            Ok(mut backend) => {
                let mut client = TokioIo::new(upgraded);
                match tokio::io::copy_bidirectional(&mut client, &mut backend).await {
                    Ok((up, down)) => debug!(up, down, backend = %addr, "tunnel closed"),
                    Err(err) => debug!(error = %err, backend = %addr, "tunnel aborted"),
                }
            }
            Err(err) => warn!(error = %err, backend = %addr, "tunnel connect failed"),
        }
    });

    // Empty 200 lets hyper complete the upgrade handshake.
    StatusCode::OK.into_response()
}

/// The routing domain for a request: its Host header without the port.
fn host_domain(request: &Request) -> String {
    let host = request
        .headers()
        .get(axum::http::header::HOST)
        .and_then(|value| value.to_str().ok())
        .or_else(|| request.uri().host())
        .unwrap_or_default();
    strip_port(host).to_string()
}

fn strip_port(host: &str) -> &str {
    // Bracketed IPv6 hosts keep their brackets, ports come after.
    if let Some(end) = host.rfind(']') {
        return &host[..=end];
    }
    host.split(':').next().unwrap_or(host)
}
