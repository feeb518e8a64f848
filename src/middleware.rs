use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tracing::info;

use crate::proxy::GatewayState;

/// Sentinel secret that disables the access gate.
pub const DISABLED_SECRET: &str = "none";

/// Registered standard claims carried by gateway access tokens.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    #[serde(default)]
    pub sub: String,
    pub exp: u64,
    #[serde(default)]
    pub iat: u64,
}

/// Bearer-token access gate.
///
/// With the secret configured, any missing, mis-signed or expired token is
/// rejected with 401 before the request reaches the proxy.
pub async fn jwt_auth(
    State(state): State<GatewayState>,
    request: Request,
    next: Next,
) -> Response {
    if state.jwt_secret == DISABLED_SECRET {
        return next.run(request).await;
    }

    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));

    if let Some(token) = token {
        let key = DecodingKey::from_secret(state.jwt_secret.as_bytes());
        if decode::<Claims>(token, &key, &Validation::new(Algorithm::HS256)).is_ok() {
            return next.run(request).await;
        }
    }

    unauthorized()
}

fn unauthorized() -> Response {
    let mut response = (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    response.headers_mut().insert(
        header::WWW_AUTHENTICATE,
        HeaderValue::from_static("Bearer realm=Restricted"),
    );
    response
}

/// Request/response logging.
pub async fn logging_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let client = client_key(&request);

    info!(
        target: "bulu::access",
        method = %method,
        uri = %uri,
        client = %client,
        "incoming request"
    );

    let response = next.run(request).await;

    info!(
        target: "bulu::access",
        method = %method,
        uri = %uri,
        client = %client,
        status = %response.status(),
        "request completed"
    );

    response
}

/// The affinity key for a request: the client address as seen by the
/// gateway, preferring forwarded headers over the socket peer.
pub fn client_key(request: &Request) -> String {
    if let Some(forwarded) = request.headers().get("x-forwarded-for") {
        if let Ok(forwarded) = forwarded.to_str() {
            if let Some(first) = forwarded.split(',').next() {
                return first.trim().to_string();
            }
        }
    }

    if let Some(real_ip) = request.headers().get("x-real-ip") {
        if let Ok(ip) = real_ip.to_str() {
            return ip.to_string();
        }
    }

    if let Some(ConnectInfo(addr)) = request.extensions().get::<ConnectInfo<SocketAddr>>() {
        addr.ip().to_string()
    } else {
        "unknown".to_string()
    }
}
