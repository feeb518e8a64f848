use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// JSON body for outcomes the gateway synthesizes itself.
#[derive(Debug, Serialize)]
pub struct GatewayReply {
    pub ok: bool,
    #[serde(rename = "errMsg")]
    pub err_msg: String,
}

impl GatewayReply {
    fn new(err_msg: impl Into<String>) -> Self {
        Self {
            ok: false,
            err_msg: err_msg.into(),
        }
    }

    /// Degraded-domain contract: deliberately HTTP 200 so upstream health
    /// checks do not trip on infrastructure failure.
    pub fn no_service_alive() -> Response {
        (StatusCode::OK, Json(Self::new("Bulu no service alive"))).into_response()
    }

    pub fn domain_not_matched() -> Response {
        (StatusCode::BAD_GATEWAY, Json(Self::new("domain not matched"))).into_response()
    }

    pub fn rate_limited() -> Response {
        (
            StatusCode::TOO_MANY_REQUESTS,
            Json(Self::new("rate limit exceeded")),
        )
            .into_response()
    }

    pub fn bad_gateway(err_msg: impl Into<String>) -> Response {
        (StatusCode::BAD_GATEWAY, Json(Self::new(err_msg))).into_response()
    }
}
