use axum::Json;
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use mxcache_service::metric;
use mxcache_service::types::MatrixError;
use thiserror::Error;

/// A request the proxy refuses to forward.
///
/// These are answered right away and never reach the cache or the upstream.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("method {0} is not allowed")]
    InvalidMethod(Method),

    #[error("no endpoint matches {0}")]
    UnknownRequest(String),
}

impl ProxyError {
    fn status(&self) -> StatusCode {
        match self {
            Self::InvalidMethod(_) => StatusCode::METHOD_NOT_ALLOWED,
            Self::UnknownRequest(_) => StatusCode::NOT_FOUND,
        }
    }

    fn body(&self) -> MatrixError {
        match self {
            Self::InvalidMethod(_) => MatrixError::INVALID_METHOD,
            Self::UnknownRequest(_) => MatrixError::UNKNOWN_REQUEST,
        }
    }

    fn reason(&self) -> &'static str {
        match self {
            Self::InvalidMethod(_) => "method",
            Self::UnknownRequest(_) => "path",
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        metric!(counter("proxy.rejected") += 1, "reason" => self.reason());
        tracing::debug!("Rejecting request: {}", self);

        (self.status(), Json(self.body())).into_response()
    }
}
