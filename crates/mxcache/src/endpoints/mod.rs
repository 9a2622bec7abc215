use axum::Router;
use axum::http::Method;
use axum::routing::get;
use mxcache_service::metric;
use sentry::integrations::tower::{NewSentryLayer, SentryHttpLayer};
use tower::ServiceBuilder;

use crate::service::ProxyService;

mod error;
mod metrics;
mod proxy;

pub use error::ProxyError;
use metrics::MetricsLayer;
use proxy::proxy_request as proxy;

pub async fn healthcheck() -> &'static str {
    metric!(counter("healthcheck") += 1);
    "ok"
}

async fn invalid_method(method: Method) -> ProxyError {
    ProxyError::InvalidMethod(method)
}

/// Creates the application serving all proxied requests.
///
/// Every path apart from the healthcheck is handled by the proxy, which rejects paths that do
/// not belong to a known endpoint. Methods are restricted to `GET` and `OPTIONS` everywhere.
pub fn create_app(service: ProxyService) -> Router {
    // The layers here go "top to bottom" according to the reading order here.
    let layer = ServiceBuilder::new()
        .layer(NewSentryLayer::new_from_top())
        .layer(SentryHttpLayer::new().enable_transaction())
        .layer(MetricsLayer);
    Router::new()
        .fallback(proxy)
        .with_state(service)
        .layer(layer)
        // the healthcheck is last, as it will bypass all the middlewares
        .route(
            "/healthcheck",
            get(healthcheck)
                .options(healthcheck)
                .fallback(invalid_method),
        )
}
