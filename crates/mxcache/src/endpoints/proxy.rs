use axum::body::Body;
use axum::extract::State;
use axum::http::{Method, Uri};
use axum::response::Response;
use mxcache_service::caching::ProxyRequest;
use mxcache_service::endpoints::match_endpoint;
use mxcache_service::upstream::UpstreamResponse;

use crate::service::ProxyService;

use super::ProxyError;

/// Forwards a request for a known endpoint to the upstream, sharing the response with all
/// identical requests.
///
/// `OPTIONS` requests are answered with the response to the equivalent `GET` request.
pub async fn proxy_request(
    State(service): State<ProxyService>,
    method: Method,
    uri: Uri,
) -> Result<Response, ProxyError> {
    if method != Method::GET && method != Method::OPTIONS {
        return Err(ProxyError::InvalidMethod(method));
    }

    // Match on the resolved upstream path, dot segments are only removed by the resolution.
    let key = service.cache_key(uri.path(), uri.query());
    let matched = match_endpoint(key.url().path())
        .ok_or_else(|| ProxyError::UnknownRequest(uri.path().to_owned()))?;

    tracing::debug!(
        endpoint = matched.endpoint.name(),
        params = ?matched.params,
        "Proxying {}",
        key
    );

    let response = service
        .cache()
        .resolve(ProxyRequest::new(key, matched.endpoint))
        .await;

    Ok(into_response(&response))
}

fn into_response(upstream: &UpstreamResponse) -> Response {
    let mut response = Response::new(Body::from(upstream.body().clone()));
    *response.status_mut() = upstream.status();
    *response.headers_mut() = upstream.headers().clone();
    response
}
