//! The client talking to the upstream homeserver.

use std::time::Instant;

use bytes::Bytes;
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::{Client, StatusCode};
use url::Url;

use crate::config::Config;
use crate::types::MatrixError;
use crate::utils::http::{UpstreamTimeouts, create_client, strip_hop_by_hop_headers};

/// A fully buffered response, either received from upstream or synthesized on failure.
///
/// Responses are immutable once created and are shared between all clients waiting on the same
/// upstream request.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    transport_error: bool,
}

impl UpstreamResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body,
            transport_error: false,
        }
    }

    /// The `500` response handed out when the upstream could not be reached.
    pub fn transport_error() -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            headers,
            body: Bytes::from(MatrixError::PROXY_FAILED.to_json()),
            transport_error: true,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Whether this response was synthesized because the upstream request failed.
    pub fn is_transport_error(&self) -> bool {
        self.transport_error
    }
}

/// Performs `GET` requests against the upstream.
///
/// Cloning is cheap, all clones share one connection pool.
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    client: Client,
}

impl UpstreamClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Creates a client with the timeouts given in `config`.
    pub fn from_config(config: &Config) -> reqwest::Result<Self> {
        let client = create_client(&UpstreamTimeouts::from_config(config))?;
        Ok(Self::new(client))
    }

    /// Fetches `url` and buffers the full response.
    ///
    /// This never fails: transport errors are logged and turned into
    /// [`UpstreamResponse::transport_error`].
    pub async fn fetch(&self, url: &Url) -> UpstreamResponse {
        let start = Instant::now();
        let result = self.try_fetch(url).await;
        metric!(timer("upstream.duration") = start.elapsed());

        match result {
            Ok(response) => {
                metric!(
                    counter("upstream.status_code") += 1,
                    "status" => response.status().as_str(),
                );
                metric!(histogram("upstream.body_size") = response.body().len() as u64);
                response
            }
            Err(error) => {
                metric!(counter("upstream.transport_error") += 1);
                // the full URL carries the access token, so only the path is logged
                tracing::error!(
                    error = &error as &dyn std::error::Error,
                    path = url.path(),
                    "Error proxying request",
                );
                UpstreamResponse::transport_error()
            }
        }
    }

    async fn try_fetch(&self, url: &Url) -> reqwest::Result<UpstreamResponse> {
        tracing::trace!("Fetching `{}` from upstream", url.path());

        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();
        let mut headers = response.headers().clone();
        let body = response.bytes().await?;

        strip_hop_by_hop_headers(&mut headers);
        Ok(UpstreamResponse::new(status, headers, body))
    }
}

#[cfg(test)]
mod tests {
    use mxcache_test::FakeHomeserver;

    use super::*;

    #[tokio::test]
    async fn test_fetch() {
        mxcache_test::setup();
        let server = FakeHomeserver::new();
        let client = UpstreamClient::new(Client::new());

        let response = client.fetch(&server.url("_matrix/client/versions")).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert!(!response.is_transport_error());
        assert_eq!(
            response.headers().get("x-served-by").unwrap(),
            "fake-homeserver"
        );
        assert!(response.headers().get(header::TRANSFER_ENCODING).is_none());

        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["versions"][0], "r0.6.1");
        assert_eq!(server.accesses(), 1);
    }

    #[tokio::test]
    async fn test_fetch_passes_status_through() {
        mxcache_test::setup();
        let server = FakeHomeserver::new();
        let client = UpstreamClient::new(Client::new());

        let response = client
            .fetch(&server.url("_matrix/client/versions?status=404"))
            .await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(!response.is_transport_error());
    }

    #[tokio::test]
    async fn test_fetch_malformed_body() {
        mxcache_test::setup();
        let server = FakeHomeserver::new();
        let client = UpstreamClient::new(Client::new());

        let response = client
            .fetch(&server.url("_matrix/client/r0/sync?garbage=1"))
            .await;

        // an unparseable body is still a regular upstream response
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!response.is_transport_error());
        assert_eq!(&response.body()[..], mxcache_test::GARBAGE_BODY.as_bytes());
    }

    #[tokio::test]
    async fn test_fetch_connection_refused() {
        mxcache_test::setup();
        let client = UpstreamClient::new(Client::new());

        let response = client
            .fetch(&mxcache_test::unreachable_url("_matrix/client/versions"))
            .await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(response.is_transport_error());
        insta::assert_snapshot!(
            std::str::from_utf8(response.body()).unwrap(),
            @r#"{"errcode":"ERR_UNKNOWN","error":"Error proxying request"}"#
        );
    }

    #[tokio::test]
    async fn test_fetch_timeout() {
        mxcache_test::setup();
        let server = FakeHomeserver::new();
        let timeouts = UpstreamTimeouts {
            connect: None,
            request: Some(std::time::Duration::from_millis(100)),
        };
        let client = UpstreamClient::new(create_client(&timeouts).unwrap());

        let response = client
            .fetch(&server.url("_matrix/client/r0/sync?delay=2s"))
            .await;

        assert!(response.is_transport_error());
    }
}
