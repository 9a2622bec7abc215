use std::time::Duration;

use reqwest::header::{self, HeaderMap, HeaderName};

use crate::config::Config;

/// The user agent sent with every upstream request.
pub const USER_AGENT: &str = concat!("mxcache/", env!("CARGO_PKG_VERSION"));

/// Headers that only apply to a single transport-level connection.
///
/// The proxy buffers upstream bodies completely and re-frames them for every client, so these
/// must not be forwarded.
const HOP_BY_HOP_HEADERS: [HeaderName; 6] = [
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Various timeouts for the upstream client.
#[derive(Copy, Clone, Debug, Default)]
pub struct UpstreamTimeouts {
    /// The timeout for establishing a connection.
    pub connect: Option<Duration>,
    /// Global timeout for one request, including the body.
    pub request: Option<Duration>,
}

impl UpstreamTimeouts {
    pub fn from_config(config: &Config) -> Self {
        Self {
            connect: config.connect_timeout,
            request: config.upstream_timeout,
        }
    }
}

/// Creates a [`reqwest::Client`] with the provided timeouts.
///
/// Redirects are not followed, they are passed through to the client verbatim.
pub fn create_client(timeouts: &UpstreamTimeouts) -> reqwest::Result<reqwest::Client> {
    let mut builder = reqwest::ClientBuilder::new()
        .user_agent(USER_AGENT)
        .pool_idle_timeout(Duration::from_secs(30))
        .redirect(reqwest::redirect::Policy::none());

    if let Some(connect) = timeouts.connect {
        builder = builder.connect_timeout(connect);
    }
    if let Some(request) = timeouts.request {
        builder = builder.timeout(request);
    }

    builder.build()
}

/// Removes connection-specific headers, including the ones named in a `Connection` header.
pub fn strip_hop_by_hop_headers(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in HOP_BY_HOP_HEADERS.iter().chain(named.iter()) {
        headers.remove(name);
    }
    headers.remove("keep-alive");
    headers.remove("proxy-connection");
}
