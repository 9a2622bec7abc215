//! The state shared by all request handlers.

use std::sync::Arc;

use anyhow::{Context, Result};
use mxcache_service::caching::{CacheKey, ProxyCache};
use mxcache_service::config::{Config, ConfigError};
use mxcache_service::upstream::UpstreamClient;
use url::Url;

/// Resolves proxied requests against the configured homeserver.
///
/// Cloning is cheap, all clones share one cache.
#[derive(Clone, Debug)]
pub struct ProxyService {
    cache: ProxyCache,
    upstream: Arc<Url>,
    access_token: Arc<str>,
}

impl ProxyService {
    /// Creates the service from a validated config.
    pub fn create(config: &Config) -> Result<Self> {
        let upstream = config.upstream.clone().ok_or(ConfigError::MissingUpstream)?;
        let access_token = config
            .access_token
            .as_deref()
            .ok_or(ConfigError::MissingAccessToken)?;

        let client = UpstreamClient::from_config(config).context("failed to create HTTP client")?;

        Ok(Self::new(
            ProxyCache::new(client, config.cache_ttl),
            upstream,
            access_token,
        ))
    }

    pub fn new(cache: ProxyCache, upstream: Url, access_token: &str) -> Self {
        Self {
            cache,
            upstream: Arc::new(upstream),
            access_token: access_token.into(),
        }
    }

    pub fn cache(&self) -> &ProxyCache {
        &self.cache
    }

    /// Computes the upstream request for a proxied `path` and `query`.
    pub fn cache_key(&self, path: &str, query: Option<&str>) -> CacheKey {
        CacheKey::resolve(&self.upstream, path, query, &self.access_token)
    }
}
