use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::channel::oneshot;
use futures::future::{BoxFuture, FutureExt, Shared, TryFutureExt};
use parking_lot::Mutex;
use sentry::{Hub, SentryFutureExt};

use super::CacheKey;
use crate::endpoints::{Endpoint, QueryParams};
use crate::upstream::{UpstreamClient, UpstreamResponse};
use crate::utils::futures::CallOnDrop;

// The shared receiver lets any number of requests wait on one upstream call without holding the
// index lock.
type ComputationChannel = Shared<oneshot::Receiver<Arc<UpstreamResponse>>>;

type ComputationMap = Arc<Mutex<BTreeMap<CacheKey, ComputationChannel>>>;

/// A proxied request, resolved against the upstream and matched to its endpoint.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    key: CacheKey,
    endpoint: &'static Endpoint,
    query: QueryParams,
}

impl ProxyRequest {
    pub fn new(key: CacheKey, endpoint: &'static Endpoint) -> Self {
        let query = key.query_params();
        Self {
            key,
            endpoint,
            query,
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn endpoint(&self) -> &'static Endpoint {
        self.endpoint
    }
}

/// Deduplicates concurrent upstream requests and keeps cacheable responses for a fixed TTL.
///
/// Clones share the same index.
#[derive(Clone)]
pub struct ProxyCache {
    upstream: UpstreamClient,

    /// How long cacheable responses are retained after they completed.
    ttl: Duration,

    /// In-flight and retained upstream requests.
    computations: ComputationMap,
}

impl fmt::Debug for ProxyCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self
            .computations
            .try_lock()
            .map(|computations| computations.len())
            .unwrap_or_default();
        f.debug_struct("ProxyCache")
            .field("upstream", &self.upstream)
            .field("ttl", &self.ttl)
            .field("entries", &entries)
            .finish()
    }
}

impl ProxyCache {
    pub fn new(upstream: UpstreamClient, ttl: Duration) -> Self {
        Self {
            upstream,
            ttl,
            computations: Default::default(),
        }
    }

    /// The number of in-flight and retained entries.
    pub fn len(&self) -> usize {
        self.computations.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether an in-flight or retained entry exists for `key`.
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.computations.lock().contains_key(key)
    }

    /// Resolves the response for `request`.
    ///
    /// If an entry for the request's key exists, the returned future attaches to it. Otherwise a
    /// new upstream request is spawned and registered under the key before this returns, so that
    /// all concurrent callers share it. Every caller receives the same [`UpstreamResponse`].
    ///
    /// NOTE: This function itself is *not* `async`, because it should eagerly spawn the upstream
    /// request, even if the caller goes away before awaiting the result.
    pub fn resolve(&self, request: ProxyRequest) -> BoxFuture<'static, Arc<UpstreamResponse>> {
        let endpoint = request.endpoint.name();
        metric!(counter("caches.access") += 1, "endpoint" => endpoint);

        let mut computations = self.computations.lock();
        let channel = if let Some(channel) = computations.get(&request.key) {
            metric!(counter("caches.channel.hit") += 1, "endpoint" => endpoint);
            channel.clone()
        } else {
            metric!(counter("caches.channel.miss") += 1, "endpoint" => endpoint);

            let key = request.key.clone();
            let (channel, computation) = self.create_computation(request);
            let evicted = computations.insert(key, channel.clone());
            debug_assert!(evicted.is_none());

            // The computation evicts its own entry, which needs the lock.
            drop(computations);
            tokio::spawn(computation);
            channel
        };

        channel
            .unwrap_or_else(|_cancelled| {
                tracing::error!("upstream request dropped before completing");
                Arc::new(UpstreamResponse::transport_error())
            })
            .boxed()
    }

    /// Creates the upstream request for `request` along with the eviction of its entry.
    ///
    /// The caller is responsible for inserting the returned channel into the index before
    /// spawning the returned future.
    fn create_computation(
        &self,
        request: ProxyRequest,
    ) -> (ComputationChannel, impl Future<Output = ()> + Send + 'static) {
        let (sender, receiver) = oneshot::channel();

        let remove_computation_token = {
            let computations = Arc::clone(&self.computations);
            let key = request.key.clone();
            CallOnDrop::new(move || {
                computations.lock().remove(&key);
            })
        };

        let upstream = self.upstream.clone();
        let ttl = self.ttl;

        let computation = async move {
            let ProxyRequest {
                key,
                endpoint,
                query,
            } = request;

            let response = Arc::new(upstream.fetch(key.url()).await);

            let cacheable =
                !response.is_transport_error() && endpoint.is_cacheable(&query, response.body());

            if !cacheable {
                metric!(counter("caches.rejected") += 1, "endpoint" => endpoint.name());
                tracing::debug!("Not retaining response for {}", key);

                // Evict before publishing the response. A client that sees it and retries is
                // guaranteed to start a fresh upstream request.
                drop(remove_computation_token);
                sender.send(response).ok();
                return;
            }

            metric!(counter("caches.retained") += 1, "endpoint" => endpoint.name());
            tracing::trace!("Retaining response for {} for {:?}", key, ttl);
            sender.send(response).ok();

            tokio::time::sleep(ttl).await;

            metric!(counter("caches.evicted") += 1, "endpoint" => endpoint.name());
            drop(remove_computation_token);
        }
        .bind_hub(Hub::new_from_top(Hub::current()));

        (receiver.shared(), computation)
    }
}
