//! # Request coalescing and caching
//!
//! The proxy keeps a single in-memory index from [`CacheKey`] to the shared result of one
//! upstream request. Every entry goes through the same lifecycle:
//!
//! - On the first request for a key, an entry is inserted into the index *before* the upstream
//!   request is spawned. Every request for the same key arriving from then on attaches to that
//!   entry instead of issuing its own upstream call.
//! - Once the upstream response is in, the endpoint decides whether it may be served to other
//!   clients (see [`Endpoint::is_cacheable`](crate::endpoints::Endpoint::is_cacheable)).
//! - Rejected responses are evicted from the index right away, before they are handed to the
//!   waiting clients. The next request for the key starts a fresh upstream call.
//! - Accepted responses stay in the index for the configured TTL and are evicted afterwards,
//!   regardless of how often they were accessed.
//!
//! Responses synthesized for transport errors are never retained.
//!
//! An entry is only ever evicted after its response settled. There is no timeout on the upstream
//! call by default, so a hung upstream keeps its entry, and everyone attached to it, waiting.
//! [`Config::upstream_timeout`](crate::config::Config::upstream_timeout) bounds this.
//!
//! ### Metrics
//!
//! All metrics are tagged with the `endpoint` name:
//!
//! - `caches.access`: All accesses.
//! - `caches.channel.hit`: Accesses attached to an existing in-flight or retained entry.
//! - `caches.channel.miss`: Accesses that started a new upstream request.
//! - `caches.retained`: Responses kept in memory for the TTL.
//! - `caches.rejected`: Responses evicted right after they were received.
//! - `caches.evicted`: Retained responses evicted after the TTL.

mod cache_key;
mod memory;


pub use cache_key::{ACCESS_TOKEN_PARAM, CacheKey};
pub use memory::{ProxyCache, ProxyRequest};
