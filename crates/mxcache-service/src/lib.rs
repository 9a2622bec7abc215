//! The caching core of mxcache.
//!
//! This crate holds everything needed to answer proxied Matrix client API requests: the static
//! [`endpoints`] table with its per-route cacheability rules, the [`upstream`] client talking to
//! the homeserver, and the request-coalescing [`caching`] layer tying both together.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod endpoints;
pub mod logging;
pub mod types;
pub mod upstream;
pub mod utils;
