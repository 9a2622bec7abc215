//! mxcache.
//!
//! mxcache is a caching reverse proxy for the client API of a Matrix homeserver. Identical
//! requests arriving at the same time share a single upstream request, and responses are kept in
//! memory for a short time so that many clients polling the same rooms cause little load on the
//! homeserver.

#![warn(
    missing_docs,
    missing_debug_implementations,
    unused_crate_dependencies,
    clippy::all
)]

mod cli;
mod endpoints;
mod logging;
mod server;
mod service;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
