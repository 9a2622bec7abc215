//! Helpers for testing the proxy server and service.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using a [`Server`] or [`FakeHomeserver`], make sure that the server is held until all
//!    requests to it have been made. The server stops serving when dropped. To avoid this, assign
//!    it to a variable: `let server = FakeHomeserver::new();`.
//!
//! The [`FakeHomeserver`] understands a few query parameters on every route, which allow tests
//! to steer its responses:
//!
//!  - `delay=<duration>`: Waits for the given duration (in `humantime` format) before responding.
//!  - `status=<code>`: Responds with the given status code instead of `200`.
//!  - `garbage`: Responds with [`GARBAGE_BODY`] instead of JSON.

use std::collections::BTreeMap;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::{self, Query, State};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router, middleware};
use reqwest::{StatusCode, Url};
use serde_json::{Value, json};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

/// The body the [`FakeHomeserver`] responds with when asked for `garbage`.
pub const GARBAGE_BODY: &str = "<html>oops</html>";

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `mxcache` crates and mutes all
///    other logs (such as hyper or reqwest).
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("mxcache=trace,mxcache_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Returns a URL on localhost where nothing is listening.
pub fn unreachable_url(path: &str) -> Url {
    let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let path = path.trim_start_matches('/');
    format!("http://127.0.0.1:{port}/{path}").parse().unwrap()
}

/// A test server that binds to a random port and serves a web app.
///
/// This server requires a `tokio` runtime and is supposed to be run in a `tokio::test`. It
/// automatically stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    pub handle: tokio::task::JoinHandle<()>,
    pub socket: SocketAddr,
}

impl Server {
    /// Creates a new test server serving the given router.
    pub fn with_router(router: Router) -> Self {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();
        let listener = tokio::net::TcpListener::from_std(listener).unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self { handle, socket }
    }

    /// Returns the socket address that this server listens on.
    pub fn addr(&self) -> SocketAddr {
        self.socket
    }

    /// Returns the port that this server listens on.
    pub fn port(&self) -> u16 {
        self.addr().port()
    }

    /// Returns a full URL pointing to the given path.
    ///
    /// This URL uses `127.0.0.1` as hostname.
    pub fn url(&self, path: &str) -> Url {
        let path = path.trim_start_matches('/');
        format!("http://127.0.0.1:{}/{}", self.port(), path)
            .parse()
            .unwrap()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

type Params = BTreeMap<String, String>;

#[derive(Clone, Debug, Default)]
struct HomeserverState {
    requests: Arc<AtomicUsize>,
}

/// A minimal Matrix homeserver that counts the requests it receives.
///
/// Every JSON response carries a `request` field with the sequence number of the request that
/// produced it, as well as the received query parameters under `query`. Two clients seeing the
/// same `request` number were served by the same upstream call.
pub struct FakeHomeserver {
    server: Server,
    hits: Arc<Mutex<BTreeMap<String, usize>>>,
}

impl FakeHomeserver {
    pub fn new() -> Self {
        let hits = Arc::new(Mutex::new(BTreeMap::new()));

        let hitcounter = {
            let hits = hits.clone();
            move |extract::OriginalUri(uri), req: extract::Request, next: middleware::Next| {
                let hits = hits.clone();
                async move {
                    {
                        let mut hits = hits.lock().unwrap();
                        let hits = hits.entry(uri.to_string()).or_default();
                        *hits += 1;
                    }

                    next.run(req).await
                }
            }
        };

        let router = Router::new()
            .route(
                "/_matrix/client/versions",
                get(
                    |State(state): State<HomeserverState>, Query(params): Query<Params>| async move {
                        respond(&state, &params, json!({ "versions": ["r0.6.1"] })).await
                    },
                ),
            )
            .route(
                "/_matrix/client/r0/sync",
                get(
                    |State(state): State<HomeserverState>, Query(params): Query<Params>| async move {
                        // without an explicit `next_batch`, the long-poll "times out" and echoes
                        // the given cursor
                        let next_batch = params
                            .get("next_batch")
                            .or_else(|| params.get("since"))
                            .map_or("s0", String::as_str);
                        let body = json!({ "next_batch": next_batch, "rooms": {} });
                        respond(&state, &params, body).await
                    },
                ),
            )
            .route(
                "/_matrix/client/r0/events",
                get(
                    |State(state): State<HomeserverState>, Query(params): Query<Params>| async move {
                        let end = params
                            .get("end")
                            .or_else(|| params.get("from"))
                            .map_or("e0", String::as_str);
                        let body = json!({ "end": end, "chunk": [] });
                        respond(&state, &params, body).await
                    },
                ),
            )
            .route(
                "/_matrix/client/r0/rooms/:room/initialSync",
                get(
                    |State(state): State<HomeserverState>,
                     extract::Path(room): extract::Path<String>,
                     Query(params): Query<Params>| async move {
                        respond(&state, &params, json!({ "room_id": room })).await
                    },
                ),
            )
            .route(
                "/_matrix/client/r0/rooms/:room/messages",
                get(
                    |State(state): State<HomeserverState>,
                     extract::Path(room): extract::Path<String>,
                     Query(params): Query<Params>| async move {
                        respond(&state, &params, json!({ "room_id": room, "chunk": [] })).await
                    },
                ),
            )
            .route(
                "/_matrix/client/r0/rooms/:room/state/:state_key",
                get(
                    |State(state): State<HomeserverState>,
                     extract::Path((room, state_key)): extract::Path<(String, String)>,
                     Query(params): Query<Params>| async move {
                        let body = json!({ "room_id": room, "state_key": state_key });
                        respond(&state, &params, body).await
                    },
                ),
            )
            .layer(middleware::from_fn(hitcounter))
            .with_state(HomeserverState::default());

        let server = Server::with_router(router);

        Self { server, hits }
    }

    /// Returns the number of requests received since the last call, and resets the counter.
    pub fn accesses(&self) -> usize {
        let map = std::mem::take(&mut *self.hits.lock().unwrap());
        map.into_values().sum()
    }

    /// Returns the requests received per URI since the last call, and resets the counters.
    pub fn all_hits(&self) -> Vec<(String, usize)> {
        let map = std::mem::take(&mut *self.hits.lock().unwrap());
        map.into_iter().collect()
    }

    /// Returns a full URL pointing to the given path.
    pub fn url(&self, path: &str) -> Url {
        self.server.url(path)
    }

    /// The URL to configure as upstream.
    pub fn base_url(&self) -> Url {
        self.server.url("")
    }
}

impl Default for FakeHomeserver {
    fn default() -> Self {
        Self::new()
    }
}

async fn respond(state: &HomeserverState, params: &Params, mut body: Value) -> Response {
    let request = state.requests.fetch_add(1, Ordering::SeqCst) + 1;

    if let Some(delay) = params.get("delay") {
        let duration = humantime::parse_duration(delay).unwrap();
        tokio::time::sleep(duration).await;
    }

    let status = params
        .get("status")
        .and_then(|status| status.parse().ok())
        .and_then(|status| StatusCode::from_u16(status).ok())
        .unwrap_or(StatusCode::OK);

    if params.contains_key("garbage") {
        let headers = [
            ("x-served-by", "fake-homeserver"),
            ("content-type", "text/html"),
        ];
        return (status, headers, GARBAGE_BODY).into_response();
    }

    body["request"] = request.into();
    body["query"] = json!(params);

    (status, [("x-served-by", "fake-homeserver")], Json(body)).into_response()
}
