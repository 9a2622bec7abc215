//! The Matrix client API endpoints that can be served through the proxy.
//!
//! Every proxied request has to match one of the [`ENDPOINTS`]. Each endpoint carries an optional
//! validity check that decides, once the upstream response is in, whether it may be served to
//! other clients from memory.
//!
//! Long-polling endpoints such as `/sync` answer with the very cursor they were given when the
//! server-side timeout hits without any new data. Such a response only makes sense for the
//! client that is waiting on it, so these endpoints are only cached when the response cursor
//! moved past the requested one.

use std::collections::BTreeMap;
use std::fmt;

use percent_encoding::percent_decode_str;
use serde_json::Value;

/// Query parameters of a resolved upstream request.
///
/// When a parameter is given multiple times, the last value wins.
pub type QueryParams = BTreeMap<String, String>;

/// Decides whether a parsed upstream response may be served to other clients.
pub type ValidityFn = fn(&QueryParams, &Value) -> bool;

/// A recognized upstream route.
pub struct Endpoint {
    name: &'static str,
    pattern: &'static str,
    validity: Option<ValidityFn>,
}

/// All routes known to the proxy, in match order.
pub static ENDPOINTS: &[Endpoint] = &[
    Endpoint::new("versions", "/_matrix/client/versions"),
    Endpoint::new("initial_sync", "/_matrix/client/r0/rooms/:room/initialSync"),
    Endpoint::new("messages", "/_matrix/client/r0/rooms/:room/messages"),
    Endpoint::new("state", "/_matrix/client/r0/rooms/:room/state/:stateKey"),
    Endpoint::new("sync", "/_matrix/client/r0/sync").with_validity(sync_advanced),
    Endpoint::new("events", "/_matrix/client/r0/events").with_validity(events_advanced),
];

/// A path matched against an [`Endpoint`], along with its decoded named segments.
#[derive(Debug, Clone)]
pub struct EndpointMatch {
    pub endpoint: &'static Endpoint,
    pub params: BTreeMap<&'static str, String>,
}

/// Finds the first endpoint matching `path`.
pub fn match_endpoint(path: &str) -> Option<EndpointMatch> {
    ENDPOINTS.iter().find_map(|endpoint| {
        let params = endpoint.match_path(path)?;
        Some(EndpointMatch { endpoint, params })
    })
}

impl Endpoint {
    const fn new(name: &'static str, pattern: &'static str) -> Self {
        Self {
            name,
            pattern,
            validity: None,
        }
    }

    const fn with_validity(mut self, validity: ValidityFn) -> Self {
        self.validity = Some(validity);
        self
    }

    /// A short identifier used in logs and metrics.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Matches `path` against this endpoint's template.
    ///
    /// Literal segments compare ASCII case-insensitively, a single trailing slash is ignored,
    /// and every named segment has to match one non-empty path segment.
    pub fn match_path(&self, path: &str) -> Option<BTreeMap<&'static str, String>> {
        let path = match path.strip_suffix('/') {
            Some(stripped) if !stripped.is_empty() => stripped,
            _ => path,
        };

        let mut segments = path.strip_prefix('/')?.split('/');
        let mut params = BTreeMap::new();

        for expected in self.pattern.trim_start_matches('/').split('/') {
            let segment = segments.next()?;
            match expected.strip_prefix(':') {
                Some(name) => {
                    if segment.is_empty() {
                        return None;
                    }
                    let value = percent_decode_str(segment).decode_utf8_lossy();
                    params.insert(name, value.into_owned());
                }
                None if segment.eq_ignore_ascii_case(expected) => {}
                None => return None,
            }
        }

        segments.next().is_none().then_some(params)
    }

    /// Decides whether the upstream response `body` may be cached for other clients.
    ///
    /// Bodies that are not valid JSON are never cached.
    pub fn is_cacheable(&self, query: &QueryParams, body: &[u8]) -> bool {
        let data: Value = match serde_json::from_slice(body) {
            Ok(data) => data,
            Err(error) => {
                tracing::warn!(
                    error = &error as &dyn std::error::Error,
                    endpoint = self.name,
                    "Failed to parse upstream response",
                );
                return false;
            }
        };

        match self.validity {
            Some(is_valid) => is_valid(query, &data),
            None => true,
        }
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.name)
            .field("pattern", &self.pattern)
            .field("has_validity", &self.validity.is_some())
            .finish()
    }
}

/// Checks that the cursor in response `field` differs from the one requested in query `param`.
///
/// A missing parameter and a missing field compare equal.
fn cursor_advanced(query: &QueryParams, param: &str, body: &Value, field: &str) -> bool {
    // Deliberately stricter than a plain field lookup: a body that is not an object carries no
    // cursor at all and is never shared, even for a request without one.
    if !body.is_object() {
        return false;
    }
    let requested = query.get(param).map(|cursor| Value::String(cursor.clone()));
    requested.as_ref() != body.get(field)
}

fn sync_advanced(query: &QueryParams, body: &Value) -> bool {
    cursor_advanced(query, "since", body, "next_batch")
}

fn events_advanced(query: &QueryParams, body: &Value) -> bool {
    cursor_advanced(query, "from", body, "end")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(pairs: &[(&str, &str)]) -> QueryParams {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    fn endpoint(name: &str) -> &'static Endpoint {
        ENDPOINTS.iter().find(|e| e.name() == name).unwrap()
    }

    #[test]
    fn test_match_static_paths() {
        let matched = match_endpoint("/_matrix/client/versions").unwrap();
        assert_eq!(matched.endpoint.name(), "versions");
        assert!(matched.params.is_empty());

        let matched = match_endpoint("/_matrix/client/r0/sync").unwrap();
        assert_eq!(matched.endpoint.name(), "sync");

        let matched = match_endpoint("/_matrix/client/r0/events").unwrap();
        assert_eq!(matched.endpoint.name(), "events");
    }

    #[test]
    fn test_match_named_segments() {
        let matched =
            match_endpoint("/_matrix/client/r0/rooms/%21abc%3Aexample.org/state/m.room.name")
                .unwrap();
        assert_eq!(matched.endpoint.name(), "state");
        assert_eq!(matched.params["room"], "!abc:example.org");
        assert_eq!(matched.params["stateKey"], "m.room.name");

        let matched = match_endpoint("/_matrix/client/r0/rooms/!abc/messages").unwrap();
        assert_eq!(matched.endpoint.name(), "messages");
        assert_eq!(matched.params["room"], "!abc");

        let matched = match_endpoint("/_matrix/client/r0/rooms/!abc/initialSync").unwrap();
        assert_eq!(matched.endpoint.name(), "initial_sync");
    }

    #[test]
    fn test_match_is_lenient() {
        // trailing slashes and case differences in literal segments are accepted
        assert!(match_endpoint("/_matrix/client/r0/sync/").is_some());
        assert!(match_endpoint("/_MATRIX/Client/R0/Sync").is_some());
    }

    #[test]
    fn test_no_match() {
        assert!(match_endpoint("/foo/bar").is_none());
        assert!(match_endpoint("/").is_none());
        assert!(match_endpoint("").is_none());
        assert!(match_endpoint("/_matrix/client/r0/sync/extra").is_none());
        assert!(match_endpoint("/_matrix/client/r0/rooms//messages").is_none());
        assert!(match_endpoint("/_matrix/client/r0/rooms/!abc/state").is_none());
        assert!(match_endpoint("/_matrix/client/r0/sync//").is_none());
        assert!(match_endpoint("_matrix/client/versions").is_none());
    }

    #[test]
    fn test_always_cacheable() {
        let versions = endpoint("versions");
        assert!(versions.is_cacheable(&query(&[]), br#"{"versions":["r0.6.1"]}"#));
        assert!(versions.is_cacheable(&query(&[]), b"[]"));
        assert!(!versions.is_cacheable(&query(&[]), b"<html>oops</html>"));
        assert!(!versions.is_cacheable(&query(&[]), b""));
    }

    #[test]
    fn test_sync_cacheable() {
        let sync = endpoint("sync");

        // the long-poll timed out without advancing the cursor
        assert!(!sync.is_cacheable(&query(&[("since", "A")]), br#"{"next_batch":"A"}"#));
        assert!(sync.is_cacheable(&query(&[("since", "A")]), br#"{"next_batch":"B"}"#));

        // an initial sync without cursor is cacheable, an error body without cursor is not
        assert!(sync.is_cacheable(&query(&[]), br#"{"next_batch":"B"}"#));
        assert!(!sync.is_cacheable(&query(&[]), br#"{"errcode":"M_UNKNOWN"}"#));

        // a string cursor never equals a non-string one
        assert!(sync.is_cacheable(&query(&[("since", "1")]), br#"{"next_batch":1}"#));

        assert!(!sync.is_cacheable(&query(&[("since", "A")]), b"not json"));
        assert!(!sync.is_cacheable(&query(&[("since", "A")]), b"null"));
        // an array carries no cursor, even when none was requested
        assert!(!sync.is_cacheable(&query(&[]), b"[]"));
    }

    #[test]
    fn test_events_cacheable() {
        let events = endpoint("events");
        assert!(!events.is_cacheable(&query(&[("from", "s1")]), br#"{"end":"s1","chunk":[]}"#));
        assert!(events.is_cacheable(&query(&[("from", "s1")]), br#"{"end":"s2","chunk":[]}"#));
        // `since` is irrelevant for the events endpoint
        assert!(!events.is_cacheable(&query(&[("since", "s1")]), br#"{"chunk":[]}"#));
    }
}
