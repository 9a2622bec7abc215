use std::fmt;

use url::Url;

use crate::endpoints::QueryParams;

/// The query parameter carrying the upstream credential.
pub const ACCESS_TOKEN_PARAM: &str = "access_token";

/// Identifies one upstream request: the fully resolved upstream URL, credential included.
///
/// Requests resolving to the same URL share one upstream call and one cache entry. The
/// [`Debug`] and [`Display`](fmt::Display) output redacts the credential.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CacheKey(Url);

impl CacheKey {
    /// Resolves a proxied request against the upstream `base` URL.
    ///
    /// The request `path` replaces the path of `base`, the original `query` is kept and the
    /// `access_token` parameter is set, replacing any value supplied by the client. Dot segments
    /// in `path` are resolved, so endpoints must be matched against the resolved path.
    pub fn resolve(base: &Url, path: &str, query: Option<&str>, access_token: &str) -> Self {
        let mut url = base.clone();
        url.set_path(path);
        url.set_query(query);
        url.set_fragment(None);
        set_query_param(&mut url, ACCESS_TOKEN_PARAM, access_token);
        Self(url)
    }

    /// The upstream URL to fetch.
    pub fn url(&self) -> &Url {
        &self.0
    }

    /// The decoded query parameters, the last occurrence of a name winning.
    pub fn query_params(&self) -> QueryParams {
        self.0.query_pairs().into_owned().collect()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut redacted = self.0.clone();
        set_query_param(&mut redacted, ACCESS_TOKEN_PARAM, "[redacted]");
        f.write_str(redacted.as_str())
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CacheKey")
            .field(&format_args!("{self}"))
            .finish()
    }
}

/// Sets the query parameter `name` to `value`.
///
/// The first occurrence of `name` is replaced in place and any further occurrences are
/// removed. If `name` is not present yet, it is appended.
fn set_query_param(url: &mut Url, name: &str, value: &str) {
    let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();

    let mut serializer = url.query_pairs_mut();
    serializer.clear();

    let mut replaced = false;
    for (key, current) in &pairs {
        if key != name {
            serializer.append_pair(key, current);
        } else if !replaced {
            serializer.append_pair(name, value);
            replaced = true;
        }
    }
    if !replaced {
        serializer.append_pair(name, value);
    }
}
