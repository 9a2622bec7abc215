use serde::Serialize;

/// A Matrix-style error body: `{"errcode": "...", "error": "..."}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MatrixError {
    pub errcode: &'static str,
    pub error: &'static str,
}

impl MatrixError {
    /// The request used a method other than `GET` or `OPTIONS`.
    pub const INVALID_METHOD: Self = Self::new("M_UNKNOWN", "Invalid method");

    /// The request path is not one of the proxied endpoints.
    pub const UNKNOWN_REQUEST: Self = Self::new("M_NOT_FOUND", "Unknown proxy request");

    /// The upstream could not be reached or its response could not be read.
    pub const PROXY_FAILED: Self = Self::new("ERR_UNKNOWN", "Error proxying request");

    pub const fn new(errcode: &'static str, error: &'static str) -> Self {
        Self { errcode, error }
    }

    /// Serializes the error into its JSON body.
    pub fn to_json(&self) -> String {
        // serializing two plain strings cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }
}
