//! The slice of HTTP the request pipeline needs: status codes and responses.
//!
//! Wire parsing and serialization belong to the hosting server; handlers in
//! this crate only build a [`Response`] and hand it back to the pipeline.

use std::fmt;

use tracing::error;

/// An HTTP response status code.
///
/// # Examples
///
/// ```
/// use rttp_db::http::StatusCode;
///
/// let status = StatusCode::ServiceUnavailable;
/// assert_eq!(status.as_u16(), 503);
/// assert!(!status.is_success());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum StatusCode {
    Ok = 200,
    Created = 201,
    NoContent = 204,
    BadRequest = 400,
    NotFound = 404,
    Conflict = 409,
    UnprocessableEntity = 422,
    InternalServerError = 500,
    ServiceUnavailable = 503,
    GatewayTimeout = 504,
}

impl StatusCode {
    /// Returns the numeric status code as a `u16`.
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Returns `true` for 2xx codes.
    pub fn is_success(self) -> bool {
        (200..300).contains(&self.as_u16())
    }

    /// Returns the canonical reason phrase for this status code.
    pub fn canonical_reason(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Created => "Created",
            Self::NoContent => "No Content",
            Self::BadRequest => "Bad Request",
            Self::NotFound => "Not Found",
            Self::Conflict => "Conflict",
            Self::UnprocessableEntity => "Unprocessable Entity",
            Self::InternalServerError => "Internal Server Error",
            Self::ServiceUnavailable => "Service Unavailable",
            Self::GatewayTimeout => "Gateway Timeout",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.as_u16(), self.canonical_reason())
    }
}

/// A response produced by a handler and returned by the pipeline.
///
/// # Examples
///
/// ```
/// use rttp_db::http::{Response, StatusCode};
///
/// let response = Response::new(StatusCode::Ok)
///     .header("Content-Type", "application/json")
///     .json(&serde_json::json!({ "status": "ok" }));
///
/// assert_eq!(response.status(), StatusCode::Ok);
/// assert_eq!(response.body_text(), r#"{"status":"ok"}"#);
/// ```
#[derive(Debug, Clone)]
pub struct Response {
    status: StatusCode,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Response {
    /// Creates a new response with the given status and an empty body.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Appends a response header. Multiple calls with the same name are additive.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Sets the response body from a string.
    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into().into_bytes();
        self
    }

    /// Serializes `value` as the JSON body.
    ///
    /// A value that cannot be serialized (a map with non-string keys, a
    /// failing `Serialize` impl) turns the response into a logged
    /// `500 Internal Server Error`.
    #[must_use]
    pub fn json<T: serde::Serialize>(mut self, value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(body) => self.body = body,
            Err(err) => {
                error!(error = %err, "failed to serialize JSON response body");
                self.status = StatusCode::InternalServerError;
                self.body = self.status.canonical_reason().as_bytes().to_vec();
            }
        }
        self
    }

    /// Returns the status code of this response.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Returns the first value for the given header name (case-insensitive).
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns every header in insertion order.
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Returns the body bytes.
    pub fn body_bytes(&self) -> &[u8] {
        &self.body
    }

    /// Returns the body as text, replacing invalid UTF-8.
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new(StatusCode::Ok)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[test]
    fn header_lookup_is_case_insensitive() {
        let r = Response::new(StatusCode::Ok).header("X-Request-Id", "abc-123");
        assert_eq!(r.header_value("x-request-id"), Some("abc-123"));
        assert_eq!(r.header_value("x-missing"), None);
    }

    #[test]
    fn unserializable_json_body_becomes_500() {
        let mut by_pair = BTreeMap::new();
        by_pair.insert((1, 2), "tuple keys are not valid JSON object keys");

        let response = Response::new(StatusCode::Ok).json(&by_pair);
        assert_eq!(response.status(), StatusCode::InternalServerError);
        assert_eq!(response.body_text(), "Internal Server Error");
    }

    #[test]
    fn display_includes_reason() {
        assert_eq!(
            StatusCode::ServiceUnavailable.to_string(),
            "503 Service Unavailable"
        );
    }
}
