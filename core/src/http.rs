//! HTTP/1.1 vocabulary shared by requests, responses and transports.
//!
//! # Design
//! Headers are kept as ordered `(name, value)` pairs rather than a map so
//! rendering reproduces the caller's insertion order byte for byte. Lookups
//! are case-insensitive, as header names are.

use std::fmt;

/// Protocol token written on every request line.
pub const HTTP_11: &str = "HTTP/1.1";

/// HTTP method for a request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Delete,
    /// Any other token, written verbatim on the request line.
    Other(String),
}

impl HttpMethod {
    pub fn as_str(&self) -> &str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Other(token) => token,
        }
    }

    /// Whether requests with this method carry a body section.
    pub fn has_body(&self) -> bool {
        matches!(self, HttpMethod::Post | HttpMethod::Put)
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for HttpMethod {
    fn from(token: &str) -> Self {
        match token {
            "GET" => HttpMethod::Get,
            "POST" => HttpMethod::Post,
            "PUT" => HttpMethod::Put,
            "DELETE" => HttpMethod::Delete,
            other => HttpMethod::Other(other.to_string()),
        }
    }
}

/// Get the first header value matching `name` (case-insensitive).
pub fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}
