//! Declarative request description and its HTTP/1.1 rendering.
//!
//! # Design
//! `Request::write_to` renders straight into a `BytesMut`. For bodies the
//! length is not known until the formatter has run, so a fixed-width
//! `Content-Length` field is reserved first and patched once the body bytes
//! have been counted. Nothing is staged in an intermediate string.
//!
//! The request's status lives in a shared `StatusCell` so callers can watch
//! it through the `ResponseFuture` while the pipeline owns the request.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use serde_json::Value;

use crate::error::ClientError;
use crate::formatter::{put_encoded, BodyFormatter, BodyType, JsonFormatter};
use crate::http::{find_header, HttpMethod, HTTP_11};

const CONTENT_LENGTH: &[u8] = b"Content-Length: ";

/// Width of the reserved `Content-Length` value, enough for any u32.
const LENGTH_FIELD_WIDTH: usize = 10;

/// Lifecycle of one request execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum RequestStatus {
    None = 0,
    SendCompleted = 1,
    Received = 2,
    Completed = 3,
    Error = 4,
}

impl RequestStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => RequestStatus::SendCompleted,
            2 => RequestStatus::Received,
            3 => RequestStatus::Completed,
            4 => RequestStatus::Error,
            _ => RequestStatus::None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RequestStatus::Completed | RequestStatus::Error)
    }

    fn can_advance_to(self, next: RequestStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        next == RequestStatus::Error || next > self
    }
}

/// Shared, forward-only request status.
#[derive(Debug, Default)]
pub struct StatusCell(AtomicU8);

impl StatusCell {
    pub fn get(&self) -> RequestStatus {
        RequestStatus::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move to `next`. Backward, repeated and post-terminal transitions are
    /// refused and return `false`.
    pub fn advance(&self, next: RequestStatus) -> bool {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                RequestStatus::from_u8(raw)
                    .can_advance_to(next)
                    .then_some(next as u8)
            })
            .is_ok()
    }
}

/// An HTTP request waiting to be executed.
#[derive(Clone)]
pub struct Request {
    method: HttpMethod,
    url: String,
    protocol: String,
    query: Vec<(String, Option<String>)>,
    headers: Vec<(String, String)>,
    body: Option<Value>,
    body_type: Option<BodyType>,
    formatter: Arc<dyn BodyFormatter>,
    timeout: Option<Duration>,
    status: Arc<StatusCell>,
}

impl Request {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            protocol: HTTP_11.to_string(),
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
            body_type: None,
            formatter: Arc::new(JsonFormatter),
            timeout: None,
            status: Arc::new(StatusCell::default()),
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Post, url)
    }

    pub fn put(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Put, url)
    }

    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Delete, url)
    }

    /// Append a query pair. `None` and empty values are left off the wire.
    pub fn query(mut self, key: impl Into<String>, value: Option<impl Into<String>>) -> Self {
        self.query.push((key.into(), value.map(Into::into)));
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set the body payload. `Value::Null` clears it.
    pub fn body(mut self, body: Value) -> Self {
        self.body = (!body.is_null()).then_some(body);
        self
    }

    /// Declare the type a successful response body decodes into.
    pub fn expect(mut self, body_type: BodyType) -> Self {
        self.body_type = Some(body_type);
        self
    }

    pub fn formatter(mut self, formatter: impl BodyFormatter + 'static) -> Self {
        self.formatter = Arc::new(formatter);
        self
    }

    /// Override the host's default timeout for this request.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }

    pub fn method(&self) -> &HttpMethod {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn payload(&self) -> Option<&Value> {
        self.body.as_ref()
    }

    pub fn body_type(&self) -> Option<&BodyType> {
        self.body_type.as_ref()
    }

    pub fn body_formatter(&self) -> &dyn BodyFormatter {
        self.formatter.as_ref()
    }

    pub fn timeout_override(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn status(&self) -> RequestStatus {
        self.status.get()
    }

    pub(crate) fn status_cell(&self) -> Arc<StatusCell> {
        Arc::clone(&self.status)
    }

    /// Render the request into `out`.
    pub fn write_to(&self, out: &mut BytesMut) -> Result<(), ClientError> {
        out.extend_from_slice(self.method.as_str().as_bytes());
        out.put_u8(b' ');
        out.extend_from_slice(self.url.as_bytes());
        self.write_query(out);
        out.put_u8(b' ');
        out.extend_from_slice(self.protocol.as_bytes());
        out.extend_from_slice(b"\r\n");

        for (name, value) in &self.headers {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }

        if !self.method.has_body() {
            out.extend_from_slice(b"\r\n");
            return Ok(());
        }

        let Some(body) = &self.body else {
            out.extend_from_slice(b"Content-Length: 0\r\n\r\n");
            return Ok(());
        };

        if find_header(&self.headers, "content-type").is_none() {
            out.extend_from_slice(b"Content-Type: ");
            out.extend_from_slice(self.formatter.content_type().as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(CONTENT_LENGTH);
        let field = out.len();
        out.put_bytes(b' ', LENGTH_FIELD_WIDTH);
        out.extend_from_slice(b"\r\n\r\n");

        let start = out.len();
        self.formatter.serialize(body, out)?;
        let count = (out.len() - start).to_string();
        if count.len() > LENGTH_FIELD_WIDTH {
            return Err(ClientError::Serialize(format!(
                "body of {count} bytes exceeds the content-length field"
            )));
        }
        out[field..field + count.len()].copy_from_slice(count.as_bytes());
        Ok(())
    }

    /// Render the request into a fresh buffer.
    pub fn encode(&self) -> Result<Bytes, ClientError> {
        let mut out = BytesMut::with_capacity(256);
        self.write_to(&mut out)?;
        Ok(out.freeze())
    }

    fn write_query(&self, out: &mut BytesMut) {
        let mut written = 0;
        for (key, value) in &self.query {
            let Some(value) = value.as_deref().filter(|v| !v.is_empty()) else {
                continue;
            };
            out.put_u8(if written == 0 { b'?' } else { b'&' });
            out.extend_from_slice(key.as_bytes());
            out.put_u8(b'=');
            put_encoded(out, value);
            written += 1;
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("url", &self.url)
            .field("query", &self.query)
            .field("headers", &self.headers)
            .field("body", &self.body)
            .field("body_type", &self.body_type)
            .field("formatter", &self.formatter)
            .field("timeout", &self.timeout)
            .field("status", &self.status.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::formatter::FormUrlFormatter;

    fn rendered(req: &Request) -> String {
        String::from_utf8(req.encode().unwrap().to_vec()).unwrap()
    }

    /// Split rendered bytes into (head, body) at the first blank line.
    fn split(raw: &str) -> (&str, &str) {
        let end = raw.find("\r\n\r\n").unwrap();
        (&raw[..end], &raw[end + 4..])
    }

    fn content_length(head: &str) -> usize {
        head.lines()
            .find_map(|line| line.strip_prefix("Content-Length: "))
            .unwrap()
            .trim_end()
            .parse()
            .unwrap()
    }

    #[test]
    fn get_ends_with_blank_line_and_no_length() {
        let raw = rendered(&Request::get("/items").header("Host", "example.com"));
        assert_eq!(raw, "GET /items HTTP/1.1\r\nHost: example.com\r\n\r\n");
        assert!(!raw.contains("Content-Length"));
    }

    #[test]
    fn delete_ignores_body() {
        let raw = rendered(&Request::delete("/items/1").body(json!({"a": 1, "b": 2})));
        assert_eq!(raw, "DELETE /items/1 HTTP/1.1\r\n\r\n");
    }

    #[test]
    fn post_length_matches_serialized_body() {
        let req = Request::post("/items").body(json!({"name": "bolt", "quantity": 3}));
        let raw = rendered(&req);
        let (head, body) = split(&raw);
        assert_eq!(content_length(head), body.len());
        assert_eq!(body, r#"{"name":"bolt","quantity":3}"#);
        assert!(head.contains("Content-Type: application/json\r\n"));
    }

    #[test]
    fn length_field_is_space_padded_to_fixed_width() {
        let raw = rendered(&Request::put("/v").body(json!([1, 2, 3])));
        assert!(raw.contains("Content-Length: 7         \r\n\r\n[1,2,3]"));
    }

    #[test]
    fn post_without_body_declares_zero_length() {
        let raw = rendered(&Request::post("/ping"));
        assert_eq!(raw, "POST /ping HTTP/1.1\r\nContent-Length: 0\r\n\r\n");
        assert_eq!(rendered(&Request::put("/ping").body(Value::Null)), raw.replace("POST", "PUT"));
    }

    #[test]
    fn query_is_encoded_in_insertion_order() {
        let req = Request::get("/search")
            .query("a", Some("1"))
            .query("empty", Some(""))
            .query("b", Some("x y"))
            .query("missing", None::<String>);
        assert_eq!(rendered(&req), "GET /search?a=1&b=x%20y HTTP/1.1\r\n\r\n");
    }

    #[test]
    fn query_with_only_empty_values_adds_nothing() {
        let req = Request::get("/search").query("a", Some(""));
        assert_eq!(rendered(&req), "GET /search HTTP/1.1\r\n\r\n");
    }

    #[test]
    fn form_body_uses_form_content_type() {
        let req = Request::post("/form")
            .formatter(FormUrlFormatter)
            .body(json!({"q": "hi there"}));
        let raw = rendered(&req);
        let (head, body) = split(&raw);
        assert_eq!(body, "q=hi%20there");
        assert_eq!(content_length(head), body.len());
        assert!(head.contains("Content-Type: application/x-www-form-urlencoded"));
    }

    #[test]
    fn explicit_content_type_is_not_duplicated() {
        let req = Request::post("/raw")
            .header("content-type", "application/vnd.custom+json")
            .body(json!({"a": 1, "b": 2}));
        let raw = rendered(&req);
        assert_eq!(raw.matches("ontent-").count(), 2);
        assert!(!raw.contains("application/json"));
    }

    #[test]
    fn status_only_moves_forward() {
        let cell = StatusCell::default();
        assert!(cell.advance(RequestStatus::SendCompleted));
        assert!(!cell.advance(RequestStatus::SendCompleted));
        assert!(cell.advance(RequestStatus::Received));
        assert!(!cell.advance(RequestStatus::SendCompleted));
        assert!(cell.advance(RequestStatus::Completed));
        assert!(!cell.advance(RequestStatus::Error));
        assert_eq!(cell.get(), RequestStatus::Completed);
    }

    #[test]
    fn error_is_reachable_from_any_live_state() {
        let cell = StatusCell::default();
        assert!(cell.advance(RequestStatus::Error));
        assert!(!cell.advance(RequestStatus::Completed));
        assert_eq!(cell.get(), RequestStatus::Error);
    }
}
