//! Response value delivered through the completion channel.
//!
//! # Design
//! A transport hands the engine a `Response` built from a parsed
//! `ResponseHead` plus a `BodyReader`. The reader is a view of the first
//! `length` bytes of a buffer the transport keeps writing into, so the
//! buffer stays transport-owned until the classifier releases it.
//! `BodyReader::release` consumes the reader and `Drop` releases an
//! unreleased one, which makes the release happen exactly once on every
//! exit path.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use serde_json::Value;

use crate::error::ClientError;
use crate::http::find_header;

/// Inbound byte buffer shared between a transport and the body readers it
/// hands out.
pub type SharedBuffer = Arc<Mutex<BytesMut>>;

/// Status line and headers of a response, as parsed by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    /// Status code exactly as it appeared on the wire.
    pub code: String,
    pub message: String,
    pub headers: Vec<(String, String)>,
    /// Declared body length in bytes (decoded length for chunked bodies).
    pub length: usize,
    pub chunked: bool,
    pub keep_alive: bool,
}

/// Readable view of a response body inside a transport-owned buffer.
pub struct BodyReader {
    source: SharedBuffer,
    len: usize,
    chunked: bool,
    released: bool,
}

impl BodyReader {
    pub fn new(source: SharedBuffer, len: usize, chunked: bool) -> Self {
        Self {
            source,
            len,
            chunked,
            released: false,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_chunked(&self) -> bool {
        self.chunked
    }

    /// Exclusive access to the body bytes. The transport cannot append to
    /// the underlying buffer while the guard is held.
    pub fn lock(&self) -> MappedMutexGuard<'_, [u8]> {
        let len = self.len;
        MutexGuard::map(self.source.lock(), move |buf| {
            let end = len.min(buf.len());
            &mut buf[..end]
        })
    }

    /// Read the body as text, replacing invalid UTF-8 sequences.
    pub fn read_string(&self) -> String {
        String::from_utf8_lossy(&self.lock()).into_owned()
    }

    /// Hand the body bytes back to the transport.
    pub fn release(mut self) {
        self.free();
    }

    fn free(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let mut buf = self.source.lock();
        let n = self.len.min(buf.len());
        buf.advance(n);
        // bytes of later parked messages stay; an emptied buffer that a
        // chunked body may have grown is dropped
        if self.chunked && buf.is_empty() {
            *buf = BytesMut::new();
        }
    }
}

impl Drop for BodyReader {
    fn drop(&mut self) {
        self.free();
    }
}

impl fmt::Debug for BodyReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BodyReader")
            .field("len", &self.len)
            .field("chunked", &self.chunked)
            .field("released", &self.released)
            .finish()
    }
}

/// Body after classification.
pub enum DecodedBody {
    /// Dynamic JSON token, produced when no target type was declared.
    Value(Value),
    /// Raw text: form bodies and diagnostic text of failed responses.
    Text(String),
    /// Value of the request's declared `BodyType`.
    Typed(Box<dyn Any + Send + Sync>),
}

impl fmt::Debug for DecodedBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodedBody::Value(v) => f.debug_tuple("Value").field(v).finish(),
            DecodedBody::Text(t) => f.debug_tuple("Text").field(t).finish(),
            DecodedBody::Typed(_) => f.write_str("Typed(..)"),
        }
    }
}

/// Terminal outcome of one request execution.
#[derive(Debug)]
pub struct Response {
    code: String,
    message: String,
    headers: Vec<(String, String)>,
    length: usize,
    chunked: bool,
    keep_alive: bool,
    pub(crate) stream: Option<BodyReader>,
    pub(crate) exception: Option<ClientError>,
    pub(crate) body: Option<DecodedBody>,
}

impl Response {
    /// Build a response from a parsed head and its body reader.
    pub fn from_head(head: ResponseHead, stream: Option<BodyReader>) -> Self {
        Self {
            code: head.code,
            message: head.message,
            headers: head.headers,
            length: head.length,
            chunked: head.chunked,
            keep_alive: head.keep_alive,
            stream,
            exception: None,
            body: None,
        }
    }

    /// Failure response carrying only a classified exception.
    pub fn failed(err: ClientError) -> Self {
        Self {
            code: err.code().map(|c| c.to_string()).unwrap_or_default(),
            message: err.to_string(),
            headers: Vec::new(),
            length: 0,
            chunked: false,
            keep_alive: false,
            stream: None,
            exception: Some(err),
            body: None,
        }
    }

    /// Synthetic response produced when a request's timer fires.
    pub fn timeout() -> Self {
        Self {
            message: "Request timeout".to_string(),
            ..Self::failed(ClientError::Timeout)
        }
    }

    /// Status code as received, e.g. `"200"`.
    pub fn code(&self) -> &str {
        &self.code
    }

    /// Status code parsed as an integer.
    pub fn status(&self) -> Option<u16> {
        self.code.parse().ok()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Declared body length.
    pub fn length(&self) -> usize {
        self.length
    }

    pub fn is_chunked(&self) -> bool {
        self.chunked
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn exception(&self) -> Option<&ClientError> {
        self.exception.as_ref()
    }

    pub fn is_success(&self) -> bool {
        self.exception.is_none()
    }

    pub fn body(&self) -> Option<&DecodedBody> {
        self.body.as_ref()
    }

    /// The decoded body as the request's declared type.
    pub fn body_as<T: Any>(&self) -> Option<&T> {
        match &self.body {
            Some(DecodedBody::Typed(value)) => value.downcast_ref(),
            _ => None,
        }
    }

    /// The decoded body as a dynamic JSON token.
    pub fn json(&self) -> Option<&Value> {
        match &self.body {
            Some(DecodedBody::Value(value)) => Some(value),
            _ => None,
        }
    }

    /// The decoded body as raw text.
    pub fn text(&self) -> Option<&str> {
        match &self.body {
            Some(DecodedBody::Text(text)) => Some(text),
            _ => None,
        }
    }

    /// Split into the usual result pair.
    pub fn into_result(mut self) -> Result<Response, ClientError> {
        match self.exception.take() {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }
}
