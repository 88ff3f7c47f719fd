//! Pluggable body formatters.
//!
//! # Design
//! A formatter is a strategy value held on each `Request` (default JSON);
//! there is no discovery mechanism. Bodies are untyped `serde_json::Value`s
//! on the way out. On the way in, a formatter produces a `DecodedBody`, and
//! a declared `BodyType` turns the dynamic token into a concrete Rust type
//! without reflection: `BodyType::of::<T>()` captures a monomorphized
//! conversion function.

use std::any::{type_name, Any};
use std::borrow::Cow;
use std::fmt;

use bytes::{BufMut, BytesMut};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::ClientError;
use crate::response::{BodyReader, DecodedBody};

// RFC 3986 unreserved characters stay literal; a space becomes %20.
const VALUE_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Append `value` percent-encoded to `out`.
pub(crate) fn put_encoded(out: &mut BytesMut, value: &str) {
    for chunk in utf8_percent_encode(value, VALUE_ENCODE_SET) {
        out.extend_from_slice(chunk.as_bytes());
    }
}

/// Capability contract for serializing request bodies and decoding
/// response bodies of one content type.
pub trait BodyFormatter: Send + Sync + fmt::Debug {
    /// Value for the `Content-Type` header.
    fn content_type(&self) -> &'static str;

    /// Serialize `data` by appending to `out`.
    fn serialize(&self, data: &Value, out: &mut BytesMut) -> Result<(), ClientError>;

    /// Decode the body visible through `body`.
    fn deserialize(
        &self,
        body: &BodyReader,
        target: Option<&BodyType>,
    ) -> Result<DecodedBody, ClientError>;
}

type FromValue = fn(Value) -> Result<Box<dyn Any + Send + Sync>, serde_json::Error>;

/// Declared decode target of a response body.
#[derive(Clone, Copy)]
pub struct BodyType {
    name: &'static str,
    from_value: FromValue,
}

fn convert<T: DeserializeOwned + Send + Sync + 'static>(
    value: Value,
) -> Result<Box<dyn Any + Send + Sync>, serde_json::Error> {
    let typed: T = serde_json::from_value(value)?;
    Ok(Box::new(typed))
}

impl BodyType {
    pub fn of<T: DeserializeOwned + Send + Sync + 'static>() -> Self {
        Self {
            name: type_name::<T>(),
            from_value: convert::<T>,
        }
    }

    /// Rust type name of the target.
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn decode(&self, value: Value) -> Result<DecodedBody, ClientError> {
        (self.from_value)(value)
            .map(DecodedBody::Typed)
            .map_err(|e| ClientError::Decode(format!("{}: {e}", self.name)))
    }
}

impl fmt::Debug for BodyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("BodyType").field(&self.name).finish()
    }
}

/// `application/json` formatter.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonFormatter;

impl BodyFormatter for JsonFormatter {
    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn serialize(&self, data: &Value, out: &mut BytesMut) -> Result<(), ClientError> {
        // A single-entry mapping is sent as its bare value.
        let data = match data {
            Value::Object(map) if map.len() == 1 => map.values().next().unwrap_or(data),
            _ => data,
        };
        serde_json::to_writer(out.writer(), data).map_err(|e| ClientError::Serialize(e.to_string()))
    }

    fn deserialize(
        &self,
        body: &BodyReader,
        target: Option<&BodyType>,
    ) -> Result<DecodedBody, ClientError> {
        let value: Value = {
            let bytes = body.lock();
            serde_json::from_slice(&bytes).map_err(|e| ClientError::Decode(e.to_string()))?
        };
        match target {
            Some(target) => target.decode(value),
            None => Ok(DecodedBody::Value(value)),
        }
    }
}

/// `application/x-www-form-urlencoded` formatter.
#[derive(Debug, Clone, Copy, Default)]
pub struct FormUrlFormatter;

impl BodyFormatter for FormUrlFormatter {
    fn content_type(&self) -> &'static str {
        "application/x-www-form-urlencoded"
    }

    fn serialize(&self, data: &Value, out: &mut BytesMut) -> Result<(), ClientError> {
        match data {
            Value::Object(map) => {
                let mut written = 0;
                for (key, value) in map {
                    let text: Cow<'_, str> = match value {
                        Value::Null => continue,
                        Value::String(s) => Cow::Borrowed(s.as_str()),
                        other => Cow::Owned(other.to_string()),
                    };
                    if written > 0 {
                        out.put_u8(b'&');
                    }
                    out.extend_from_slice(key.as_bytes());
                    out.put_u8(b'=');
                    put_encoded(out, &text);
                    written += 1;
                }
            }
            Value::Null => {}
            Value::String(s) => out.extend_from_slice(s.as_bytes()),
            other => out.extend_from_slice(other.to_string().as_bytes()),
        }
        Ok(())
    }

    fn deserialize(
        &self,
        body: &BodyReader,
        _target: Option<&BodyType>,
    ) -> Result<DecodedBody, ClientError> {
        Ok(DecodedBody::Text(body.read_string()))
    }
}
