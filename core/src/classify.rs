//! Response classification.
//!
//! Turns a raw response into the caller-facing outcome: parse the code,
//! decode or read the body, release the body buffer, drop non-persistent
//! connections and attach a `ClientError::Status` to anything but 200.

use crate::error::ClientError;
use crate::pool::Lease;
use crate::request::Request;
use crate::response::{DecodedBody, Response};

/// Classify `response` for `request`, received on `lease`.
///
/// The body buffer is released before this returns, on every path. An
/// `Err` means the response could not be interpreted at all; the caller
/// turns it into a failure response.
pub(crate) fn classify(
    request: &Request,
    mut response: Response,
    lease: &mut Lease,
) -> Result<Response, ClientError> {
    let stream = response.stream.take();
    let code: u16 = match response.code().parse() {
        Ok(code) => code,
        Err(_) => {
            drop(stream);
            return Err(ClientError::InvalidStatus(response.code().to_string()));
        }
    };

    let decoded = match stream {
        Some(stream) if response.length() > 0 => {
            let decoded = if code == 200 {
                request
                    .body_formatter()
                    .deserialize(&stream, request.body_type())
            } else {
                Ok(DecodedBody::Text(stream.read_string()))
            };
            stream.release();
            decoded.map(Some)
        }
        // empty body; dropping the reader releases it
        _ => Ok(None),
    };

    if !response.keep_alive() {
        tracing::debug!(conn = lease.id(), "server closed keep-alive, disconnecting");
        lease.disconnect();
    }

    let decoded = decoded?;
    if code == 200 {
        response.body = decoded;
    } else {
        let body = match decoded {
            Some(DecodedBody::Text(text)) => text,
            _ => String::new(),
        };
        tracing::debug!(code, url = request.url(), "request failed with status");
        response.exception = Some(ClientError::Status { code, body });
    }
    Ok(response)
}
