//! HTTP/1.1 response framing.
//!
//! `httparse` parses status lines, headers and chunk-size lines; this module
//! only drives the framing state machine over a growing `BytesMut`, yielding
//! one complete message at a time and leaving the bytes of a following
//! message in the buffer.
//!
//! Interim `1xx` responses are skipped. A final response with neither a
//! length nor chunked framing runs to the end of the stream, which is only
//! accepted when the connection is not kept alive; `decode_eof` finishes it.

use std::ops::Range;

use bytes::{Buf, Bytes, BytesMut};
use httparse::Status;

use crate::error::TransportError;
use crate::http::find_header;
use crate::response::{BodyReader, Response, ResponseHead, SharedBuffer};

/// Upper bound on the size of a status line plus headers.
const MAX_HEAD: usize = 64 * 1024;

const MAX_HEADERS: usize = 64;

/// One decoded response.
#[derive(Debug)]
pub struct Message {
    pub head: ResponseHead,
    pub body: Bytes,
}

impl Message {
    /// Park the body in `buffer` and build the engine-facing response.
    pub fn into_response(self, buffer: &SharedBuffer) -> Response {
        let len = self.body.len();
        if len == 0 {
            return Response::from_head(self.head, None);
        }
        buffer.lock().extend_from_slice(&self.body);
        let reader = BodyReader::new(SharedBuffer::clone(buffer), len, self.head.chunked);
        Response::from_head(self.head, Some(reader))
    }
}

#[derive(Debug, Default)]
enum State {
    #[default]
    Head,
    Sized {
        head: ResponseHead,
        length: usize,
    },
    Chunked {
        head: ResponseHead,
        decoded: BytesMut,
    },
    UntilEof {
        head: ResponseHead,
    },
}

/// Incremental decoder for a stream of responses on one connection.
#[derive(Debug, Default)]
pub struct ResponseDecoder {
    state: State,
}

impl ResponseDecoder {
    /// Try to decode one message from the front of `src`.
    ///
    /// Returns `Ok(None)` when more bytes are needed.
    pub fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, TransportError> {
        loop {
            match std::mem::take(&mut self.state) {
                State::Head => {
                    let Some((consumed, parsed)) = parse_head(&src[..])? else {
                        if src.len() > MAX_HEAD {
                            return Err(TransportError::Parse("response head too large".into()));
                        }
                        return Ok(None);
                    };
                    src.advance(consumed);
                    self.state = match parsed.framing {
                        Framing::Interim => {
                            tracing::trace!(code = %parsed.head.code, "skipping interim response");
                            State::Head
                        }
                        Framing::Chunked => State::Chunked {
                            head: parsed.head,
                            decoded: BytesMut::new(),
                        },
                        Framing::Length(length) => State::Sized {
                            head: parsed.head,
                            length,
                        },
                        Framing::UntilEof => State::UntilEof { head: parsed.head },
                    };
                }
                State::Sized { head, length } => {
                    if src.len() < length {
                        self.state = State::Sized { head, length };
                        return Ok(None);
                    }
                    let body = src.split_to(length).freeze();
                    return Ok(Some(Message { head, body }));
                }
                State::Chunked { mut head, mut decoded } => match decode_chunk(src)? {
                    Chunk::Data { payload, consumed } => {
                        decoded.extend_from_slice(&src[payload]);
                        src.advance(consumed);
                        self.state = State::Chunked { head, decoded };
                    }
                    Chunk::Last(consumed) => {
                        src.advance(consumed);
                        head.length = decoded.len();
                        return Ok(Some(Message {
                            head,
                            body: decoded.freeze(),
                        }));
                    }
                    Chunk::NeedMore => {
                        self.state = State::Chunked { head, decoded };
                        return Ok(None);
                    }
                },
                State::UntilEof { head } => {
                    self.state = State::UntilEof { head };
                    return Ok(None);
                }
            }
        }
    }

    /// Finish decoding once the peer has closed the stream.
    ///
    /// Yields the close-delimited message in progress, if any. `Ok(None)`
    /// means the stream ended between messages or inside a framed one.
    pub fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Message>, TransportError> {
        if let Some(message) = self.decode(src)? {
            return Ok(Some(message));
        }
        match std::mem::take(&mut self.state) {
            State::UntilEof { mut head } => {
                let body = src.split().freeze();
                head.length = body.len();
                Ok(Some(Message { head, body }))
            }
            _ => Ok(None),
        }
    }
}

enum Framing {
    Length(usize),
    Chunked,
    UntilEof,
    /// A `1xx` response other than `101`; no body, another head follows.
    Interim,
}

struct ParsedHead {
    head: ResponseHead,
    framing: Framing,
}

/// Parse a status line and headers. `Ok(None)` means the head is incomplete;
/// otherwise returns the number of bytes it spans.
fn parse_head(src: &[u8]) -> Result<Option<(usize, ParsedHead)>, TransportError> {
    let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut slots);
    let consumed = match response.parse(src) {
        Ok(Status::Complete(consumed)) => consumed,
        Ok(Status::Partial) => return Ok(None),
        Err(err) => return Err(TransportError::Parse(format!("bad response head: {err}"))),
    };
    let code = response
        .code
        .ok_or_else(|| TransportError::Parse("missing status code".into()))?;
    let headers: Vec<(String, String)> = response
        .headers
        .iter()
        .map(|h| {
            let value = String::from_utf8_lossy(h.value).trim().to_string();
            (h.name.to_string(), value)
        })
        .collect();

    let connection = find_header(&headers, "connection").map(str::to_ascii_lowercase);
    let keep_alive = match connection.as_deref() {
        Some(v) if v.contains("close") => false,
        Some(v) if v.contains("keep-alive") => true,
        _ => response.version == Some(1),
    };

    let chunked = find_header(&headers, "transfer-encoding")
        .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"));
    let framing = if (100..200).contains(&code) && code != 101 {
        Framing::Interim
    } else if chunked {
        Framing::Chunked
    } else if let Some(v) = find_header(&headers, "content-length") {
        Framing::Length(
            v.parse()
                .map_err(|_| TransportError::Parse(format!("bad content-length {v:?}")))?,
        )
    } else if matches!(code, 101 | 204 | 304) {
        Framing::Length(0)
    } else if !keep_alive {
        Framing::UntilEof
    } else {
        return Err(TransportError::Parse(format!(
            "{code} response has no length on a kept-alive connection"
        )));
    };
    let length = match framing {
        Framing::Length(n) => n,
        _ => 0,
    };

    let head = ResponseHead {
        code: code.to_string(),
        message: response.reason.unwrap_or_default().to_string(),
        headers,
        length,
        chunked,
        keep_alive,
    };
    Ok(Some((consumed, ParsedHead { head, framing })))
}

enum Chunk {
    /// Chunk payload at `payload`; the chunk and its CRLF span `consumed`
    /// bytes.
    Data {
        payload: Range<usize>,
        consumed: usize,
    },
    /// Terminating chunk plus trailers, this many bytes long.
    Last(usize),
    NeedMore,
}

/// Decode one chunk from chunked transfer encoding.
fn decode_chunk(data: &[u8]) -> Result<Chunk, TransportError> {
    let (start, size) = match httparse::parse_chunk_size(data) {
        Ok(Status::Complete(parsed)) => parsed,
        Ok(Status::Partial) => return Ok(Chunk::NeedMore),
        Err(_) => return Err(TransportError::Parse("bad chunk size".into())),
    };

    if size == 0 {
        let mut trailers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        return match httparse::parse_headers(&data[start..], &mut trailers) {
            Ok(Status::Complete((len, _))) => Ok(Chunk::Last(start + len)),
            Ok(Status::Partial) => Ok(Chunk::NeedMore),
            Err(err) => Err(TransportError::Parse(format!("bad chunk trailer: {err}"))),
        };
    }

    let too_large = || TransportError::Parse(format!("chunk size {size:#x} too large"));
    let end = usize::try_from(size)
        .ok()
        .and_then(|size| start.checked_add(size))
        .ok_or_else(too_large)?;
    let consumed = end.checked_add(2).ok_or_else(too_large)?;
    if data.len() < consumed {
        return Ok(Chunk::NeedMore);
    }
    if &data[end..consumed] != b"\r\n" {
        return Err(TransportError::Parse("chunk not terminated by CRLF".into()));
    }
    Ok(Chunk::Data {
        payload: start..end,
        consumed,
    })
}
