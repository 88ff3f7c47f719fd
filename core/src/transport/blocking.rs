//! Blocking HTTP/1.1 transport over a std `TcpStream`.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use parking_lot::Mutex;

use super::h1::ResponseDecoder;
use super::{BlockingTransport, ConnectFuture, Connector, Received, Transport};
use crate::error::TransportError;
use crate::response::SharedBuffer;

const READ_CHUNK: usize = 8 * 1024;

/// Synchronous connection to one peer.
pub struct BlockingTcpTransport {
    peer: SocketAddr,
    stream: Option<TcpStream>,
    buf: BytesMut,
    decoder: ResponseDecoder,
    body: SharedBuffer,
}

impl BlockingTcpTransport {
    /// Connect. Reads and writes block without limit until the caller sets
    /// an exchange timeout.
    pub fn connect(addr: SocketAddr, connect_timeout: Duration) -> Result<Self, TransportError> {
        let stream = TcpStream::connect_timeout(&addr, connect_timeout)
            .map_err(|e| TransportError::Connect(format!("{addr}: {e}")))?;
        stream.set_nodelay(true)?;
        tracing::debug!(peer = %addr, "connected (blocking)");
        Ok(Self {
            peer: addr,
            stream: Some(stream),
            buf: BytesMut::with_capacity(READ_CHUNK),
            decoder: ResponseDecoder::default(),
            body: Arc::new(Mutex::new(BytesMut::new())),
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    fn stream(&mut self) -> Result<&mut TcpStream, TransportError> {
        self.stream.as_mut().ok_or(TransportError::Closed)
    }
}

impl BlockingTransport for BlockingTcpTransport {
    fn set_io_timeout(&mut self, timeout: Duration) -> Result<(), TransportError> {
        // a zero timeout is rejected by the socket
        let timeout = timeout.max(Duration::from_millis(1));
        let stream = self.stream()?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        Ok(())
    }

    fn send_message(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let result = self.stream()?.write_all(bytes);
        result.map_err(|e| {
            self.disconnect();
            e.into()
        })
    }

    fn receive_message(&mut self) -> Received {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.decoder.decode(&mut self.buf) {
                Ok(Some(message)) => return Ok(message.into_response(&self.body)),
                Ok(None) => {}
                Err(err) => {
                    self.disconnect();
                    return Err(err);
                }
            }
            let read = self.stream()?.read(&mut chunk);
            match read {
                Ok(0) => {
                    let finished = self.decoder.decode_eof(&mut self.buf);
                    self.disconnect();
                    return match finished {
                        Ok(Some(message)) => Ok(message.into_response(&self.body)),
                        Ok(None) => Err(TransportError::Closed),
                        Err(err) => Err(err),
                    };
                }
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(err) => {
                    self.disconnect();
                    return Err(err.into());
                }
            }
        }
    }

    fn disconnect(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
            tracing::debug!(peer = %self.peer, "disconnected (blocking)");
        }
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}

/// Opens blocking connections to a fixed address.
#[derive(Debug, Clone)]
pub struct BlockingTcpConnector {
    addr: SocketAddr,
    connect_timeout: Duration,
}

impl BlockingTcpConnector {
    pub fn new(addr: SocketAddr, connect_timeout: Duration) -> Self {
        Self {
            addr,
            connect_timeout,
        }
    }
}

impl Connector for BlockingTcpConnector {
    fn connect(&self) -> ConnectFuture<'_> {
        let (addr, connect_timeout) = (self.addr, self.connect_timeout);
        Box::pin(async move {
            let transport =
                tokio::task::spawn_blocking(move || BlockingTcpTransport::connect(addr, connect_timeout))
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))??;
            Ok(Transport::blocking(transport))
        })
    }
}
