//! Event-driven HTTP/1.1 transport over a tokio `TcpStream`.
//!
//! The socket is split between two background tasks. The writer drains an
//! unbounded queue of rendered requests; the reader decodes responses and
//! completes whichever waiter `receive_next` registered. A response that
//! arrives with no waiter is parked and handed out by the next
//! registration as `Inbound::Ready`.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;

use super::h1::ResponseDecoder;
use super::{ConnectFuture, Connector, EventedTransport, Inbound, Received, Transport};
use crate::error::TransportError;
use crate::response::SharedBuffer;

#[derive(Default)]
struct Slot {
    waiter: Option<oneshot::Sender<Received>>,
    ready: VecDeque<Received>,
    closed: Option<TransportError>,
}

impl Slot {
    fn deliver(&mut self, result: Received) {
        match self.waiter.take() {
            Some(tx) => {
                // a dropped waiter means the request was abandoned
                let _ = tx.send(result);
            }
            None => self.ready.push_back(result),
        }
    }

    fn fail(&mut self, err: TransportError) {
        if self.closed.is_none() {
            self.closed = Some(err.clone());
        }
        if let Some(tx) = self.waiter.take() {
            let _ = tx.send(Err(err));
        }
    }
}

/// Evented connection to one peer.
pub struct TcpTransport {
    peer: SocketAddr,
    outbound: mpsc::UnboundedSender<Bytes>,
    slot: Arc<Mutex<Slot>>,
    tasks: [AbortHandle; 2],
}

impl TcpTransport {
    pub async fn connect(addr: SocketAddr, timeout: Duration) -> Result<Self, TransportError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Connect(format!("{addr}: timed out after {timeout:?}")))?
            .map_err(|e| TransportError::Connect(format!("{addr}: {e}")))?;
        stream.set_nodelay(true)?;
        Ok(Self::from_stream(stream, addr))
    }

    fn from_stream(stream: TcpStream, peer: SocketAddr) -> Self {
        let (reader, writer) = stream.into_split();
        let slot = Arc::new(Mutex::new(Slot::default()));
        let (outbound, queue) = mpsc::unbounded_channel();
        let body: SharedBuffer = Arc::new(Mutex::new(BytesMut::new()));

        let read_task = tokio::spawn(read_loop(reader, Arc::clone(&slot), body));
        let write_task = tokio::spawn(write_loop(writer, queue, Arc::clone(&slot)));
        tracing::debug!(%peer, "connected");

        Self {
            peer,
            outbound,
            slot,
            tasks: [read_task.abort_handle(), write_task.abort_handle()],
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

impl EventedTransport for TcpTransport {
    fn send(&mut self, bytes: Bytes) -> Result<(), TransportError> {
        if let Some(err) = &self.slot.lock().closed {
            return Err(err.clone());
        }
        self.outbound.send(bytes).map_err(|_| TransportError::Closed)
    }

    fn receive_next(&mut self) -> Inbound {
        let mut slot = self.slot.lock();
        if let Some(result) = slot.ready.pop_front() {
            return Inbound::Ready(result);
        }
        if let Some(err) = &slot.closed {
            return Inbound::Ready(Err(err.clone()));
        }
        let (tx, rx) = oneshot::channel();
        slot.waiter = Some(tx);
        Inbound::Pending(rx)
    }

    fn disconnect(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        self.slot.lock().fail(TransportError::Closed);
        tracing::debug!(peer = %self.peer, "disconnected");
    }

    fn is_connected(&self) -> bool {
        self.slot.lock().closed.is_none()
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn read_loop(mut reader: OwnedReadHalf, slot: Arc<Mutex<Slot>>, body: SharedBuffer) {
    let mut buf = BytesMut::with_capacity(8 * 1024);
    let mut decoder = ResponseDecoder::default();
    loop {
        match decoder.decode(&mut buf) {
            Ok(Some(message)) => {
                let response = message.into_response(&body);
                slot.lock().deliver(Ok(response));
                continue;
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(error = %err, "dropping connection on malformed response");
                slot.lock().fail(err);
                return;
            }
        }
        match reader.read_buf(&mut buf).await {
            Ok(0) => {
                match decoder.decode_eof(&mut buf) {
                    Ok(Some(message)) => {
                        let response = message.into_response(&body);
                        slot.lock().deliver(Ok(response));
                    }
                    Ok(None) => {}
                    Err(err) => {
                        slot.lock().fail(err);
                        return;
                    }
                }
                slot.lock().fail(TransportError::Closed);
                return;
            }
            Ok(_) => {}
            Err(err) => {
                slot.lock().fail(err.into());
                return;
            }
        }
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut queue: mpsc::UnboundedReceiver<Bytes>,
    slot: Arc<Mutex<Slot>>,
) {
    while let Some(bytes) = queue.recv().await {
        if let Err(err) = writer.write_all(&bytes).await {
            slot.lock().fail(err.into());
            return;
        }
    }
    let _ = writer.shutdown().await;
}

/// Opens evented connections to a fixed address.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: SocketAddr,
    timeout: Duration,
}

impl TcpConnector {
    pub fn new(addr: SocketAddr, timeout: Duration) -> Self {
        Self { addr, timeout }
    }
}

impl Connector for TcpConnector {
    fn connect(&self) -> ConnectFuture<'_> {
        Box::pin(async move {
            let transport = TcpTransport::connect(self.addr, self.timeout).await?;
            Ok(Transport::evented(transport))
        })
    }
}
