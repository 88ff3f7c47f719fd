//! Transport collaborators.
//!
//! # Design
//! The engine supports two execution modes, chosen by the connection it is
//! handed rather than by subclassing: `Transport` is a tagged union and the
//! dispatcher matches on it at runtime.
//!
//! - `EventedTransport` is callback-driven. `receive_next` arms interest in
//!   the next inbound message *before* anything is sent, so a reply cannot
//!   slip past an unarmed listener. If a message is already parked on the
//!   connection the registration reports it as `Inbound::Ready`.
//! - `BlockingTransport` sends and reads synchronously; the dispatcher runs
//!   it on tokio's blocking pool.
//!
//! Transports report failures as `TransportError` values, never panics.

pub mod blocking;
pub mod h1;
pub mod tcp;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use serde::Deserialize;
use tokio::sync::oneshot;

use crate::error::TransportError;
use crate::response::Response;

pub use blocking::{BlockingTcpConnector, BlockingTcpTransport};
pub use tcp::{TcpConnector, TcpTransport};

/// Outcome of one receive, as delivered by a transport.
pub type Received = Result<Response, TransportError>;

/// Registration for the next inbound message.
#[derive(Debug)]
pub enum Inbound {
    /// A result was already available when interest was registered.
    Ready(Received),
    /// The result will arrive on this channel.
    Pending(oneshot::Receiver<Received>),
}

impl Inbound {
    pub fn is_ready(&self) -> bool {
        matches!(self, Inbound::Ready(_))
    }

    /// Wait for the registered message.
    pub async fn wait(self) -> Received {
        match self {
            Inbound::Ready(result) => result,
            Inbound::Pending(rx) => rx.await.unwrap_or(Err(TransportError::Closed)),
        }
    }
}

/// Callback-driven connection.
pub trait EventedTransport: Send {
    /// Queue rendered request bytes for transmission.
    fn send(&mut self, bytes: Bytes) -> Result<(), TransportError>;

    /// Register interest in the next inbound message.
    fn receive_next(&mut self) -> Inbound;

    fn disconnect(&mut self);

    fn is_connected(&self) -> bool;
}

/// Synchronous connection.
pub trait BlockingTransport: Send {
    /// Bound the reads and writes of the next exchange.
    fn set_io_timeout(&mut self, _timeout: Duration) -> Result<(), TransportError> {
        Ok(())
    }

    fn send_message(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Block until one full response has been read.
    fn receive_message(&mut self) -> Received;

    fn disconnect(&mut self);

    fn is_connected(&self) -> bool;
}

/// A pooled connection in one of the two execution modes.
pub enum Transport {
    Evented(Box<dyn EventedTransport>),
    Blocking(Box<dyn BlockingTransport>),
}

impl Transport {
    pub fn evented(transport: impl EventedTransport + 'static) -> Self {
        Transport::Evented(Box::new(transport))
    }

    pub fn blocking(transport: impl BlockingTransport + 'static) -> Self {
        Transport::Blocking(Box::new(transport))
    }

    pub fn mode(&self) -> TransportMode {
        match self {
            Transport::Evented(_) => TransportMode::Evented,
            Transport::Blocking(_) => TransportMode::Blocking,
        }
    }

    pub fn disconnect(&mut self) {
        match self {
            Transport::Evented(t) => t.disconnect(),
            Transport::Blocking(t) => t.disconnect(),
        }
    }

    pub fn is_connected(&self) -> bool {
        match self {
            Transport::Evented(t) => t.is_connected(),
            Transport::Blocking(t) => t.is_connected(),
        }
    }
}

/// Execution mode of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    #[default]
    Evented,
    Blocking,
}

pub type ConnectFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Transport, TransportError>> + Send + 'a>>;

/// Opens new connections for a pool.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self) -> ConnectFuture<'_>;
}
