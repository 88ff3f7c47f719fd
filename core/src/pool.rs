//! Fixed-size connection pool.
//!
//! # Design
//! A semaphore bounds the number of leases outstanding; `pop` suspends while
//! every permit is taken. Idle connections are reused last-in first-out and
//! new ones are opened lazily through the pool's `Connector`. A `Lease` owns
//! its connection outright, so two requests can never hold the same
//! connection at once. Pushing a lease back either parks the connection for
//! reuse or, if it was disconnected or discarded, drops it.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::TransportError;
use crate::transport::{Connector, Transport};

/// Exclusive use of one pooled connection.
pub struct Lease {
    id: u64,
    transport: Transport,
    reusable: bool,
    _permit: OwnedSemaphorePermit,
}

impl Lease {
    /// Pool-assigned connection id, stable across reuse.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn transport_mut(&mut self) -> &mut Transport {
        &mut self.transport
    }

    /// Close the underlying connection; it will not be pooled again.
    pub fn disconnect(&mut self) {
        self.transport.disconnect();
        self.reusable = false;
    }

    /// Mark the connection as unfit for reuse without closing it first.
    pub fn discard(&mut self) {
        self.reusable = false;
    }

    pub fn is_reusable(&self) -> bool {
        self.reusable && self.transport.is_connected()
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("id", &self.id)
            .field("mode", &self.transport.mode())
            .field("reusable", &self.reusable)
            .finish()
    }
}

/// Pool of connections to one host.
pub struct Pool {
    connector: Box<dyn Connector>,
    idle: Mutex<Vec<(u64, Transport)>>,
    permits: Arc<Semaphore>,
    size: usize,
    next_id: AtomicU64,
    timeout: Duration,
}

impl Pool {
    /// Pool of at most `size` connections whose requests default to
    /// `timeout`.
    pub fn new(connector: impl Connector, size: usize, timeout: Duration) -> Self {
        let size = size.max(1);
        Self {
            connector: Box::new(connector),
            idle: Mutex::new(Vec::with_capacity(size)),
            permits: Arc::new(Semaphore::new(size)),
            size,
            next_id: AtomicU64::new(0),
            timeout,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Default request timeout for this pool's host.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    /// Leases not currently handed out.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Take a connection, waiting while the pool is exhausted.
    pub async fn pop(&self) -> Result<Lease, TransportError> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| TransportError::Closed)?;

        loop {
            let idle = self.idle.lock().pop();
            match idle {
                Some((id, transport)) if transport.is_connected() => {
                    return Ok(Lease {
                        id,
                        transport,
                        reusable: true,
                        _permit: permit,
                    });
                }
                Some((id, _)) => tracing::debug!(conn = id, "evicting dead idle connection"),
                None => break,
            }
        }

        let transport = self.connector.connect().await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(conn = id, mode = ?transport.mode(), "opened connection");
        Ok(Lease {
            id,
            transport,
            reusable: true,
            _permit: permit,
        })
    }

    /// Return a lease. Connections that are closed or discarded are dropped.
    pub fn push(&self, lease: Lease) {
        let reusable = lease.is_reusable();
        let Lease {
            id,
            transport,
            _permit: permit,
            ..
        } = lease;
        if reusable {
            self.idle.lock().push((id, transport));
        } else {
            tracing::debug!(conn = id, "dropping connection");
        }
        // the permit is released only after the connection is parked
        drop(permit);
    }

    /// Refuse new leases and close every idle connection.
    pub fn close(&self) {
        self.permits.close();
        for (_, mut transport) in self.idle.lock().drain(..) {
            transport.disconnect();
        }
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("size", &self.size)
            .field("available", &self.available())
            .field("idle", &self.idle_count())
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::AtomicUsize;

    use bytes::Bytes;

    use super::*;
    use crate::transport::{ConnectFuture, EventedTransport, Inbound};

    /// Evented transport used only for pool bookkeeping.
    pub(crate) struct Silent {
        connected: bool,
    }

    impl EventedTransport for Silent {
        fn send(&mut self, _bytes: Bytes) -> Result<(), TransportError> {
            Ok(())
        }

        fn receive_next(&mut self) -> Inbound {
            Inbound::Ready(Err(TransportError::Closed))
        }

        fn disconnect(&mut self) {
            self.connected = false;
        }

        fn is_connected(&self) -> bool {
            self.connected
        }
    }

    #[derive(Default, Clone)]
    pub(crate) struct CountingConnector {
        pub(crate) opened: Arc<AtomicUsize>,
    }

    impl Connector for CountingConnector {
        fn connect(&self) -> ConnectFuture<'_> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(Transport::evented(Silent { connected: true })) })
        }
    }

    struct RefusingConnector;

    impl Connector for RefusingConnector {
        fn connect(&self) -> ConnectFuture<'_> {
            Box::pin(async { Err(TransportError::Connect("refused".into())) })
        }
    }

    #[tokio::test]
    async fn reuses_returned_connections() {
        let connector = CountingConnector::default();
        let pool = Pool::new(connector.clone(), 2, Duration::from_secs(1));

        let lease = pool.pop().await.unwrap();
        let id = lease.id();
        pool.push(lease);
        assert_eq!(pool.idle_count(), 1);

        let again = pool.pop().await.unwrap();
        assert_eq!(again.id(), id);
        assert_eq!(connector.opened.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disconnected_leases_are_not_pooled() {
        let pool = Pool::new(CountingConnector::default(), 1, Duration::from_secs(1));
        let mut lease = pool.pop().await.unwrap();
        lease.disconnect();
        pool.push(lease);
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.available(), 1);

        let mut lease = pool.pop().await.unwrap();
        lease.discard();
        pool.push(lease);
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn pop_waits_while_exhausted() {
        let pool = Arc::new(Pool::new(CountingConnector::default(), 1, Duration::from_secs(1)));
        let held = pool.pop().await.unwrap();
        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.pop().await.map(|l| l.id()) })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        let id = held.id();
        pool.push(held);
        assert_eq!(waiter.await.unwrap().unwrap(), id);
    }

    #[tokio::test]
    async fn connect_failure_releases_the_permit() {
        let pool = Pool::new(RefusingConnector, 1, Duration::from_secs(1));
        assert!(matches!(pool.pop().await, Err(TransportError::Connect(_))));
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn closed_pool_refuses_leases() {
        let pool = Pool::new(CountingConnector::default(), 1, Duration::from_secs(1));
        let lease = pool.pop().await.unwrap();
        pool.push(lease);
        pool.close();
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.pop().await.unwrap_err(), TransportError::Closed);
    }
}
