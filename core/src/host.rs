//! One remote host: its connection pool, health and request helpers.

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use crate::config::ClientConfig;
use crate::dispatch::{self, ResponseFuture};
use crate::error::TransportError;
use crate::health::{HealthSnapshot, HostHealth, RollingHealth};
use crate::http::HttpMethod;
use crate::pool::Pool;
use crate::request::Request;
use crate::transport::{BlockingTcpConnector, TcpConnector, TransportMode};

struct HostInner {
    authority: String,
    pool: Pool,
    health: Arc<dyn HostHealth>,
    rolling: Option<Arc<RollingHealth>>,
}

/// Handle to a host. Clones share the pool and health counters.
#[derive(Clone)]
pub struct HttpHost {
    inner: Arc<HostInner>,
}

impl HttpHost {
    /// Host reached through `pool`, tracked with a default `RollingHealth`.
    ///
    /// `authority` is sent as the `Host` header of requests built here.
    pub fn new(authority: impl Into<String>, pool: Pool) -> Self {
        Self::with_rolling(authority, pool, Arc::new(RollingHealth::default()))
    }

    fn with_rolling(authority: impl Into<String>, pool: Pool, rolling: Arc<RollingHealth>) -> Self {
        Self {
            inner: Arc::new(HostInner {
                authority: authority.into(),
                pool,
                health: rolling.clone(),
                rolling: Some(rolling),
            }),
        }
    }

    /// Host reporting outcomes to a caller-supplied health sink.
    pub fn with_health(
        authority: impl Into<String>,
        pool: Pool,
        health: Arc<dyn HostHealth>,
    ) -> Self {
        Self {
            inner: Arc::new(HostInner {
                authority: authority.into(),
                pool,
                health,
                rolling: None,
            }),
        }
    }

    /// Resolve `authority` (`host:port`) and build a TCP-backed host
    /// configured by `config`.
    pub fn from_config(authority: &str, config: &ClientConfig) -> Result<Self, TransportError> {
        let addr = resolve(authority)?;
        let pool = match config.mode {
            TransportMode::Evented => Pool::new(
                TcpConnector::new(addr, config.connect_timeout()),
                config.max_connections,
                config.request_timeout(),
            ),
            TransportMode::Blocking => Pool::new(
                BlockingTcpConnector::new(addr, config.connect_timeout()),
                config.max_connections,
                config.request_timeout(),
            ),
        };
        tracing::debug!(%addr, mode = ?config.mode, size = config.max_connections, "host configured");
        let health = Arc::new(RollingHealth::new(config.health_window));
        Ok(Self::with_rolling(authority, pool, health))
    }

    pub fn authority(&self) -> &str {
        &self.inner.authority
    }

    pub fn pool(&self) -> &Pool {
        &self.inner.pool
    }

    pub fn health(&self) -> Arc<dyn HostHealth> {
        Arc::clone(&self.inner.health)
    }

    /// Counters of the built-in `RollingHealth`, if this host uses one.
    pub fn snapshot(&self) -> Option<HealthSnapshot> {
        self.inner.rolling.as_ref().map(|rolling| rolling.snapshot())
    }

    /// A request for `path` carrying this host's `Host` header.
    pub fn request(&self, method: HttpMethod, path: impl Into<String>) -> Request {
        Request::new(method, path).header("Host", self.inner.authority.as_str())
    }

    pub fn get(&self, path: impl Into<String>) -> Request {
        self.request(HttpMethod::Get, path)
    }

    pub fn post(&self, path: impl Into<String>) -> Request {
        self.request(HttpMethod::Post, path)
    }

    pub fn put(&self, path: impl Into<String>) -> Request {
        self.request(HttpMethod::Put, path)
    }

    pub fn delete(&self, path: impl Into<String>) -> Request {
        self.request(HttpMethod::Delete, path)
    }

    /// Execute `request` on this host.
    pub fn execute(&self, request: Request) -> ResponseFuture {
        dispatch::execute(request, self)
    }

    /// Close the pool; pending and later requests fail with a closed
    /// transport.
    pub fn close(&self) {
        self.inner.pool.close();
    }
}

impl Request {
    /// Execute this request on `host`.
    pub fn execute(self, host: &HttpHost) -> ResponseFuture {
        dispatch::execute(self, host)
    }
}

impl fmt::Debug for HttpHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpHost")
            .field("authority", &self.inner.authority)
            .field("pool", &self.inner.pool)
            .finish()
    }
}

fn resolve(authority: &str) -> Result<SocketAddr, TransportError> {
    authority
        .to_socket_addrs()
        .map_err(|e| TransportError::Connect(format!("{authority}: {e}")))?
        .next()
        .ok_or_else(|| TransportError::Connect(format!("{authority}: no address")))
}
