//! Asynchronous HTTP/1.1 request execution engine.
//!
//! # Overview
//! A caller describes a `Request` and executes it against an `HttpHost`. The
//! engine leases a pooled connection, renders the request, waits for the
//! reply in either evented or blocking mode, classifies it and hands back a
//! `Response` through a `ResponseFuture`. Every outcome, including timeouts
//! and transport faults, arrives as a `Response`; failures carry a
//! `ClientError` in `Response::exception`.
//!
//! # Design
//! - `request` renders straight into a byte buffer, patching a fixed-width
//!   `Content-Length` once the body is serialized.
//! - `formatter` holds the pluggable body codecs (JSON, urlencoded form).
//! - `pool` bounds concurrent connections per host; a `Lease` owns its
//!   connection exclusively.
//! - `gate` resolves each request exactly once, racing the pipeline against
//!   its timeout timer.
//! - `classify` maps codes to outcomes and releases every body buffer.
//! - `transport` has the connection traits plus TCP implementations for both
//!   modes and the HTTP/1.1 response decoder they share.
//!
//! ```no_run
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! use courier_core::{ClientConfig, HttpHost};
//! use serde_json::json;
//!
//! let host = HttpHost::from_config("127.0.0.1:3000", &ClientConfig::default())?;
//! let resp = host
//!     .post("/items")
//!     .body(json!({"name": "bolt", "quantity": 3}))
//!     .execute(&host)
//!     .await
//!     .into_result()?;
//! println!("{:?}", resp.json());
//! # Ok(())
//! # }
//! ```

mod classify;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod formatter;
pub mod gate;
pub mod health;
pub mod host;
pub mod http;
pub mod pool;
pub mod request;
pub mod response;
pub mod transport;

pub use config::ClientConfig;
pub use dispatch::{execute, ResponseFuture};
pub use error::{ClientError, ErrorClass, TransportError};
pub use formatter::{BodyFormatter, BodyType, FormUrlFormatter, JsonFormatter};
pub use gate::{CompletionGate, Resolution};
pub use health::{HealthSnapshot, HostHealth, RollingHealth};
pub use host::HttpHost;
pub use http::HttpMethod;
pub use pool::{Lease, Pool};
pub use request::{Request, RequestStatus};
pub use response::{BodyReader, DecodedBody, Response};
pub use transport::{Connector, Transport, TransportMode};
