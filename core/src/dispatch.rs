//! Request execution pipeline.
//!
//! # Design
//! `execute` returns immediately with a `ResponseFuture`; the work runs on a
//! spawned task:
//!
//! 1. lease a connection from the host's pool, waiting if it is exhausted
//! 2. render the request
//! 3. evented connections register for the next inbound message first and
//!    only transmit if nothing was already waiting; blocking connections
//!    send and read on tokio's blocking pool
//! 4. classify the response, releasing its body buffer
//! 5. return the lease to the pool and resolve the request's gate
//!
//! Every fault is turned into a response carrying an exception, so the
//! future always completes with a `Response`. The gate's timer races the
//! pipeline; if it wins, an evented wait is abandoned and its connection is
//! discarded, since a late reply would otherwise be read by the next request.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::classify::classify;
use crate::error::{ClientError, TransportError};
use crate::gate::{CompletionGate, Resolution};
use crate::host::HttpHost;
use crate::pool::Lease;
use crate::request::{Request, RequestStatus, StatusCell};
use crate::response::Response;
use crate::transport::{EventedTransport, Inbound, Received, Transport};

/// Pending result of one execution.
///
/// Always resolves to a `Response`; failures are reported through
/// `Response::exception`.
#[derive(Debug)]
pub struct ResponseFuture {
    rx: oneshot::Receiver<Response>,
    status: Arc<StatusCell>,
}

impl ResponseFuture {
    /// Current lifecycle status of the request.
    pub fn status(&self) -> RequestStatus {
        self.status.get()
    }
}

impl Future for ResponseFuture {
    type Output = Response;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Response> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|delivered| delivered.unwrap_or_else(|_| Response::failed(ClientError::Dropped)))
    }
}

/// Start executing `request` against `host`.
///
/// Must be called from within a tokio runtime.
pub fn execute(request: Request, host: &HttpHost) -> ResponseFuture {
    let status = request.status_cell();
    let timeout = request
        .timeout_override()
        .unwrap_or_else(|| host.pool().timeout());
    let (gate, rx) = CompletionGate::new(Arc::clone(&status), Some(host.health()));
    gate.arm(timeout);
    tokio::spawn(run(request, host.clone(), gate, timeout));
    ResponseFuture { rx, status }
}

/// Outcome of one attempt. `Ok(None)` means the gate was resolved by the
/// timer and the attempt was abandoned.
type Attempt = Result<Option<Response>, ClientError>;

async fn run(request: Request, host: HttpHost, gate: CompletionGate, timeout: Duration) {
    debug!(method = %request.method(), url = request.url(), "executing request");

    let acquired = tokio::select! {
        biased;
        leased = host.pool().pop() => Some(leased),
        _ = gate.resolved() => None,
    };
    let (lease, attempt) = match acquired {
        Some(Ok(lease)) => transmit(&request, &gate, lease, timeout).await,
        Some(Err(err)) => (None, Err(err.into())),
        None => (None, Ok(None)),
    };
    if let Some(lease) = lease {
        host.pool().push(lease);
    }

    let response = match attempt {
        Ok(Some(response)) => response,
        Ok(None) => {
            debug!(url = request.url(), "abandoned after timeout");
            return;
        }
        Err(err) => {
            warn!(method = %request.method(), url = request.url(), error = %err, "request failed");
            Response::failed(err)
        }
    };
    if !gate.resolve(Resolution::Transport, response) {
        debug!(url = request.url(), "response arrived after timeout");
    }
}

/// Drive one exchange on `lease`. The lease is handed back unless it was
/// lost to a panicked blocking task.
async fn transmit(
    request: &Request,
    gate: &CompletionGate,
    mut lease: Lease,
    timeout: Duration,
) -> (Option<Lease>, Attempt) {
    let status = request.status_cell();
    let bytes = match request.encode() {
        Ok(bytes) => bytes,
        Err(err) => return (Some(lease), Err(err)),
    };

    let armed = match lease.transport_mut() {
        Transport::Evented(conn) => Some(arm_and_send(&mut **conn, bytes.clone(), &status)),
        Transport::Blocking(_) => None,
    };

    let received = match armed {
        Some(Ok(inbound)) => {
            tokio::select! {
                received = inbound.wait() => received,
                _ = gate.resolved() => {
                    lease.discard();
                    return (Some(lease), Ok(None));
                }
            }
        }
        Some(Err(err)) => Err(err),
        None => {
            let joined = tokio::task::spawn_blocking(move || {
                let received = send_and_read(&mut lease, &bytes, &status, timeout);
                (lease, received)
            })
            .await;
            match joined {
                Ok((returned, received)) => {
                    lease = returned;
                    received
                }
                Err(err) => {
                    let err = TransportError::Io {
                        kind: std::io::ErrorKind::Other,
                        message: err.to_string(),
                    };
                    return (None, Err(err.into()));
                }
            }
        }
    };

    let response = match received {
        Ok(response) => response,
        Err(err) => {
            debug!(conn = lease.id(), error = %err, "transport failed, discarding connection");
            lease.discard();
            return (Some(lease), Err(err.into()));
        }
    };
    request.status_cell().advance(RequestStatus::Received);

    match classify(request, response, &mut lease) {
        Ok(response) => (Some(lease), Ok(Some(response))),
        Err(err) => {
            if matches!(err, ClientError::InvalidStatus(_)) {
                lease.discard();
            }
            (Some(lease), Err(err))
        }
    }
}

/// Register for the next message, then transmit unless a message was
/// already waiting.
fn arm_and_send(
    conn: &mut dyn EventedTransport,
    bytes: Bytes,
    status: &StatusCell,
) -> Result<Inbound, TransportError> {
    let inbound = conn.receive_next();
    if inbound.is_ready() {
        debug!("message already pending, skipping send");
        return Ok(inbound);
    }
    conn.send(bytes)?;
    status.advance(RequestStatus::SendCompleted);
    Ok(inbound)
}

fn send_and_read(
    lease: &mut Lease,
    bytes: &[u8],
    status: &StatusCell,
    timeout: Duration,
) -> Received {
    let Transport::Blocking(conn) = lease.transport_mut() else {
        return Err(TransportError::Closed);
    };
    conn.set_io_timeout(timeout)?;
    conn.send_message(bytes)?;
    status.advance(RequestStatus::SendCompleted);
    conn.receive_message()
}

#[cfg(test)]
mod tests {
    use std::collections::{HashSet, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use bytes::BytesMut;
    use parking_lot::Mutex;
    use serde::Deserialize;
    use serde_json::json;

    use super::*;
    use crate::error::ErrorClass;
    use crate::formatter::BodyType;
    use crate::pool::Pool;
    use crate::response::{BodyReader, ResponseHead, SharedBuffer};
    use crate::transport::{BlockingTransport, ConnectFuture, Connector};

    #[derive(Debug, Deserialize, PartialEq)]
    struct Item {
        name: String,
    }

    /// A canned reply: status code, body, keep-alive.
    #[derive(Clone)]
    struct Reply(&'static str, &'static str, bool);

    impl Reply {
        fn into_response(self, buffer: &SharedBuffer) -> Response {
            let Reply(code, body, keep_alive) = self;
            buffer.lock().extend_from_slice(body.as_bytes());
            let head = ResponseHead {
                code: code.into(),
                message: String::new(),
                headers: Vec::new(),
                length: body.len(),
                chunked: false,
                keep_alive,
            };
            let reader = BodyReader::new(Arc::clone(buffer), body.len(), false);
            Response::from_head(head, Some(reader))
        }
    }

    #[derive(Default)]
    struct Script {
        replies: Mutex<VecDeque<Result<Reply, TransportError>>>,
        sent: Mutex<Vec<Bytes>>,
        delay: Option<Duration>,
        /// A reply already parked on the connection before the first send.
        parked: Mutex<Option<Reply>>,
        opened: AtomicUsize,
        in_use: Mutex<HashSet<u64>>,
        overlaps: AtomicUsize,
        io_timeouts: Mutex<Vec<Duration>>,
    }

    impl Script {
        fn replying(replies: impl IntoIterator<Item = Reply>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into_iter().map(Ok).collect()),
                ..Self::default()
            })
        }

        fn next(&self) -> Result<Reply, TransportError> {
            self.replies.lock().pop_front().unwrap_or(Err(TransportError::Closed))
        }
    }

    struct Scripted {
        id: u64,
        script: Arc<Script>,
        buffer: SharedBuffer,
        pending: Option<oneshot::Sender<Received>>,
        connected: bool,
    }

    impl Scripted {
        fn new(script: Arc<Script>) -> Self {
            let id = script.opened.fetch_add(1, Ordering::SeqCst) as u64;
            Self {
                id,
                script,
                buffer: Arc::new(Mutex::new(BytesMut::new())),
                pending: None,
                connected: true,
            }
        }

        fn enter(&self) {
            if !self.script.in_use.lock().insert(self.id) {
                self.script.overlaps.fetch_add(1, Ordering::SeqCst);
            }
        }

        fn leave(&self) {
            self.script.in_use.lock().remove(&self.id);
        }
    }

    impl EventedTransport for Scripted {
        fn send(&mut self, bytes: Bytes) -> Result<(), TransportError> {
            self.enter();
            self.script.sent.lock().push(bytes);
            let Some(tx) = self.pending.take() else {
                return Err(TransportError::Closed);
            };
            let reply = self.script.next();
            let buffer = Arc::clone(&self.buffer);
            let delay = self.script.delay;
            let script = Arc::clone(&self.script);
            let id = self.id;
            tokio::spawn(async move {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                script.in_use.lock().remove(&id);
                let _ = tx.send(reply.map(|r| r.into_response(&buffer)));
            });
            Ok(())
        }

        fn receive_next(&mut self) -> Inbound {
            if let Some(reply) = self.script.parked.lock().take() {
                return Inbound::Ready(Ok(reply.into_response(&self.buffer)));
            }
            let (tx, rx) = oneshot::channel();
            self.pending = Some(tx);
            Inbound::Pending(rx)
        }

        fn disconnect(&mut self) {
            self.connected = false;
        }

        fn is_connected(&self) -> bool {
            self.connected
        }
    }

    impl BlockingTransport for Scripted {
        fn set_io_timeout(&mut self, timeout: Duration) -> Result<(), TransportError> {
            self.script.io_timeouts.lock().push(timeout);
            Ok(())
        }

        fn send_message(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
            self.enter();
            self.script.sent.lock().push(Bytes::copy_from_slice(bytes));
            Ok(())
        }

        fn receive_message(&mut self) -> Received {
            if let Some(delay) = self.script.delay {
                std::thread::sleep(delay);
            }
            self.leave();
            self.script.next().map(|r| r.into_response(&self.buffer))
        }

        fn disconnect(&mut self) {
            self.connected = false;
        }

        fn is_connected(&self) -> bool {
            self.connected
        }
    }

    struct ScriptConnector {
        script: Arc<Script>,
        blocking: bool,
    }

    impl Connector for ScriptConnector {
        fn connect(&self) -> ConnectFuture<'_> {
            let conn = Scripted::new(Arc::clone(&self.script));
            let transport = if self.blocking {
                Transport::blocking(conn)
            } else {
                Transport::evented(conn)
            };
            Box::pin(async move { Ok(transport) })
        }
    }

    fn host(script: &Arc<Script>, blocking: bool, size: usize, timeout: Duration) -> HttpHost {
        let connector = ScriptConnector {
            script: Arc::clone(script),
            blocking,
        };
        HttpHost::new("example.com", Pool::new(connector, size, timeout))
    }

    #[tokio::test]
    async fn evented_success_decodes_and_completes() {
        let script = Script::replying([Reply("200", r#"{"name":"bolt"}"#, true)]);
        let host = host(&script, false, 1, Duration::from_secs(5));

        let future = execute(
            host.get("/items/1").expect(BodyType::of::<Item>()),
            &host,
        );
        let resp = future.await;
        assert!(resp.exception().is_none(), "{:?}", resp.exception());
        assert_eq!(resp.body_as::<Item>(), Some(&Item { name: "bolt".into() }));

        let sent = script.sent.lock();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].starts_with(b"GET /items/1 HTTP/1.1\r\nHost: example.com\r\n"));
        assert_eq!(host.pool().idle_count(), 1);
        assert_eq!(host.snapshot().map(|s| s.successes), Some(1));
    }

    #[tokio::test]
    async fn status_is_terminal_once_the_future_resolves() {
        let script = Script::replying([Reply("404", "item not found", true)]);
        let host = host(&script, false, 1, Duration::from_secs(5));
        let request = host.get("/items/9");
        let future = execute(request.clone(), &host);

        let resp = future.await;
        assert_eq!(request.status(), RequestStatus::Completed);
        assert!(matches!(
            resp.exception(),
            Some(ClientError::Status { code: 404, body }) if body == "item not found"
        ));
        let snap = host.snapshot().unwrap();
        assert_eq!(snap.failures, 1);
        assert_eq!(snap.last_error, Some(ErrorClass::Status(404)));
    }

    #[tokio::test]
    async fn ready_message_skips_send() {
        let script = Arc::new(Script {
            parked: Mutex::new(Some(Reply("200", r#"{"name":"early"}"#, true))),
            ..Script::default()
        });
        let host = host(&script, false, 1, Duration::from_secs(5));
        let request = host.get("/").expect(BodyType::of::<Item>());

        let resp = execute(request.clone(), &host).await;
        assert_eq!(resp.body_as::<Item>().map(|i| i.name.as_str()), Some("early"));
        assert!(script.sent.lock().is_empty());
        // never transmitted, so the status skipped SendCompleted
        assert_eq!(request.status(), RequestStatus::Completed);
    }

    #[tokio::test]
    async fn blocking_mode_round_trip() {
        let script = Script::replying([Reply("200", r#"{"name":"nut"}"#, true)]);
        let host = host(&script, true, 1, Duration::from_secs(5));
        // two fields, so the JSON formatter does not unwrap the object
        let body = json!({"name": "nut", "quantity": 2});

        let request = host.post("/items").body(body).expect(BodyType::of::<Item>());
        let resp = execute(request.clone(), &host).await;
        assert_eq!(resp.body_as::<Item>(), Some(&Item { name: "nut".into() }));
        assert_eq!(request.status(), RequestStatus::Completed);

        let sent = script.sent.lock();
        let raw = std::str::from_utf8(&sent[0]).unwrap();
        assert!(raw.starts_with("POST /items HTTP/1.1\r\n"));
        assert!(raw.ends_with(r#"{"name":"nut","quantity":2}"#));
        assert_eq!(host.pool().idle_count(), 1);
    }

    #[tokio::test]
    async fn blocking_exchange_uses_the_effective_timeout() {
        let script = Script::replying([
            Reply("200", r#"{"a":1,"b":2}"#, true),
            Reply("200", r#"{"a":1,"b":2}"#, true),
        ]);
        let host = host(&script, true, 1, Duration::from_millis(100));

        let resp = execute(host.get("/").timeout(Duration::from_secs(3)), &host).await;
        assert!(resp.exception().is_none(), "{:?}", resp.exception());
        let resp = execute(host.get("/"), &host).await;
        assert!(resp.exception().is_none(), "{:?}", resp.exception());

        assert_eq!(
            *script.io_timeouts.lock(),
            vec![Duration::from_secs(3), Duration::from_millis(100)]
        );
    }

    #[tokio::test]
    async fn transport_error_becomes_failed_response() {
        let script = Arc::new(Script {
            replies: Mutex::new(VecDeque::from([Err(TransportError::Parse("garbage".into()))])),
            ..Script::default()
        });
        let host = host(&script, false, 1, Duration::from_secs(5));
        let request = host.get("/");

        let resp = execute(request.clone(), &host).await;
        assert!(matches!(
            resp.exception(),
            Some(ClientError::Transport(TransportError::Parse(_)))
        ));
        assert_eq!(request.status(), RequestStatus::Error);
        // the connection is out of sync and was not pooled
        assert_eq!(host.pool().idle_count(), 0);
        assert_eq!(host.pool().available(), 1);
        assert_eq!(host.snapshot().unwrap().last_error, Some(ErrorClass::Protocol));
    }

    #[tokio::test]
    async fn timeout_beats_slow_response_and_discards_connection() {
        let script = Arc::new(Script {
            replies: Mutex::new(VecDeque::from([Ok(Reply("200", "{}", true))])),
            delay: Some(Duration::from_millis(300)),
            ..Script::default()
        });
        let host = host(&script, false, 1, Duration::from_secs(5));
        let request = host.get("/slow").timeout(Duration::from_millis(30));

        let resp = execute(request.clone(), &host).await;
        assert_eq!(resp.code(), "408");
        assert_eq!(resp.message(), "Request timeout");
        assert!(resp.exception().is_some_and(ClientError::is_timeout));
        assert_eq!(request.status(), RequestStatus::Error);

        // the pipeline gives its lease back without pooling it
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(host.pool().idle_count(), 0);
        assert_eq!(host.pool().available(), 1);
        assert_eq!(host.snapshot().unwrap().last_error, Some(ErrorClass::Timeout));
    }

    #[tokio::test]
    async fn fast_response_beats_timeout() {
        let script = Script::replying([Reply("200", "{}", true)]);
        let host = host(&script, true, 1, Duration::from_millis(500));

        let resp = execute(host.get("/"), &host).await;
        assert_eq!(resp.code(), "200");
        assert!(resp.exception().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_requests_never_share_a_connection() {
        const REQUESTS: usize = 24;
        const POOL: usize = 3;
        for blocking in [false, true] {
            let script = Arc::new(Script {
                replies: Mutex::new((0..REQUESTS).map(|_| Ok(Reply("200", "{}", true))).collect()),
                delay: Some(Duration::from_millis(5)),
                ..Script::default()
            });
            let host = host(&script, blocking, POOL, Duration::from_secs(10));

            let futures: Vec<_> = (0..REQUESTS)
                .map(|i| execute(host.get(format!("/n/{i}")), &host))
                .collect();
            for future in futures {
                let resp = future.await;
                assert!(resp.exception().is_none(), "{:?}", resp.exception());
            }

            assert_eq!(script.overlaps.load(Ordering::SeqCst), 0);
            assert!(script.opened.load(Ordering::SeqCst) <= POOL);
            assert_eq!(script.sent.lock().len(), REQUESTS);
            assert_eq!(host.snapshot().unwrap().successes, REQUESTS as u64);
        }
    }

    #[tokio::test]
    async fn connection_close_is_not_reused() {
        let script = Script::replying([Reply("200", "{}", false), Reply("200", "{}", true)]);
        let host = host(&script, false, 1, Duration::from_secs(5));

        assert!(execute(host.get("/a"), &host).await.exception().is_none());
        assert!(execute(host.get("/b"), &host).await.exception().is_none());
        assert_eq!(script.opened.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn dropped_future_does_not_leak_the_lease() {
        let script = Script::replying([Reply("200", "{}", true)]);
        let host = host(&script, false, 1, Duration::from_secs(5));

        drop(execute(host.get("/"), &host));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(host.pool().available(), 1);
        assert_eq!(host.pool().idle_count(), 1);
    }
}
