//! Single-resolution completion gate.
//!
//! # Design
//! A gate binds one request to one response. Two parties race to resolve
//! it: the dispatch pipeline with the real (or failed) response, and a timer
//! armed for the request's timeout. An atomic flag decides the winner; the
//! loser's response is dropped, which also releases any body buffer it
//! still holds.
//!
//! The winner alone settles the request's terminal status and records the
//! outcome on host health, so both always describe the response the caller
//! actually receives. Only then is the response delivered, from a freshly
//! spawned task: resolving never runs the caller's continuation inline, so
//! chains of gates cannot grow the resolver's call stack.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{oneshot, Notify};
use tokio::task::AbortHandle;

use crate::error::ClientError;
use crate::health::HostHealth;
use crate::request::{RequestStatus, StatusCell};
use crate::response::Response;

/// Which party resolved a gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The dispatch pipeline delivered a response.
    Transport,
    /// The timeout timer fired first.
    Timer,
}

struct GateInner {
    resolved: AtomicBool,
    sender: Mutex<Option<oneshot::Sender<Response>>>,
    timer: Mutex<Option<AbortHandle>>,
    notify: Notify,
    status: Arc<StatusCell>,
    health: Option<Arc<dyn HostHealth>>,
    runtime: Handle,
}

/// Cheaply cloneable handle to one gate.
#[derive(Clone)]
pub struct CompletionGate {
    inner: Arc<GateInner>,
}

impl CompletionGate {
    /// Create a gate and the receiver its winning response is delivered to.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        status: Arc<StatusCell>,
        health: Option<Arc<dyn HostHealth>>,
    ) -> (Self, oneshot::Receiver<Response>) {
        let (tx, rx) = oneshot::channel();
        let gate = Self {
            inner: Arc::new(GateInner {
                resolved: AtomicBool::new(false),
                sender: Mutex::new(Some(tx)),
                timer: Mutex::new(None),
                notify: Notify::new(),
                status,
                health,
                runtime: Handle::current(),
            }),
        };
        (gate, rx)
    }

    /// Arm the timer. When it fires it resolves the gate with a synthetic
    /// 408 response, unless something else got there first.
    pub fn arm(&self, timeout: Duration) {
        if self.is_resolved() {
            return;
        }
        let gate = self.clone();
        let task = self.inner.runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            if gate.resolve(Resolution::Timer, Response::timeout()) {
                tracing::warn!(timeout_ms = timeout.as_millis() as u64, "request timed out");
            }
        });
        if let Some(previous) = self.inner.timer.lock().replace(task.abort_handle()) {
            previous.abort();
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.inner.resolved.load(Ordering::Acquire)
    }

    /// Offer `response` as the gate's outcome. Returns `true` if this call
    /// won; every later call is a no-op returning `false`.
    pub fn resolve(&self, source: Resolution, response: Response) -> bool {
        if self.inner.resolved.swap(true, Ordering::AcqRel) {
            tracing::trace!(?source, "gate already resolved, dropping response");
            return false;
        }
        if source != Resolution::Timer {
            if let Some(timer) = self.inner.timer.lock().take() {
                timer.abort();
            }
        }

        self.inner.status.advance(terminal_status(source, &response));
        if let Some(health) = &self.inner.health {
            match response.exception() {
                None => health.record_success(),
                Some(err) => health.record_failure(err.class()),
            }
        }
        self.inner.notify.notify_waiters();

        if let Some(tx) = self.inner.sender.lock().take() {
            self.inner.runtime.spawn(async move {
                // the caller may have dropped its future
                let _ = tx.send(response);
            });
        }
        true
    }

    /// Wait until the gate is resolved by anyone.
    pub async fn resolved(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_resolved() {
            return;
        }
        notified.await;
    }
}

/// A response the server answered, successfully or not, completes the
/// request; timeouts and local or transport faults end it in `Error`.
fn terminal_status(source: Resolution, response: &Response) -> RequestStatus {
    match (source, response.exception()) {
        (Resolution::Timer, _) => RequestStatus::Error,
        (_, None) | (_, Some(ClientError::Status { .. })) => RequestStatus::Completed,
        (_, Some(_)) => RequestStatus::Error,
    }
}
