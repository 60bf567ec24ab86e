//! Correlation table for locally-issued requests
//!
//! Tracks every outstanding request by id and matches inbound responses and
//! error responses back to the callers that issued them. All mutation goes
//! through one mutex so concurrent issuers and the session read loop can
//! never double-resolve an id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::{oneshot, watch};
use tracing::warn;

use crate::error::{Error, Result};
use crate::rpc::progress::ProgressToken;
use crate::protocol::message::{RequestId, RpcError};

struct PendingEntry {
    method: String,
    issued_at: Instant,
    tx: oneshot::Sender<Result<Value>>,
    /// Progress token attached at issue time, if the caller opted in
    token: Option<ProgressToken>,
}

/// What was removed from the table when an entry left it; lets the session
/// detach any progress sink the request carried.
pub(crate) struct RemovedEntry {
    pub method: String,
    pub token: Option<ProgressToken>,
}

/// The caller's side of one outstanding request
pub struct PendingHandle {
    pub id: RequestId,
    rx: oneshot::Receiver<Result<Value>>,
}

impl PendingHandle {
    /// Wait for resolution. If the table is dropped without resolving (which
    /// only happens on teardown), the result is a connection-closed error.
    pub async fn wait(self) -> Result<Value> {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::ConnectionClosed(
                "session closed before the request resolved".to_string(),
            )),
        }
    }
}

/// Table of outstanding locally-issued requests
pub struct PendingRequests {
    inner: Mutex<HashMap<RequestId, PendingEntry>>,
    counter: AtomicI64,
    count_tx: watch::Sender<usize>,
    count_rx: watch::Receiver<usize>,
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingRequests {
    pub fn new() -> Self {
        let (count_tx, count_rx) = watch::channel(0);
        Self {
            inner: Mutex::new(HashMap::new()),
            counter: AtomicI64::new(1),
            count_tx,
            count_rx,
        }
    }

    /// Allocate the next sequential request id.
    pub fn next_id(&self) -> RequestId {
        RequestId::Number(self.counter.fetch_add(1, Ordering::Relaxed))
    }

    /// Track a new outstanding request. Fails if the id is already in
    /// flight; ids only become reusable once their request resolves.
    pub fn register(
        &self,
        id: RequestId,
        method: &str,
        token: Option<ProgressToken>,
    ) -> Result<PendingHandle> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock().expect("pending table lock poisoned");
        if inner.contains_key(&id) {
            return Err(Error::Protocol(format!(
                "duplicate request id {} is already outstanding",
                id
            )));
        }
        inner.insert(
            id.clone(),
            PendingEntry {
                method: method.to_string(),
                issued_at: Instant::now(),
                tx,
                token,
            },
        );
        let _ = self.count_tx.send(inner.len());
        Ok(PendingHandle { id, rx })
    }

    /// Complete the matching request exactly once. A stray resolution (an id
    /// that is unknown or already resolved) is logged and dropped; a peer may
    /// legitimately race a cancellation with its response.
    pub(crate) fn resolve(
        &self,
        id: &RequestId,
        outcome: std::result::Result<Value, RpcError>,
    ) -> Option<RemovedEntry> {
        let entry = self.remove(id);
        match entry {
            Some(entry) => {
                let removed = RemovedEntry {
                    method: entry.method,
                    token: entry.token,
                };
                let result = outcome.map_err(Error::Rpc);
                // The caller may have stopped waiting; that is not an error.
                let _ = entry.tx.send(result);
                Some(removed)
            }
            None => {
                warn!("dropping stray response for untracked request id {}", id);
                None
            }
        }
    }

    /// Cancel an outstanding request: the local waiter resolves with a
    /// cancellation error and the id leaves the table. Cancelling an id that
    /// already resolved is a no-op.
    pub(crate) fn cancel(&self, id: &RequestId) -> Option<RemovedEntry> {
        let entry = self.remove(id);
        entry.map(|entry| {
            let _ = entry.tx.send(Err(Error::Cancelled));
            RemovedEntry {
                method: entry.method,
                token: entry.token,
            }
        })
    }

    fn remove(&self, id: &RequestId) -> Option<PendingEntry> {
        let mut inner = self.inner.lock().expect("pending table lock poisoned");
        let entry = inner.remove(id);
        let _ = self.count_tx.send(inner.len());
        entry
    }

    /// Resolve every still-pending request with a connection-closed error.
    /// Called exactly once during session teardown.
    pub(crate) fn drain_on_close(&self) -> usize {
        let entries: Vec<PendingEntry> = {
            let mut inner = self.inner.lock().expect("pending table lock poisoned");
            let drained = inner.drain().map(|(_, entry)| entry).collect();
            let _ = self.count_tx.send(0);
            drained
        };
        let drained = entries.len();
        for entry in entries {
            warn!(
                method = %entry.method,
                waited_ms = entry.issued_at.elapsed().as_millis() as u64,
                "failing pending request: connection closed"
            );
            let _ = entry.tx.send(Err(Error::ConnectionClosed(
                "session closed with the request still pending".to_string(),
            )));
        }
        drained
    }

    /// Number of requests currently awaiting resolution.
    pub fn outstanding(&self) -> usize {
        self.inner.lock().expect("pending table lock poisoned").len()
    }

    /// Wait until nothing is outstanding, up to `timeout`. Returns true when
    /// the table emptied in time.
    pub async fn wait_empty(&self, timeout: std::time::Duration) -> bool {
        let mut rx = self.count_rx.clone();
        let wait = async {
            loop {
                if *rx.borrow() == 0 {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }
}
