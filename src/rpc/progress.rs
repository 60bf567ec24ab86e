//! Progress and cancellation plumbing
//!
//! [`ProgressBus`] routes inbound `notifications/progress` frames to the
//! sink of whichever local caller opted in with a progress token.
//! [`ActiveRequests`] tracks inbound requests this side is servicing, so the
//! peer's `notifications/cancelled` can reach running handlers and so at
//! most one response is ever sent per request id.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::protocol::message::RequestId;

/// Opaque token correlating a request with its progress notifications
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProgressToken {
    Number(i64),
    String(String),
}

impl ProgressToken {
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(ProgressToken::String(s.clone())),
            Value::Number(n) => n.as_i64().map(ProgressToken::Number),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            ProgressToken::Number(n) => Value::Number((*n).into()),
            ProgressToken::String(s) => Value::String(s.clone()),
        }
    }
}

impl From<&str> for ProgressToken {
    fn from(s: &str) -> Self {
        ProgressToken::String(s.to_string())
    }
}

impl std::fmt::Display for ProgressToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProgressToken::Number(n) => write!(f, "{}", n),
            ProgressToken::String(s) => write!(f, "{}", s),
        }
    }
}

/// Wire payload of `notifications/progress`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressParams {
    #[serde(rename = "progressToken")]
    pub token: ProgressToken,
    pub progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Wire payload of `notifications/cancelled`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelledParams {
    #[serde(rename = "requestId")]
    pub request_id: RequestId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// One caller-visible progress step
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub progress: f64,
    pub total: Option<f64>,
    pub message: Option<String>,
}

struct ProgressSink {
    tx: mpsc::Sender<ProgressUpdate>,
    last: f64,
}

/// Routes inbound progress notifications to caller sinks by token
#[derive(Default)]
pub struct ProgressBus {
    sinks: DashMap<ProgressToken, ProgressSink>,
}

impl ProgressBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate a token with a caller's sink. Tokens are valid only while
    /// their request is pending; a duplicate token is a sequencing bug.
    pub fn attach(&self, token: ProgressToken, tx: mpsc::Sender<ProgressUpdate>) -> Result<()> {
        use dashmap::mapref::entry::Entry;
        match self.sinks.entry(token) {
            Entry::Occupied(e) => Err(Error::Protocol(format!(
                "progress token {} is already in use",
                e.key()
            ))),
            Entry::Vacant(e) => {
                e.insert(ProgressSink {
                    tx,
                    last: f64::NEG_INFINITY,
                });
                Ok(())
            }
        }
    }

    /// Drop the association; further notifications for the token are ignored.
    pub fn detach(&self, token: &ProgressToken) {
        self.sinks.remove(token);
    }

    /// Forward one inbound progress notification. Unknown tokens are dropped
    /// without error, and progress values must increase per token.
    pub fn deliver(&self, params: ProgressParams) {
        let Some(mut sink) = self.sinks.get_mut(&params.token) else {
            debug!(token = %params.token, "ignoring progress for unknown token");
            return;
        };
        if params.progress <= sink.last {
            warn!(
                token = %params.token,
                progress = params.progress,
                "dropping non-increasing progress update"
            );
            return;
        }
        sink.last = params.progress;
        let update = ProgressUpdate {
            progress: params.progress,
            total: params.total,
            message: params.message,
        };
        // A slow consumer loses intermediate steps rather than stalling the
        // read loop.
        if sink.tx.try_send(update).is_err() {
            debug!(token = %params.token, "progress sink full or gone, update dropped");
        }
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

/// Cooperative cancellation state shared with a running handler
#[derive(Default)]
pub struct CancelState {
    cancelled: AtomicBool,
    reason: Mutex<Option<String>>,
}

impl CancelState {
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.lock().expect("cancel reason lock poisoned").clone()
    }

    fn cancel(&self, reason: Option<String>) {
        *self.reason.lock().expect("cancel reason lock poisoned") = reason;
        self.cancelled.store(true, Ordering::Release);
    }
}

/// Outcome of completing an inbound request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Normal completion; the response may be sent
    Send,
    /// The request was cancelled; a late response must be suppressed
    Suppress,
    /// The id was not being serviced (already completed)
    Untracked,
}

/// Registry of inbound requests currently being serviced
pub struct ActiveRequests {
    entries: DashMap<RequestId, Arc<CancelState>>,
    count_tx: watch::Sender<usize>,
    count_rx: watch::Receiver<usize>,
}

impl Default for ActiveRequests {
    fn default() -> Self {
        Self::new()
    }
}

impl ActiveRequests {
    pub fn new() -> Self {
        let (count_tx, count_rx) = watch::channel(0);
        Self {
            entries: DashMap::new(),
            count_tx,
            count_rx,
        }
    }

    /// Start servicing an inbound request. A duplicate id while the first is
    /// still in flight is a protocol violation by the peer.
    pub fn begin(&self, id: RequestId) -> Result<Arc<CancelState>> {
        use dashmap::mapref::entry::Entry;
        let state = match self.entries.entry(id) {
            Entry::Occupied(e) => {
                return Err(Error::Protocol(format!(
                    "request id {} is already being serviced",
                    e.key()
                )))
            }
            Entry::Vacant(e) => {
                let state = Arc::new(CancelState::default());
                e.insert(Arc::clone(&state));
                state
            }
        };
        self.publish_count();
        Ok(state)
    }

    /// Flag an in-flight request as cancelled. Returns false for ids that
    /// are not (or no longer) being serviced.
    pub fn cancel(&self, id: &RequestId, reason: Option<String>) -> bool {
        match self.entries.get(id) {
            Some(state) => {
                state.cancel(reason);
                true
            }
            None => false,
        }
    }

    /// Finish servicing a request and decide the response disposition.
    pub fn complete(&self, id: &RequestId) -> Completion {
        let removed = self.entries.remove(id);
        self.publish_count();
        match removed {
            Some((_, state)) if state.is_cancelled() => Completion::Suppress,
            Some(_) => Completion::Send,
            None => Completion::Untracked,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Wait until no inbound request is in flight, up to `timeout`.
    /// Returns true when idle was reached.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
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

    fn publish_count(&self) {
        let _ = self.count_tx.send(self.entries.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn progress_routes_to_the_attached_sink() {
        let bus = ProgressBus::new();
        let (tx, mut rx) = mpsc::channel(8);
        let token = ProgressToken::Number(1);
        bus.attach(token.clone(), tx).unwrap();

        bus.deliver(ProgressParams {
            token: token.clone(),
            progress: 0.25,
            total: Some(1.0),
            message: Some("reading".to_string()),
        });

        let update = rx.recv().await.unwrap();
        assert_eq!(update.progress, 0.25);
        assert_eq!(update.total, Some(1.0));

        bus.detach(&token);
        assert!(bus.is_empty());
    }

    #[tokio::test]
    async fn unknown_and_regressing_progress_is_dropped() {
        let bus = ProgressBus::new();
        let (tx, mut rx) = mpsc::channel(8);
        let token = ProgressToken::from("job");
        bus.attach(token.clone(), tx).unwrap();

        // Unknown token: no delivery, no error.
        bus.deliver(ProgressParams {
            token: ProgressToken::from("ghost"),
            progress: 0.9,
            total: None,
            message: None,
        });

        bus.deliver(ProgressParams {
            token: token.clone(),
            progress: 0.5,
            total: None,
            message: None,
        });
        // Regression is dropped.
        bus.deliver(ProgressParams {
            token: token.clone(),
            progress: 0.4,
            total: None,
            message: None,
        });
        bus.deliver(ProgressParams {
            token,
            progress: 0.6,
            total: None,
            message: None,
        });

        assert_eq!(rx.recv().await.unwrap().progress, 0.5);
        assert_eq!(rx.recv().await.unwrap().progress, 0.6);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn duplicate_progress_token_is_rejected() {
        let bus = ProgressBus::new();
        let (tx, _rx) = mpsc::channel(1);
        let (tx2, _rx2) = mpsc::channel(1);
        bus.attach(ProgressToken::Number(7), tx).unwrap();
        assert!(bus.attach(ProgressToken::Number(7), tx2).is_err());
    }

    #[test]
    fn token_wire_shapes() {
        assert_eq!(
            ProgressToken::from_value(&json!("t-1")),
            Some(ProgressToken::from("t-1"))
        );
        assert_eq!(
            ProgressToken::from_value(&json!(12)),
            Some(ProgressToken::Number(12))
        );
        assert_eq!(ProgressToken::from_value(&json!(true)), None);
    }

    #[tokio::test]
    async fn active_requests_enforce_one_response_per_id() {
        let active = ActiveRequests::new();
        let id = RequestId::Number(4);

        active.begin(id.clone()).unwrap();
        assert!(matches!(
            active.begin(id.clone()),
            Err(Error::Protocol(_))
        ));

        assert_eq!(active.complete(&id), Completion::Send);
        assert_eq!(active.complete(&id), Completion::Untracked);
    }

    #[tokio::test]
    async fn cancellation_suppresses_the_late_response() {
        let active = ActiveRequests::new();
        let id = RequestId::from("slow");
        let state = active.begin(id.clone()).unwrap();

        assert!(active.cancel(&id, Some("user abort".to_string())));
        assert!(state.is_cancelled());
        assert_eq!(state.reason().as_deref(), Some("user abort"));
        assert_eq!(active.complete(&id), Completion::Suppress);

        // Cancelling something that is not in flight reports false.
        assert!(!active.cancel(&RequestId::Number(99), None));
    }

    #[tokio::test]
    async fn wait_idle_observes_the_drain() {
        let active = Arc::new(ActiveRequests::new());
        let id = RequestId::Number(1);
        active.begin(id.clone()).unwrap();

        let waiter = {
            let active = Arc::clone(&active);
            tokio::spawn(async move { active.wait_idle(Duration::from_secs(1)).await })
        };
        tokio::task::yield_now().await;
        active.complete(&id);
        assert!(waiter.await.unwrap());

        // Idle times out when work never finishes.
        active.begin(RequestId::Number(2)).unwrap();
        assert!(!active.wait_idle(Duration::from_millis(20)).await);
    }
}
