//! HTTP client transport
//!
//! Client-to-server messages travel as individual POST bodies to the session
//! endpoint; server-to-client messages arrive on a long-lived event-stream
//! GET against the same endpoint. Session identity lives in the
//! `Mcp-Session-Id` token, not in any one connection: the push stream may
//! drop and reconnect (with `Last-Event-ID` for replay) without the session
//! noticing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::transport::Transport;

/// Session token header, issued by the server on initialize
pub const SESSION_HEADER: &str = "Mcp-Session-Id";

/// Resume header carried when re-establishing the push stream
pub const LAST_EVENT_ID_HEADER: &str = "Last-Event-ID";

/// One parsed event-stream frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub id: Option<String>,
    pub event: Option<String>,
    pub data: String,
}

/// Incremental event-stream parser.
///
/// Fed arbitrary byte chunks, yields complete events at blank-line
/// boundaries. Comment lines and unknown fields are ignored.
#[derive(Default)]
pub struct SseDecoder {
    buffer: String,
    id: Option<String>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();

        while let Some(newline) = self.buffer.find('\n') {
            let mut line = self.buffer[..newline].to_string();
            self.buffer.drain(..=newline);
            if line.ends_with('\r') {
                line.pop();
            }

            if line.is_empty() {
                if !self.data.is_empty() {
                    events.push(SseEvent {
                        id: self.id.clone(),
                        event: self.event.take(),
                        data: self.data.join("\n"),
                    });
                    self.data.clear();
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line.as_str(), ""),
            };
            match field {
                "data" => self.data.push(value.to_string()),
                "id" => self.id = Some(value.to_string()),
                "event" => self.event = Some(value.to_string()),
                _ => {}
            }
        }
        events
    }

    /// The most recent event id seen, for resume bookkeeping.
    pub fn last_id(&self) -> Option<&str> {
        self.id.as_deref()
    }
}

struct ListenerState {
    client: reqwest::Client,
    endpoint: String,
    token: Arc<Mutex<Option<String>>>,
    last_event_id: Arc<Mutex<Option<String>>>,
    inbound: mpsc::UnboundedSender<Result<String>>,
    closed: Arc<AtomicBool>,
}

/// HTTP POST + event-stream transport, client side
pub struct HttpClientTransport {
    client: reqwest::Client,
    endpoint: String,
    token: Arc<Mutex<Option<String>>>,
    last_event_id: Arc<Mutex<Option<String>>>,
    inbound_tx: mpsc::UnboundedSender<Result<String>>,
    inbound_rx: mpsc::UnboundedReceiver<Result<String>>,
    listener: Option<JoinHandle<()>>,
    closed: Arc<AtomicBool>,
}

impl HttpClientTransport {
    /// Create a transport against a session endpoint, e.g.
    /// `http://127.0.0.1:8900/rpc`.
    pub fn new(endpoint: &str) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.to_string(),
            token: Arc::new(Mutex::new(None)),
            last_event_id: Arc::new(Mutex::new(None)),
            inbound_tx,
            inbound_rx,
            listener: None,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The session token, once the server issued one.
    pub fn session_token(&self) -> Option<String> {
        self.token.lock().expect("token lock poisoned").clone()
    }

    fn ensure_listener(&mut self) {
        if self.listener.is_some() || self.session_token().is_none() {
            return;
        }
        let state = ListenerState {
            client: self.client.clone(),
            endpoint: self.endpoint.clone(),
            token: Arc::clone(&self.token),
            last_event_id: Arc::clone(&self.last_event_id),
            inbound: self.inbound_tx.clone(),
            closed: Arc::clone(&self.closed),
        };
        self.listener = Some(tokio::spawn(run_listener(state)));
    }
}

/// Run one POST to completion: capture the session token, surface rejection
/// statuses, and hand back the response body when the server returned one.
async fn dispatch_post(
    request: reqwest::RequestBuilder,
    token_slot: &Arc<Mutex<Option<String>>>,
) -> Result<Option<String>> {
    let response = request
        .send()
        .await
        .map_err(|e| Error::Transport(format!("POST failed: {}", e)))?;

    if let Some(token) = response.headers().get(SESSION_HEADER) {
        if let Ok(token) = token.to_str() {
            *token_slot.lock().expect("token lock poisoned") = Some(token.to_string());
        }
    }

    let status = response.status();
    if status == reqwest::StatusCode::NOT_FOUND {
        return Err(Error::Transport(
            "session token no longer recognized by the server".to_string(),
        ));
    }
    if !status.is_success() {
        return Err(Error::Transport(format!(
            "POST rejected with status {}",
            status
        )));
    }

    // Responses to our own requests come back on the POST body.
    let text = response
        .text()
        .await
        .map_err(|e| Error::Transport(format!("failed to read POST response: {}", e)))?;
    if text.trim().is_empty() {
        Ok(None)
    } else {
        Ok(Some(text))
    }
}

/// Hold the push stream open, reconnecting with `Last-Event-ID` whenever it
/// drops, until the transport closes.
async fn run_listener(state: ListenerState) {
    while !state.closed.load(Ordering::Acquire) {
        let mut request = state
            .client
            .get(&state.endpoint)
            .header(reqwest::header::ACCEPT, "text/event-stream");
        if let Some(token) = state.token.lock().expect("token lock poisoned").clone() {
            request = request.header(SESSION_HEADER, token);
        }
        if let Some(last) = state
            .last_event_id
            .lock()
            .expect("event id lock poisoned")
            .clone()
        {
            request = request.header(LAST_EVENT_ID_HEADER, last);
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                info!("event-stream connected");
                let mut decoder = SseDecoder::new();
                let mut stream = response.bytes_stream();
                while let Some(chunk) = stream.next().await {
                    match chunk {
                        Ok(bytes) => {
                            let text = String::from_utf8_lossy(&bytes);
                            for event in decoder.feed(&text) {
                                if let Some(id) = &event.id {
                                    *state
                                        .last_event_id
                                        .lock()
                                        .expect("event id lock poisoned") = Some(id.clone());
                                }
                                if state.inbound.send(Ok(event.data)).is_err() {
                                    return;
                                }
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "event-stream read failed");
                            break;
                        }
                    }
                }
                debug!("event-stream ended");
            }
            Ok(response) => {
                warn!(status = %response.status(), "event-stream request refused");
            }
            Err(e) => {
                warn!(error = %e, "event-stream connection failed");
            }
        }

        if state.closed.load(Ordering::Acquire) {
            break;
        }
        // Reconnect with the same session token after a short pause.
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

#[async_trait]
impl Transport for HttpClientTransport {
    async fn send(&mut self, frame: &str) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Transport("http transport is closed".to_string()));
        }

        let body: serde_json::Value = serde_json::from_str(frame)
            .map_err(|e| Error::Transport(format!("frame is not valid JSON: {}", e)))?;

        let mut request = self
            .client
            .post(&self.endpoint)
            .header(
                reqwest::header::ACCEPT,
                "application/json, text/event-stream",
            )
            .json(&body);
        if let Some(token) = self.session_token() {
            request = request.header(SESSION_HEADER, token);
        }

        let is_request = body.get("method").is_some() && body.get("id").is_some();
        if is_request {
            // A request's POST stays open until the server answers it, and
            // that answer may depend on traffic this session still has to
            // produce; run the round-trip on its own task so the session
            // loop never deadlocks on it. Delivery failures come back
            // through the inbound path as transport errors.
            let token_slot = Arc::clone(&self.token);
            let inbound = self.inbound_tx.clone();
            tokio::spawn(async move {
                match dispatch_post(request, &token_slot).await {
                    Ok(Some(reply)) => {
                        let _ = inbound.send(Ok(reply));
                    }
                    Ok(None) => {}
                    Err(e) => {
                        let _ = inbound.send(Err(e));
                    }
                }
            });
        } else {
            // Notifications and responses are acknowledged as soon as the
            // server ingests them; awaiting inline keeps them ordered
            // against everything sent later.
            if let Some(reply) = dispatch_post(request, &self.token).await? {
                let _ = self.inbound_tx.send(Ok(reply));
            }
        }

        self.ensure_listener();
        Ok(())
    }

    async fn receive(&mut self) -> Result<Option<String>> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(None);
        }
        match self.inbound_rx.recv().await {
            Some(Ok(frame)) => Ok(Some(frame)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
        // Best effort: tell the server the session is over.
        if let Some(token) = self.session_token() {
            let request = self
                .client
                .delete(&self.endpoint)
                .header(SESSION_HEADER, token)
                .send();
            if let Ok(result) = tokio::time::timeout(Duration::from_secs(2), request).await {
                if let Err(e) = result {
                    debug!(error = %e, "session termination request failed");
                }
            }
        }
        info!("http transport closed");
        Ok(())
    }
}
