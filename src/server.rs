//! HTTP host
//!
//! Serves the protocol over HTTP: client-to-server messages arrive as POST
//! bodies on the session endpoint, server-to-client messages are pushed on
//! an event-stream GET against the same endpoint, and DELETE terminates the
//! session. Session identity is a server-issued `Mcp-Session-Id` token, so
//! the push connection can drop and reconnect without losing the session.
//!
//! Each accepted session runs the same [`Session`] state machine as the
//! stdio path, over an internal channel-backed transport.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    extract::State,
    http::{header, HeaderMap, Method, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
    routing::get,
    Router,
};
use dashmap::DashMap;
use futures_util::Stream;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::protocol::capabilities::{CapabilitySet, PeerInfo};
use crate::protocol::message::RequestId;
use crate::protocol::{error_codes, methods};
use crate::rpc::dispatcher::Dispatcher;
use crate::rpc::session::{Role, Session, SessionHandle, SessionOptions};
use crate::transport::http::{LAST_EVENT_ID_HEADER, SESSION_HEADER};
use crate::transport::Transport;

/// One frame queued for the push channel, tagged with its event id
#[derive(Debug, Clone)]
struct PushFrame {
    event_id: u64,
    data: String,
}

/// Channel plumbing shared between the HTTP handlers and the session's
/// transport.
struct HttpConnection {
    inbound_tx: mpsc::Sender<String>,
    /// POST requests waiting for the response to their own request id
    waiters: DashMap<RequestId, oneshot::Sender<String>>,
    push_tx: mpsc::Sender<PushFrame>,
    /// The push receiver, leased by whichever GET connection is active
    push_rx: Mutex<Option<mpsc::Receiver<PushFrame>>>,
    /// Recently pushed frames, kept for `Last-Event-ID` reconnects
    replay: Mutex<VecDeque<PushFrame>>,
    replay_window: usize,
    next_event_id: AtomicU64,
}

impl HttpConnection {
    fn push(&self, data: String) -> Result<()> {
        let event_id = self.next_event_id.fetch_add(1, Ordering::Relaxed) + 1;
        let frame = PushFrame { event_id, data };
        {
            let mut replay = self.replay.lock().expect("replay ring lock poisoned");
            replay.push_back(frame.clone());
            while replay.len() > self.replay_window {
                replay.pop_front();
            }
        }
        self.push_tx
            .try_send(frame)
            .map_err(|_| Error::Backpressure)
    }

    fn replay_after(&self, last_event_id: Option<u64>) -> Vec<PushFrame> {
        let Some(last) = last_event_id else {
            return Vec::new();
        };
        let replay = self.replay.lock().expect("replay ring lock poisoned");
        replay
            .iter()
            .filter(|frame| frame.event_id > last)
            .cloned()
            .collect()
    }
}

/// Server-side transport: inbound frames come from POST bodies, outbound
/// frames either answer a waiting POST or go out on the push channel.
struct HttpServerTransport {
    inbound_rx: mpsc::Receiver<String>,
    conn: Arc<HttpConnection>,
    is_closed: bool,
}

#[async_trait]
impl Transport for HttpServerTransport {
    async fn send(&mut self, frame: &str) -> Result<()> {
        if self.is_closed {
            return Err(Error::Transport("http session is closed".to_string()));
        }
        // A response whose id matches a waiting POST returns on that POST's
        // body; everything else is server-initiated and goes to the stream.
        if let Some(id) = response_id(frame) {
            if let Some((_, waiter)) = self.conn.waiters.remove(&id) {
                if waiter.send(frame.to_string()).is_ok() {
                    return Ok(());
                }
                // The POST gave up waiting; fall through to the push channel.
            }
        }
        self.conn.push(frame.to_string())
    }

    async fn receive(&mut self) -> Result<Option<String>> {
        if self.is_closed {
            return Ok(None);
        }
        Ok(self.inbound_rx.recv().await)
    }

    async fn close(&mut self) -> Result<()> {
        self.is_closed = true;
        self.inbound_rx.close();
        Ok(())
    }
}

/// Cheaply extract the id of a frame that is a response or error response.
fn response_id(frame: &str) -> Option<RequestId> {
    let value: Value = serde_json::from_str(frame).ok()?;
    if value.get("result").is_none() && value.get("error").is_none() {
        return None;
    }
    RequestId::from_value(value.get("id")?).ok()
}

/// One accepted HTTP session
struct HttpSession {
    id: Uuid,
    token: String,
    handle: SessionHandle,
    conn: Arc<HttpConnection>,
    created_at: chrono::DateTime<chrono::Utc>,
}

/// All live HTTP sessions, keyed by session token
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<HttpSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn get(&self, token: &str) -> Option<Arc<HttpSession>> {
        self.sessions.get(token).map(|entry| Arc::clone(&entry))
    }

    /// The session handle behind a token, for server-initiated traffic.
    pub fn handle(&self, token: &str) -> Option<SessionHandle> {
        self.get(token).map(|session| session.handle.clone())
    }

    /// Handles of every live session, e.g. for broadcast notifications.
    pub fn handles(&self) -> Vec<SessionHandle> {
        self.sessions
            .iter()
            .map(|entry| entry.handle.clone())
            .collect()
    }

    /// Accept a new connection: mint a token, wire up the channel transport
    /// and spawn the session run loop. The entry reaps itself when the
    /// session closes.
    fn create(self: &Arc<Self>, state: &AppState) -> Arc<HttpSession> {
        let token = generate_token();
        let (inbound_tx, inbound_rx) = mpsc::channel(64);
        let (push_tx, push_rx) = mpsc::channel(state.config.outbound_queue);
        let conn = Arc::new(HttpConnection {
            inbound_tx,
            waiters: DashMap::new(),
            push_tx,
            push_rx: Mutex::new(Some(push_rx)),
            replay: Mutex::new(VecDeque::new()),
            replay_window: state.config.replay_window,
            next_event_id: AtomicU64::new(0),
        });

        let transport = HttpServerTransport {
            inbound_rx,
            conn: Arc::clone(&conn),
            is_closed: false,
        };
        let (session, handle) = Session::new(
            Box::new(transport),
            Arc::clone(&state.dispatcher),
            SessionOptions {
                role: Role::Responder,
                capabilities: state.capabilities.clone(),
                info: state.info.clone(),
                config: state.config.clone(),
            },
        );
        tokio::spawn(session.run());
        if let Some(interval) = state.config.ping_interval {
            crate::rpc::ping::PingMonitor::new(
                handle.clone(),
                interval,
                state.config.ping_max_failures,
            )
            .spawn();
        }

        let entry = Arc::new(HttpSession {
            id: Uuid::new_v4(),
            token: token.clone(),
            handle: handle.clone(),
            conn,
            created_at: chrono::Utc::now(),
        });
        self.sessions.insert(token.clone(), Arc::clone(&entry));
        info!(session = %entry.id, sessions = self.sessions.len(), "http session accepted");

        // Reap the registry entry once the session reaches its terminal state.
        let registry = Arc::clone(self);
        let session_id = entry.id;
        tokio::spawn(async move {
            handle.closed().await;
            registry.sessions.remove(&token);
            info!(session = %session_id, "http session reaped");
        });

        entry
    }

    fn remove(&self, token: &str) -> Option<Arc<HttpSession>> {
        self.sessions.remove(token).map(|(_, entry)| entry)
    }
}

fn generate_token() -> String {
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
    use rand::RngCore;
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Shared state for the HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub dispatcher: Arc<Dispatcher>,
    pub capabilities: CapabilitySet,
    pub info: PeerInfo,
    pub registry: Arc<SessionRegistry>,
}

impl AppState {
    pub fn new(
        config: Config,
        dispatcher: Arc<Dispatcher>,
        capabilities: CapabilitySet,
        info: PeerInfo,
    ) -> Self {
        Self {
            config,
            dispatcher,
            capabilities,
            info,
            registry: Arc::new(SessionRegistry::new()),
        }
    }
}

/// Build the host router.
pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::ACCEPT,
            header::CACHE_CONTROL,
            header::HeaderName::from_static("mcp-session-id"),
            header::HeaderName::from_static("last-event-id"),
        ])
        .allow_origin(header::HeaderValue::from_static("*"));

    Router::new()
        .route("/health", get(health_check))
        .route(
            "/rpc",
            get(sse_handler).post(post_handler).delete(delete_handler),
        )
        .layer(RequestBodyLimitLayer::new(1024 * 1024)) // 1 MiB
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Bind and serve until the process is stopped.
pub async fn run_server(
    config: Config,
    dispatcher: Arc<Dispatcher>,
    capabilities: CapabilitySet,
    info: PeerInfo,
) -> Result<()> {
    let address = config.server_address();
    let state = AppState::new(config, dispatcher, capabilities, info);
    let router = app(state);

    let listener = tokio::net::TcpListener::bind(&address).await?;
    info!("host listening on {}", address);
    axum::serve(listener, router)
        .await
        .map_err(|e| Error::Transport(format!("server error: {}", e)))?;
    Ok(())
}

async fn health_check(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "parley-mcp",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "sessions": state.registry.len(),
    }))
}

fn session_token(headers: &HeaderMap) -> Option<String> {
    let token = headers.get(SESSION_HEADER)?.to_str().ok()?;
    Some(token.to_string())
}

fn token_is_wellformed(token: &str) -> bool {
    !token.is_empty() && token.chars().all(|c| c.is_ascii_graphic())
}

fn rpc_error_body(code: i32, message: &str, id: Option<Value>) -> Json<Value> {
    Json(json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {"code": code, "message": message}
    }))
}

/// Client-to-server ingress: one decoded message per request body.
async fn post_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let value: Value = match serde_json::from_str(&body) {
        Ok(value) => value,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                rpc_error_body(
                    error_codes::PARSE_ERROR,
                    &format!("Parse error: {}", e),
                    None,
                ),
            )
                .into_response();
        }
    };

    let token = session_token(&headers);
    if let Some(token) = &token {
        if !token_is_wellformed(token) {
            return (StatusCode::BAD_REQUEST, "malformed session token").into_response();
        }
    }
    let is_initialize = value.get("method").and_then(Value::as_str) == Some(methods::INITIALIZE);

    let session = match &token {
        Some(token) => match state.registry.get(token) {
            Some(session) => session,
            None => {
                debug!("request with unknown session token");
                return (StatusCode::NOT_FOUND, "unknown session token").into_response();
            }
        },
        // The first initialize request creates the session and mints the
        // token the client carries afterwards.
        None if is_initialize => state.registry.create(&state),
        None => {
            return (StatusCode::BAD_REQUEST, "missing session token").into_response();
        }
    };

    let request_id = match (value.get("method"), value.get("id")) {
        (Some(_), Some(id)) => match RequestId::from_value(id) {
            Ok(id) => Some(id),
            Err(_) => {
                return (
                    StatusCode::BAD_REQUEST,
                    rpc_error_body(
                        error_codes::INVALID_REQUEST,
                        "request id must be a string or integer",
                        None,
                    ),
                )
                    .into_response();
            }
        },
        _ => None,
    };

    match request_id {
        Some(id) => {
            // Requests block the POST until the session answers that id.
            let (tx, rx) = oneshot::channel();
            session.conn.waiters.insert(id.clone(), tx);
            if session.conn.inbound_tx.send(body).await.is_err() {
                session.conn.waiters.remove(&id);
                return (StatusCode::GONE, "session is closed").into_response();
            }

            let wait = state
                .config
                .request_timeout
                .unwrap_or(Duration::from_secs(60))
                + Duration::from_secs(5);
            match tokio::time::timeout(wait, rx).await {
                Ok(Ok(frame)) => (
                    StatusCode::OK,
                    [
                        (header::CONTENT_TYPE.as_str(), "application/json"),
                        (SESSION_HEADER, session.token.as_str()),
                    ],
                    frame,
                )
                    .into_response(),
                Ok(Err(_)) => {
                    (StatusCode::GONE, "session closed before responding").into_response()
                }
                Err(_) => {
                    session.conn.waiters.remove(&id);
                    warn!(%id, "POST timed out waiting for the response");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        rpc_error_body(
                            error_codes::INTERNAL_ERROR,
                            "timed out waiting for the response",
                            Some(id.to_value()),
                        ),
                    )
                        .into_response()
                }
            }
        }
        None => {
            // Notifications and responses are accepted without a body.
            if session.conn.inbound_tx.send(body).await.is_err() {
                return (StatusCode::GONE, "session is closed").into_response();
            }
            (
                StatusCode::ACCEPTED,
                [(SESSION_HEADER, session.token.as_str())],
            )
                .into_response()
        }
    }
}

/// Server-to-client push: the long-lived event-stream connection.
async fn sse_handler(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let Some(token) = session_token(&headers) else {
        return (StatusCode::BAD_REQUEST, "missing session token").into_response();
    };
    let Some(session) = state.registry.get(&token) else {
        return (StatusCode::NOT_FOUND, "unknown session token").into_response();
    };

    let leased = session
        .conn
        .push_rx
        .lock()
        .expect("push lease lock poisoned")
        .take();
    let Some(rx) = leased else {
        return (StatusCode::CONFLICT, "push stream already attached").into_response();
    };

    let last_event_id = headers
        .get(LAST_EVENT_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    let replay = session.conn.replay_after(last_event_id);
    if !replay.is_empty() {
        info!(
            session = %session.id,
            frames = replay.len(),
            "replaying missed push frames after reconnect"
        );
    }

    let lease = PushLease {
        conn: Arc::clone(&session.conn),
        rx: Some(rx),
    };
    Sse::new(push_stream(lease, replay, last_event_id.unwrap_or(0)))
        .keep_alive(
            KeepAlive::new()
                .interval(Duration::from_secs(30))
                .text("keep-alive"),
        )
        .into_response()
}

/// Holds the push receiver for one GET connection and returns it to the
/// session when the connection drops, so a reconnect can pick it back up.
struct PushLease {
    conn: Arc<HttpConnection>,
    rx: Option<mpsc::Receiver<PushFrame>>,
}

impl Drop for PushLease {
    fn drop(&mut self) {
        if let Some(rx) = self.rx.take() {
            *self.conn.push_rx.lock().expect("push lease lock poisoned") = Some(rx);
        }
    }
}

fn push_stream(
    mut lease: PushLease,
    replay: Vec<PushFrame>,
    mut last_sent: u64,
) -> impl Stream<Item = std::result::Result<Event, Infallible>> {
    async_stream::stream! {
        for frame in replay {
            last_sent = frame.event_id;
            yield Ok(Event::default()
                .event("message")
                .id(frame.event_id.to_string())
                .data(frame.data));
        }
        loop {
            let frame = match lease.rx.as_mut() {
                Some(rx) => rx.recv().await,
                None => None,
            };
            let Some(frame) = frame else { break };
            // Anything at or below the replay point was already delivered.
            if frame.event_id <= last_sent {
                continue;
            }
            last_sent = frame.event_id;
            yield Ok(Event::default()
                .event("message")
                .id(frame.event_id.to_string())
                .data(frame.data));
        }
    }
}

/// Explicit session termination.
async fn delete_handler(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let Some(token) = session_token(&headers) else {
        return (StatusCode::BAD_REQUEST, "missing session token").into_response();
    };
    match state.registry.remove(&token) {
        Some(session) => {
            info!(session = %session.id, age_s = (chrono::Utc::now() - session.created_at).num_seconds(), "session terminated by client");
            session.handle.close();
            StatusCode::OK.into_response()
        }
        None => (StatusCode::NOT_FOUND, "unknown session token").into_response(),
    }
}
