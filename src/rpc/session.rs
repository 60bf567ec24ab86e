//! Session lifecycle and the per-connection run loop
//!
//! One [`Session`] owns one transport for its whole life. A single task runs
//! the connection: it multiplexes the transport's inbound sequence with the
//! bounded outbound queue, so per-direction ordering and single-writer
//! discipline fall out of the structure rather than a lock. Everything else
//! talks to the connection through a cloneable [`SessionHandle`].
//!
//! Lifecycle: `Uninitialized → Initializing → Ready → ShuttingDown → Closed`,
//! with any state collapsing to `Closed` on transport failure. The state
//! machine is the authority the dispatcher and correlation table consult;
//! neither acts on a message the current state forbids.

use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::protocol::capabilities::{
    CapabilitySet, InitializeParams, InitializeResult, NegotiatedCapabilities, PeerInfo,
};
use crate::protocol::message::{
    self, decode, encode, Message, Notification, Request, RequestId, RpcError,
};
use crate::protocol::{self, methods};
use crate::rpc::dispatcher::{Dispatcher, RequestContext};
use crate::rpc::pending::PendingRequests;
use crate::rpc::progress::{
    ActiveRequests, CancelledParams, Completion, ProgressBus, ProgressParams, ProgressToken,
    ProgressUpdate,
};
use crate::transport::Transport;

/// Per-connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Initializing,
    Ready,
    ShuttingDown,
    Closed,
}

/// Which side of the handshake this session plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sends `initialize` and the `initialized` notification
    Initiator,
    /// Answers `initialize` and waits for the `initialized` notification
    Responder,
}

/// Per-request options for [`SessionHandle::request_with`]
#[derive(Default)]
pub struct RequestOptions {
    /// Overrides the configured default deadline
    pub timeout: Option<Duration>,
    /// Opt into progress reporting; updates arrive on this sink
    pub progress: Option<mpsc::Sender<ProgressUpdate>>,
}

/// Construction parameters for a session
pub struct SessionOptions {
    pub role: Role,
    pub capabilities: CapabilitySet,
    pub info: PeerInfo,
    pub config: Config,
}

struct Shared {
    role: Role,
    config: Config,
    local_capabilities: CapabilitySet,
    local_info: PeerInfo,
    state: Mutex<SessionState>,
    state_tx: watch::Sender<SessionState>,
    state_rx: watch::Receiver<SessionState>,
    pending: PendingRequests,
    progress: ProgressBus,
    active: ActiveRequests,
    negotiated: OnceLock<NegotiatedCapabilities>,
    outbound: mpsc::Sender<Message>,
    dispatcher: Arc<Dispatcher>,
    close_tx: watch::Sender<bool>,
    close_rx: watch::Receiver<bool>,
}

impl Shared {
    fn state(&self) -> SessionState {
        *self.state.lock().expect("session state lock poisoned")
    }

    /// The single point where state changes. Transitions are totally
    /// ordered under the lock; an illegal transition is a sequencing bug.
    fn transition(&self, to: SessionState) -> Result<()> {
        use SessionState::*;
        let mut state = self.state.lock().expect("session state lock poisoned");
        let from = *state;
        if from == to {
            return Ok(());
        }
        let legal = matches!(
            (from, to),
            (Uninitialized, Initializing)
                | (Initializing, Ready)
                | (Ready, ShuttingDown)
                | (Uninitialized, Closed)
                | (Initializing, Closed)
                | (Ready, Closed)
                | (ShuttingDown, Closed)
        );
        if !legal {
            return Err(Error::Protocol(format!(
                "illegal session state transition {:?} -> {:?}",
                from, to
            )));
        }
        *state = to;
        drop(state);
        let _ = self.state_tx.send(to);
        info!(?from, ?to, "session state transition");
        Ok(())
    }

    /// Queue a message for the writer side of the run loop. The queue is
    /// bounded; overflow rejects the send instead of growing.
    fn enqueue(&self, message: Message) -> Result<()> {
        self.outbound.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => Error::Backpressure,
            mpsc::error::TrySendError::Closed(_) => {
                Error::ConnectionClosed("session closed".to_string())
            }
        })
    }

    fn request_close(&self) {
        let _ = self.close_tx.send(true);
    }

    /// Wait for every in-flight request, inbound handlers and outstanding
    /// outbound requests alike, to drain. Bounded by `timeout`.
    async fn wait_drained(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        let active_idle = self.active.wait_idle(timeout).await;
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let pending_empty = self.pending.wait_empty(remaining).await;
        active_idle && pending_empty
    }
}

fn token_for(id: &RequestId) -> ProgressToken {
    match id {
        RequestId::Number(n) => ProgressToken::Number(*n),
        RequestId::String(s) => ProgressToken::String(s.clone()),
    }
}

/// Cloneable interface to a running session
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<Shared>,
}

impl SessionHandle {
    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// The frozen handshake outcome, once the session reached `Ready`.
    pub fn negotiated(&self) -> Option<NegotiatedCapabilities> {
        self.shared.negotiated.get().cloned()
    }

    /// Requests this side has issued and not yet seen resolve.
    pub fn outstanding_requests(&self) -> usize {
        self.shared.pending.outstanding()
    }

    /// Drive the handshake from the initiating side.
    ///
    /// Sends `initialize`, verifies the answered protocol version, freezes
    /// the negotiated capability set, and confirms with the `initialized`
    /// notification. Fail-closed: any error closes the session.
    pub async fn initialize(&self) -> Result<NegotiatedCapabilities> {
        if self.shared.role != Role::Initiator {
            return Err(Error::Protocol(
                "only the initiating side may start the handshake".to_string(),
            ));
        }
        self.shared.transition(SessionState::Initializing)?;

        let params = InitializeParams {
            protocol_version: protocol::LATEST_VERSION.to_string(),
            capabilities: self.shared.local_capabilities.clone(),
            client_info: self.shared.local_info.clone(),
        };
        let outcome = self
            .issue(
                methods::INITIALIZE,
                Some(serde_json::to_value(params)?),
                Some(self.shared.config.handshake_timeout),
                None,
            )
            .await;
        let result = match outcome {
            Ok(value) => value,
            Err(e) => {
                error!(error = %e, "handshake failed, closing session");
                self.close();
                return Err(e);
            }
        };

        let init: InitializeResult = match serde_json::from_value(result) {
            Ok(init) => init,
            Err(e) => {
                self.close();
                return Err(Error::Protocol(format!(
                    "malformed initialize response: {}",
                    e
                )));
            }
        };

        if !protocol::version_supported(&init.protocol_version) {
            self.close();
            return Err(Error::VersionMismatch {
                offered: init.protocol_version,
                supported: protocol::SUPPORTED_VERSIONS.join(", "),
            });
        }

        let negotiated = NegotiatedCapabilities {
            protocol_version: init.protocol_version,
            capabilities: self
                .shared
                .local_capabilities
                .negotiate(&init.capabilities),
            peer: init.server_info,
        };
        let _ = self.shared.negotiated.set(negotiated.clone());

        if let Err(e) = self
            .shared
            .enqueue(Message::notification(methods::INITIALIZED, None))
        {
            self.close();
            return Err(e);
        }
        self.shared.transition(SessionState::Ready)?;
        info!(
            peer = %negotiated.peer.name,
            version = %negotiated.protocol_version,
            capabilities = ?negotiated.names(),
            "session ready"
        );
        Ok(negotiated)
    }

    /// Issue a request with default options and wait for its resolution.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        self.request_with(method, params, RequestOptions::default())
            .await
    }

    /// Issue a request, optionally with a caller deadline and progress sink.
    pub async fn request_with(
        &self,
        method: &str,
        params: Option<Value>,
        options: RequestOptions,
    ) -> Result<Value> {
        match self.shared.state() {
            SessionState::Ready => {}
            SessionState::ShuttingDown => return Err(Error::ShuttingDown),
            SessionState::Closed => {
                return Err(Error::ConnectionClosed("session is closed".to_string()))
            }
            _ => return Err(Error::NotInitialized),
        }
        let deadline = options.timeout.or(self.shared.config.request_timeout);
        self.issue(method, params, deadline, options.progress).await
    }

    /// Send a one-way notification.
    pub fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        match self.shared.state() {
            SessionState::Ready => {}
            SessionState::ShuttingDown => return Err(Error::ShuttingDown),
            SessionState::Closed => {
                return Err(Error::ConnectionClosed("session is closed".to_string()))
            }
            _ => return Err(Error::NotInitialized),
        }
        self.shared.enqueue(Message::notification(method, params))
    }

    /// Round-trip a keep-alive ping. Legal while `Ready` or `ShuttingDown`.
    pub async fn ping(&self) -> Result<()> {
        match self.shared.state() {
            SessionState::Ready | SessionState::ShuttingDown => {}
            SessionState::Closed => {
                return Err(Error::ConnectionClosed("session is closed".to_string()))
            }
            _ => return Err(Error::NotInitialized),
        }
        self.issue(
            methods::PING,
            None,
            Some(self.shared.config.ping_timeout),
            None,
        )
        .await
        .map(|_| ())
    }

    /// Cancel an outstanding request this side issued. The local waiter
    /// resolves with a cancellation error; the peer gets a best-effort
    /// cancellation notification. Idempotent after resolution.
    pub fn cancel(&self, id: &RequestId, reason: Option<&str>) {
        let Some(removed) = self.shared.pending.cancel(id) else {
            return;
        };
        if let Some(token) = removed.token {
            self.shared.progress.detach(&token);
        }
        let params = CancelledParams {
            request_id: id.clone(),
            reason: reason.map(str::to_string),
        };
        match serde_json::to_value(params) {
            Ok(value) => {
                if self
                    .shared
                    .enqueue(Message::notification(methods::CANCELLED, Some(value)))
                    .is_err()
                {
                    debug!(%id, "cancellation notification not sent, session closing");
                }
            }
            Err(e) => warn!(%id, error = %e, "failed to encode cancellation notification"),
        }
    }

    /// Orderly local shutdown: tell the peer, stop issuing, drain in-flight
    /// inbound work, then close the transport.
    pub async fn shutdown(&self) -> Result<()> {
        match self.shared.state() {
            SessionState::Ready => {}
            SessionState::ShuttingDown | SessionState::Closed => return Ok(()),
            _ => return Err(Error::NotInitialized),
        }
        self.shared.transition(SessionState::ShuttingDown)?;
        // Best effort: the peer may already be gone.
        if let Err(e) = self
            .issue(
                methods::SHUTDOWN,
                None,
                Some(self.shared.config.drain_timeout),
                None,
            )
            .await
        {
            debug!(error = %e, "peer did not acknowledge shutdown");
        }
        if !self
            .shared
            .wait_drained(self.shared.config.drain_timeout)
            .await
        {
            warn!("drain timeout elapsed with requests still in flight");
        }
        self.close();
        Ok(())
    }

    /// Ask the run loop to tear the session down. Non-blocking; await
    /// [`SessionHandle::closed`] to observe completion.
    pub fn close(&self) {
        self.shared.request_close();
    }

    /// Wait until the session reaches its terminal state.
    pub async fn closed(&self) {
        let mut rx = self.shared.state_rx.clone();
        loop {
            if *rx.borrow() == SessionState::Closed {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Register, enqueue and await one request. No state gating: the public
    /// entry points gate before calling in, and the handshake itself must
    /// run while `Initializing`.
    async fn issue(
        &self,
        method: &str,
        params: Option<Value>,
        deadline: Option<Duration>,
        progress: Option<mpsc::Sender<ProgressUpdate>>,
    ) -> Result<Value> {
        let shared = &self.shared;
        let id = shared.pending.next_id();

        let (params, token) = match progress {
            Some(sink) => {
                let token = token_for(&id);
                shared.progress.attach(token.clone(), sink)?;
                let params = message::inject_progress_token(params, &token.to_value());
                (Some(params), Some(token))
            }
            None => (params, None),
        };

        let handle = match shared.pending.register(id.clone(), method, token.clone()) {
            Ok(handle) => handle,
            Err(e) => {
                if let Some(token) = &token {
                    shared.progress.detach(token);
                }
                return Err(e);
            }
        };

        if let Err(e) = shared.enqueue(Message::request(id.clone(), method, params)) {
            shared.pending.cancel(&id);
            if let Some(token) = &token {
                shared.progress.detach(token);
            }
            return Err(e);
        }

        match deadline {
            Some(deadline) => match tokio::time::timeout(deadline, handle.wait()).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    // Deadline expiry behaves like manual cancellation, but
                    // surfaces as a distinct timeout error.
                    self.cancel(&id, Some("deadline exceeded"));
                    Err(Error::TimedOut(deadline))
                }
            },
            None => handle.wait().await,
        }
    }
}

/// A per-connection session: owns the transport and runs the message loop
pub struct Session {
    shared: Arc<Shared>,
    transport: Box<dyn Transport>,
    outbound_rx: mpsc::Receiver<Message>,
}

enum Event {
    CloseRequested,
    Outbound(Option<Message>),
    Inbound(Result<Option<String>>),
}

impl Session {
    /// Create a session over a transport. The session does nothing until
    /// [`Session::run`] is driven, typically on a spawned task.
    pub fn new(
        transport: Box<dyn Transport>,
        dispatcher: Arc<Dispatcher>,
        options: SessionOptions,
    ) -> (Session, SessionHandle) {
        let (outbound_tx, outbound_rx) = mpsc::channel(options.config.outbound_queue);
        let (state_tx, state_rx) = watch::channel(SessionState::Uninitialized);
        let (close_tx, close_rx) = watch::channel(false);

        let shared = Arc::new(Shared {
            role: options.role,
            config: options.config,
            local_capabilities: options.capabilities,
            local_info: options.info,
            state: Mutex::new(SessionState::Uninitialized),
            state_tx,
            state_rx,
            pending: PendingRequests::new(),
            progress: ProgressBus::new(),
            active: ActiveRequests::new(),
            negotiated: OnceLock::new(),
            outbound: outbound_tx,
            dispatcher,
            close_tx,
            close_rx,
        });

        let handle = SessionHandle {
            shared: Arc::clone(&shared),
        };
        (
            Session {
                shared,
                transport,
                outbound_rx,
            },
            handle,
        )
    }

    /// Drive the connection until it closes. Returns the failure that tore
    /// the session down, or `Ok` for an orderly close.
    pub async fn run(mut self) -> Result<()> {
        if self.shared.role == Role::Responder {
            self.spawn_handshake_timer();
        }

        let mut close_rx = self.shared.close_rx.clone();
        let result = loop {
            let event = tokio::select! {
                changed = close_rx.changed() => {
                    if changed.is_err() || *close_rx.borrow() {
                        Event::CloseRequested
                    } else {
                        continue;
                    }
                }
                maybe = self.outbound_rx.recv() => Event::Outbound(maybe),
                frame = self.transport.receive() => Event::Inbound(frame),
            };

            match event {
                Event::CloseRequested => break Ok(()),
                Event::Outbound(Some(message)) => {
                    if let Err(e) = self.write(message).await {
                        break Err(e);
                    }
                }
                Event::Outbound(None) => break Ok(()),
                Event::Inbound(Ok(Some(frame))) => {
                    if let Err(e) = self.handle_frame(&frame).await {
                        if e.is_fatal() {
                            break Err(e);
                        }
                        warn!(error = %e, "error handling inbound frame");
                    }
                }
                Event::Inbound(Ok(None)) => {
                    info!("peer closed the transport");
                    break Ok(());
                }
                Event::Inbound(Err(e)) => {
                    error!(error = %e, "transport failure");
                    break Err(e);
                }
            }
        };

        self.teardown().await;
        result
    }

    /// Fail the session if the peer never completes the handshake.
    fn spawn_handshake_timer(&self) {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            tokio::time::sleep(shared.config.handshake_timeout).await;
            match shared.state() {
                SessionState::Uninitialized | SessionState::Initializing => {
                    warn!(
                        timeout = ?shared.config.handshake_timeout,
                        "handshake timed out, closing session"
                    );
                    shared.request_close();
                }
                _ => {}
            }
        });
    }

    async fn write(&mut self, message: Message) -> Result<()> {
        let frame = match encode(&message) {
            Ok(frame) => frame,
            Err(e) => {
                error!(error = %e, "failed to encode outbound message");
                return Ok(());
            }
        };
        match self.transport.send(&frame).await {
            Ok(()) => Ok(()),
            Err(Error::Backpressure) => {
                // The push channel is saturated; the frame stays recoverable
                // through the replay ring, the session survives.
                warn!("outbound frame dropped under backpressure");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn handle_frame(&mut self, frame: &str) -> Result<()> {
        let message = match decode(frame) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "dropping undecodable frame");
                return Ok(());
            }
        };
        match message {
            Message::Response(r) => {
                self.resolve_pending(&r.id, Ok(r.result));
                Ok(())
            }
            Message::Error(e) => {
                self.resolve_pending(&e.id, Err(e.error));
                Ok(())
            }
            Message::Notification(n) => self.handle_notification(n).await,
            Message::Request(r) => self.handle_request(r).await,
        }
    }

    fn resolve_pending(&self, id: &RequestId, outcome: std::result::Result<Value, RpcError>) {
        if let Some(removed) = self.shared.pending.resolve(id, outcome) {
            if let Some(token) = removed.token {
                self.shared.progress.detach(&token);
            }
        }
    }

    async fn handle_notification(&mut self, note: Notification) -> Result<()> {
        match note.method.as_str() {
            methods::INITIALIZED => {
                if self.shared.role == Role::Responder
                    && self.shared.state() == SessionState::Initializing
                {
                    self.shared.transition(SessionState::Ready)?;
                    info!("handshake complete, session ready");
                } else {
                    warn!("unexpected initialized notification");
                }
            }
            methods::PROGRESS => {
                match note
                    .params
                    .and_then(|p| serde_json::from_value::<ProgressParams>(p).ok())
                {
                    Some(params) => self.shared.progress.deliver(params),
                    None => warn!("dropping malformed progress notification"),
                }
            }
            methods::CANCELLED => {
                match note
                    .params
                    .and_then(|p| serde_json::from_value::<CancelledParams>(p).ok())
                {
                    Some(params) => {
                        if !self
                            .shared
                            .active
                            .cancel(&params.request_id, params.reason)
                        {
                            debug!(
                                id = %params.request_id,
                                "cancellation for a request not in flight"
                            );
                        }
                    }
                    None => warn!("dropping malformed cancellation notification"),
                }
            }
            _ => match self.shared.state() {
                SessionState::Ready | SessionState::ShuttingDown => {
                    self.shared
                        .dispatcher
                        .fan_out(&note.method, note.params)
                        .await;
                }
                state => {
                    debug!(
                        method = %note.method,
                        ?state,
                        "ignoring notification outside the ready state"
                    );
                }
            },
        }
        Ok(())
    }

    async fn handle_request(&mut self, request: Request) -> Result<()> {
        match request.method.as_str() {
            methods::INITIALIZE => return self.handle_initialize(request).await,
            methods::SHUTDOWN => return self.handle_shutdown(request).await,
            methods::PING => {
                let reply = match self.shared.state() {
                    SessionState::Ready | SessionState::ShuttingDown => {
                        Message::response(request.id, json!({}))
                    }
                    _ => Message::error_response(request.id, Error::NotInitialized.to_rpc_error()),
                };
                return self.send_now(reply).await;
            }
            _ => {}
        }

        match self.shared.state() {
            SessionState::Ready => {}
            SessionState::ShuttingDown => {
                return self
                    .send_now(Message::error_response(
                        request.id,
                        Error::ShuttingDown.to_rpc_error(),
                    ))
                    .await;
            }
            _ => {
                return self
                    .send_now(Message::error_response(
                        request.id,
                        Error::NotInitialized.to_rpc_error(),
                    ))
                    .await;
            }
        }

        let Some(negotiated) = self.shared.negotiated.get() else {
            return self
                .send_now(Message::error_response(
                    request.id,
                    RpcError::internal("negotiated capabilities missing in ready state"),
                ))
                .await;
        };

        let handler = match self.shared.dispatcher.route(&request.method, negotiated) {
            Ok(handler) => handler,
            Err(rpc_error) => {
                return self
                    .send_now(Message::error_response(request.id, rpc_error))
                    .await;
            }
        };

        let cancel = match self.shared.active.begin(request.id.clone()) {
            Ok(cancel) => cancel,
            Err(e) => {
                warn!(id = %request.id, error = %e, "rejecting duplicate in-flight request id");
                return self
                    .send_now(Message::error_response(request.id, e.to_rpc_error()))
                    .await;
            }
        };

        let progress_token = message::extract_progress_token(request.params.as_ref())
            .and_then(|v| ProgressToken::from_value(&v));
        let ctx = RequestContext {
            id: request.id.clone(),
            cancel,
            progress_token,
            outbound: self.shared.outbound.clone(),
        };

        // Handlers for distinct ids run concurrently; the completion registry
        // guarantees at most one response per id.
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let outcome = handler.handle(ctx, request.params).await;
            match shared.active.complete(&request.id) {
                Completion::Send => {
                    let reply = match outcome {
                        Ok(value) => Message::response(request.id.clone(), value),
                        Err(rpc_error) => Message::error_response(request.id.clone(), rpc_error),
                    };
                    if shared.outbound.send(reply).await.is_err() {
                        debug!(id = %request.id, "session closed before the response was sent");
                    }
                }
                Completion::Suppress => {
                    debug!(id = %request.id, "suppressing response for a cancelled request");
                }
                Completion::Untracked => {
                    warn!(id = %request.id, "request completed twice");
                }
            }
        });
        Ok(())
    }

    async fn handle_initialize(&mut self, request: Request) -> Result<()> {
        if self.shared.role != Role::Responder {
            return self
                .send_now(Message::error_response(
                    request.id,
                    RpcError::new(
                        protocol::error_codes::INVALID_REQUEST,
                        "initialize must be sent by the connecting side",
                    ),
                ))
                .await;
        }
        if self.shared.state() != SessionState::Uninitialized {
            return self
                .send_now(Message::error_response(
                    request.id,
                    RpcError::new(
                        protocol::error_codes::INVALID_REQUEST,
                        "session is already initialized",
                    ),
                ))
                .await;
        }

        let params: InitializeParams = match request
            .params
            .clone()
            .map(serde_json::from_value)
            .transpose()
        {
            Ok(Some(params)) => params,
            _ => {
                return self
                    .send_now(Message::error_response(
                        request.id,
                        RpcError::invalid_params("missing or malformed initialize parameters"),
                    ))
                    .await;
            }
        };

        self.shared.transition(SessionState::Initializing)?;

        let version = protocol::select_version(&params.protocol_version);
        let negotiated = NegotiatedCapabilities {
            protocol_version: version.to_string(),
            capabilities: self
                .shared
                .local_capabilities
                .negotiate(&params.capabilities),
            peer: params.client_info.clone(),
        };
        info!(
            peer = %params.client_info.name,
            offered = %params.protocol_version,
            agreed = version,
            capabilities = ?negotiated.names(),
            "initialize received"
        );
        let _ = self.shared.negotiated.set(negotiated);

        let result = InitializeResult {
            protocol_version: version.to_string(),
            capabilities: self.shared.local_capabilities.clone(),
            server_info: self.shared.local_info.clone(),
            instructions: None,
        };
        self.send_now(Message::response(
            request.id,
            serde_json::to_value(result)?,
        ))
        .await
    }

    async fn handle_shutdown(&mut self, request: Request) -> Result<()> {
        match self.shared.state() {
            SessionState::Ready => {
                self.send_now(Message::response(request.id, json!({}))).await?;
                self.shared.transition(SessionState::ShuttingDown)?;
                info!("peer requested shutdown, draining in-flight work");
                let shared = Arc::clone(&self.shared);
                tokio::spawn(async move {
                    if !shared.wait_drained(shared.config.drain_timeout).await {
                        warn!("drain timeout elapsed with requests still in flight");
                    }
                    shared.request_close();
                });
                Ok(())
            }
            SessionState::ShuttingDown => {
                self.send_now(Message::error_response(
                    request.id,
                    Error::ShuttingDown.to_rpc_error(),
                ))
                .await
            }
            _ => {
                self.send_now(Message::error_response(
                    request.id,
                    Error::NotInitialized.to_rpc_error(),
                ))
                .await
            }
        }
    }

    /// Write a protocol-generated message directly. The run loop is the
    /// transport's only writer, so this cannot reorder against the queue
    /// drain happening in the same loop.
    async fn send_now(&mut self, message: Message) -> Result<()> {
        self.write(message).await
    }

    async fn teardown(&mut self) {
        if let Err(e) = self.transport.close().await {
            debug!(error = %e, "error closing transport");
        }
        // Whatever was queued but never written is part of the drained state.
        while self.outbound_rx.try_recv().is_ok() {}
        let drained = self.shared.pending.drain_on_close();
        if drained > 0 {
            warn!(drained, "session closed with requests still pending");
        }
        if let Err(e) = self.shared.transition(SessionState::Closed) {
            error!(error = %e, "failed to finalize session state");
        }
        info!("session closed");
    }
}
