//! Method and notification routing
//!
//! Hosts register typed handlers for request methods and subscribers for
//! notification methods at startup; the session consults the dispatcher for
//! every inbound frame. Capability gating happens here: a method whose
//! required capability is absent from the negotiated set is rejected before
//! its handler is ever looked at.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::protocol::capabilities::NegotiatedCapabilities;
use crate::protocol::message::{Message, RequestId, RpcError};
use crate::protocol::{self, methods};
use crate::rpc::progress::{CancelState, ProgressParams, ProgressToken};

/// Per-invocation context handed to method handlers
pub struct RequestContext {
    pub(crate) id: RequestId,
    pub(crate) cancel: Arc<CancelState>,
    pub(crate) progress_token: Option<ProgressToken>,
    pub(crate) outbound: mpsc::Sender<Message>,
}

impl RequestContext {
    /// The id of the request being serviced.
    pub fn request_id(&self) -> &RequestId {
        &self.id
    }

    /// Whether the peer asked to cancel this request. Cancellation is
    /// cooperative; long-running handlers should poll this and abandon work.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// The peer's stated cancellation reason, if any.
    pub fn cancel_reason(&self) -> Option<String> {
        self.cancel.reason()
    }

    /// Emit a progress notification bound to the caller's token.
    ///
    /// Inert when the caller did not opt into progress reporting.
    pub async fn report_progress(
        &self,
        progress: f64,
        total: Option<f64>,
        message: Option<&str>,
    ) -> Result<()> {
        let Some(token) = &self.progress_token else {
            return Ok(());
        };
        let params = ProgressParams {
            token: token.clone(),
            progress,
            total,
            message: message.map(str::to_string),
        };
        let note = Message::notification(methods::PROGRESS, Some(serde_json::to_value(params)?));
        self.outbound
            .send(note)
            .await
            .map_err(|_| Error::ConnectionClosed("session closed".to_string()))
    }
}

/// A registered request handler
#[async_trait]
pub trait MethodHandler: Send + Sync {
    async fn handle(
        &self,
        ctx: RequestContext,
        params: Option<Value>,
    ) -> std::result::Result<Value, RpcError>;
}

/// A registered notification subscriber
#[async_trait]
pub trait NotificationSubscriber: Send + Sync {
    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> MethodHandler for FnHandler<F>
where
    F: Fn(RequestContext, Option<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<Value, RpcError>> + Send,
{
    async fn handle(
        &self,
        ctx: RequestContext,
        params: Option<Value>,
    ) -> std::result::Result<Value, RpcError> {
        (self.0)(ctx, params).await
    }
}

/// Wrap an async closure as a [`MethodHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MethodHandler>
where
    F: Fn(RequestContext, Option<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Value, RpcError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

struct FnSubscriber<F>(F);

#[async_trait]
impl<F, Fut> NotificationSubscriber for FnSubscriber<F>
where
    F: Fn(String, Option<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        (self.0)(method.to_string(), params).await
    }
}

/// Wrap an async closure as a [`NotificationSubscriber`].
pub fn subscriber_fn<F, Fut>(f: F) -> Arc<dyn NotificationSubscriber>
where
    F: Fn(String, Option<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnSubscriber(f))
}

#[derive(Clone)]
struct Registration {
    handler: Arc<dyn MethodHandler>,
    required_capability: Option<String>,
}

/// Registry routing inbound requests and notifications to host code
#[derive(Default)]
pub struct Dispatcher {
    handlers: RwLock<HashMap<String, Registration>>,
    subscribers: RwLock<HashMap<String, Vec<Arc<dyn NotificationSubscriber>>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a request method. Methods in the protocol
    /// catalog automatically carry their catalog capability gate.
    pub fn register(&self, method: &str, handler: Arc<dyn MethodHandler>) -> Result<()> {
        let required = protocol::required_capability(method).map(str::to_string);
        self.register_inner(method, handler, required)
    }

    /// Register a handler gated on an explicit capability, overriding the
    /// catalog default.
    pub fn register_gated(
        &self,
        method: &str,
        capability: &str,
        handler: Arc<dyn MethodHandler>,
    ) -> Result<()> {
        self.register_inner(method, handler, Some(capability.to_string()))
    }

    fn register_inner(
        &self,
        method: &str,
        handler: Arc<dyn MethodHandler>,
        required_capability: Option<String>,
    ) -> Result<()> {
        if protocol::is_reserved(method) {
            return Err(Error::Protocol(format!(
                "method '{}' is reserved by the engine",
                method
            )));
        }
        let mut handlers = self.handlers.write().expect("handler registry lock poisoned");
        if handlers.contains_key(method) {
            return Err(Error::Protocol(format!(
                "method '{}' already has a handler",
                method
            )));
        }
        handlers.insert(
            method.to_string(),
            Registration {
                handler,
                required_capability,
            },
        );
        Ok(())
    }

    /// Subscribe to a notification method. Multiple subscribers fan out.
    pub fn subscribe(&self, method: &str, subscriber: Arc<dyn NotificationSubscriber>) {
        self.subscribers
            .write()
            .expect("subscriber registry lock poisoned")
            .entry(method.to_string())
            .or_default()
            .push(subscriber);
    }

    /// Resolve an inbound request to its handler, applying the capability
    /// gate against the negotiated set.
    pub(crate) fn route(
        &self,
        method: &str,
        negotiated: &NegotiatedCapabilities,
    ) -> std::result::Result<Arc<dyn MethodHandler>, RpcError> {
        let registration = {
            let handlers = self.handlers.read().expect("handler registry lock poisoned");
            handlers.get(method).cloned()
        };
        let Some(registration) = registration else {
            return Err(RpcError::method_not_found(method));
        };
        if let Some(required) = &registration.required_capability {
            if !negotiated.allows(required) {
                return Err(
                    Error::CapabilityNotNegotiated(required.clone()).to_rpc_error()
                );
            }
        }
        Ok(registration.handler)
    }

    /// Fan a notification out to every subscriber for its method. Subscriber
    /// failures are isolated: logged, never propagated to other subscribers
    /// or to the session. Unknown methods are dropped silently; the protocol
    /// allows forward-compatible notifications.
    pub(crate) async fn fan_out(&self, method: &str, params: Option<Value>) {
        let subscribers = {
            let map = self
                .subscribers
                .read()
                .expect("subscriber registry lock poisoned");
            map.get(method).cloned()
        };
        let Some(subscribers) = subscribers else {
            debug!(method, "no subscriber for notification, dropping");
            return;
        };
        for subscriber in subscribers {
            if let Err(e) = subscriber.notify(method, params.clone()).await {
                warn!(method, error = %e, "notification subscriber failed");
            }
        }
    }

    /// Whether any handler is registered for the method.
    pub fn has_handler(&self, method: &str) -> bool {
        self.handlers
            .read()
            .expect("handler registry lock poisoned")
            .contains_key(method)
    }
}
