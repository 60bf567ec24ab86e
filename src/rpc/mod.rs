//! Protocol engine core: correlation, dispatch, progress and the session
//! state machine.

pub mod dispatcher;
pub mod pending;
pub mod ping;
pub mod progress;
pub mod session;

pub use dispatcher::{handler_fn, subscriber_fn, Dispatcher, MethodHandler, RequestContext};
pub use pending::{PendingHandle, PendingRequests};
pub use ping::PingMonitor;
pub use progress::{ProgressToken, ProgressUpdate};
pub use session::{
    RequestOptions, Role, Session, SessionHandle, SessionOptions, SessionState,
};
