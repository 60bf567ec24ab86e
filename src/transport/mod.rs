//! Transport layer
//!
//! A transport delivers framed protocol messages in both directions and is
//! otherwise oblivious to protocol semantics. The same session logic runs
//! over any implementation: the process stdio pipe, the HTTP client channel,
//! or an in-memory pair for tests. New transports plug in behind the trait
//! without touching the session state machine.

pub mod http;
pub mod stdio;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{Error, Result};

/// Bidirectional, ordered frame channel
#[async_trait]
pub trait Transport: Send {
    /// Deliver one outbound frame; fails with a transport error when the
    /// peer is gone or the channel was closed.
    async fn send(&mut self, frame: &str) -> Result<()>;

    /// Wait for the next inbound frame. `Ok(None)` is the clean end of the
    /// sequence; abnormal closure surfaces as a transport error.
    async fn receive(&mut self) -> Result<Option<String>>;

    /// Release channel resources. Idempotent.
    async fn close(&mut self) -> Result<()>;
}

/// In-memory transport for tests and same-process peers
pub struct InMemoryTransport {
    sender: Option<mpsc::UnboundedSender<String>>,
    receiver: mpsc::UnboundedReceiver<String>,
    is_closed: bool,
}

impl InMemoryTransport {
    /// Create a pair of connected in-memory transports.
    pub fn pair() -> (Self, Self) {
        let (tx1, rx1) = mpsc::unbounded_channel();
        let (tx2, rx2) = mpsc::unbounded_channel();

        (
            Self {
                sender: Some(tx1),
                receiver: rx2,
                is_closed: false,
            },
            Self {
                sender: Some(tx2),
                receiver: rx1,
                is_closed: false,
            },
        )
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn send(&mut self, frame: &str) -> Result<()> {
        let Some(sender) = &self.sender else {
            return Err(Error::Transport("in-memory transport is closed".to_string()));
        };
        sender
            .send(frame.to_string())
            .map_err(|_| Error::Transport("peer side of in-memory transport is gone".to_string()))
    }

    async fn receive(&mut self) -> Result<Option<String>> {
        if self.is_closed {
            return Ok(None);
        }
        // A dropped sender is the peer closing cleanly.
        Ok(self.receiver.recv().await)
    }

    async fn close(&mut self) -> Result<()> {
        if !self.is_closed {
            self.is_closed = true;
            // Dropping our sender lets the peer observe end-of-sequence.
            self.sender = None;
            self.receiver.close();
            debug!("in-memory transport closed");
        }
        Ok(())
    }
}

/// Constructors for the built-in transport variants
pub struct TransportFactory;

impl TransportFactory {
    /// Newline-delimited framing over the process stdio pipe.
    pub fn stdio() -> Box<dyn Transport> {
        Box::new(stdio::StdioTransport::new())
    }

    /// HTTP POST ingress plus an event-stream push channel.
    pub fn http_client(endpoint: &str) -> Box<dyn Transport> {
        Box::new(http::HttpClientTransport::new(endpoint))
    }

    /// Connected in-memory pair for tests.
    pub fn in_memory_pair() -> (Box<dyn Transport>, Box<dyn Transport>) {
        let (a, b) = InMemoryTransport::pair();
        (Box::new(a), Box::new(b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_pair_delivers_both_ways_in_order() {
        let (mut a, mut b) = InMemoryTransport::pair();

        a.send("one").await.unwrap();
        a.send("two").await.unwrap();
        assert_eq!(b.receive().await.unwrap().as_deref(), Some("one"));
        assert_eq!(b.receive().await.unwrap().as_deref(), Some("two"));

        b.send("back").await.unwrap();
        assert_eq!(a.receive().await.unwrap().as_deref(), Some("back"));
    }

    #[tokio::test]
    async fn dropping_one_side_ends_the_sequence_cleanly() {
        let (mut a, b) = InMemoryTransport::pair();
        drop(b);
        assert!(a.send("into the void").await.is_err());
        assert_eq!(a.receive().await.unwrap(), None);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_terminal() {
        let (mut a, mut b) = InMemoryTransport::pair();
        a.close().await.unwrap();
        a.close().await.unwrap();
        assert!(a.send("x").await.is_err());
        assert_eq!(a.receive().await.unwrap(), None);

        // The peer observes the closure as end-of-sequence.
        assert_eq!(b.receive().await.unwrap(), None);
    }
}
