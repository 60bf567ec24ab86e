//! Newline-delimited stdio transport
//!
//! One complete UTF-8 JSON message per line. Reads block until a full frame
//! or end of stream; EOF on the read side is the clean end of the inbound
//! sequence. Both logical streams are strictly ordered. The implementation
//! is generic over the underlying reader and writer so tests can drive it
//! with duplex pipes instead of the real process stdio.

use async_trait::async_trait;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, Stdin, Stdout,
};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::transport::Transport;

/// Default buffer size for stdio framing (64KB)
const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Newline-delimited frame transport over an async read/write pair
pub struct StdioTransport<R = BufReader<Stdin>, W = BufWriter<Stdout>> {
    reader: R,
    writer: W,
    /// Partial-line carry-over; keeps `receive` safe to cancel mid-read
    buffer: Vec<u8>,
    is_closed: bool,
}

impl StdioTransport {
    /// Frame over the real process stdio.
    pub fn new() -> Self {
        Self {
            reader: BufReader::with_capacity(DEFAULT_BUFFER_SIZE, tokio::io::stdin()),
            writer: BufWriter::with_capacity(DEFAULT_BUFFER_SIZE, tokio::io::stdout()),
            buffer: Vec::new(),
            is_closed: false,
        }
    }
}

impl Default for StdioTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl<R, W> StdioTransport<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Frame over an arbitrary reader/writer pair (tests, child pipes).
    pub fn from_parts(reader: R, writer: W) -> Self {
        Self {
            reader,
            writer,
            buffer: Vec::new(),
            is_closed: false,
        }
    }

    /// A frame must be a single line; an embedded newline would desync the
    /// peer's framing.
    fn validate_frame(frame: &str) -> Result<()> {
        if frame.contains('\n') || frame.contains('\r') {
            return Err(Error::Transport(
                "frame contains an embedded newline".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl<R, W> Transport for StdioTransport<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, frame: &str) -> Result<()> {
        if self.is_closed {
            return Err(Error::Transport("stdio transport is closed".to_string()));
        }
        Self::validate_frame(frame)?;

        self.writer.write_all(frame.as_bytes()).await.map_err(|e| {
            self.is_closed = true;
            Error::Transport(format!("failed to write frame: {}", e))
        })?;
        self.writer.write_all(b"\n").await.map_err(|e| {
            self.is_closed = true;
            Error::Transport(format!("failed to write frame delimiter: {}", e))
        })?;
        self.writer.flush().await.map_err(|e| {
            self.is_closed = true;
            Error::Transport(format!("failed to flush frame: {}", e))
        })?;

        debug!(bytes = frame.len(), "sent stdio frame");
        Ok(())
    }

    async fn receive(&mut self) -> Result<Option<String>> {
        if self.is_closed {
            return Ok(None);
        }

        loop {
            // read_until appends partial reads to the persistent buffer, so
            // a cancelled receive resumes where it left off.
            match self.reader.read_until(b'\n', &mut self.buffer).await {
                Ok(0) => {
                    info!("stdio reached EOF, peer disconnected");
                    self.is_closed = true;
                    return Ok(None);
                }
                Ok(_) => {
                    if self.buffer.last() != Some(&b'\n') {
                        // EOF in the middle of a frame; treat as stream end.
                        warn!("discarding incomplete trailing frame");
                        self.is_closed = true;
                        return Ok(None);
                    }
                    let mut raw = std::mem::take(&mut self.buffer);
                    raw.pop();
                    if raw.last() == Some(&b'\r') {
                        raw.pop();
                    }
                    let line = match String::from_utf8(raw) {
                        Ok(line) => line,
                        Err(e) => {
                            warn!("dropping non-UTF-8 frame: {}", e);
                            continue;
                        }
                    };
                    // Blank lines are keep-alive noise, not frames.
                    if line.trim().is_empty() {
                        continue;
                    }
                    debug!(bytes = line.len(), "received stdio frame");
                    return Ok(Some(line));
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("stdio read failed: {}", e);
                    self.is_closed = true;
                    return Err(Error::Transport(format!("failed to read frame: {}", e)));
                }
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        if !self.is_closed {
            if let Err(e) = self.writer.flush().await {
                warn!("error flushing stdio on close: {}", e);
            }
            if let Err(e) = self.writer.shutdown().await {
                warn!("error shutting down stdio writer: {}", e);
            }
            self.is_closed = true;
            info!("stdio transport closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn piped() -> (
        StdioTransport<BufReader<tokio::io::DuplexStream>, tokio::io::DuplexStream>,
        StdioTransport<BufReader<tokio::io::DuplexStream>, tokio::io::DuplexStream>,
    ) {
        let (a_rx, b_tx) = tokio::io::duplex(4096);
        let (b_rx, a_tx) = tokio::io::duplex(4096);
        (
            StdioTransport::from_parts(BufReader::new(a_rx), a_tx),
            StdioTransport::from_parts(BufReader::new(b_rx), b_tx),
        )
    }

    #[tokio::test]
    async fn frames_round_trip_in_order() {
        let (mut a, mut b) = piped();

        b.send(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#).await.unwrap();
        b.send(r#"{"jsonrpc":"2.0","id":2,"method":"ping"}"#).await.unwrap();

        let first = a.receive().await.unwrap().unwrap();
        let second = a.receive().await.unwrap().unwrap();
        assert!(first.contains("\"id\":1"));
        assert!(second.contains("\"id\":2"));
    }

    #[tokio::test]
    async fn blank_lines_are_skipped() {
        let (a_rx, mut feeder) = tokio::io::duplex(4096);
        let (_b_rx, a_tx) = tokio::io::duplex(4096);
        let mut transport = StdioTransport::from_parts(BufReader::new(a_rx), a_tx);

        feeder.write_all(b"\n  \n{\"jsonrpc\":\"2.0\",\"method\":\"x\"}\n").await.unwrap();
        let frame = transport.receive().await.unwrap().unwrap();
        assert!(frame.contains("\"method\":\"x\""));
    }

    #[tokio::test]
    async fn eof_is_a_clean_close() {
        let (a_rx, feeder) = tokio::io::duplex(4096);
        let (_b_rx, a_tx) = tokio::io::duplex(4096);
        let mut transport = StdioTransport::from_parts(BufReader::new(a_rx), a_tx);

        drop(feeder);
        assert_eq!(transport.receive().await.unwrap(), None);
        // Terminal: later receives keep reporting end-of-sequence.
        assert_eq!(transport.receive().await.unwrap(), None);
    }

    #[tokio::test]
    async fn embedded_newlines_are_rejected_before_writing() {
        let (mut a, _b) = piped();
        let result = a.send("{\"jsonrpc\":\"2.0\",\n\"id\":1}").await;
        assert!(matches!(result, Err(Error::Transport(_))));
        // The transport survives a rejected frame.
        a.send(r#"{"jsonrpc":"2.0","method":"ok"}"#).await.unwrap();
    }

    #[tokio::test]
    async fn crlf_delimiters_are_tolerated() {
        let (a_rx, mut feeder) = tokio::io::duplex(4096);
        let (_b_rx, a_tx) = tokio::io::duplex(4096);
        let mut transport = StdioTransport::from_parts(BufReader::new(a_rx), a_tx);

        feeder
            .write_all(b"{\"jsonrpc\":\"2.0\",\"method\":\"win\"}\r\n")
            .await
            .unwrap();
        let frame = transport.receive().await.unwrap().unwrap();
        assert_eq!(frame, "{\"jsonrpc\":\"2.0\",\"method\":\"win\"}");
    }
}
