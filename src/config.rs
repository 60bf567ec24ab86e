//! Engine and host configuration

use std::time::Duration;

/// Tunables for sessions and the HTTP host.
///
/// Defaults are suitable for local development; the binary overrides them
/// from CLI flags.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP host bind address
    pub host: String,
    /// HTTP host port
    pub port: u16,
    /// Initialization must complete within this window or the session closes
    pub handshake_timeout: Duration,
    /// Default deadline applied to outgoing requests; `None` waits forever
    pub request_timeout: Option<Duration>,
    /// How long a shutting-down session waits for in-flight work to drain
    pub drain_timeout: Duration,
    /// Bound of the per-session outbound queue; overflow rejects the send
    pub outbound_queue: usize,
    /// How many pushed frames the event-stream replay ring retains
    pub replay_window: usize,
    /// Interval between keep-alive pings; `None` disables the monitor
    pub ping_interval: Option<Duration>,
    /// Deadline for a single keep-alive ping
    pub ping_timeout: Duration,
    /// Consecutive ping failures tolerated before the session is closed
    pub ping_max_failures: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8900,
            handshake_timeout: Duration::from_secs(30),
            request_timeout: Some(Duration::from_secs(60)),
            drain_timeout: Duration::from_secs(10),
            outbound_queue: 256,
            replay_window: 128,
            ping_interval: None,
            ping_timeout: Duration::from_secs(5),
            ping_max_failures: 3,
        }
    }
}

impl Config {
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
