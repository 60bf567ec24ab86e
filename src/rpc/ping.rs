//! Keep-alive ping monitor
//!
//! Periodically round-trips a `ping` request and closes the session after a
//! configured number of consecutive failures. Useful on transports where a
//! dead peer is otherwise indistinguishable from a quiet one.

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::rpc::session::{SessionHandle, SessionState};

/// Interval health checker for a running session
pub struct PingMonitor {
    handle: SessionHandle,
    interval: Duration,
    max_failures: u32,
}

impl PingMonitor {
    pub fn new(handle: SessionHandle, interval: Duration, max_failures: u32) -> Self {
        Self {
            handle,
            interval,
            max_failures: max_failures.max(1),
        }
    }

    /// Run the monitor on its own task until the session closes or the
    /// failure budget is exhausted.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            // The first tick fires immediately; skip it so a freshly opened
            // session gets a full interval before its first probe.
            ticker.tick().await;

            let mut failures: u32 = 0;
            loop {
                ticker.tick().await;
                match self.handle.state() {
                    SessionState::Closed => break,
                    SessionState::Ready | SessionState::ShuttingDown => {}
                    // Not up yet; check again next interval.
                    _ => continue,
                }
                match self.handle.ping().await {
                    Ok(()) => {
                        failures = 0;
                        debug!("keep-alive ping ok");
                    }
                    Err(e) => {
                        failures += 1;
                        warn!(
                            failures,
                            max = self.max_failures,
                            error = %e,
                            "keep-alive ping failed"
                        );
                        if failures >= self.max_failures {
                            warn!("ping failure budget exhausted, closing session");
                            self.handle.close();
                            break;
                        }
                    }
                }
            }
        })
    }
}
