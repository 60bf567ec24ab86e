use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use parley_mcp::{
    config::Config,
    protocol::capabilities::{CapabilityOptions, CapabilitySet, PeerInfo, LIST_CHANGED},
    rpc::{Dispatcher, PingMonitor, Role, Session, SessionOptions},
    server::run_server,
    transport::TransportFactory,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TransportKind {
    /// Newline-delimited messages over the process stdio pipe
    Stdio,
    /// HTTP POST ingress with an event-stream push channel
    Http,
}

#[derive(Parser)]
#[command(name = "parley")]
#[command(about = "A capability-negotiated RPC host")]
#[command(version)]
struct Args {
    /// Transport to serve on
    #[arg(long, value_enum, default_value_t = TransportKind::Stdio)]
    transport: TransportKind,

    /// HTTP host
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// HTTP port
    #[arg(long, default_value = "8900")]
    port: u16,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Handshake deadline (e.g. "30s")
    #[arg(long, default_value = "30s")]
    handshake_timeout: humantime::Duration,

    /// Default deadline for outgoing requests (e.g. "60s")
    #[arg(long, default_value = "60s")]
    request_timeout: humantime::Duration,

    /// How long shutdown waits for in-flight work
    #[arg(long, default_value = "10s")]
    drain_timeout: humantime::Duration,

    /// Bound of the per-session outbound queue
    #[arg(long, default_value = "256")]
    outbound_queue: usize,

    /// Push frames retained for event-stream reconnects
    #[arg(long, default_value = "128")]
    replay_window: usize,

    /// Keep-alive ping interval (e.g. "30s"); disabled when omitted
    #[arg(long)]
    ping_interval: Option<humantime::Duration>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    // On stdio the protocol owns stdout; diagnostics must stay on stderr.
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    info!("Starting parley host");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("Transport: {:?}", args.transport);

    let config = Config {
        host: args.host,
        port: args.port,
        handshake_timeout: args.handshake_timeout.into(),
        request_timeout: Some(args.request_timeout.into()),
        drain_timeout: args.drain_timeout.into(),
        outbound_queue: args.outbound_queue,
        replay_window: args.replay_window,
        ping_interval: args.ping_interval.map(Into::into),
        ..Config::default()
    };

    // The bare host serves the protocol lifecycle and utilities; embedders
    // register their own feature handlers on the dispatcher.
    let dispatcher = Arc::new(Dispatcher::new());
    let capabilities = CapabilitySet::new()
        .declare_with("tools", CapabilityOptions::new().with_flag(LIST_CHANGED));
    let info = PeerInfo::new("parley", env!("CARGO_PKG_VERSION"));

    match args.transport {
        TransportKind::Http => {
            run_server(config, dispatcher, capabilities, info).await?;
        }
        TransportKind::Stdio => {
            let ping_interval = config.ping_interval;
            let ping_max_failures = config.ping_max_failures;
            let (session, handle) = Session::new(
                TransportFactory::stdio(),
                dispatcher,
                SessionOptions {
                    role: Role::Responder,
                    capabilities,
                    info,
                    config,
                },
            );
            let runner = tokio::spawn(session.run());
            if let Some(interval) = ping_interval {
                PingMonitor::new(handle.clone(), interval, ping_max_failures).spawn();
            }

            // Signals initiate the shutdown handshake instead of dropping
            // the pipe on the peer.
            let signal_handle = handle.clone();
            tokio::spawn(async move {
                wait_for_signal().await;
                info!("signal received, shutting down");
                if signal_handle.shutdown().await.is_err() {
                    signal_handle.close();
                }
            });

            handle.closed().await;
            runner.await??;
            // Give the drain a moment to settle before the process exits.
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
