//! Proxy a SignalR hub and print its traffic.
//!
//! Demonstrates:
//! - Starting a monitor proxy in front of a hub server
//! - Serving remote observers over the relay WebSocket
//! - Watching the source locally and printing every envelope
//!
//! Usage:
//!   cargo run --example proxy -- --upstream ws://localhost:5000
//!   cargo run --example proxy -- --upstream ws://localhost:5000 --listen 127.0.0.1:8080
//!   cargo run --example proxy -- --upstream ws://localhost:5000 --relay 127.0.0.1:9000 --debug

// ============================================================================
// Imports
// ============================================================================

use std::net::SocketAddr;

use signalr_monitor::{Error, Monitor, RelayMessage, Result, SourceId};
use tracing_subscriber::EnvFilter;

// ============================================================================
// Constants
// ============================================================================

const DEFAULT_LISTEN: &str = "127.0.0.1:8080";
const DEFAULT_UPSTREAM: &str = "ws://127.0.0.1:5000";

// ============================================================================
// Args
// ============================================================================

/// Command-line arguments.
#[derive(Debug, Clone)]
struct Args {
    debug: bool,
    listen: String,
    upstream: String,
    relay: Option<String>,
}

impl Args {
    fn parse() -> Self {
        let args: Vec<String> = std::env::args().collect();
        let value = |flag: &str| {
            args.iter()
                .position(|a| a == flag)
                .and_then(|i| args.get(i + 1))
                .cloned()
        };

        Self {
            debug: args.iter().any(|a| a == "--debug"),
            listen: value("--listen").unwrap_or_else(|| DEFAULT_LISTEN.to_string()),
            upstream: value("--upstream").unwrap_or_else(|| DEFAULT_UPSTREAM.to_string()),
            relay: value("--relay"),
        }
    }
}

fn init_logging(debug: bool) {
    let filter = if debug {
        "signalr_monitor=debug"
    } else {
        "signalr_monitor=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(false)
        .init();
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.debug);

    if let Err(e) = run(args).await {
        eprintln!("\n[ERROR] {e}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    println!("=== SignalR Monitor Proxy ===\n");

    let monitor = Monitor::builder().build()?;
    let source = SourceId::new(1).ok_or_else(|| Error::config("source id must be non-zero"))?;

    let listen: SocketAddr = args
        .listen
        .parse()
        .map_err(|e| Error::config(format!("bad --listen: {e}")))?;
    let proxy = monitor.proxy(source, listen, &args.upstream).await?;
    println!("[Proxy] {} -> {}", proxy.ws_url(), args.upstream);

    if let Some(relay) = &args.relay {
        let relay: SocketAddr = relay
            .parse()
            .map_err(|e| Error::config(format!("bad --relay: {e}")))?;
        let server = monitor.relay_server(relay).await?;
        println!("[Relay] observers connect to {}", server.ws_url());
    }

    println!("Press Ctrl+C to exit...\n");

    let (_watcher, mut messages) = monitor.watch(source);
    loop {
        tokio::select! {
            message = messages.recv() => {
                let Some(message) = message else { break };
                print_message(&message);
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    monitor.close();
    Ok(())
}

fn print_message(message: &RelayMessage) {
    match message {
        RelayMessage::History { envelopes, .. } => {
            println!("[History] {} envelope(s)", envelopes.len());
        }
        RelayMessage::NewMessage { envelope } => {
            println!(
                "#{:<5} {:<18} {}",
                envelope.monotonic_seq, envelope.event_type, envelope.data
            );
        }
        RelayMessage::Cleared { .. } => println!("[Cleared]"),
        RelayMessage::Status { state, .. } => println!("[Status] {state:?}"),
    }
}
