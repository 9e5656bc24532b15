//! callbridge-engine - reference engine speaking the callbridge protocol on stdin/stdout.
//!
//! Logs go to stderr; stdout carries only protocol frames. SIGINT is the
//! host's break signal and interrupts the running goal.

use std::io;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use anyhow::Context;
use callbridge_core::ipc::StreamTransport;
use callbridge_engine::Peer;

fn main() -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_env("CALLBRIDGE_ENGINE_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();

    let interrupt = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&interrupt))
        .context("Failed to install SIGINT handler")?;

    let transport = StreamTransport::new(io::stdin(), io::stdout());
    Peer::new(Arc::new(transport), interrupt)
        .run()
        .context("engine stopped")?;
    Ok(())
}
