//! Reference peer engine for callbridge sessions.
//!
//! Interprets a small directive language (see [`term`]) and speaks the
//! callbridge wire protocol. It runs either on a thread of the host process
//! ([`in_process_launcher`]) or as the `callbridge-engine` binary over
//! stdin/stdout.

pub mod error;
pub mod interp;
pub mod peer;
pub mod term;

use std::sync::Arc;

use callbridge_core::{InProcessLauncher, PeerEnd};
use tracing::warn;

pub use error::{EngineError, Result};
pub use peer::Peer;

/// Directive used as the handshake probe.
pub const PROBE_DIRECTIVE: &str = "true";

/// Serve one in-process session until the host closes it.
pub fn serve(end: PeerEnd) -> Result<()> {
    Peer::new(Arc::new(end.transport), end.interrupt).run()
}

/// Launcher running the reference engine on a thread of this process.
pub fn in_process_launcher() -> InProcessLauncher {
    InProcessLauncher::new(|end| {
        if let Err(e) = serve(end) {
            warn!("in-process engine stopped: {}", e);
        }
    })
    .with_probe(PROBE_DIRECTIVE)
}
