//! Channel plumbing between the host and an engine.
//!
//! This module provides the wire protocol, the framed transport, and the
//! launchers that start an engine in a child process or on a local thread.

mod launcher;
pub mod pipe;
mod process;
pub mod protocol;
mod transport;

pub use launcher::{
    EngineControl, EngineLauncher, EngineLink, InProcessLauncher, PeerEnd, PipeTransport,
};
pub use process::{ENGINE_PATH_VAR, ProcessLauncher};
pub use protocol::{
    ANONYMOUS_VAR, BOOTSTRAP_METHOD, BootstrapMode, Fault, GoalOutcome, GoalRequest, Hello,
    InboundCallOutcome, InboundCallRequest, Message, read_message, write_message,
};
pub use transport::{ChannelTransport, StreamTransport};
