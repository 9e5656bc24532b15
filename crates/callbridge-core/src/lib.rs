//! Host side of the callbridge goal/callback exchange.
//!
//! This crate provides:
//! - Engine sessions: goal submission, interrupt, shutdown
//! - The dispatch loop coordinating goals and inbound calls on one channel
//! - Handle registry for host objects referenced by the engine
//! - Pluggable dispatch of inbound calls to host callables
//! - Framed wire protocol, stream transports and engine launchers

pub mod callbacks;
pub mod config;
pub mod coord;
pub mod error;
pub mod goal;
pub mod ipc;
pub mod registry;
pub mod session;
pub mod value;

pub use callbacks::{Arg, CallDispatcher, CallResult, ParamType, Returned};
pub use config::{BootstrapMode, SessionConfig};
pub use error::{Error, Result};
pub use goal::Goal;
pub use ipc::{
    EngineControl, EngineLauncher, EngineLink, Fault, InProcessLauncher, PeerEnd, ProcessLauncher,
};
pub use registry::{HandleRegistry, HostObject};
pub use session::{Session, SessionAnchor, SessionState};
pub use value::Value;
