//! Engine launchers: how a session obtains its channel and control surface.
//!
//! A launcher starts the engine (a child process or a thread in this process)
//! and hands back an [`EngineLink`]: the structured channel plus an
//! [`EngineControl`] for everything that travels outside the channel.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use super::pipe::{PipeCloser, PipeReader, PipeWriter, pipe};
use super::transport::{ChannelTransport, StreamTransport};
use crate::error::{Error, Result};
use crate::value::Value;

/// Out-of-band control of a running engine.
pub trait EngineControl: Send + Sync {
    /// Ask the engine to stop whatever it is executing.
    fn send_break(&self) -> Result<()>;

    /// Nudge a console-driven engine after a goal was written directly.
    fn kick(&self) -> Result<()> {
        Ok(())
    }

    /// Whether an error reported by the engine means "interrupted".
    fn is_interrupt(&self, error: &Value) -> bool {
        error.as_str() == Some("interrupted")
    }

    /// Directive run once during the handshake to prove the engine is alive.
    fn handshake_directive(&self) -> Option<String> {
        None
    }

    /// Release the engine. Must unblock any pending channel read.
    fn close(&self) -> Result<()>;
}

/// What a launcher hands to a session.
pub struct EngineLink {
    pub transport: Arc<dyn ChannelTransport>,
    pub control: Box<dyn EngineControl>,
}

/// Starts an engine.
pub trait EngineLauncher {
    fn launch(self: Box<Self>) -> Result<EngineLink>;
}

/// Transport type seen by an in-process engine.
pub type PipeTransport = StreamTransport<PipeReader, PipeWriter>;

/// The engine's side of an in-process session.
pub struct PeerEnd {
    pub transport: PipeTransport,
    /// Set by the host's break signal. The engine clears it once observed.
    pub interrupt: Arc<AtomicBool>,
}

type PeerMain = Box<dyn FnOnce(PeerEnd) + Send + 'static>;

/// Runs an engine on a thread of the host process, connected by in-memory pipes.
pub struct InProcessLauncher {
    peer: PeerMain,
    probe: Option<String>,
    name: String,
}

impl InProcessLauncher {
    pub fn new<F>(peer: F) -> Self
    where
        F: FnOnce(PeerEnd) + Send + 'static,
    {
        Self {
            peer: Box::new(peer),
            probe: None,
            name: "callbridge-engine".to_string(),
        }
    }

    /// Run `directive` as the handshake probe goal.
    pub fn with_probe(mut self, directive: impl Into<String>) -> Self {
        self.probe = Some(directive.into());
        self
    }

    /// Thread name for the engine.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl EngineLauncher for InProcessLauncher {
    fn launch(self: Box<Self>) -> Result<EngineLink> {
        let (to_engine, engine_reads) = pipe();
        let (engine_writes, from_engine) = pipe();
        let closers = vec![to_engine.closer(), from_engine.closer()];
        let interrupt = Arc::new(AtomicBool::new(false));

        let end = PeerEnd {
            transport: StreamTransport::new(engine_reads, engine_writes),
            interrupt: Arc::clone(&interrupt),
        };
        let peer = self.peer;
        let thread = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || peer(end))
            .map_err(|e| Error::Launch(format!("Failed to start engine thread: {}", e)))?;
        debug!(name = %self.name, "in-process engine started");

        Ok(EngineLink {
            transport: Arc::new(StreamTransport::new(from_engine, to_engine)),
            control: Box::new(InProcessControl {
                interrupt,
                closers,
                thread: Mutex::new(Some(thread)),
                probe: self.probe,
            }),
        })
    }
}

struct InProcessControl {
    interrupt: Arc<AtomicBool>,
    closers: Vec<PipeCloser>,
    thread: Mutex<Option<JoinHandle<()>>>,
    probe: Option<String>,
}

impl EngineControl for InProcessControl {
    fn send_break(&self) -> Result<()> {
        self.interrupt.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn handshake_directive(&self) -> Option<String> {
        self.probe.clone()
    }

    fn close(&self) -> Result<()> {
        // A busy engine only notices the closed pipes once it stops executing.
        self.interrupt.store(true, Ordering::SeqCst);
        for closer in &self.closers {
            closer.close();
        }
        let handle = self
            .thread
            .lock()
            .map_err(|_| Error::Transport("engine thread handle poisoned".to_string()))?
            .take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return Ok(());
            }
            if handle.join().is_err() {
                warn!("in-process engine panicked");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::protocol::{GoalOutcome, Message};

    #[test]
    fn test_in_process_link_carries_messages() {
        let launcher = InProcessLauncher::new(|end: PeerEnd| {
            while let Ok(Message::Goal(goal)) = end.transport.receive() {
                let reply = Message::Outcome(GoalOutcome::success(goal.timestamp, vec![]));
                if end.transport.send(&reply).is_err() {
                    break;
                }
            }
        });
        let link = Box::new(launcher).launch().unwrap();

        link.transport
            .send(&Message::Goal(crate::ipc::protocol::GoalRequest {
                timestamp: 9,
                directive: "true".into(),
                input_var: "_".into(),
                inputs: vec![],
                output_spec: "[]".into(),
            }))
            .unwrap();
        assert!(matches!(
            link.transport.receive().unwrap(),
            Message::Outcome(GoalOutcome { timestamp: 9, succeeded: true, .. })
        ));
        link.control.close().unwrap();
    }

    #[test]
    fn test_break_sets_flag() {
        let (tx, rx) = std::sync::mpsc::channel();
        let launcher = InProcessLauncher::new(move |end: PeerEnd| {
            tx.send(Arc::clone(&end.interrupt)).unwrap();
            let _ = end.transport.receive();
        });
        let link = Box::new(launcher).launch().unwrap();
        let flag = rx.recv().unwrap();
        assert!(!flag.load(Ordering::SeqCst));
        link.control.send_break().unwrap();
        assert!(flag.load(Ordering::SeqCst));
        link.control.close().unwrap();
    }

    #[test]
    fn test_default_interrupt_recognition() {
        let launcher = InProcessLauncher::new(|_end: PeerEnd| {});
        let link = Box::new(launcher).launch().unwrap();
        assert!(link.control.is_interrupt(&Value::from("interrupted")));
        assert!(!link.control.is_interrupt(&Value::from("syntax_error(x)")));
        link.control.close().unwrap();
    }
}
