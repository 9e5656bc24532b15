//! The engine's side of the channel.
//!
//! After the host's hello (and, in sentinel mode, the engine's opening
//! call) the peer serves goals one at a time. While a goal waits on an
//! inbound call, the host may send further goals; those are served
//! recursively before the call's result arrives. Every goal starts with
//! the break flag cleared.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use callbridge_core::ipc::{
    BootstrapMode, ChannelTransport, GoalOutcome, GoalRequest, InboundCallOutcome,
    InboundCallRequest, Message,
};
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};
use crate::interp::{self, CallPort};

pub struct Peer {
    transport: Arc<dyn ChannelTransport>,
    interrupt: Arc<AtomicBool>,
    served: u64,
    depth: usize,
}

impl Peer {
    pub fn new(transport: Arc<dyn ChannelTransport>, interrupt: Arc<AtomicBool>) -> Self {
        Self {
            transport,
            interrupt,
            served: 0,
            depth: 0,
        }
    }

    /// Serve the host until it closes the channel.
    pub fn run(mut self) -> Result<()> {
        match self.serve_forever() {
            Err(e) if is_closed(&e) => {
                info!(goals = self.served, "host closed the channel");
                Ok(())
            }
            other => other,
        }
    }

    fn serve_forever(&mut self) -> Result<()> {
        let hello = match self.transport.receive()? {
            Message::Hello(hello) => hello,
            other => {
                return Err(unexpected(other.label(), "hello"));
            }
        };
        info!(
            session_handle = hello.session_handle,
            bootstrap = %hello.bootstrap,
            examples = hello.examples.len(),
            "connected to host"
        );
        if hello.bootstrap == BootstrapMode::Sentinel {
            self.transport
                .send(&Message::Call(InboundCallRequest::bootstrap(hello.session_handle)))?;
        }

        loop {
            match self.transport.receive() {
                Ok(Message::Goal(goal)) => self.answer(goal)?,
                Ok(other) => warn!("ignoring unexpected {} message", other.label()),
                Err(callbridge_core::Error::Decode(detail)) => {
                    warn!("unreadable message from host: {}", detail);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn answer(&mut self, goal: GoalRequest) -> Result<()> {
        let outcome = self.serve(goal)?;
        self.transport.send(&Message::Outcome(outcome))?;
        Ok(())
    }

    fn serve(&mut self, goal: GoalRequest) -> Result<GoalOutcome> {
        // A break only applies to the work that was running when it came,
        // including goals the host has since given up on.
        self.interrupt.store(false, Ordering::SeqCst);
        self.depth += 1;
        self.served += 1;
        debug!(
            timestamp = goal.timestamp,
            directive = %goal.directive,
            depth = self.depth,
            "serving goal"
        );
        let outcome = interp::run_goal(&goal, self);
        self.depth -= 1;
        outcome
    }
}

impl CallPort for Peer {
    fn call(&mut self, request: InboundCallRequest) -> Result<InboundCallOutcome> {
        self.transport.send(&Message::Call(request))?;
        loop {
            match self.transport.receive()? {
                Message::CallResult(outcome) => return Ok(outcome),
                Message::Goal(goal) => self.answer(goal)?,
                other => return Err(unexpected(other.label(), "call result")),
            }
        }
    }

    fn interrupted(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }

    fn goals_served(&self) -> u64 {
        self.served
    }
}

fn unexpected(found: &str, wanted: &str) -> EngineError {
    EngineError::Channel(callbridge_core::Error::Protocol(format!(
        "expected {}, received {}",
        wanted, found
    )))
}

fn is_closed(e: &EngineError) -> bool {
    matches!(e, EngineError::Channel(callbridge_core::Error::Transport(_)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use callbridge_core::ipc::{Hello, PipeTransport, StreamTransport, pipe::pipe};
    use callbridge_core::Value;
    use std::thread;

    /// A peer on one thread and the host end of its channel.
    fn connected() -> (PipeTransport, thread::JoinHandle<Result<()>>, Arc<AtomicBool>) {
        let (to_peer, peer_reads) = pipe();
        let (peer_writes, from_peer) = pipe();
        let interrupt = Arc::new(AtomicBool::new(false));
        let peer = Peer::new(
            Arc::new(StreamTransport::new(peer_reads, peer_writes)),
            Arc::clone(&interrupt),
        );
        let handle = thread::spawn(move || peer.run());
        (StreamTransport::new(from_peer, to_peer), handle, interrupt)
    }

    fn goal(timestamp: u64, directive: &str, outputs: &str) -> Message {
        Message::Goal(GoalRequest {
            timestamp,
            directive: directive.into(),
            input_var: "_".into(),
            inputs: vec![],
            output_spec: outputs.into(),
        })
    }

    #[test]
    fn test_sentinel_then_goals() {
        let (host, handle, _) = connected();
        host.send(&Message::Hello(Hello::with_catalogue(7, BootstrapMode::Sentinel).unwrap()))
            .unwrap();
        match host.receive().unwrap() {
            Message::Call(call) => assert!(call.is_bootstrap(7)),
            other => panic!("expected sentinel, got {:?}", other),
        }

        host.send(&goal(1, "X = 1, Y = 2", "[X, Y]")).unwrap();
        match host.receive().unwrap() {
            Message::Outcome(o) => {
                assert_eq!(o.timestamp, 1);
                assert_eq!(o.outputs, vec![Value::Int(1), Value::Int(2)]);
            }
            other => panic!("expected outcome, got {:?}", other),
        }

        drop(host);
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_nested_goal_served_while_calling() {
        let (host, handle, _) = connected();
        host.send(&Message::Hello(Hello::with_catalogue(0, BootstrapMode::Direct).unwrap()))
            .unwrap();
        host.send(&goal(1, "call(type(h), run, [], R)", "[R]")).unwrap();

        assert!(matches!(host.receive().unwrap(), Message::Call(_)));
        host.send(&goal(2, "goal_count(N)", "[N]")).unwrap();
        match host.receive().unwrap() {
            Message::Outcome(o) => assert_eq!((o.timestamp, o.outputs), (2, vec![Value::Int(2)])),
            other => panic!("expected nested outcome, got {:?}", other),
        }
        host.send(&Message::CallResult(InboundCallOutcome::returned(Some(Value::from("ok")))))
            .unwrap();
        match host.receive().unwrap() {
            Message::Outcome(o) => assert_eq!((o.timestamp, o.outputs), (1, vec![Value::from("ok")])),
            other => panic!("expected outer outcome, got {:?}", other),
        }

        drop(host);
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_break_interrupts_running_goal() {
        let (host, handle, interrupt) = connected();
        host.send(&Message::Hello(Hello::with_catalogue(0, BootstrapMode::Direct).unwrap()))
            .unwrap();
        host.send(&goal(1, "loop", "[]")).unwrap();
        thread::sleep(std::time::Duration::from_millis(20));
        interrupt.store(true, Ordering::SeqCst);
        match host.receive().unwrap() {
            Message::Outcome(o) => assert_eq!(o.error, Some(Value::from("interrupted"))),
            other => panic!("expected outcome, got {:?}", other),
        }

        // The next goal starts with the flag cleared.
        host.send(&goal(2, "true", "[]")).unwrap();
        assert!(matches!(host.receive().unwrap(), Message::Outcome(o) if o.succeeded));

        drop(host);
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_goal_after_break_runs_while_outer_waits() {
        let (host, handle, interrupt) = connected();
        host.send(&Message::Hello(Hello::with_catalogue(0, BootstrapMode::Direct).unwrap()))
            .unwrap();
        host.send(&goal(1, "call(type(h), slow, [])", "[]")).unwrap();
        assert!(matches!(host.receive().unwrap(), Message::Call(_)));

        // The host gave up on goal 1 after a break and moves on.
        interrupt.store(true, Ordering::SeqCst);
        for timestamp in 2..=3 {
            host.send(&goal(timestamp, "true", "[]")).unwrap();
            match host.receive().unwrap() {
                Message::Outcome(o) => {
                    assert_eq!(o.timestamp, timestamp);
                    assert!(o.succeeded && o.error.is_none(), "{:?}", o);
                }
                other => panic!("expected outcome, got {:?}", other),
            }
        }

        // The slow call finally returns and goal 1 is answered late.
        host.send(&Message::CallResult(InboundCallOutcome::returned(None)))
            .unwrap();
        assert!(matches!(host.receive().unwrap(), Message::Outcome(o) if o.timestamp == 1));

        drop(host);
        handle.join().unwrap().unwrap();
    }
}
