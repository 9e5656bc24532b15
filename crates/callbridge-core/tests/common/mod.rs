//! Scripted engine peer for driving a session from tests.

#![allow(dead_code)]

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use callbridge_core::ipc::{
    ChannelTransport, GoalOutcome, GoalRequest, Hello, InboundCallOutcome, InboundCallRequest,
    Message,
};
use callbridge_core::{BootstrapMode, InProcessLauncher, PeerEnd, Session, SessionConfig};

/// The engine side of a test session, driven step by step.
pub struct ScriptedPeer {
    pub end: PeerEnd,
    pub hello: Option<Hello>,
}

impl ScriptedPeer {
    /// Read the host's hello.
    pub fn accept(&mut self) -> Hello {
        match self.end.transport.receive().expect("hello") {
            Message::Hello(hello) => {
                self.hello = Some(hello.clone());
                hello
            }
            other => panic!("expected hello, got {:?}", other),
        }
    }

    /// Read the hello and, in sentinel mode, open the channel.
    pub fn open(&mut self) -> Hello {
        let hello = self.accept();
        if hello.bootstrap == BootstrapMode::Sentinel {
            self.send_sentinel();
        }
        hello
    }

    pub fn send_sentinel(&self) {
        let handle = self.hello.as_ref().expect("hello first").session_handle;
        self.end
            .transport
            .send(&Message::Call(InboundCallRequest::bootstrap(handle)))
            .unwrap();
    }

    pub fn next_goal(&self) -> GoalRequest {
        match self.end.transport.receive().expect("goal") {
            Message::Goal(goal) => goal,
            other => panic!("expected goal, got {:?}", other),
        }
    }

    /// Wait for a goal; None once the host closes the channel.
    pub fn try_next_goal(&self) -> Option<GoalRequest> {
        match self.end.transport.receive() {
            Ok(Message::Goal(goal)) => Some(goal),
            Ok(other) => panic!("expected goal, got {:?}", other),
            Err(_) => None,
        }
    }

    pub fn reply(&self, outcome: GoalOutcome) {
        self.end.transport.send(&Message::Outcome(outcome)).unwrap();
    }

    pub fn succeed(&self, goal: &GoalRequest, outputs: Vec<callbridge_core::Value>) {
        self.reply(GoalOutcome::success(goal.timestamp, outputs));
    }

    /// Issue an inbound call and wait for its result.
    pub fn call(&self, request: InboundCallRequest) -> InboundCallOutcome {
        self.end.transport.send(&Message::Call(request)).unwrap();
        self.call_result()
    }

    pub fn call_result(&self) -> InboundCallOutcome {
        match self.end.transport.receive().expect("call result") {
            Message::CallResult(outcome) => outcome,
            other => panic!("expected call result, got {:?}", other),
        }
    }

    /// Block until the host closes the channel.
    pub fn drain(&self) {
        while self.end.transport.receive().is_ok() {}
    }

    /// Poll the break flag until it is raised or `timeout` passes.
    pub fn wait_for_break(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.end.interrupt.swap(false, Ordering::SeqCst) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        false
    }
}

/// Launcher running `script` as the engine.
pub fn scripted<F>(script: F) -> InProcessLauncher
where
    F: FnOnce(ScriptedPeer) + Send + 'static,
{
    InProcessLauncher::new(move |end: PeerEnd| script(ScriptedPeer { end, hello: None }))
}

/// Start a session against `script` with default config.
pub fn start<F>(script: F) -> Session
where
    F: FnOnce(ScriptedPeer) + Send + 'static,
{
    Session::start(scripted(script), SessionConfig::default()).expect("session start")
}

/// Spin until `pred` holds, failing the test after two seconds.
pub fn eventually(what: &str, pred: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !pred() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(2));
    }
}
