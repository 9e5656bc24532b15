//! The dispatch loop: one thread per session that owns steady-state channel I/O.
//!
//! ```text
//!                 ┌──────────────── receive ────────────────┐
//!                 │                                         ▼
//!   engine ◄── send ── next_step ◄── PendingCallTable ◄── route
//!                          ▲                                │
//!                          │          call: spawn / side task
//!                          └── complete_call ◄──────────────┤
//!                                     outcome: finish + resolve slot
//! ```
//!
//! Each iteration reads exactly one message, routes it, then writes at most
//! one message back, chosen by [`PendingCallTable::next_step`].

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::thread;

use tracing::{debug, error, info, warn};

use super::pending::{Finished, NextStep};
use super::slot::SideTask;
use crate::callbacks;
use crate::error::{Error, Result};
use crate::ipc::{BootstrapMode, Fault, GoalOutcome, InboundCallOutcome, InboundCallRequest, Message};
use crate::session::{Session, SessionInner, Shared};

enum Received {
    Message(Message),
    /// A frame arrived but could not be decoded.
    Unreadable(String),
}

pub(crate) struct DispatchLoop {
    shared: Arc<Shared>,
    session: Weak<SessionInner>,
}

impl DispatchLoop {
    pub(crate) fn new(shared: Arc<Shared>, session: Weak<SessionInner>) -> Self {
        Self { shared, session }
    }

    pub(crate) fn run(self) -> Result<()> {
        info!(session = %self.shared.id, "dispatch loop started");
        let direct = self.shared.bootstrap == BootstrapMode::Direct;

        loop {
            let received = match self.shared.transport.receive() {
                Ok(message) => Received::Message(message),
                Err(Error::Decode(detail)) => Received::Unreadable(detail),
                Err(e) => return self.fail(e),
            };

            if let Err(e) = self.route(received) {
                return self.fail(e);
            }

            match self.shared.table.next_step(direct) {
                Ok(NextStep::Send(message)) => {
                    self.trace("host -> engine", &message);
                    if let Err(e) = self.shared.transport.send(&message) {
                        return self.fail(e);
                    }
                }
                Ok(NextStep::Receive) => {}
                Ok(NextStep::Stop) => break,
                Err(e) => return self.fail(e),
            }
        }

        info!(session = %self.shared.id, "dispatch loop stopped");
        Ok(())
    }

    fn route(&self, received: Received) -> Result<()> {
        match received {
            Received::Unreadable(detail) => {
                warn!(session = %self.shared.id, "unreadable message from engine: {}", detail);
                let id = self.shared.table.begin_call()?;
                self.shared.table.complete_call(
                    id,
                    InboundCallOutcome::faulted(Fault::new("decode", detail)),
                )?;
                Ok(())
            }
            Received::Message(message) => {
                self.trace("engine -> host", &message);
                match message {
                    Message::Call(request) => self.route_call(request),
                    Message::Outcome(outcome) => self.route_outcome(outcome),
                    other => Err(Error::Protocol(format!(
                        "unexpected {} message from engine",
                        other.label()
                    ))),
                }
            }
        }
    }

    fn route_call(&self, request: InboundCallRequest) -> Result<()> {
        if request.is_bootstrap(self.shared.anchor) {
            debug!(session = %self.shared.id, "engine opened the channel");
            return Ok(());
        }

        let id = self.shared.table.begin_call()?;
        let job = CallJob {
            id,
            request,
            shared: Arc::clone(&self.shared),
            session: Weak::clone(&self.session),
        };

        let task: SideTask = Box::new(move || job.run());
        if self.shared.threaded_callbacks.load(Ordering::SeqCst) {
            return spawn_callback(task);
        }

        let goal = match self.shared.table.active_for_calling_thread() {
            Ok(goal) => goal,
            // The goal behind this call was ended locally; nobody waits on it.
            Err(e) if self.shared.table.has_abandoned() => {
                debug!(
                    call = id,
                    "no waiting goal ({}); running inbound call on its own thread",
                    e
                );
                return spawn_callback(task);
            }
            Err(e) => return Err(e),
        };
        debug!(call = id, goal = goal.timestamp(), "running inbound call on waiting thread");
        match goal.slot().run_in_waiter(task)? {
            None => Ok(()),
            Some(task) => {
                debug!(
                    call = id,
                    goal = goal.timestamp(),
                    "goal already ended; running inbound call on its own thread"
                );
                spawn_callback(task)
            }
        }
    }

    fn route_outcome(&self, outcome: GoalOutcome) -> Result<()> {
        let timestamp = outcome.timestamp;
        let goal = match self.shared.table.finish(timestamp)? {
            Finished::Goal(goal) => goal,
            Finished::Abandoned => {
                debug!(session = %self.shared.id, timestamp, "dropping outcome of a cancelled goal");
                return Ok(());
            }
        };
        debug!(
            session = %self.shared.id,
            timestamp,
            succeeded = outcome.succeeded,
            "goal completed"
        );
        if let Err(e) = goal.slot().resolve(outcome) {
            // The goal is out of the table, so the cascade in `fail` cannot reach it.
            goal.slot().fail(e.to_string());
            return Err(e);
        }
        Ok(())
    }

    /// Stop the loop after a read/write failure or an inconsistency.
    fn fail(&self, e: Error) -> Result<()> {
        if self.shared.shutting_down.load(Ordering::SeqCst) || self.shared.table.is_closed() {
            debug!(session = %self.shared.id, "dispatch loop ended by shutdown: {}", e);
            return Ok(());
        }

        error!(session = %self.shared.id, "dispatch loop failed: {}", e);
        self.shared.record_failure(&e);
        let ended = self.shared.table.fail_all(&e.to_string());
        self.shared.table.close();
        if ended > 0 {
            warn!(goals = ended, "ended pending goals after channel failure");
        }
        Err(e)
    }

    fn trace(&self, direction: &str, message: &Message) {
        if self.shared.debug {
            info!(session = %self.shared.id, kind = message.label(), "{}: {:?}", direction, message);
        }
    }
}

fn spawn_callback(task: SideTask) -> Result<()> {
    thread::Builder::new()
        .name("callbridge-callback".to_string())
        .spawn(task)?;
    Ok(())
}

/// One inbound call, run on a callback thread or a waiting goal's thread.
struct CallJob {
    id: u64,
    request: InboundCallRequest,
    shared: Arc<Shared>,
    session: Weak<SessionInner>,
}

impl CallJob {
    fn run(self) {
        let outcome = match self.session.upgrade() {
            Some(inner) => {
                let session = Session::from_inner(inner);
                let request = &self.request;
                panic::catch_unwind(AssertUnwindSafe(|| callbacks::execute(&session, request)))
                    .unwrap_or_else(|_| {
                        warn!(method = %request.method, "host callable panicked");
                        InboundCallOutcome::faulted(Fault::new(
                            "host_panic",
                            format!("host callable {} panicked", request.method),
                        ))
                    })
            }
            None => InboundCallOutcome::faulted(Fault::new("session_closed", "session was dropped")),
        };

        if let Err(e) = self.shared.table.complete_call(self.id, outcome) {
            warn!(call = self.id, "failed to record inbound call outcome: {}", e);
        }
    }
}
