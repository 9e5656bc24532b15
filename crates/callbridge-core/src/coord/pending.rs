//! Table of outstanding goals and in-flight inbound calls.
//!
//! Everything here lives behind one mutex so that "is anything outstanding?"
//! is answered consistently with every insertion and removal. The same lock
//! domain owns the calling-thread stack used to attribute inbound calls to
//! the goal that caused them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use rustc_hash::FxHashSet;
use tracing::debug;

use super::slot::CallSlot;
use crate::error::{Error, Result, lock_error};
use crate::ipc::{GoalRequest, InboundCallOutcome, Message};

/// A submitted goal, shared by the submitting thread and the dispatch loop.
#[derive(Debug)]
pub struct PendingGoal {
    request: GoalRequest,
    slot: CallSlot,
    caller: ThreadId,
    first: AtomicBool,
}

impl PendingGoal {
    /// Create a goal owned by the current thread.
    pub fn new(request: GoalRequest) -> Self {
        Self {
            request,
            slot: CallSlot::new(),
            caller: thread::current().id(),
            first: AtomicBool::new(false),
        }
    }

    pub fn timestamp(&self) -> u64 {
        self.request.timestamp
    }

    pub fn request(&self) -> &GoalRequest {
        &self.request
    }

    pub fn slot(&self) -> &CallSlot {
        &self.slot
    }

    pub fn caller(&self) -> ThreadId {
        self.caller
    }

    /// Whether this goal took the first-goal submission path.
    pub fn is_first(&self) -> bool {
        self.first.load(Ordering::SeqCst)
    }

    fn mark_first(&self) {
        self.first.store(true, Ordering::SeqCst);
    }
}

/// What the dispatch loop should do after routing a message.
#[derive(Debug)]
pub enum NextStep {
    /// Write this message to the engine.
    Send(Message),
    /// Nothing to send; go back to reading.
    Receive,
    /// The table was closed.
    Stop,
}

/// Result of matching an engine outcome against the table.
#[derive(Debug)]
pub enum Finished {
    /// The goal was pending and is now removed.
    Goal(Arc<PendingGoal>),
    /// The goal was sent, then ended locally by an interrupt or abort cascade.
    Abandoned,
}

/// Which work a cascade ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cascade {
    /// Pending goals only; in-flight calls still report to the engine.
    Interrupt,
    /// Pending goals and in-flight calls.
    Abort,
    /// Everything: the channel is gone.
    Fault,
}

#[derive(Debug)]
struct InFlightCall {
    id: u64,
    outcome: Option<InboundCallOutcome>,
}

#[derive(Debug, Default)]
struct TableState {
    goals: Vec<Arc<PendingGoal>>,
    calls: Vec<InFlightCall>,
    callers: Vec<ThreadId>,
    /// Sent goals ended by a cascade whose outcome the engine still owes.
    abandoned: FxHashSet<u64>,
    next_call_id: u64,
    closed: bool,
}

impl TableState {
    fn is_idle(&self) -> bool {
        self.goals.is_empty() && self.calls.is_empty()
    }

    fn start(&mut self, goal: &Arc<PendingGoal>) -> Result<()> {
        goal.slot.mark_started()?;
        self.callers.push(goal.caller);
        Ok(())
    }

    fn take_goals(&mut self, cascade: Cascade) -> Vec<Arc<PendingGoal>> {
        let goals = std::mem::take(&mut self.goals);
        match cascade {
            Cascade::Interrupt => {}
            Cascade::Abort => self.calls.clear(),
            Cascade::Fault => {
                self.calls.clear();
                self.callers.clear();
                self.abandoned.clear();
                return goals;
            }
        }
        // The caller stack keeps the entries of sent goals: the engine will
        // still answer them, in order.
        self.abandoned.extend(
            goals
                .iter()
                .filter(|g| g.slot.has_started())
                .map(|g| g.timestamp()),
        );
        goals
    }
}

/// Outstanding work of one session.
#[derive(Debug, Default)]
pub struct PendingCallTable {
    state: Mutex<TableState>,
    changed: Condvar,
}

impl PendingCallTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a goal for the dispatch loop to send.
    pub fn schedule(&self, goal: Arc<PendingGoal>) -> Result<()> {
        let mut state = self.state.lock().map_err(lock_error)?;
        if state.closed {
            return Err(Error::ShuttingDown);
        }
        state.goals.push(goal);
        self.changed.notify_all();
        Ok(())
    }

    /// Add a goal, claiming it for direct submission if nothing else is outstanding.
    ///
    /// Returns true when the caller must write the goal to the channel itself:
    /// the goal is then already marked first and started, with its thread on
    /// the caller stack.
    pub fn schedule_direct(&self, goal: Arc<PendingGoal>) -> Result<bool> {
        let mut state = self.state.lock().map_err(lock_error)?;
        if state.closed {
            return Err(Error::ShuttingDown);
        }
        let direct = state.is_idle();
        if direct {
            goal.mark_first();
            state.start(&goal)?;
        }
        state.goals.push(goal);
        self.changed.notify_all();
        Ok(direct)
    }

    /// Add the session's first goal. Fails if anything is outstanding.
    pub fn schedule_first(&self, goal: Arc<PendingGoal>) -> Result<()> {
        let mut state = self.state.lock().map_err(lock_error)?;
        if state.closed {
            return Err(Error::ShuttingDown);
        }
        if !state.is_idle() {
            return Err(Error::Protocol(
                "first goal submitted while work is outstanding".to_string(),
            ));
        }
        goal.mark_first();
        state.goals.push(goal);
        self.changed.notify_all();
        Ok(())
    }

    /// The newest goal that has not been sent yet.
    pub fn most_recent_unstarted(&self) -> Result<Option<Arc<PendingGoal>>> {
        let state = self.state.lock().map_err(lock_error)?;
        Ok(state
            .goals
            .iter()
            .rev()
            .find(|g| !g.slot.has_started())
            .cloned())
    }

    /// The goal whose execution caused the inbound call now being routed.
    ///
    /// That is the newest started goal submitted by the thread on top of the
    /// caller stack.
    pub fn active_for_calling_thread(&self) -> Result<Arc<PendingGoal>> {
        let state = self.state.lock().map_err(lock_error)?;
        let caller = state.callers.last().copied().ok_or_else(|| {
            Error::Protocol("inbound call with no goal in progress".to_string())
        })?;
        state
            .goals
            .iter()
            .rev()
            .find(|g| g.caller == caller && g.slot.has_started())
            .cloned()
            .ok_or_else(|| {
                Error::Protocol(format!(
                    "no goal in progress for calling thread {:?}",
                    caller
                ))
            })
    }

    /// Remove and return the goal with `timestamp`.
    pub fn forget(&self, timestamp: u64) -> Result<Option<Arc<PendingGoal>>> {
        let mut state = self.state.lock().map_err(lock_error)?;
        let index = state.goals.iter().position(|g| g.timestamp() == timestamp);
        let goal = index.map(|i| state.goals.remove(i));
        self.changed.notify_all();
        Ok(goal)
    }

    /// Match an engine outcome for `timestamp`, popping the caller pushed when
    /// the goal was sent.
    ///
    /// An outcome for a goal the table never sent, or already matched, is a
    /// protocol inconsistency.
    pub fn finish(&self, timestamp: u64) -> Result<Finished> {
        let mut state = self.state.lock().map_err(lock_error)?;
        let index = state
            .goals
            .iter()
            .position(|g| g.timestamp() == timestamp && g.slot.has_started());
        if index.is_none() && !state.abandoned.contains(&timestamp) {
            return Err(Error::Protocol(format!(
                "outcome for unknown goal {}",
                timestamp
            )));
        }
        if state.callers.pop().is_none() {
            return Err(Error::Protocol(format!(
                "outcome for goal {} while no goal was in progress",
                timestamp
            )));
        }
        let finished = match index {
            Some(i) => Finished::Goal(state.goals.remove(i)),
            None => {
                state.abandoned.remove(&timestamp);
                Finished::Abandoned
            }
        };
        self.changed.notify_all();
        Ok(finished)
    }

    /// Pop the caller pushed when the goal now completing was sent.
    pub fn pop_caller(&self) -> Result<Option<ThreadId>> {
        let mut state = self.state.lock().map_err(lock_error)?;
        Ok(state.callers.pop())
    }

    /// Register an inbound call as in flight and return its id.
    pub fn begin_call(&self) -> Result<u64> {
        let mut state = self.state.lock().map_err(lock_error)?;
        let id = state.next_call_id;
        state.next_call_id += 1;
        state.calls.push(InFlightCall { id, outcome: None });
        Ok(id)
    }

    /// Record the outcome of an in-flight call.
    ///
    /// Returns false if the call is no longer tracked, which happens when a
    /// cascade cleared the table while the call was running.
    pub fn complete_call(&self, id: u64, outcome: InboundCallOutcome) -> Result<bool> {
        let mut state = self.state.lock().map_err(lock_error)?;
        let Some(call) = state.calls.iter_mut().find(|c| c.id == id) else {
            debug!(call = id, "dropping outcome of untracked inbound call");
            return Ok(false);
        };
        call.outcome = Some(outcome);
        self.changed.notify_all();
        Ok(true)
    }

    /// Decide what to send next, waiting until there is something to do.
    ///
    /// Priority: the outcome of the newest in-flight call once it completes,
    /// then the newest unsent goal. In direct mode the loop goes back to
    /// reading when the only work outstanding is the directly sent goal.
    pub fn next_step(&self, direct: bool) -> Result<NextStep> {
        let mut state = self.state.lock().map_err(lock_error)?;
        loop {
            if state.closed {
                return Ok(NextStep::Stop);
            }

            if state.calls.last().is_some_and(|c| c.outcome.is_some()) {
                let outcome = state.calls.pop().and_then(|c| c.outcome);
                self.changed.notify_all();
                if let Some(outcome) = outcome {
                    return Ok(NextStep::Send(Message::CallResult(outcome)));
                }
            }

            if let Some(goal) = state
                .goals
                .iter()
                .rev()
                .find(|g| !g.slot.has_started())
                .cloned()
            {
                state.start(&goal)?;
                return Ok(NextStep::Send(Message::Goal(goal.request.clone())));
            }

            if direct && state.calls.is_empty() && state.goals.iter().all(|g| g.is_first()) {
                return Ok(NextStep::Receive);
            }

            state = self.changed.wait(state).map_err(lock_error)?;
        }
    }

    /// True iff no goals are pending and no inbound calls are in flight.
    pub fn is_idle(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_idle()
    }

    /// Block until idle. Returns false if `timeout` elapsed first.
    pub fn wait_until_idle(&self, timeout: Option<Duration>) -> Result<bool> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock().map_err(lock_error)?;
        while !state.is_idle() {
            match deadline {
                None => state = self.changed.wait(state).map_err(lock_error)?,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(false);
                    }
                    state = self
                        .changed
                        .wait_timeout(state, deadline - now)
                        .map_err(lock_error)?
                        .0;
                }
            }
        }
        Ok(true)
    }

    pub fn pending_goals(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .goals
            .len()
    }

    pub fn inflight_calls(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .calls
            .len()
    }

    /// End every pending goal as aborted and stop tracking in-flight calls.
    /// Returns how many goals were ended.
    pub fn abort_all(&self) -> usize {
        self.end_all(Cascade::Abort, CallSlot::abort)
    }

    /// End every pending goal as interrupted.
    ///
    /// In-flight calls stay tracked so their results still reach the engine,
    /// which is left free to serve later goals.
    pub fn interrupt_all(&self) -> usize {
        self.end_all(Cascade::Interrupt, CallSlot::interrupt)
    }

    /// End every pending goal with a channel fault and clear the table.
    pub fn fail_all(&self, fault: &str) -> usize {
        self.end_all(Cascade::Fault, |slot| slot.fail(fault))
    }

    /// Whether some sent goal was ended locally and not yet answered.
    pub fn has_abandoned(&self) -> bool {
        !self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .abandoned
            .is_empty()
    }

    fn end_all(&self, cascade: Cascade, end: impl Fn(&CallSlot)) -> usize {
        let goals = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let goals = state.take_goals(cascade);
            self.changed.notify_all();
            goals
        };
        for goal in &goals {
            end(&goal.slot);
        }
        goals.len()
    }

    /// Refuse new work and wake every waiter.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.closed = true;
        state.calls.clear();
        state.callers.clear();
        state.abandoned.clear();
        self.changed.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::slot::Completion;
    use crate::ipc::{ANONYMOUS_VAR, GoalOutcome};

    fn goal(ts: u64) -> Arc<PendingGoal> {
        Arc::new(PendingGoal::new(GoalRequest {
            timestamp: ts,
            directive: format!("g{}", ts),
            input_var: ANONYMOUS_VAR.to_string(),
            inputs: vec![],
            output_spec: "[]".to_string(),
        }))
    }

    fn sent_timestamp(step: NextStep) -> u64 {
        match step {
            NextStep::Send(Message::Goal(g)) => g.timestamp,
            other => panic!("expected a goal, got {:?}", other),
        }
    }

    #[test]
    fn test_new_table_is_idle() {
        let table = PendingCallTable::new();
        assert!(table.is_idle());
        assert!(table.wait_until_idle(Some(Duration::ZERO)).unwrap());
    }

    #[test]
    fn test_lifo_dispatch() {
        let table = PendingCallTable::new();
        for ts in 1..=3 {
            table.schedule(goal(ts)).unwrap();
        }
        assert_eq!(table.most_recent_unstarted().unwrap().unwrap().timestamp(), 3);
        assert_eq!(sent_timestamp(table.next_step(false).unwrap()), 3);
        assert_eq!(sent_timestamp(table.next_step(false).unwrap()), 2);
        assert_eq!(sent_timestamp(table.next_step(false).unwrap()), 1);
        assert!(table.most_recent_unstarted().unwrap().is_none());
    }

    #[test]
    fn test_forget_by_timestamp() {
        let table = PendingCallTable::new();
        table.schedule(goal(1)).unwrap();
        table.schedule(goal(2)).unwrap();

        assert!(table.forget(5).unwrap().is_none());
        assert_eq!(table.forget(1).unwrap().unwrap().timestamp(), 1);
        assert!(!table.is_idle());
        assert_eq!(table.forget(2).unwrap().unwrap().timestamp(), 2);
        assert!(table.is_idle());
    }

    #[test]
    fn test_completed_call_outcome_takes_priority() {
        let table = PendingCallTable::new();
        table.schedule(goal(1)).unwrap();
        let call = table.begin_call().unwrap();
        table
            .complete_call(call, InboundCallOutcome::returned(None))
            .unwrap();

        assert!(matches!(
            table.next_step(false).unwrap(),
            NextStep::Send(Message::CallResult(_))
        ));
        assert_eq!(sent_timestamp(table.next_step(false).unwrap()), 1);
    }

    #[test]
    fn test_only_newest_call_is_answered() {
        let table = PendingCallTable::new();
        let older = table.begin_call().unwrap();
        let newer = table.begin_call().unwrap();
        table
            .complete_call(older, InboundCallOutcome::returned(None))
            .unwrap();
        table.schedule(goal(1)).unwrap();

        // The older call finished first but the newer one blocks it.
        assert_eq!(sent_timestamp(table.next_step(false).unwrap()), 1);
        table
            .complete_call(newer, InboundCallOutcome::returned(None))
            .unwrap();
        assert!(matches!(table.next_step(false).unwrap(), NextStep::Send(Message::CallResult(_))));
        assert!(matches!(table.next_step(false).unwrap(), NextStep::Send(Message::CallResult(_))));
        assert_eq!(table.inflight_calls(), 0);
    }

    #[test]
    fn test_active_goal_for_calling_thread() {
        let table = PendingCallTable::new();
        assert!(matches!(
            table.active_for_calling_thread(),
            Err(Error::Protocol(_))
        ));

        table.schedule(goal(1)).unwrap();
        sent_timestamp(table.next_step(false).unwrap());
        assert_eq!(table.active_for_calling_thread().unwrap().timestamp(), 1);
    }

    #[test]
    fn test_direct_scheduling_only_when_idle() {
        let table = PendingCallTable::new();
        let first = goal(1);
        assert!(table.schedule_direct(Arc::clone(&first)).unwrap());
        assert!(first.is_first());
        assert!(first.slot().has_started());
        assert!(matches!(table.next_step(true).unwrap(), NextStep::Receive));

        let second = goal(2);
        assert!(!table.schedule_direct(Arc::clone(&second)).unwrap());
        assert!(!second.is_first());
        assert_eq!(sent_timestamp(table.next_step(true).unwrap()), 2);
        assert_eq!(table.pop_caller().unwrap(), Some(thread::current().id()));
        assert_eq!(table.pop_caller().unwrap(), Some(thread::current().id()));
        assert_eq!(table.pop_caller().unwrap(), None);
    }

    #[test]
    fn test_first_goal_requires_idle() {
        let table = PendingCallTable::new();
        table.schedule(goal(1)).unwrap();
        assert!(matches!(
            table.schedule_first(goal(2)),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_abort_all_resolves_every_slot() {
        let table = PendingCallTable::new();
        let goals: Vec<_> = (1..=4).map(goal).collect();
        for g in &goals {
            table.schedule(Arc::clone(g)).unwrap();
        }
        table.begin_call().unwrap();

        assert_eq!(table.abort_all(), 4);
        assert!(table.is_idle());
        for g in &goals {
            assert_eq!(g.slot().wait_for_result().unwrap(), Completion::Aborted);
        }
    }

    #[test]
    fn test_fault_cascade_keeps_answered_goals() {
        let table = PendingCallTable::new();
        let answered = goal(1);
        let waiting = goal(2);
        table.schedule(Arc::clone(&answered)).unwrap();
        table.schedule(Arc::clone(&waiting)).unwrap();
        answered
            .slot()
            .resolve(GoalOutcome::success(1, vec![]))
            .unwrap();

        table.fail_all("channel closed");
        assert!(matches!(
            answered.slot().wait_for_result().unwrap(),
            Completion::Outcome(_)
        ));
        assert_eq!(
            waiting.slot().wait_for_result().unwrap(),
            Completion::Fault("channel closed".to_string())
        );
    }

    #[test]
    fn test_close_stops_waiting_loop() {
        let table = Arc::new(PendingCallTable::new());
        let waiter = {
            let table = Arc::clone(&table);
            thread::spawn(move || table.next_step(false).unwrap())
        };
        thread::sleep(Duration::from_millis(20));
        table.close();
        assert!(matches!(waiter.join().unwrap(), NextStep::Stop));
        assert!(matches!(table.schedule(goal(1)), Err(Error::ShuttingDown)));
    }

    #[test]
    fn test_wait_until_idle_times_out() {
        let table = PendingCallTable::new();
        table.schedule(goal(1)).unwrap();
        assert!(!table.wait_until_idle(Some(Duration::from_millis(10))).unwrap());
    }

    #[test]
    fn test_late_call_outcome_after_cascade_is_dropped() {
        let table = PendingCallTable::new();
        let id = table.begin_call().unwrap();
        table.abort_all();
        assert!(!table
            .complete_call(id, InboundCallOutcome::returned(None))
            .unwrap());
    }

    #[test]
    fn test_finish_matches_sent_goal() {
        let table = PendingCallTable::new();
        table.schedule(goal(1)).unwrap();
        assert!(matches!(table.finish(1), Err(Error::Protocol(_))));

        sent_timestamp(table.next_step(false).unwrap());
        match table.finish(1).unwrap() {
            Finished::Goal(g) => assert_eq!(g.timestamp(), 1),
            other => panic!("expected the goal, got {:?}", other),
        }
        assert!(table.is_idle());
        assert!(matches!(table.finish(1), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_interrupt_keeps_inflight_calls() {
        let table = PendingCallTable::new();
        let sent = goal(1);
        table.schedule(Arc::clone(&sent)).unwrap();
        sent_timestamp(table.next_step(false).unwrap());
        let call = table.begin_call().unwrap();
        table.schedule(goal(2)).unwrap();

        assert_eq!(table.interrupt_all(), 2);
        assert_eq!(sent.slot().wait_for_result().unwrap(), Completion::Interrupted);
        assert_eq!(table.pending_goals(), 0);
        assert_eq!(table.inflight_calls(), 1);
        assert!(table.has_abandoned());

        // The running callback still reports to the engine.
        assert!(table
            .complete_call(call, InboundCallOutcome::returned(None))
            .unwrap());
        assert!(matches!(
            table.next_step(false).unwrap(),
            NextStep::Send(Message::CallResult(_))
        ));

        // A later goal goes out while the engine still owes the first outcome.
        table.schedule(goal(3)).unwrap();
        assert_eq!(sent_timestamp(table.next_step(false).unwrap()), 3);
        assert!(matches!(table.finish(3).unwrap(), Finished::Goal(_)));
        assert!(matches!(table.finish(1).unwrap(), Finished::Abandoned));
        assert!(!table.has_abandoned());
        assert!(table.is_idle());

        // Goal 2 was never sent, so an outcome for it is unexpected.
        assert!(matches!(table.finish(2), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_abort_clears_calls_but_tracks_sent_goals() {
        let table = PendingCallTable::new();
        table.schedule(goal(1)).unwrap();
        sent_timestamp(table.next_step(false).unwrap());
        table.begin_call().unwrap();

        assert_eq!(table.abort_all(), 1);
        assert!(table.is_idle());
        assert!(matches!(table.finish(1).unwrap(), Finished::Abandoned));
    }

    #[test]
    fn test_fault_clears_everything() {
        let table = PendingCallTable::new();
        table.schedule(goal(1)).unwrap();
        sent_timestamp(table.next_step(false).unwrap());
        table.begin_call().unwrap();

        assert_eq!(table.fail_all("channel closed"), 1);
        assert!(table.is_idle());
        assert!(!table.has_abandoned());
        assert_eq!(table.pop_caller().unwrap(), None);
    }
}
