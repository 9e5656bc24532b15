//! Per-goal result slot.
//!
//! One thread waits on a [`CallSlot`]; the dispatch loop resolves it exactly
//! once. While waiting, the slot can also run side tasks handed to it by the
//! dispatch loop, which is how inbound calls execute on the waiting thread
//! when threaded callbacks are off.

use std::fmt;
use std::sync::{Condvar, Mutex, PoisonError};

use crate::error::{Error, Result, lock_error};
use crate::ipc::GoalOutcome;

/// A unit of work run on the waiting thread.
pub type SideTask = Box<dyn FnOnce() + Send + 'static>;

/// How a slot was completed.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    /// The engine answered.
    Outcome(GoalOutcome),
    /// Ended by an interrupt cascade.
    Interrupted,
    /// Ended by an abort cascade.
    Aborted,
    /// Ended because the channel failed.
    Fault(String),
}

/// Observable phase of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotPhase {
    Created,
    Started,
    ExecutingSideTask,
    Resolved,
}

#[derive(Default)]
struct SlotState {
    started: bool,
    running_task: bool,
    task: Option<SideTask>,
    completion: Option<Completion>,
}

/// Blocking result slot for a single goal.
#[derive(Default)]
pub struct CallSlot {
    state: Mutex<SlotState>,
    changed: Condvar,
}

impl CallSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> SlotPhase {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.completion.is_some() {
            SlotPhase::Resolved
        } else if state.running_task {
            SlotPhase::ExecutingSideTask
        } else if state.started {
            SlotPhase::Started
        } else {
            SlotPhase::Created
        }
    }

    /// Mark the goal as sent to the engine.
    pub fn mark_started(&self) -> Result<()> {
        let mut state = self.state.lock().map_err(lock_error)?;
        if state.started {
            return Err(Error::Protocol("goal started twice".to_string()));
        }
        state.started = true;
        Ok(())
    }

    pub fn has_started(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .started
    }

    pub fn is_resolved(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .completion
            .is_some()
    }

    /// Queue `task` to run on the thread blocked in [`wait_for_result`](Self::wait_for_result).
    ///
    /// If the slot already completed, nobody is left to run the task and it
    /// is handed back.
    pub fn run_in_waiter(&self, task: SideTask) -> Result<Option<SideTask>> {
        let mut state = self.state.lock().map_err(lock_error)?;
        if !state.started {
            return Err(Error::Protocol(
                "side task for a goal that was never sent".to_string(),
            ));
        }
        if state.task.is_some() {
            return Err(Error::Protocol("side task already queued".to_string()));
        }
        if state.completion.is_some() {
            return Ok(Some(task));
        }
        state.task = Some(task);
        self.changed.notify_all();
        Ok(None)
    }

    /// Deliver the engine's answer. Fails if the slot was already completed
    /// or still has a side task queued.
    ///
    /// A side task that is still running is fine: it has already reported
    /// its result, otherwise the engine could not have answered.
    pub fn resolve(&self, outcome: GoalOutcome) -> Result<()> {
        let mut state = self.state.lock().map_err(lock_error)?;
        if state.task.is_some() {
            return Err(Error::Protocol(format!(
                "goal {} completed while a side task was pending",
                outcome.timestamp
            )));
        }
        if let Some(existing) = &state.completion {
            return Err(Error::Protocol(format!(
                "goal {} completed twice (already {})",
                outcome.timestamp,
                label(existing)
            )));
        }
        state.completion = Some(Completion::Outcome(outcome));
        self.changed.notify_all();
        Ok(())
    }

    pub fn interrupt(&self) {
        self.inject(Completion::Interrupted);
    }

    pub fn abort(&self) {
        self.inject(Completion::Aborted);
    }

    pub fn fail(&self, fault: impl Into<String>) {
        self.inject(Completion::Fault(fault.into()));
    }

    /// Complete the slot with a cancellation unless it is already complete.
    fn inject(&self, completion: Completion) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.completion.is_none() {
            state.completion = Some(completion);
        }
        self.changed.notify_all();
    }

    /// Block until the slot completes, running queued side tasks meanwhile.
    ///
    /// Returns at once if the slot is already complete.
    pub fn wait_for_result(&self) -> Result<Completion> {
        let mut state = self.state.lock().map_err(lock_error)?;
        loop {
            if let Some(task) = state.task.take() {
                state.running_task = true;
                drop(state);
                task();
                state = self.state.lock().map_err(lock_error)?;
                state.running_task = false;
                continue;
            }
            if let Some(completion) = &state.completion {
                return Ok(completion.clone());
            }
            state = self.changed.wait(state).map_err(lock_error)?;
        }
    }
}

fn label(completion: &Completion) -> &'static str {
    match completion {
        Completion::Outcome(_) => "answered",
        Completion::Interrupted => "interrupted",
        Completion::Aborted => "aborted",
        Completion::Fault(_) => "faulted",
    }
}

impl fmt::Debug for CallSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallSlot")
            .field("phase", &self.phase())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_resolve_wakes_waiter() {
        let slot = Arc::new(CallSlot::new());
        slot.mark_started().unwrap();
        let waiter = {
            let slot = Arc::clone(&slot);
            thread::spawn(move || slot.wait_for_result().unwrap())
        };
        thread::sleep(Duration::from_millis(20));
        slot.resolve(GoalOutcome::success(1, vec![])).unwrap();
        assert_eq!(
            waiter.join().unwrap(),
            Completion::Outcome(GoalOutcome::success(1, vec![]))
        );
        assert_eq!(slot.phase(), SlotPhase::Resolved);
    }

    #[test]
    fn test_wait_after_resolution_returns_immediately() {
        let slot = CallSlot::new();
        slot.resolve(GoalOutcome::failure(4)).unwrap();
        assert!(matches!(slot.wait_for_result().unwrap(), Completion::Outcome(_)));
        assert!(matches!(slot.wait_for_result().unwrap(), Completion::Outcome(_)));
    }

    #[test]
    fn test_double_resolution_is_protocol_error() {
        let slot = CallSlot::new();
        slot.resolve(GoalOutcome::failure(1)).unwrap();
        assert!(matches!(
            slot.resolve(GoalOutcome::failure(1)),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_resolve_after_abort_is_protocol_error() {
        let slot = CallSlot::new();
        slot.abort();
        slot.interrupt();
        assert_eq!(slot.wait_for_result().unwrap(), Completion::Aborted);
        assert!(slot.resolve(GoalOutcome::failure(1)).is_err());
    }

    #[test]
    fn test_started_twice() {
        let slot = CallSlot::new();
        assert_eq!(slot.phase(), SlotPhase::Created);
        slot.mark_started().unwrap();
        assert!(slot.mark_started().is_err());
    }

    #[test]
    fn test_side_task_runs_on_waiting_thread() {
        let slot = Arc::new(CallSlot::new());
        slot.mark_started().unwrap();
        let (tx, rx) = mpsc::channel();

        let waiter = {
            let slot = Arc::clone(&slot);
            thread::spawn(move || {
                let me = thread::current().id();
                (me, slot.wait_for_result().unwrap())
            })
        };

        let resolver = Arc::clone(&slot);
        let returned = slot
            .run_in_waiter(Box::new(move || {
                tx.send(thread::current().id()).unwrap();
            }))
            .unwrap();
        assert!(returned.is_none());

        let ran_on = rx.recv().unwrap();
        resolver.resolve(GoalOutcome::success(2, vec![])).unwrap();

        let (waiter_id, completion) = waiter.join().unwrap();
        assert_eq!(ran_on, waiter_id);
        assert!(matches!(completion, Completion::Outcome(_)));
    }

    #[test]
    fn test_side_task_requires_started_goal() {
        let slot = CallSlot::new();
        assert!(slot.run_in_waiter(Box::new(|| {})).is_err());
        slot.mark_started().unwrap();
        slot.run_in_waiter(Box::new(|| {})).unwrap();
        assert!(slot.run_in_waiter(Box::new(|| {})).is_err());
        assert!(slot.resolve(GoalOutcome::failure(1)).is_err());
    }

    #[test]
    fn test_resolve_while_side_task_is_still_running() {
        let slot = Arc::new(CallSlot::new());
        slot.mark_started().unwrap();
        let (reported_tx, reported_rx) = mpsc::channel();
        let (finish_tx, finish_rx) = mpsc::channel::<()>();

        let waiter = {
            let slot = Arc::clone(&slot);
            thread::spawn(move || slot.wait_for_result().unwrap())
        };
        slot.run_in_waiter(Box::new(move || {
            reported_tx.send(()).unwrap();
            finish_rx.recv().unwrap();
        }))
        .unwrap();

        // The task has reported but not returned yet.
        reported_rx.recv().unwrap();
        assert_eq!(slot.phase(), SlotPhase::ExecutingSideTask);
        slot.resolve(GoalOutcome::success(3, vec![])).unwrap();
        finish_tx.send(()).unwrap();

        assert_eq!(
            waiter.join().unwrap(),
            Completion::Outcome(GoalOutcome::success(3, vec![]))
        );
    }

    #[test]
    fn test_side_task_handed_back_after_completion() {
        let slot = CallSlot::new();
        slot.mark_started().unwrap();
        slot.interrupt();
        assert!(slot.run_in_waiter(Box::new(|| {})).unwrap().is_some());
    }
}
