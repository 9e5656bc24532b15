//! Engine sessions.
//!
//! A [`Session`] owns one engine, one channel and one dispatch loop. Any
//! number of host threads may submit goals through clones of the same
//! session; each blocks only on its own goal.
//!
//! Lifecycle:
//!
//! ```text
//! Uninitialized → Handshaking → SteadyState ⇄ Interrupting → ShuttingDown → Terminated
//! ```
//!
//! A channel failure while running moves the session to `Faulted` until it
//! is shut down.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::callbacks::CallDispatcher;
use crate::config::SessionConfig;
use crate::coord::{Completion, DispatchLoop, PendingCallTable, PendingGoal};
use crate::error::{Error, Result, lock_error};
use crate::goal::Goal;
use crate::ipc::{
    BootstrapMode, ChannelTransport, EngineControl, EngineLauncher, Hello, Message,
};
use crate::registry::{HandleRegistry, HostObject};
use crate::value::Value;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Handshaking,
    SteadyState,
    Interrupting,
    /// The channel failed or the engine broke the protocol. Goals fail
    /// with the recorded fault until the session is shut down.
    Faulted,
    ShuttingDown,
    Terminated,
}

/// Object behind the session's own handle. Target of the sentinel call.
#[derive(Debug, PartialEq)]
pub struct SessionAnchor {
    pub id: Uuid,
}

/// State shared between the session and its dispatch loop.
pub(crate) struct Shared {
    pub(crate) id: Uuid,
    pub(crate) bootstrap: BootstrapMode,
    pub(crate) debug: bool,
    pub(crate) anchor: u32,
    pub(crate) threaded_callbacks: AtomicBool,
    pub(crate) shutting_down: AtomicBool,
    pub(crate) transport: Arc<dyn ChannelTransport>,
    pub(crate) table: PendingCallTable,
    pub(crate) registry: HandleRegistry,
    pub(crate) dispatcher: RwLock<CallDispatcher>,
    failure: Mutex<Option<String>>,
}

impl Shared {
    pub(crate) fn record_failure(&self, e: &Error) {
        let mut failure = self.failure.lock().unwrap_or_else(PoisonError::into_inner);
        failure.get_or_insert_with(|| e.to_string());
    }

    fn failure(&self) -> Option<String> {
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

pub(crate) struct SessionInner {
    shared: Arc<Shared>,
    control: Box<dyn EngineControl>,
    state: Mutex<SessionState>,
    interrupting: AtomicBool,
    clock: AtomicU64,
    config: SessionConfig,
    loop_thread: Mutex<Option<JoinHandle<Result<()>>>>,
}

/// Which submission path a goal takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubmitPath {
    Normal,
    /// The handshake probe: must be the only outstanding work.
    First,
}

/// Handle to a running engine session. Cheap to clone.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Launch an engine and complete the handshake.
    pub fn start<L>(launcher: L, config: SessionConfig) -> Result<Self>
    where
        L: EngineLauncher + 'static,
    {
        Self::start_boxed(Box::new(launcher), config)
    }

    pub fn start_boxed(launcher: Box<dyn EngineLauncher>, config: SessionConfig) -> Result<Self> {
        let id = Uuid::new_v4();
        info!(session = %id, bootstrap = %config.bootstrap, "starting engine session");

        let link = launcher.launch()?;
        let registry = HandleRegistry::new();
        let anchor = registry.register(Arc::new(SessionAnchor { id }))?;

        let shared = Arc::new(Shared {
            id,
            bootstrap: config.bootstrap,
            debug: config.debug,
            anchor,
            threaded_callbacks: AtomicBool::new(config.threaded_callbacks),
            shutting_down: AtomicBool::new(false),
            transport: link.transport,
            table: PendingCallTable::new(),
            registry,
            dispatcher: RwLock::new(CallDispatcher::new()),
            failure: Mutex::new(None),
        });

        let session = Session {
            inner: Arc::new(SessionInner {
                shared,
                control: link.control,
                state: Mutex::new(SessionState::Uninitialized),
                interrupting: AtomicBool::new(false),
                clock: AtomicU64::new(0),
                config,
                loop_thread: Mutex::new(None),
            }),
        };

        if let Err(e) = session.handshake() {
            error!(session = %id, "handshake failed: {}", e);
            if let Err(close_err) = session.shutdown() {
                warn!("cleanup after failed handshake: {}", close_err);
            }
            return Err(e);
        }
        Ok(session)
    }

    pub(crate) fn from_inner(inner: Arc<SessionInner>) -> Self {
        Self { inner }
    }

    fn handshake(&self) -> Result<()> {
        self.set_state(SessionState::Handshaking)?;
        let shared = &self.inner.shared;

        let hello = Hello::with_catalogue(shared.anchor, shared.bootstrap)?;
        shared.transport.send(&Message::Hello(hello))?;

        let weak = Arc::downgrade(&self.inner);
        let loop_shared = Arc::clone(shared);
        let handle = thread::Builder::new()
            .name("callbridge-dispatch".to_string())
            .spawn(move || DispatchLoop::new(loop_shared, weak).run())
            .map_err(|e| Error::Launch(format!("Failed to start dispatch loop: {}", e)))?;
        *self.inner.loop_thread.lock().map_err(lock_error)? = Some(handle);

        if let Some(probe) = self.inner.control.handshake_directive() {
            debug!(session = %shared.id, directive = %probe, "running handshake probe");
            let answered = self.submit(Goal::new(probe.clone()), SubmitPath::First)?;
            if answered.is_none() {
                return Err(Error::Launch(format!(
                    "engine failed handshake probe '{}'",
                    probe
                )));
            }
        }

        self.set_state(SessionState::SteadyState)?;
        info!(session = %shared.id, "engine session ready");
        Ok(())
    }

    /// Run a goal and block until the engine answers.
    ///
    /// Returns the output values on success, `None` if the directive failed
    /// logically, and an error if it raised one or was cancelled.
    pub fn submit_goal(&self, goal: impl Into<Goal>) -> Result<Option<Vec<Value>>> {
        self.submit(goal.into(), SubmitPath::Normal)
    }

    /// Run a directive with no inputs or outputs. True if it succeeded.
    pub fn deterministic_goal(&self, directive: &str) -> Result<bool> {
        Ok(self.submit_goal(Goal::new(directive))?.is_some())
    }

    /// Run a directive and return its outputs.
    pub fn query(&self, directive: &str, output_spec: &str) -> Result<Option<Vec<Value>>> {
        self.submit_goal(Goal::new(directive).outputs(output_spec))
    }

    fn submit(&self, goal: Goal, path: SubmitPath) -> Result<Option<Vec<Value>>> {
        self.ensure_accepting()?;
        let shared = &self.inner.shared;
        let timestamp = self.next_timestamp()?;
        let pending = Arc::new(PendingGoal::new(goal.into_request(timestamp)?));

        let send_directly = match (shared.bootstrap, path) {
            (BootstrapMode::Direct, path) => {
                let direct = shared.table.schedule_direct(Arc::clone(&pending))?;
                if !direct && path == SubmitPath::First {
                    shared.table.forget(timestamp)?;
                    return Err(Error::Protocol(
                        "first goal submitted while work is outstanding".to_string(),
                    ));
                }
                direct
            }
            (BootstrapMode::Sentinel, SubmitPath::First) => {
                shared.table.schedule_first(Arc::clone(&pending))?;
                false
            }
            (BootstrapMode::Sentinel, SubmitPath::Normal) => {
                shared.table.schedule(Arc::clone(&pending))?;
                false
            }
        };
        debug!(
            session = %shared.id,
            timestamp,
            directive = %pending.request().directive,
            direct = send_directly,
            "goal scheduled"
        );

        if send_directly {
            self.send_first(&pending)?;
        }

        let completion = pending.slot().wait_for_result()?;
        self.interpret(&pending, completion)
    }

    /// Write a directly submitted goal from the calling thread.
    fn send_first(&self, pending: &PendingGoal) -> Result<()> {
        let shared = &self.inner.shared;
        let sent = shared
            .transport
            .send(&Message::Goal(pending.request().clone()))
            .and_then(|_| self.inner.control.kick());
        if let Err(e) = sent {
            error!(session = %shared.id, "failed to send first goal: {}", e);
            shared.record_failure(&e);
            shared.table.fail_all(&e.to_string());
            return Err(e);
        }
        Ok(())
    }

    fn interpret(&self, pending: &PendingGoal, completion: Completion) -> Result<Option<Vec<Value>>> {
        match completion {
            Completion::Aborted => Err(Error::Aborted),
            Completion::Interrupted => Err(Error::Interrupted),
            Completion::Fault(message) => Err(Error::Transport(message)),
            Completion::Outcome(outcome) => {
                if outcome.timestamp != pending.timestamp() {
                    return Err(Error::Protocol(format!(
                        "goal {} answered with outcome {}",
                        pending.timestamp(),
                        outcome.timestamp
                    )));
                }
                if let Some(error) = outcome.error {
                    if self.inner.control.is_interrupt(&error) {
                        return Err(Error::Interrupted);
                    }
                    return Err(Error::PeerFailure(error));
                }
                Ok(outcome.succeeded.then_some(outcome.outputs))
            }
        }
    }

    fn next_timestamp(&self) -> Result<u64> {
        self.inner
            .clock
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |t| t.checked_add(1))
            .map(|previous| previous + 1)
            .map_err(|_| Error::Protocol("goal timestamp counter exhausted".to_string()))
    }

    fn ensure_accepting(&self) -> Result<()> {
        if let Some(failure) = self.inner.shared.failure() {
            return Err(Error::Transport(failure));
        }
        if self.inner.shared.shutting_down.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }
        Ok(())
    }

    /// Ask the engine to stop what it is running.
    ///
    /// Waits up to the configured grace period for every outstanding goal to
    /// come back; goals still pending after that are ended locally as
    /// interrupted.
    pub fn interrupt(&self) -> Result<()> {
        if let Some(failure) = self.inner.shared.failure() {
            return Err(Error::Transport(failure));
        }
        {
            let mut state = self.inner.state.lock().map_err(lock_error)?;
            match *state {
                SessionState::SteadyState => *state = SessionState::Interrupting,
                SessionState::Interrupting => return Ok(()),
                SessionState::ShuttingDown | SessionState::Terminated => {
                    return Err(Error::ShuttingDown);
                }
                other => {
                    return Err(Error::InvalidOperation(format!(
                        "cannot interrupt a session in state {:?}",
                        other
                    )));
                }
            }
        }
        self.inner.interrupting.store(true, Ordering::SeqCst);
        info!(session = %self.inner.shared.id, "interrupting engine");

        let result = self.interrupt_and_wait();

        self.inner.interrupting.store(false, Ordering::SeqCst);
        let mut state = self.inner.state.lock().map_err(lock_error)?;
        if *state == SessionState::Interrupting {
            *state = SessionState::SteadyState;
        }
        result
    }

    fn interrupt_and_wait(&self) -> Result<()> {
        if let Err(e) = self.inner.control.send_break() {
            warn!("Failed to send break to engine: {}", e);
        }
        let table = &self.inner.shared.table;
        if !table.wait_until_idle(Some(self.inner.config.interrupt_grace()))? {
            let ended = table.interrupt_all();
            warn!(
                goals = ended,
                "engine did not stop within grace period; interrupted pending goals"
            );
        }
        Ok(())
    }

    /// Stop the engine and release the channel. Calling it again only logs.
    pub fn shutdown(&self) -> Result<()> {
        self.inner.shutdown()
    }

    /// End every pending goal as aborted. Returns how many were ended.
    pub fn abort_tasks(&self) -> usize {
        let ended = self.inner.shared.table.abort_all();
        if ended > 0 {
            info!(session = %self.inner.shared.id, goals = ended, "aborted pending goals");
        }
        ended
    }

    /// End every pending goal as interrupted. Returns how many were ended.
    pub fn interrupt_tasks(&self) -> usize {
        self.inner.shared.table.interrupt_all()
    }

    /// Block until no goals are pending and no inbound calls are in flight.
    pub fn wait_until_idle(&self) -> Result<()> {
        self.inner.shared.table.wait_until_idle(None).map(|_| ())
    }

    pub fn is_idle(&self) -> bool {
        self.inner.shared.table.is_idle()
    }

    pub fn pending_goals(&self) -> usize {
        self.inner.shared.table.pending_goals()
    }

    pub fn is_interrupting(&self) -> bool {
        self.inner.interrupting.load(Ordering::SeqCst)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shared.shutting_down.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> SessionState {
        let state = *self
            .inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match state {
            SessionState::Handshaking | SessionState::SteadyState | SessionState::Interrupting
                if self.inner.shared.failure().is_some() =>
            {
                SessionState::Faulted
            }
            other => other,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.inner.shared.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Handle of the session's own anchor object.
    pub fn anchor_handle(&self) -> u32 {
        self.inner.shared.anchor
    }

    /// Switch between running inbound calls on fresh threads (true) and on
    /// the waiting goal's thread (false). Applies to calls routed afterwards.
    pub fn set_threaded_callbacks(&self, threaded: bool) {
        self.inner
            .shared
            .threaded_callbacks
            .store(threaded, Ordering::SeqCst);
    }

    pub fn threaded_callbacks(&self) -> bool {
        self.inner.shared.threaded_callbacks.load(Ordering::SeqCst)
    }

    /// Register host callables. May be called at any time.
    pub fn register_callables<R>(&self, f: impl FnOnce(&mut CallDispatcher) -> R) -> Result<R> {
        let mut dispatcher = self.inner.shared.dispatcher.write().map_err(lock_error)?;
        Ok(f(&mut dispatcher))
    }

    pub(crate) fn with_dispatcher<R>(&self, f: impl FnOnce(&CallDispatcher) -> R) -> Result<R> {
        let dispatcher = self.inner.shared.dispatcher.read().map_err(lock_error)?;
        Ok(f(&dispatcher))
    }

    pub fn register_object(&self, object: Arc<dyn HostObject>) -> Result<u32> {
        self.inner.shared.registry.register(object)
    }

    pub fn register<T: HostObject>(&self, object: T) -> Result<u32> {
        self.register_object(Arc::new(object))
    }

    pub fn resolve_handle(&self, handle: u32) -> Result<Arc<dyn HostObject>> {
        self.inner.shared.registry.resolve(handle)
    }

    pub fn resolve_as<T: HostObject>(&self, handle: u32) -> Result<Arc<T>> {
        self.inner.shared.registry.resolve_as(handle)
    }

    pub fn revoke_handle(&self, handle: u32) -> Result<bool> {
        self.inner.shared.registry.revoke(handle)
    }

    pub fn revoke_object(&self, object: &dyn HostObject) -> Result<bool> {
        self.inner.shared.registry.revoke_object(object)
    }

    pub fn revoke_type<T: HostObject>(&self) -> Result<bool> {
        self.inner.shared.registry.revoke_type::<T>()
    }

    pub fn registry(&self) -> &HandleRegistry {
        &self.inner.shared.registry
    }

    fn set_state(&self, next: SessionState) -> Result<()> {
        let mut state = self.inner.state.lock().map_err(lock_error)?;
        if matches!(*state, SessionState::ShuttingDown | SessionState::Terminated) {
            return Err(Error::ShuttingDown);
        }
        *state = next;
        Ok(())
    }
}

impl SessionInner {
    fn shutdown(&self) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if matches!(*state, SessionState::ShuttingDown | SessionState::Terminated) {
                info!(session = %self.shared.id, "shutdown already requested");
                return Ok(());
            }
            *state = SessionState::ShuttingDown;
        }
        self.shared.shutting_down.store(true, Ordering::SeqCst);
        info!(session = %self.shared.id, "shutting down engine session");

        let aborted = self.shared.table.abort_all();
        if aborted > 0 {
            debug!(goals = aborted, "aborted pending goals for shutdown");
        }
        self.shared.table.close();

        let closed = self.control.close();
        if let Err(e) = &closed {
            warn!("Failed to close engine: {}", e);
        }

        let handle = self
            .loop_thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                debug!("shutdown requested from the dispatch thread; not joining it");
            } else {
                match handle.join() {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => debug!("dispatch loop ended with: {}", e),
                    Err(_) => warn!("dispatch loop panicked"),
                }
            }
        }

        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = SessionState::Terminated;
        info!(session = %self.shared.id, "engine session terminated");
        closed
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        let state = *self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if state == SessionState::Terminated {
            return;
        }
        if let Err(e) = self.shutdown() {
            warn!("shutdown on drop: {}", e);
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.shared.id)
            .field("state", &self.state())
            .field("pending_goals", &self.pending_goals())
            .finish()
    }
}
