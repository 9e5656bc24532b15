//! Goal/callback coordination.
//!
//! Host threads submit goals and block on a per-goal [`CallSlot`]. A single
//! dispatch loop thread per session reads the channel, resolves slots as
//! outcomes arrive, and runs inbound calls from the engine while those goals
//! are outstanding. Outstanding work is tracked in a [`PendingCallTable`].

mod dispatch;
mod pending;
mod slot;

pub(crate) use dispatch::DispatchLoop;
pub use pending::{Finished, NextStep, PendingCallTable, PendingGoal};
pub use slot::{CallSlot, Completion, SideTask, SlotPhase};
