//! Handle registry for host objects referenced by the engine.
//!
//! The engine never sees host objects directly. Each object passed across the
//! boundary is registered here and travels as an integer handle. Handles are
//! slot indices: revoking one leaves a tombstone so every other handle keeps
//! its meaning for the lifetime of the session.

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::error::{Error, Result, lock_error};

/// An object that can be registered in a [`HandleRegistry`].
///
/// Implemented for every `PartialEq + Debug + Send + Sync + 'static` type.
/// Equality is what lets a second registration of an equal object return the
/// existing handle.
pub trait HostObject: Any + Send + Sync + fmt::Debug {
    /// Rust type name of the concrete object.
    fn type_name(&self) -> &'static str;

    fn as_any(&self) -> &dyn Any;

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;

    /// Value equality across erased objects. False for objects of different types.
    fn equals(&self, other: &dyn HostObject) -> bool;
}

impl<T> HostObject for T
where
    T: PartialEq + fmt::Debug + Send + Sync + 'static,
{
    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn equals(&self, other: &dyn HostObject) -> bool {
        other
            .as_any()
            .downcast_ref::<T>()
            .is_some_and(|other| other == self)
    }
}

/// `TypeId` of the concrete object behind an erased handle.
pub fn object_type_id(object: &dyn HostObject) -> TypeId {
    Any::type_id(object.as_any())
}

/// Integer handle ↔ host object table. One lock guards every operation.
#[derive(Default)]
pub struct HandleRegistry {
    slots: Mutex<Vec<Option<Arc<dyn HostObject>>>>,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an object, returning its handle.
    ///
    /// If a live entry is equal to `object`, its handle is returned instead of
    /// allocating a new slot.
    pub fn register(&self, object: Arc<dyn HostObject>) -> Result<u32> {
        let mut slots = self.slots.lock().map_err(lock_error)?;

        if let Some(existing) = slots
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|o| o.equals(object.as_ref())))
        {
            return Ok(existing as u32);
        }

        let handle = u32::try_from(slots.len())
            .map_err(|_| Error::Protocol("handle space exhausted".to_string()))?;
        debug!(handle, type_name = object.type_name(), "registered host object");
        slots.push(Some(object));
        Ok(handle)
    }

    /// Look up the object behind a handle.
    pub fn resolve(&self, handle: u32) -> Result<Arc<dyn HostObject>> {
        let slots = self.slots.lock().map_err(lock_error)?;
        slots
            .get(handle as usize)
            .and_then(Clone::clone)
            .ok_or(Error::InvalidHandle(handle))
    }

    /// Look up a handle and downcast it to a concrete type.
    pub fn resolve_as<T: HostObject>(&self, handle: u32) -> Result<Arc<T>> {
        self.resolve(handle)?
            .into_any()
            .downcast::<T>()
            .map_err(|_| Error::InvalidHandle(handle))
    }

    /// Tombstone a single handle. Returns false if it was not live.
    pub fn revoke(&self, handle: u32) -> Result<bool> {
        let mut slots = self.slots.lock().map_err(lock_error)?;
        match slots.get_mut(handle as usize) {
            Some(slot @ Some(_)) => {
                *slot = None;
                debug!(handle, "revoked handle");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Tombstone every live entry equal to `object`.
    pub fn revoke_object(&self, object: &dyn HostObject) -> Result<bool> {
        self.revoke_where(|o| o.equals(object))
    }

    /// Tombstone every live entry whose concrete type is `T`.
    pub fn revoke_type<T: HostObject>(&self) -> Result<bool> {
        let wanted = TypeId::of::<T>();
        self.revoke_where(|o| object_type_id(o) == wanted)
    }

    /// Tombstone every live entry whose Rust type name is `type_name`.
    pub fn revoke_type_named(&self, type_name: &str) -> Result<bool> {
        self.revoke_where(|o| o.type_name() == type_name)
    }

    fn revoke_where(&self, mut pred: impl FnMut(&dyn HostObject) -> bool) -> Result<bool> {
        let mut slots = self.slots.lock().map_err(lock_error)?;
        let mut any = false;
        for slot in slots.iter_mut() {
            if slot.as_ref().is_some_and(|o| pred(o.as_ref())) {
                *slot = None;
                any = true;
            }
        }
        Ok(any)
    }

    /// Number of live (non-tombstoned) entries.
    pub fn live_count(&self) -> Result<usize> {
        let slots = self.slots.lock().map_err(lock_error)?;
        Ok(slots.iter().filter(|s| s.is_some()).count())
    }
}

impl fmt::Debug for HandleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let len = self.slots.lock().map(|s| s.len()).unwrap_or_default();
        f.debug_struct("HandleRegistry").field("slots", &len).finish()
    }
}
