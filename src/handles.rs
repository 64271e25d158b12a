// SPDX-License-Identifier: MIT OR Apache-2.0

//! Process-wide handle table.
//!
//! Maps small opaque handles to shared resource records. Handles are slot
//! index + 1, so they are always non-zero and growth never invalidates a
//! previously issued handle. `get` on a stale or unknown handle returns
//! `None` - never undefined behavior.

use std::num::NonZeroU32;

use parking_lot::Mutex;

/// Opaque non-zero identifier addressing one table slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(NonZeroU32);

impl Handle {
    fn from_index(index: usize) -> Self {
        // index + 1 always fits: the table never grows past u32::MAX slots.
        Self(NonZeroU32::new(index as u32 + 1).expect("slot index overflow"))
    }

    fn index(self) -> usize {
        self.0.get() as usize - 1
    }

    /// Raw wire value, for diagnostics and error payloads.
    pub fn raw(self) -> u32 {
        self.0.get()
    }
}

/// Thread-safe registry of shared resources.
///
/// `T` is expected to be cheap to clone (an `Arc` in practice); `get` clones
/// the value out under the table lock, so the returned reference stays valid
/// for as long as the caller keeps it, independent of later `destroy` calls.
pub struct HandleTable<T> {
    slots: Mutex<Vec<Option<T>>>,
}

impl<T: Clone> HandleTable<T> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
        }
    }

    /// Store `value` in the first free slot and return its handle.
    pub fn create(&self, value: T) -> Handle {
        let mut slots = self.slots.lock();
        if let Some(index) = slots.iter().position(Option::is_none) {
            slots[index] = Some(value);
            return Handle::from_index(index);
        }
        slots.push(Some(value));
        Handle::from_index(slots.len() - 1)
    }

    /// Look up a handle, cloning the stored value out.
    pub fn get(&self, handle: Handle) -> Option<T> {
        let slots = self.slots.lock();
        slots.get(handle.index()).and_then(Clone::clone)
    }

    /// Remove a handle, freeing its slot for reuse. Stale handles are a no-op.
    pub fn destroy(&self, handle: Handle) -> Option<T> {
        let mut slots = self.slots.lock();
        slots.get_mut(handle.index()).and_then(Option::take)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.slots.lock().iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}
