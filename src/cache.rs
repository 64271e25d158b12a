// SPDX-License-Identifier: MIT OR Apache-2.0

//! Slot-based, reference-counted resource cache.
//!
//! A growable array of refcounted slots holding buffer payloads. Refcount 0
//! means the slot is idle: the payload stays resident so `find` can hand it
//! back out for reuse (the dominant cost-saving path). Refcount 1 means
//! exactly one owner - safe to mutate the payload in place. Refcount >= 2
//! means multiple consumers - the copy-on-write pipeline must fork instead
//! of mutating.
//!
//! Cleanup is ownership-based, never a callback: a payload is dropped
//! exactly once, either when its idle slot is physically reused by a later
//! `create` or when the cache itself is dropped. It is never dropped while
//! any consumer still holds a reference.

use std::num::NonZeroU32;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{Result, SurfaceError};

/// Opaque non-zero identifier addressing one cache slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheHandle(NonZeroU32);

impl CacheHandle {
    fn from_index(index: usize) -> Self {
        Self(NonZeroU32::new(index as u32 + 1).expect("cache slot index overflow"))
    }

    fn index(self) -> usize {
        self.0.get() as usize - 1
    }

    /// Raw wire value, for diagnostics and error payloads.
    pub fn raw(self) -> u32 {
        self.0.get()
    }
}

struct Slot<P> {
    refcount: u32,
    payload: P,
}

struct CacheInner<P> {
    slots: Vec<Option<Slot<P>>>,
    /// Most recently produced slot, for the render-identity fast path.
    recent: Option<CacheHandle>,
}

impl<P> CacheInner<P> {
    fn slot(&self, handle: CacheHandle) -> Option<&Slot<P>> {
        self.slots.get(handle.index()).and_then(Option::as_ref)
    }

    fn slot_mut(&mut self, handle: CacheHandle) -> Option<&mut Slot<P>> {
        self.slots.get_mut(handle.index()).and_then(Option::as_mut)
    }
}

/// Counters describing cache occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub capacity: usize,
    pub live: usize,
    pub idle: usize,
}

/// Growable refcounted slot cache.
///
/// One cache-wide mutex guards all structural operations; individual
/// `retain`/`release`/`find` calls are atomic with respect to each other but
/// carry no ordering guarantee across handles. The array never shrinks.
pub struct SlotCache<P> {
    inner: Mutex<CacheInner<P>>,
}

impl<P> SlotCache<P> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                slots: Vec::new(),
                recent: None,
            }),
        }
    }

    /// Store a payload and return its handle. The new slot starts at
    /// refcount 0: callers must immediately `retain` what they intend to
    /// keep.
    ///
    /// Slot selection order: an empty slot, else an idle slot (whose stale
    /// payload is dropped - cleanup runs here, exactly once), else geometric
    /// growth. Growth never invalidates existing handles.
    pub fn create(&self, payload: P) -> Result<CacheHandle> {
        let (handle, evicted) = {
            let mut inner = self.inner.lock();

            let empty = inner.slots.iter().position(Option::is_none);
            let idle = inner
                .slots
                .iter()
                .position(|s| s.as_ref().is_some_and(|slot| slot.refcount == 0));

            let index = match empty.or(idle) {
                Some(index) => index,
                None => {
                    if inner.slots.len() >= u32::MAX as usize {
                        return Err(SurfaceError::Resources("cache slot space exhausted".into()));
                    }
                    // Vec growth is geometric, so existing indices stay stable.
                    inner.slots.push(None);
                    debug!(capacity = inner.slots.len(), "cache grew");
                    inner.slots.len() - 1
                }
            };

            let handle = CacheHandle::from_index(index);
            if inner.recent == Some(handle) {
                inner.recent = None;
            }
            let evicted = inner.slots[index].replace(Slot {
                refcount: 0,
                payload,
            });
            (handle, evicted)
        };
        // Evicted payload Drop (the cleanup) runs outside the cache lock.
        drop(evicted);
        Ok(handle)
    }

    /// Increment a slot's refcount. Invalid handles are a logged no-op.
    pub fn retain(&self, handle: CacheHandle) {
        let mut inner = self.inner.lock();
        match inner.slot_mut(handle) {
            Some(slot) => slot.refcount += 1,
            None => warn!(slot = handle.raw(), "retain on invalid cache handle"),
        }
    }

    /// Decrement a slot's refcount. At 0 the slot becomes idle and its
    /// payload stays resident for reuse. Releasing an already-idle or
    /// invalid slot is a logged no-op - the count never goes negative.
    pub fn release(&self, handle: CacheHandle) {
        let mut inner = self.inner.lock();
        let Some(slot) = inner.slot_mut(handle) else {
            warn!(slot = handle.raw(), "release on invalid cache handle");
            return;
        };
        if slot.refcount == 0 {
            warn!(slot = handle.raw(), "release on idle cache slot");
            return;
        }
        slot.refcount -= 1;
        if slot.refcount == 0 {
            debug!(slot = handle.raw(), "cache slot idle");
        }
    }

    /// Current refcount of a slot, `None` for invalid handles.
    pub fn refcount(&self, handle: CacheHandle) -> Option<u32> {
        self.inner.lock().slot(handle).map(|slot| slot.refcount)
    }

    /// First idle slot (refcount 0) whose payload satisfies `pred`.
    ///
    /// Busy slots are never returned, no matter what the predicate says.
    pub fn find<F>(&self, pred: F) -> Option<CacheHandle>
    where
        F: Fn(&P) -> bool,
    {
        let inner = self.inner.lock();
        inner
            .slots
            .iter()
            .enumerate()
            .find(|(_, slot)| {
                slot.as_ref()
                    .is_some_and(|s| s.refcount == 0 && pred(&s.payload))
            })
            .map(|(index, _)| CacheHandle::from_index(index))
    }

    /// Mark a slot as most recently produced. Invalid handles are ignored.
    pub fn set_recent(&self, handle: CacheHandle) {
        let mut inner = self.inner.lock();
        if inner.slot(handle).is_some() {
            inner.recent = Some(handle);
        }
    }

    /// The most recently produced slot, if it has not been evicted since.
    pub fn recent(&self) -> Option<CacheHandle> {
        self.inner.lock().recent
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        let live = inner.slots.iter().filter(|s| s.is_some()).count();
        let idle = inner
            .slots
            .iter()
            .filter(|s| s.as_ref().is_some_and(|slot| slot.refcount == 0))
            .count();
        CacheStats {
            capacity: inner.slots.len(),
            live,
            idle,
        }
    }
}

impl<P: Clone> SlotCache<P> {
    /// Clone the payload out of a slot.
    pub fn get(&self, handle: CacheHandle) -> Option<P> {
        self.inner.lock().slot(handle).map(|slot| slot.payload.clone())
    }
}

impl<P> Default for SlotCache<P> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Payload whose Drop increments a counter, to observe cleanup.
    struct Tracked(Arc<AtomicUsize>);

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_refcount_never_negative() {
        let cache = SlotCache::new();
        let h = cache.create("payload").unwrap();
        assert_eq!(cache.refcount(h), Some(0));

        cache.release(h); // idle: no-op
        assert_eq!(cache.refcount(h), Some(0));

        cache.retain(h);
        cache.retain(h);
        cache.release(h);
        assert_eq!(cache.refcount(h), Some(1));
    }

    #[test]
    fn test_idle_payload_stays_resident() {
        let drops = Arc::new(AtomicUsize::new(0));
        let cache = SlotCache::new();
        let h = cache.create(Tracked(Arc::clone(&drops))).unwrap();

        cache.retain(h);
        cache.release(h);
        // Idle again, but not destroyed: still findable for reuse.
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        assert_eq!(cache.find(|_| true), Some(h));
    }

    #[test]
    fn test_cleanup_runs_exactly_once_on_slot_reuse() {
        let drops = Arc::new(AtomicUsize::new(0));
        let cache = SlotCache::new();
        let first = cache.create(Tracked(Arc::clone(&drops))).unwrap();

        // All slots occupied but idle: create reuses the slot, dropping the
        // stale payload exactly once.
        let second = cache.create(Tracked(Arc::new(AtomicUsize::new(0)))).unwrap();
        assert_eq!(second, first);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_busy_slot_never_evicted_by_create() {
        let drops = Arc::new(AtomicUsize::new(0));
        let cache = SlotCache::new();
        let busy = cache.create(Tracked(Arc::clone(&drops))).unwrap();
        cache.retain(busy);

        let fresh = cache.create(Tracked(Arc::new(AtomicUsize::new(0)))).unwrap();
        assert_ne!(fresh, busy);
        assert_eq!(drops.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cleanup_runs_exactly_once_at_teardown() {
        let drops = Arc::new(AtomicUsize::new(0));
        {
            let cache = SlotCache::new();
            let h = cache.create(Tracked(Arc::clone(&drops))).unwrap();
            cache.retain(h);
            assert_eq!(drops.load(Ordering::SeqCst), 0);
        }
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_find_skips_busy_slots() {
        let cache = SlotCache::new();
        let busy = cache.create(10u32).unwrap();
        cache.retain(busy);
        let idle = cache.create(10u32).unwrap();

        assert_eq!(cache.find(|p| *p == 10), Some(idle));
        assert_eq!(cache.find(|p| *p == 99), None);
    }

    #[test]
    fn test_recent_cleared_when_slot_reused() {
        let cache = SlotCache::new();
        let h = cache.create("x").unwrap();
        cache.set_recent(h);
        assert_eq!(cache.recent(), Some(h));

        // Idle slot gets physically reused; the stale recent mark must not
        // leak onto the new payload.
        let reused = cache.create("y").unwrap();
        assert_eq!(reused, h);
        assert_eq!(cache.recent(), None);
    }

    #[test]
    fn test_stats() {
        let cache = SlotCache::new();
        let a = cache.create(1).unwrap();
        cache.retain(a);
        let _b = cache.create(2).unwrap();

        let stats = cache.stats();
        assert_eq!(stats.capacity, 2);
        assert_eq!(stats.live, 2);
        assert_eq!(stats.idle, 1);
    }

    #[test]
    fn test_concurrent_retain_release() {
        let cache = Arc::new(SlotCache::new());
        let h = cache.create(0u32).unwrap();
        cache.retain(h); // keep busy so create() in other tests can't evict

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        cache.retain(h);
                        cache.release(h);
                    }
                })
            })
            .collect();
        for t in workers {
            t.join().unwrap();
        }

        assert_eq!(cache.refcount(h), Some(1));
    }
}
