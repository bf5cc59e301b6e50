//! Index-addressed object pools.
//!
//! Every hot-path object (request wrappers, phase tasks, string buffers,
//! argument arrays) is borrowed from an [`ObjectPool`] and handed back when
//! the request is done with it. The pool keeps a growable array of slots and
//! two stacks of indices:
//!
//! - the *idle* stack holds slots whose object is live and ready to reuse
//! - the *free* stack holds slots whose object was released by [`trim`]
//!   and must be refilled with a freshly constructed instance
//!
//! Objects are never reclaimed behind the caller's back. Whatever is borrowed
//! must be recycled; [`PoolStats::outstanding`] exposes leaks.
//!
//! [`trim`]: ObjectPool::trim

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

use crate::error::{PoolError, PoolResult};

/// Smallest number of entries added when a slot array or stack grows.
const MIN_GROWTH: usize = 4;

/// An object that can be cleared and handed out again.
pub trait Recyclable {
    /// Drops all per-use state, keeping allocations where possible.
    fn reset(&mut self);
}

impl Recyclable for String {
    fn reset(&mut self) {
        self.clear();
    }
}

impl<T> Recyclable for Vec<T> {
    fn reset(&mut self) {
        self.clear();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Idle,
    Borrowed,
    Vacant,
}

struct Slot<T> {
    object: Option<T>,
    state: SlotState,
    generation: u32,
}

/// An object borrowed from an [`ObjectPool`].
///
/// The lease remembers which slot it came from; hand it back with
/// [`ObjectPool::recycle`].
#[must_use = "leased objects must be recycled"]
pub struct Lease<T> {
    index: usize,
    generation: u32,
    value: T,
}

impl<T> Lease<T> {
    pub fn index(&self) -> usize {
        self.index
    }
}

impl<T> Deref for Lease<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> DerefMut for Lease<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

impl<T: fmt::Debug> fmt::Debug for Lease<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("index", &self.index)
            .field("value", &self.value)
            .finish()
    }
}

/// Counters describing pool activity.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Objects constructed by the factory
    pub created: u64,
    /// Successful `get` calls
    pub borrowed: u64,
    /// Successful `recycle` calls
    pub recycled: u64,
    /// `get` calls served by reviving an idle object
    pub revived: u64,
    /// Idle objects released by `trim`
    pub trimmed: u64,
}

impl PoolStats {
    /// Objects currently borrowed and not yet recycled.
    pub fn outstanding(&self) -> u64 {
        self.borrowed - self.recycled
    }
}

/// A single-threaded free-list allocator for reusable objects.
///
/// Not internally synchronized; share it through [`SyncPool`].
pub struct ObjectPool<T> {
    slots: Vec<Slot<T>>,
    idle: Vec<usize>,
    free: Vec<usize>,
    factory: Box<dyn Fn() -> T + Send + Sync>,
    stats: PoolStats,
}

impl<T: Recyclable> ObjectPool<T> {
    /// Creates an empty pool that manufactures objects with `factory`.
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self::with_capacity(0, factory)
    }

    /// Creates a pool with room for `capacity` slots before it has to grow.
    pub fn with_capacity<F>(capacity: usize, factory: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self {
            slots: Vec::with_capacity(capacity),
            idle: Vec::with_capacity(capacity),
            free: Vec::new(),
            factory: Box::new(factory),
            stats: PoolStats::default(),
        }
    }

    /// Borrows an object, reviving an idle one when possible.
    ///
    /// Never fails: if no idle object exists, a new one is constructed into
    /// a vacant slot or into a freshly appended slot.
    pub fn get(&mut self) -> Lease<T> {
        self.stats.borrowed += 1;

        while let Some(index) = self.idle.pop() {
            let slot = &mut self.slots[index];
            match slot.object.take() {
                Some(value) => {
                    slot.state = SlotState::Borrowed;
                    slot.generation = slot.generation.wrapping_add(1);
                    self.stats.revived += 1;
                    return Lease {
                        index,
                        generation: slot.generation,
                        value,
                    };
                }
                None => {
                    // idle entry without an object; treat it as vacant
                    slot.state = SlotState::Vacant;
                    grow(&mut self.free);
                    self.free.push(index);
                }
            }
        }

        let value = (self.factory)();
        self.stats.created += 1;

        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index];
            slot.state = SlotState::Borrowed;
            slot.generation = slot.generation.wrapping_add(1);
            return Lease {
                index,
                generation: slot.generation,
                value,
            };
        }

        grow(&mut self.slots);
        let index = self.slots.len();
        self.slots.push(Slot {
            object: None,
            state: SlotState::Borrowed,
            generation: 0,
        });
        Lease {
            index,
            generation: 0,
            value,
        }
    }

    /// Returns a borrowed object to the idle stack.
    ///
    /// # Errors
    /// Fails with [`PoolError::AlreadyIdle`] when the slot is not currently
    /// borrowed by this lease, which means the object was recycled twice.
    pub fn recycle(&mut self, lease: Lease<T>) -> PoolResult<()> {
        let Lease {
            index,
            generation,
            mut value,
        } = lease;

        let slot = self
            .slots
            .get_mut(index)
            .ok_or(PoolError::UnknownSlot { index })?;

        if slot.state != SlotState::Borrowed || slot.generation != generation {
            return Err(PoolError::AlreadyIdle { index });
        }

        value.reset();
        slot.object = Some(value);
        slot.state = SlotState::Idle;
        grow(&mut self.idle);
        self.idle.push(index);
        self.stats.recycled += 1;
        Ok(())
    }

    /// Releases every idle object. Their slots are refilled lazily by later
    /// `get` calls. Returns the number of objects dropped.
    pub fn trim(&mut self) -> usize {
        let mut released = 0;
        while let Some(index) = self.idle.pop() {
            let slot = &mut self.slots[index];
            if slot.object.take().is_some() {
                released += 1;
            }
            slot.state = SlotState::Vacant;
            grow(&mut self.free);
            self.free.push(index);
        }
        self.stats.trimmed += released as u64;
        released
    }

    pub fn stats(&self) -> PoolStats {
        self.stats
    }

    /// Number of slots ever allocated.
    pub fn slots(&self) -> usize {
        self.slots.len()
    }

    /// Number of live objects waiting to be reused.
    pub fn idle(&self) -> usize {
        self.idle.len()
    }
}

impl<T> Drop for ObjectPool<T> {
    fn drop(&mut self) {
        let outstanding = self.stats.outstanding();
        if outstanding > 0 {
            log::warn!("object pool dropped with {} objects never recycled", outstanding);
        }
    }
}

/// Grows `v` by roughly half its capacity once it is full.
fn grow<V>(v: &mut Vec<V>) {
    if v.len() == v.capacity() {
        let extra = (v.capacity() / 2).max(MIN_GROWTH);
        v.reserve_exact(extra);
    }
}

/// An [`ObjectPool`] whose `get` and `recycle` are serialized by a lock.
pub struct SyncPool<T> {
    inner: Mutex<ObjectPool<T>>,
}

impl<T: Recyclable> SyncPool<T> {
    pub fn new(pool: ObjectPool<T>) -> Self {
        Self {
            inner: Mutex::new(pool),
        }
    }

    /// Creates a shared pool pre-sized for `capacity` slots.
    pub fn shared<F>(capacity: usize, factory: F) -> Arc<Self>
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Arc::new(Self::new(ObjectPool::with_capacity(capacity, factory)))
    }

    pub fn get(&self) -> PoolResult<Lease<T>> {
        let mut pool = self.inner.lock().map_err(|_| PoolError::LockPoisoned)?;
        Ok(pool.get())
    }

    pub fn recycle(&self, lease: Lease<T>) -> PoolResult<()> {
        let mut pool = self.inner.lock().map_err(|_| PoolError::LockPoisoned)?;
        pool.recycle(lease)
    }

    /// Borrows an object wrapped in a guard that recycles it on drop.
    pub fn checkout(self: &Arc<Self>) -> PoolResult<Pooled<T>> {
        let lease = self.get()?;
        Ok(Pooled {
            lease: Some(lease),
            pool: Arc::clone(self),
        })
    }

    pub fn trim(&self) -> PoolResult<usize> {
        let mut pool = self.inner.lock().map_err(|_| PoolError::LockPoisoned)?;
        Ok(pool.trim())
    }

    pub fn stats(&self) -> PoolResult<PoolStats> {
        let pool = self.inner.lock().map_err(|_| PoolError::LockPoisoned)?;
        Ok(pool.stats())
    }
}

/// An object checked out of a [`SyncPool`], recycled exactly once when the
/// guard is dropped.
///
/// A guard may move between threads with the object it owns; whichever
/// thread drops it performs the recycle.
pub struct Pooled<T: Recyclable> {
    lease: Option<Lease<T>>,
    pool: Arc<SyncPool<T>>,
}

impl<T: Recyclable> Pooled<T> {
    pub fn slot(&self) -> Option<usize> {
        self.lease.as_ref().map(Lease::index)
    }
}

impl<T: Recyclable> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.lease {
            Some(lease) => lease,
            None => unreachable!("pooled object accessed after recycle"),
        }
    }
}

impl<T: Recyclable> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.lease {
            Some(lease) => lease,
            None => unreachable!("pooled object accessed after recycle"),
        }
    }
}

impl<T: Recyclable + fmt::Debug> fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pooled").field(&self.lease).finish()
    }
}

impl<T: Recyclable> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(lease) = self.lease.take() {
            if let Err(err) = self.pool.recycle(lease) {
                // the index space can no longer be trusted
                log::error!("pool integrity violation: {}", err);
                std::process::abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    fn string_pool() -> ObjectPool<String> {
        ObjectPool::new(|| String::with_capacity(16))
    }

    /// Tests that recycled objects are revived and cleared.
    #[test]
    fn test_get_revives_idle_object() {
        let mut pool = string_pool();
        let mut lease = pool.get();
        lease.push_str("hello");
        let index = lease.index();
        pool.recycle(lease).unwrap();

        let lease = pool.get();
        assert_eq!(lease.index(), index);
        assert!(lease.is_empty());
        assert_eq!(pool.stats().created, 1);
        assert_eq!(pool.stats().revived, 1);
        pool.recycle(lease).unwrap();
    }

    /// Tests that no two live leases alias the same slot.
    #[test]
    fn test_live_leases_never_alias() {
        let mut pool = string_pool();
        let mut live = Vec::new();
        for round in 0..50 {
            live.push(pool.get());
            if round % 3 == 0 {
                let lease = live.remove(0);
                pool.recycle(lease).unwrap();
            }
            let indices: HashSet<_> = live.iter().map(|l| l.index()).collect();
            assert_eq!(indices.len(), live.len());
        }
        for lease in live {
            pool.recycle(lease).unwrap();
        }
        assert_eq!(pool.stats().outstanding(), 0);
    }

    /// Tests that a second recycle of the same slot fails fast.
    #[test]
    fn test_double_recycle_fails() {
        let mut pool = string_pool();
        let lease = pool.get();
        let forged = Lease {
            index: lease.index,
            generation: lease.generation,
            value: String::new(),
        };
        pool.recycle(lease).unwrap();
        assert_eq!(
            pool.recycle(forged),
            Err(PoolError::AlreadyIdle { index: 0 })
        );
    }

    /// Tests that a stale lease from an earlier borrow of the slot is rejected.
    #[test]
    fn test_stale_generation_rejected() {
        let mut pool = string_pool();
        let first = pool.get();
        let stale = Lease {
            index: first.index,
            generation: first.generation,
            value: String::new(),
        };
        pool.recycle(first).unwrap();
        let second = pool.get();
        assert_eq!(second.index(), stale.index());
        assert!(matches!(pool.recycle(stale), Err(PoolError::AlreadyIdle { .. })));
        pool.recycle(second).unwrap();
    }

    #[test]
    fn test_unknown_slot_rejected() {
        let mut pool = string_pool();
        let forged = Lease {
            index: 7,
            generation: 0,
            value: String::new(),
        };
        assert_eq!(pool.recycle(forged), Err(PoolError::UnknownSlot { index: 7 }));
    }

    /// Tests that trimmed slots are refilled with new objects instead of growing.
    #[test]
    fn test_trim_refills_vacant_slots() {
        let mut pool = string_pool();
        let a = pool.get();
        let b = pool.get();
        pool.recycle(a).unwrap();
        pool.recycle(b).unwrap();

        assert_eq!(pool.trim(), 2);
        assert_eq!(pool.idle(), 0);

        let c = pool.get();
        let d = pool.get();
        assert_eq!(pool.slots(), 2);
        assert_eq!(pool.stats().created, 4);
        assert_eq!(pool.stats().trimmed, 2);
        pool.recycle(c).unwrap();
        pool.recycle(d).unwrap();
    }

    /// Tests that the slot array grows by about half its size.
    #[test]
    fn test_geometric_growth() {
        let mut v: Vec<u8> = Vec::with_capacity(8);
        v.extend_from_slice(&[0; 8]);
        grow(&mut v);
        assert!(v.capacity() >= 12);

        let mut empty: Vec<u8> = Vec::new();
        grow(&mut empty);
        assert!(empty.capacity() >= MIN_GROWTH);
    }

    /// Tests that guards recycle exactly once, from whichever thread drops them.
    #[test]
    fn test_pooled_guard_recycles_across_threads() {
        let pool = SyncPool::shared(4, || Vec::<u32>::with_capacity(8));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    let mut guard = pool.checkout().unwrap();
                    guard.push(i);
                    assert_eq!(guard.len(), 1);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let stats = pool.stats().unwrap();
        assert_eq!(stats.borrowed, 8);
        assert_eq!(stats.recycled, 8);
        assert_eq!(stats.outstanding(), 0);
    }
}
