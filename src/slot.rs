//! Single-assignment process-wide state slot
//!
//! The trap-dispatch interface cannot pass custom context to a signal
//! handler, so the loader keeps its published state in exactly one global
//! slot. The slot is an atomic pointer: readers (the fault handler) perform
//! a single acquire load and no locking, which keeps the read path safe in
//! signal context. Writers publish once with a compare-exchange and reclaim
//! ownership at teardown with a swap.

use core::sync::atomic::{AtomicPtr, Ordering};

/// A cell that holds at most one published value.
///
/// `set` transfers ownership of a boxed value into the slot; `take` moves it
/// back out. Between the two, any number of `get` calls may observe the
/// value concurrently, including from a signal handler.
pub struct StateSlot<T> {
    inner: AtomicPtr<T>,
}

impl<T> StateSlot<T> {
    /// Create a new empty slot.
    pub const fn new() -> Self {
        Self {
            inner: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    /// Get the published value if one exists.
    pub fn get(&self) -> Option<&T> {
        let ptr = self.inner.load(Ordering::Acquire);
        if ptr.is_null() {
            None
        } else {
            // SAFETY: a non-null pointer was produced by Box::into_raw in
            // `set` and is only reclaimed by `take`, which removes it from
            // the slot first. The boxed value is never mutated while
            // published, so shared references are sound.
            Some(unsafe { &*ptr })
        }
    }

    /// Publish a value. Fails and returns the value if the slot is occupied.
    pub fn set(&self, value: Box<T>) -> core::result::Result<(), Box<T>> {
        let ptr = Box::into_raw(value);
        match self.inner.compare_exchange(
            core::ptr::null_mut(),
            ptr,
            Ordering::Release,
            Ordering::Relaxed,
        ) {
            Ok(_) => Ok(()),
            // SAFETY: the exchange failed, so `ptr` was never published and
            // this is the only owner; re-boxing it returns ownership to the
            // caller.
            Err(_) => Err(unsafe { Box::from_raw(ptr) }),
        }
    }

    /// Remove and return the published value, leaving the slot empty.
    pub fn take(&self) -> Option<Box<T>> {
        let ptr = self.inner.swap(core::ptr::null_mut(), Ordering::AcqRel);
        if ptr.is_null() {
            None
        } else {
            // SAFETY: the pointer came from Box::into_raw in `set` and the
            // swap removed it from the slot, so no other `take` can observe
            // it; ownership moves back to the caller.
            Some(unsafe { Box::from_raw(ptr) })
        }
    }
}

// SAFETY: the slot only hands out shared references to T across threads and
// moves T by value through set/take, so the usual bounds apply.
unsafe impl<T: Send> Send for StateSlot<T> {}
// SAFETY: see above; concurrent `get` requires T: Sync, and `take` from
// another thread requires T: Send.
unsafe impl<T: Send + Sync> Sync for StateSlot<T> {}

impl<T> Drop for StateSlot<T> {
    fn drop(&mut self) {
        let ptr = self.inner.load(Ordering::Acquire);
        if !ptr.is_null() {
            // SAFETY: we have exclusive access in Drop; the pointer is a
            // live Box::into_raw allocation still owned by the slot.
            drop(unsafe { Box::from_raw(ptr) });
        }
    }
}

impl<T> Default for StateSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_slot() {
        let slot: StateSlot<u32> = StateSlot::new();
        assert!(slot.get().is_none());
        assert!(slot.take().is_none());
    }

    #[test]
    fn test_set_get_take() {
        let slot = StateSlot::new();
        assert!(slot.set(Box::new(7u32)).is_ok());
        assert_eq!(slot.get(), Some(&7));

        let value = slot.take().unwrap();
        assert_eq!(*value, 7);
        assert!(slot.get().is_none());
    }

    #[test]
    fn test_second_set_rejected() {
        let slot = StateSlot::new();
        slot.set(Box::new(1u32)).unwrap();

        let rejected = slot.set(Box::new(2u32)).unwrap_err();
        assert_eq!(*rejected, 2);
        assert_eq!(slot.get(), Some(&1));
    }

    #[test]
    fn test_reusable_after_take() {
        let slot = StateSlot::new();
        slot.set(Box::new(1u32)).unwrap();
        slot.take().unwrap();
        assert!(slot.set(Box::new(2u32)).is_ok());
        assert_eq!(slot.get(), Some(&2));
    }
}
