//! Typed object pools for reusing allocations across requests.
//!
//! Mirrors the server's own connection-queue design (a shared
//! [`SegQueue`] handed out to workers) but for short-lived, per-request
//! scratch objects: route-parameter lists, session value buffers, and
//! similar small `Vec`-backed structures that would otherwise allocate
//! and drop once per request.
//!
//! A pool never blocks: [`Pool::acquire`] pops a free object or builds a
//! fresh one on an empty queue, and [`Pooled`] returns its value to the
//! queue on drop instead of deallocating it. Pools have no fixed
//! capacity; an oversized object is simply dropped instead of returned,
//! so a pathological request can't pin an unbounded buffer in the pool
//! forever.

use crossbeam::queue::SegQueue;
use std::{
    ops::{Deref, DerefMut},
    sync::Arc,
};

/// Something that can be pooled: built fresh and reset for reuse.
pub(crate) trait Poolable: Send + 'static {
    fn new() -> Self;

    /// Clears the object back to its post-`new` state without deallocating
    /// capacity, so a reused `Vec` keeps whatever capacity it grew to.
    fn reset(&mut self);

    /// Rough byte footprint used to decide whether a returned object is
    /// worth keeping. Oversized objects are dropped rather than pooled,
    /// so one unusually large request doesn't inflate steady-state memory.
    fn capacity_bytes(&self) -> usize;
}

impl<T: Send + 'static> Poolable for Vec<T> {
    fn new() -> Self {
        Vec::new()
    }

    fn reset(&mut self) {
        self.clear();
    }

    fn capacity_bytes(&self) -> usize {
        self.capacity() * std::mem::size_of::<T>()
    }
}

/// Upper bound on a returned object's footprint before it's dropped
/// instead of recycled. 32 KiB covers the largest route-parameter lists
/// and session scratch buffers this crate builds without letting a single
/// outlier request inflate the pool's resident memory indefinitely.
const MAX_POOLED_BYTES: usize = 32 * 1024;

/// A lock-free pool of reusable `T` instances.
///
/// Cloning a `Pool` is cheap and shares the same underlying queue, mirroring
/// how [`Server`](crate::Server) shares its stream queue across workers.
#[derive(Clone)]
pub(crate) struct Pool<T: Poolable> {
    free: Arc<SegQueue<T>>,
}

impl<T: Poolable> Pool<T> {
    pub(crate) fn new() -> Self {
        Pool {
            free: Arc::new(SegQueue::new()),
        }
    }

    /// Pops a recycled `T` or builds a fresh one, returning a guard that
    /// puts it back on drop.
    pub(crate) fn acquire(&self) -> Pooled<T> {
        let mut value = self.free.pop().unwrap_or_else(T::new);
        value.reset();

        Pooled {
            value: Some(value),
            pool: self.free.clone(),
        }
    }
}

impl<T: Poolable> Default for Pool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl Pool<Vec<u8>> {
    /// Pops a recycled buffer with capacity at least `n`, or builds a fresh
    /// one. A buffer that's too small is dropped rather than grown in place,
    /// so one oversized request can't ratchet every pooled buffer up to its
    /// size; the buffer is always returned at exactly length `n`, zeroed.
    pub(crate) fn get_with_size(&self, n: usize) -> Pooled<Vec<u8>> {
        let mut value = match self.free.pop() {
            Some(value) if value.capacity() >= n => value,
            _ => Vec::with_capacity(n),
        };
        value.clear();
        value.resize(n, 0);

        Pooled {
            value: Some(value),
            pool: self.free.clone(),
        }
    }
}

/// An object on loan from a [`Pool`]. Returns itself to the pool on drop
/// unless it grew past [`MAX_POOLED_BYTES`], in which case it's dropped.
pub(crate) struct Pooled<T: Poolable> {
    value: Option<T>,
    pool: Arc<SegQueue<T>>,
}

impl<T: Poolable + std::fmt::Debug> std::fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.value.as_ref().fmt(f)
    }
}

impl<T: Poolable> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.value.as_ref().expect("Pooled value taken before drop")
    }
}

impl<T: Poolable> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.value.as_mut().expect("Pooled value taken before drop")
    }
}

impl<T: Poolable> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            if value.capacity_bytes() <= MAX_POOLED_BYTES {
                self.pool.push(value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuses_returned_allocation() {
        let pool: Pool<Vec<u8>> = Pool::new();

        {
            let mut v = pool.acquire();
            v.extend_from_slice(&[1, 2, 3]);
        }

        assert_eq!(pool.free.len(), 1);

        let v = pool.acquire();
        assert!(v.is_empty());
        assert_eq!(pool.free.len(), 0);
    }

    #[test]
    fn get_with_size_reuses_large_enough_buffer() {
        let pool: Pool<Vec<u8>> = Pool::new();

        {
            let mut v = pool.get_with_size(16);
            v.fill(7);
        }

        let v = pool.get_with_size(8);
        assert_eq!(v.len(), 8);
        assert!(v.iter().all(|&b| b == 0));
        assert_eq!(pool.free.len(), 0);
    }

    #[test]
    fn get_with_size_discards_undersized_buffer() {
        let pool: Pool<Vec<u8>> = Pool::new();

        {
            let _v = pool.get_with_size(4);
        }
        assert_eq!(pool.free.len(), 1);

        let v = pool.get_with_size(64);
        assert_eq!(v.len(), 64);
        assert_eq!(pool.free.len(), 0);
    }

    #[test]
    fn drops_oversized_objects_instead_of_pooling() {
        let pool: Pool<Vec<u8>> = Pool::new();

        {
            let mut v = pool.acquire();
            v.resize(MAX_POOLED_BYTES + 1, 0);
        }

        assert_eq!(pool.free.len(), 0);
    }
}
