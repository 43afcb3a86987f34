//! Clone Tree Locking
//!
//! Based on Mach4 kern/lock.h/c simple locks.
//!
//! Every node of a clone tree (the root, its slices, clones and hidden
//! merge nodes) is guarded by one shared lock. Code that reaches from one
//! node into another must be holding that lock; the guard hands out a
//! [`LockToken`] which is checked against the lock a node was created
//! under. The check compiles away in release builds.

use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU64, Ordering};
use spin::{Mutex, MutexGuard};

static NEXT_LOCK_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a tree lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LockId(u64);

/// Spin lock shared by all nodes of one clone tree
#[derive(Debug)]
pub struct TreeLock<T> {
    id: LockId,
    inner: Mutex<T>,
}

impl<T> TreeLock<T> {
    /// Create a new unlocked tree lock
    pub fn new(value: T) -> Self {
        Self {
            id: LockId(NEXT_LOCK_ID.fetch_add(1, Ordering::Relaxed)),
            inner: Mutex::new(value),
        }
    }

    /// Create a lock whose value needs to know the lock's id
    pub fn new_with<F: FnOnce(LockId) -> T>(f: F) -> Self {
        let id = LockId(NEXT_LOCK_ID.fetch_add(1, Ordering::Relaxed));
        Self {
            id,
            inner: Mutex::new(f(id)),
        }
    }

    pub fn id(&self) -> LockId {
        self.id
    }

    /// Acquire the lock, spinning until available
    pub fn lock(&self) -> TreeGuard<'_, T> {
        TreeGuard {
            token: LockToken { lock_id: self.id },
            guard: self.inner.lock(),
        }
    }

    /// Try to acquire the lock without spinning
    pub fn try_lock(&self) -> Option<TreeGuard<'_, T>> {
        self.inner.try_lock().map(|guard| TreeGuard {
            token: LockToken { lock_id: self.id },
            guard,
        })
    }

    /// Check if the lock is held by anyone
    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }
}

/// RAII guard for a tree lock
pub struct TreeGuard<'a, T> {
    token: LockToken,
    guard: MutexGuard<'a, T>,
}

impl<T> TreeGuard<'_, T> {
    /// Proof that this lock is held
    pub fn token(&self) -> LockToken {
        self.token
    }
}

impl<T> Deref for TreeGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for TreeGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

/// Attestation that a particular tree lock is held
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockToken {
    lock_id: LockId,
}

impl LockToken {
    pub fn lock_id(&self) -> LockId {
        self.lock_id
    }

    /// Assert the held lock is `lock_id`
    #[inline]
    pub fn attest(&self, lock_id: LockId) {
        debug_assert_eq!(
            self.lock_id, lock_id,
            "object touched under the wrong tree lock"
        );
    }
}
