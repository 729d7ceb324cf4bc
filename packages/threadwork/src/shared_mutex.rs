//! Writer-preferring reader-writer lock.

use std::any::type_name;
use std::cell::UnsafeCell;
use std::fmt;
use std::ops::{Deref, DerefMut};

mod raw;

pub use raw::*;

/// A reader-writer lock that owns the data it protects.
///
/// Readers obtain shared access through [`read()`][Self::read], writers obtain exclusive access
/// through [`write()`][Self::write], and the returned guards release the lock when dropped.
/// Waiting writers take precedence over newly arriving readers; see [`RawSharedMutex`] for the
/// exact admission rules.
///
/// Neither mode is reentrant. A thread that holds the lock in any mode and asks for it again
/// may deadlock.
///
/// # Example
///
/// ```rust
/// use threadwork::SharedMutex;
///
/// let config = SharedMutex::new(vec!["alpha".to_string()]);
///
/// {
///     let first = config.read();
///     let second = config.read();
///     assert_eq!(first.len(), second.len());
/// }
///
/// config.write().push("beta".to_string());
///
/// assert_eq!(config.read().len(), 2);
/// ```
pub struct SharedMutex<T: ?Sized> {
    raw: RawSharedMutex,
    data: UnsafeCell<T>,
}

// SAFETY: Moving the lock moves the data; nothing else is shared.
unsafe impl<T: ?Sized + Send> Send for SharedMutex<T> {}

// SAFETY: Writers get `&mut T` from any thread (requires `T: Send`) and readers on several
// threads get `&T` at the same time (requires `T: Sync`). The lock keeps the two apart.
unsafe impl<T: ?Sized + Send + Sync> Sync for SharedMutex<T> {}

impl<T> SharedMutex<T> {
    /// Creates an unlocked lock protecting `value`.
    #[must_use]
    pub const fn new(value: T) -> Self {
        Self {
            raw: RawSharedMutex::new(),
            data: UnsafeCell::new(value),
        }
    }

    /// Consumes the lock and returns the protected value.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> SharedMutex<T> {
    /// Acquires shared access, blocking while a writer holds or waits for the lock.
    pub fn read(&self) -> SharedMutexReadGuard<'_, T> {
        self.raw.lock_shared();
        SharedMutexReadGuard { lock: self }
    }

    /// Attempts to acquire shared access without blocking.
    pub fn try_read(&self) -> Option<SharedMutexReadGuard<'_, T>> {
        self.raw
            .try_lock_shared()
            .then(|| SharedMutexReadGuard { lock: self })
    }

    /// Acquires exclusive access, blocking until every other holder has released the lock.
    pub fn write(&self) -> SharedMutexWriteGuard<'_, T> {
        self.raw.lock();
        SharedMutexWriteGuard { lock: self }
    }

    /// Attempts to acquire exclusive access without blocking.
    pub fn try_write(&self) -> Option<SharedMutexWriteGuard<'_, T>> {
        self.raw
            .try_lock()
            .then(|| SharedMutexWriteGuard { lock: self })
    }

    /// Returns a mutable reference to the protected value.
    ///
    /// No locking is needed because the exclusive borrow proves there are no other users.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// The underlying lock, for state queries such as
    /// [`reader_count()`][RawSharedMutex::reader_count].
    #[must_use]
    pub fn raw(&self) -> &RawSharedMutex {
        &self.raw
    }
}

impl<T: Default> Default for SharedMutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: ?Sized> fmt::Debug for SharedMutex<T> {
    #[cfg_attr(test, mutants::skip)] // We have no API contract for this.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("raw", &self.raw)
            .finish_non_exhaustive()
    }
}

/// Shared access to the value inside a [`SharedMutex`], released on drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct SharedMutexReadGuard<'a, T: ?Sized> {
    lock: &'a SharedMutex<T>,
}

impl<T: ?Sized> Deref for SharedMutexReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: We hold the lock in shared mode, so nobody has exclusive access.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SharedMutexReadGuard<'_, T> {
    fn drop(&mut self) {
        // SAFETY: The guard exists only while a shared lock is held and releases it once.
        unsafe {
            self.lock.raw.unlock_shared();
        }
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for SharedMutexReadGuard<'_, T> {
    #[cfg_attr(test, mutants::skip)] // We have no API contract for this.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

/// Exclusive access to the value inside a [`SharedMutex`], released on drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct SharedMutexWriteGuard<'a, T: ?Sized> {
    lock: &'a SharedMutex<T>,
}

impl<T: ?Sized> Deref for SharedMutexWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: We hold the lock exclusively.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SharedMutexWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: We hold the lock exclusively and `&mut self` keeps the access unique.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SharedMutexWriteGuard<'_, T> {
    fn drop(&mut self) {
        // SAFETY: The guard exists only while the exclusive lock is held and releases it once.
        unsafe {
            self.lock.raw.unlock();
        }
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for SharedMutexWriteGuard<'_, T> {
    #[cfg_attr(test, mutants::skip)] // We have no API contract for this.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}
