//! Provides a reader-writer lock container similar to `std::sync::RwLock<T>`
//! but parameterized over any type `L` that implements the
//! [`LockingMechanism`] trait, for better no-std support.

use core::{
    cell::{Cell, UnsafeCell},
    ops::{Deref, DerefMut},
};

/// A trait for providing reader-writer exclusion.
///
/// If you do not need to use the allocator in a multi-threaded environment,
/// you may use [`SingleThreadedLock`], which is the moral equivalent of a
/// `RefCell`.
///
/// # Safety
///
/// * If the implementation type is `Sync`, then an allocator using this locking
///   mechanism will be `Sync`, and therefore these methods must provide actual
///   reader-writer exclusion and prevent against unsynchronized accesses.
///
/// * Even in single-threaded contexts, where real synchronization is not
///   required, this type must prevent taking the exclusive lock while any lock
///   is held, and taking the shared lock while the exclusive lock is held. The
///   prevention may be a panic, abort, infinite loop, or etc...
pub unsafe trait LockingMechanism: Default {
    /// Acquire the lock exclusively.
    ///
    /// If it is already held, in any mode, this must result in a panic,
    /// abort, infinite loop, or etc... and locking must not succeed.
    fn lock_exclusive(&self);

    /// Release an exclusive hold of the lock.
    fn unlock_exclusive(&self);

    /// Acquire the lock shared.
    ///
    /// If it is already held exclusively, this must result in a panic, abort,
    /// infinite loop, or etc... and locking must not succeed.
    fn lock_shared(&self);

    /// Release one shared hold of the lock.
    fn unlock_shared(&self);
}

/// A single-threaded implementation of [`LockingMechanism`].
///
/// This is effectively a `RefCell`. It allows using the `Allocator` in
/// single-threaded scenarios.
#[derive(Debug)]
pub struct SingleThreadedLock {
    // 0: unlocked, n > 0: held by n readers, -1: held by a writer.
    state: Cell<isize>,
}

unsafe impl LockingMechanism for SingleThreadedLock {
    #[inline]
    fn lock_exclusive(&self) {
        assert_eq!(self.state.get(), 0, "lock is already held");
        self.state.set(-1);
    }

    #[inline]
    fn unlock_exclusive(&self) {
        assert_eq!(self.state.get(), -1);
        self.state.set(0);
    }

    #[inline]
    fn lock_shared(&self) {
        let state = self.state.get();
        assert!(state >= 0, "lock is held exclusively");
        self.state.set(state + 1);
    }

    #[inline]
    fn unlock_shared(&self) {
        let state = self.state.get();
        assert!(state > 0);
        self.state.set(state - 1);
    }
}

impl Default for SingleThreadedLock {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl SingleThreadedLock {
    /// Construct a new `SingleThreadedLock`.
    #[inline]
    pub fn new() -> Self {
        SingleThreadedLock {
            state: Cell::new(0),
        }
    }
}

#[cfg(feature = "parking_lot")]
mod parking {
    use super::LockingMechanism;
    use parking_lot::lock_api::RawRwLock as _;

    /// A thread-safe implementation of [`LockingMechanism`] backed by
    /// `parking_lot`'s raw reader-writer lock.
    pub struct ParkingLotLock {
        raw: parking_lot::RawRwLock,
    }

    impl core::fmt::Debug for ParkingLotLock {
        fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
            f.debug_struct("ParkingLotLock")
                .field("locked", &self.raw.is_locked())
                .finish()
        }
    }

    impl Default for ParkingLotLock {
        #[inline]
        fn default() -> Self {
            ParkingLotLock {
                raw: parking_lot::RawRwLock::INIT,
            }
        }
    }

    unsafe impl LockingMechanism for ParkingLotLock {
        #[inline]
        fn lock_exclusive(&self) {
            self.raw.lock_exclusive();
        }

        #[inline]
        fn unlock_exclusive(&self) {
            // Safety: only called by `RwLockWriteGuard::drop`, which exists
            // only while the exclusive lock is held.
            unsafe { self.raw.unlock_exclusive() }
        }

        #[inline]
        fn lock_shared(&self) {
            self.raw.lock_shared();
        }

        #[inline]
        fn unlock_shared(&self) {
            // Safety: only called by `RwLockReadGuard::drop`, which exists
            // only while a shared lock is held.
            unsafe { self.raw.unlock_shared() }
        }
    }
}

#[cfg(feature = "parking_lot")]
pub use parking::ParkingLotLock;

#[derive(Default)]
pub(crate) struct RwLock<T, L> {
    lock: L,
    value: UnsafeCell<T>,
}

// Safety: if `T` and `L` can be sent between threads, then the lock can as
// well. The API, implementation, and borrow checker do not allow for
// unsynchronized accesses in the face of sending these across threads.
unsafe impl<T, L> Send for RwLock<T, L>
where
    T: Send,
    L: Send,
{
}

// Safety: upheld by the `LockingMechanism` trait's implementation contract.
//
// `T` must be `Send` because the write guard hands out `&mut T`, which can be
// used to `mem::replace()` the `T`. `T` must be `Sync` because read guards on
// several threads hand out `&T` at the same time.
unsafe impl<T, L> Sync for RwLock<T, L>
where
    T: Send + Sync,
    L: Sync + LockingMechanism,
{
}

impl<T, L> RwLock<T, L>
where
    L: LockingMechanism,
{
    pub(crate) fn new(value: T) -> Self {
        let value = UnsafeCell::new(value);
        RwLock {
            lock: L::default(),
            value,
        }
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, T, L> {
        self.lock.lock_shared();
        RwLockReadGuard { rwlock: self }
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, T, L> {
        self.lock.lock_exclusive();
        RwLockWriteGuard { rwlock: self }
    }

    pub(crate) fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }
}

pub(crate) struct RwLockReadGuard<'a, T, L>
where
    L: LockingMechanism,
{
    rwlock: &'a RwLock<T, L>,
}

impl<T, L> Drop for RwLockReadGuard<'_, T, L>
where
    L: LockingMechanism,
{
    fn drop(&mut self) {
        self.rwlock.lock.unlock_shared();
    }
}

impl<T, L> Deref for RwLockReadGuard<'_, T, L>
where
    L: LockingMechanism,
{
    type Target = T;

    #[inline]
    fn deref(&self) -> &Self::Target {
        unsafe { &*self.rwlock.value.get() }
    }
}

pub(crate) struct RwLockWriteGuard<'a, T, L>
where
    L: LockingMechanism,
{
    rwlock: &'a RwLock<T, L>,
}

impl<T, L> Drop for RwLockWriteGuard<'_, T, L>
where
    L: LockingMechanism,
{
    fn drop(&mut self) {
        self.rwlock.lock.unlock_exclusive();
    }
}

impl<T, L> Deref for RwLockWriteGuard<'_, T, L>
where
    L: LockingMechanism,
{
    type Target = T;

    #[inline]
    fn deref(&self) -> &Self::Target {
        unsafe { &*self.rwlock.value.get() }
    }
}

impl<T, L> DerefMut for RwLockWriteGuard<'_, T, L>
where
    L: LockingMechanism,
{
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.rwlock.value.get() }
    }
}
