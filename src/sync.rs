#[cfg(feature = "loom")]
mod imp {
    pub(crate) use loom::{
        cell::UnsafeCell,
        sync::{
            Condvar, Mutex, MutexGuard,
            atomic::{AtomicU8, Ordering},
        },
    };
}

#[cfg(not(feature = "loom"))]
mod imp {
    pub(crate) use core::{
        cell::UnsafeCell,
        sync::atomic::{AtomicU8, Ordering},
    };
    pub(crate) use std::sync::{Condvar, Mutex, MutexGuard};

    /// Gives `core::cell::UnsafeCell` the closure-based access API of
    /// `loom::cell::UnsafeCell`, so the same code compiles under both.
    pub(crate) trait LoomUnsafeCellCompat<T> {
        fn with<R>(&self, f: impl FnOnce(*const T) -> R) -> R;
        fn with_mut<R>(&self, f: impl FnOnce(*mut T) -> R) -> R;
    }

    impl<T> LoomUnsafeCellCompat<T> for UnsafeCell<T> {
        #[inline]
        fn with<R>(&self, f: impl FnOnce(*const T) -> R) -> R {
            f(self.get())
        }

        #[inline]
        fn with_mut<R>(&self, f: impl FnOnce(*mut T) -> R) -> R {
            f(self.get())
        }
    }
}

pub(crate) use imp::*;
use std::sync::PoisonError;

/// Lock ignoring poisoning: every critical section in this crate leaves the
/// guarded state consistent before any user code can panic.
#[inline]
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[inline]
pub(crate) fn wait<'a, T>(condvar: &Condvar, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
    condvar.wait(guard).unwrap_or_else(PoisonError::into_inner)
}
