use crate::{
    sync::*,
    types::SyncUnsafeCell,
};
use core::fmt;

const EMPTY: u8 = 0;
const RUNNING: u8 = 1;
const READY: u8 = 2;

/// Write-once cell with single-flight initialisation.
///
/// State machine: `EMPTY -> RUNNING -> READY`, or `RUNNING -> EMPTY` when the
/// initialiser fails or unwinds. Only the caller that moved the state to
/// `RUNNING` ever writes the value; everybody else arriving meanwhile sleeps on
/// the condvar and receives the outcome of that attempt, error included. Once
/// `READY`, reads are a single `Acquire` load.
pub(crate) struct OnceSlot<T, E> {
    state: AtomicU8,
    value: SyncUnsafeCell<Option<T>>,
    gate: Mutex<Attempts<E>>,
    settled: Condvar,
}

/// Bookkeeping guarded by the gate.
struct Attempts<E> {
    /// Number of attempts claimed so far; the running one, if any, is the last.
    started: u64,
    /// Most recent failed attempt and its error.
    failed: Option<(u64, E)>,
}

impl<E> Attempts<E> {
    const fn new() -> Self {
        Self {
            started: 0,
            failed: None,
        }
    }
}

impl<T, E> OnceSlot<T, E> {
    pub(crate) fn empty() -> Self {
        Self {
            state: AtomicU8::new(EMPTY),
            value: SyncUnsafeCell::new(None),
            gate: Mutex::new(Attempts::new()),
            settled: Condvar::new(),
        }
    }

    pub(crate) fn ready(value: T) -> Self {
        Self {
            state: AtomicU8::new(READY),
            value: SyncUnsafeCell::new(Some(value)),
            gate: Mutex::new(Attempts::new()),
            settled: Condvar::new(),
        }
    }

    #[inline]
    pub(crate) fn get(&self) -> Option<&T> {
        if self.state.load(Ordering::Acquire) != READY {
            return None;
        }
        // SAFETY: `READY` is stored with `Release` right after the only write to
        // `value`, and the value is never written again. The `Acquire` load above
        // makes that write visible.
        self.value.with(|ptr| unsafe { (*ptr).as_ref() })
    }

    /// Return the stored value, running `init` if nobody has produced it yet.
    ///
    /// Concurrent callers coalesce: exactly one of them runs `init`, the others
    /// block until it settles and share its outcome. A failure is not retried
    /// here: the slot goes back to empty so that a later call starts a fresh
    /// attempt. Only an unwinding `init` hands the claim to a sleeper.
    pub(crate) fn get_or_try_init(&self, init: impl FnOnce() -> Result<T, E>) -> Result<&T, E>
    where
        E: Clone,
    {
        if let Some(value) = self.get() {
            return Ok(value);
        }
        {
            let mut gate = lock(&self.gate);
            let mut awaited = None;
            loop {
                let state = self.state.load(Ordering::Acquire);
                if state == READY {
                    drop(gate);
                    return Ok(self.get().expect("OnceSlot::get_or_try_init: [1]"));
                }
                if let (Some(attempt), Some((failed, err))) = (awaited, &gate.failed) {
                    if *failed >= attempt {
                        return Err(err.clone());
                    }
                }
                if state == RUNNING {
                    if awaited.is_none() {
                        awaited = Some(gate.started);
                    }
                    gate = wait(&self.settled, gate);
                    continue;
                }
                gate.started = gate
                    .started
                    .checked_add(1)
                    .expect("OnceSlot::get_or_try_init: [2]");
                self.state.store(RUNNING, Ordering::Relaxed);
                break;
            }
        }

        let claim = Claim { slot: self };
        match init() {
            Ok(value) => {
                claim.publish(value);
                Ok(self.get().expect("OnceSlot::get_or_try_init: [3]"))
            }
            Err(err) => {
                claim.fail(err.clone());
                Err(err)
            }
        }
    }
}

/// Ownership of a `RUNNING` slot. Dropping it without settling (an unwinding
/// initialiser) rolls the slot back to `EMPTY` and wakes the sleepers, one of
/// which claims a new attempt.
struct Claim<'a, T, E> {
    slot: &'a OnceSlot<T, E>,
}

impl<T, E> Claim<'_, T, E> {
    fn publish(self, value: T) {
        let slot = self.slot;
        core::mem::forget(self);
        let _gate = lock(&slot.gate);
        // SAFETY: the state is `RUNNING` and this claim is its unique owner, so no
        // other thread reads or writes `value` until `READY` is published below.
        slot.value.with_mut(|ptr| unsafe { *ptr = Some(value) });
        slot.state.store(READY, Ordering::Release);
        slot.settled.notify_all();
    }

    fn fail(self, err: E) {
        let slot = self.slot;
        core::mem::forget(self);
        let mut gate = lock(&slot.gate);
        gate.failed = Some((gate.started, err));
        slot.state.store(EMPTY, Ordering::Relaxed);
        slot.settled.notify_all();
    }
}

impl<T, E> Drop for Claim<'_, T, E> {
    fn drop(&mut self) {
        let _gate = lock(&self.slot.gate);
        self.slot.state.store(EMPTY, Ordering::Relaxed);
        self.slot.settled.notify_all();
    }
}

impl<T: fmt::Debug, E> fmt::Debug for OnceSlot<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get() {
            Some(value) => f.debug_tuple("Ready").field(value).finish(),
            None => f.write_str("Pending"),
        }
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use std::{
        sync::{
            Barrier,
            atomic::{AtomicUsize, Ordering as StdOrdering},
        },
        thread,
        time::Duration,
    };

    #[test]
    fn failed_init_leaves_slot_empty() {
        let slot = OnceSlot::<u32, &str>::empty();
        assert_eq!(slot.get_or_try_init(|| Err("nope")), Err("nope"));
        assert!(slot.get().is_none());
        assert_eq!(slot.get_or_try_init(|| Ok::<_, &str>(7)), Ok(&7));
        assert_eq!(slot.get_or_try_init(|| Ok::<_, &str>(8)), Ok(&7));
    }

    #[test]
    fn ready_slot_never_runs_init() {
        let slot = OnceSlot::ready(3u8);
        let value = slot.get_or_try_init(|| -> Result<u8, ()> { panic!("must not run") });
        assert_eq!(value, Ok(&3));
    }

    #[test]
    fn concurrent_callers_share_one_initialisation() {
        let slot = OnceSlot::<usize, ()>::empty();
        let runs = AtomicUsize::new(0);
        let barrier = Barrier::new(8);
        thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    barrier.wait();
                    let value = slot
                        .get_or_try_init(|| {
                            runs.fetch_add(1, StdOrdering::Relaxed);
                            thread::sleep(Duration::from_millis(20));
                            Ok::<_, ()>(42)
                        })
                        .copied();
                    assert_eq!(value, Ok(42));
                });
            }
        });
        assert_eq!(runs.load(StdOrdering::Relaxed), 1);
    }

    #[test]
    fn panicking_init_releases_the_claim() {
        let slot = OnceSlot::<u8, ()>::empty();
        let outcome = std::panic::catch_unwind(core::panic::AssertUnwindSafe(|| {
            let _ = slot.get_or_try_init(|| -> Result<u8, ()> { panic!("boom") });
        }));
        assert!(outcome.is_err());
        assert_eq!(slot.get_or_try_init(|| Ok::<_, ()>(1)), Ok(&1));
    }

    #[test]
    fn waiters_share_a_failed_attempt() {
        let slot = OnceSlot::<usize, &str>::empty();
        let runs = AtomicUsize::new(0);
        let barrier = Barrier::new(8);
        thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    barrier.wait();
                    let value = slot.get_or_try_init(|| {
                        runs.fetch_add(1, StdOrdering::Relaxed);
                        thread::sleep(Duration::from_millis(100));
                        Err("empty")
                    });
                    assert_eq!(value, Err("empty"));
                });
            }
        });
        assert_eq!(runs.load(StdOrdering::Relaxed), 1);
        assert!(slot.get().is_none());
        // A later call is a fresh attempt.
        assert_eq!(slot.get_or_try_init(|| Ok(5)), Ok(&5));
        assert_eq!(runs.load(StdOrdering::Relaxed), 1);
    }

    #[test]
    fn sleeper_takes_over_after_an_unwinding_attempt() {
        let slot = OnceSlot::<u8, ()>::empty();
        let (claimed, release) = (Barrier::new(2), Barrier::new(2));
        thread::scope(|s| {
            s.spawn(|| {
                let outcome = std::panic::catch_unwind(core::panic::AssertUnwindSafe(|| {
                    let _ = slot.get_or_try_init(|| -> Result<u8, ()> {
                        claimed.wait();
                        release.wait();
                        panic!("boom")
                    });
                }));
                assert!(outcome.is_err());
            });
            claimed.wait();
            s.spawn(|| {
                release.wait();
                assert_eq!(slot.get_or_try_init(|| Ok(9)), Ok(&9));
            });
        });
        assert_eq!(slot.get(), Some(&9));
    }
}
