use crate::{
    graph::Graph,
    sync::*,
    types::{NodeIndex, PriorityTier},
};
use derive_more::Debug;

/// Admission gate for aggregation steps.
///
/// A generalised reader/writer lock with three classes:
/// - [`PriorityTier::Background`] holders share the gate with each other and
///   with at most one foreground holder,
/// - one [`PriorityTier::Foreground`] holder at a time,
/// - a [`PriorityTier::Exclusive`] holder runs alone. While one is waiting no
///   new holders of any tier are admitted, so exclusive steps cannot starve.
///
/// Permits cover a single node's own aggregation, never its children, so a
/// permit is never held while waiting for anything else.
#[derive(Debug)]
pub struct Scheduler {
    state: Mutex<AdmissionState>,
    #[debug(skip)]
    changed: Condvar,
}

#[derive(Debug, Default)]
struct AdmissionState {
    background: usize,
    foreground: bool,
    exclusive: bool,
    exclusive_waiting: usize,
    stats: SchedulerStats,
}

impl AdmissionState {
    fn admits(&self, tier: PriorityTier) -> bool {
        if self.exclusive {
            return false;
        }
        match tier {
            PriorityTier::Background => self.exclusive_waiting == 0,
            PriorityTier::Foreground => !self.foreground && self.exclusive_waiting == 0,
            PriorityTier::Exclusive => self.background == 0 && !self.foreground,
        }
    }

    fn in_flight(&self) -> usize {
        self.background + usize::from(self.foreground) + usize::from(self.exclusive)
    }

    fn acquire(&mut self, tier: PriorityTier) {
        match tier {
            PriorityTier::Background => self.background += 1,
            PriorityTier::Foreground => self.foreground = true,
            PriorityTier::Exclusive => self.exclusive = true,
        }
        self.stats.admitted[tier.index()] += 1;
        self.stats.peak_background = self.stats.peak_background.max(self.background);
        self.stats.peak_in_flight = self.stats.peak_in_flight.max(self.in_flight());
    }

    fn release(&mut self, tier: PriorityTier) {
        match tier {
            PriorityTier::Background => {
                self.background = self
                    .background
                    .checked_sub(1)
                    .expect("AdmissionState::release: [1]");
            }
            PriorityTier::Foreground => {
                assert!(self.foreground, "AdmissionState::release: [2]");
                self.foreground = false;
            }
            PriorityTier::Exclusive => {
                assert!(self.exclusive, "AdmissionState::release: [3]");
                self.exclusive = false;
            }
        }
    }
}

/// Counters accumulated since the scheduler was created.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct SchedulerStats {
    /// Admissions per tier, indexed by [`PriorityTier::index`].
    pub admitted: [u64; 3],
    /// Largest number of background holders seen at once.
    pub peak_background: usize,
    /// Largest number of holders of any tier seen at once.
    pub peak_in_flight: usize,
}

/// Proof of admission. Releases the slot on drop.
#[must_use]
#[derive(Debug)]
pub struct Permit<'a> {
    #[debug(skip)]
    scheduler: &'a Scheduler,
    tier: PriorityTier,
}

impl Permit<'_> {
    /// Tier this permit was granted for.
    pub fn tier(&self) -> PriorityTier {
        self.tier
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        let mut state = lock(&self.scheduler.state);
        state.release(self.tier);
        drop(state);
        self.scheduler.changed.notify_all();
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    /// Gate with nothing in flight.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(AdmissionState::default()),
            changed: Condvar::new(),
        }
    }

    /// Block until a step of `tier` may run.
    pub fn admit(&self, tier: PriorityTier) -> Permit<'_> {
        let mut state = lock(&self.state);
        if !state.admits(tier) {
            log::trace!("{tier} step waiting for admission ({} in flight)", state.in_flight());
            if tier == PriorityTier::Exclusive {
                state.exclusive_waiting += 1;
            }
            while !state.admits(tier) {
                state = wait(&self.changed, state);
            }
            if tier == PriorityTier::Exclusive {
                state.exclusive_waiting -= 1;
            }
        }
        state.acquire(tier);
        Permit {
            scheduler: self,
            tier,
        }
    }

    /// Number of aggregation steps currently admitted.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        lock(&self.state).in_flight()
    }

    /// Snapshot of the admission counters.
    #[must_use]
    pub fn stats(&self) -> SchedulerStats {
        lock(&self.state).stats
    }
}

/// Order in which a batch of requests is dispatched.
///
/// Background requests go first, longest critical path first, so that the
/// most overlap-friendly work starts early; then foreground; exclusive
/// requests go last because each one drains the whole gate. Returns positions
/// into `requests`; ties keep request order.
pub(crate) fn plan(graph: &Graph, requests: &[NodeIndex]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..requests.len()).collect();
    order.sort_by(|&lhs, &rhs| {
        let (lhs, rhs) = (requests[lhs], requests[rhs]);
        graph
            .at(lhs)
            .tier
            .cmp(&graph.at(rhs).tier)
            .then_with(|| {
                let lhs = graph.cost_at(lhs).critical_path;
                graph.cost_at(rhs).critical_path.total_cmp(&lhs)
            })
    });
    order
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use std::{
        sync::{Arc, mpsc},
        thread,
        time::Duration,
    };

    #[test]
    fn background_holders_share_the_gate() {
        let scheduler = Scheduler::new();
        let a = scheduler.admit(PriorityTier::Background);
        let b = scheduler.admit(PriorityTier::Background);
        let c = scheduler.admit(PriorityTier::Foreground);
        assert_eq!(scheduler.in_flight(), 3);
        drop((a, b, c));
        assert_eq!(scheduler.in_flight(), 0);
        let stats = scheduler.stats();
        assert_eq!(stats.admitted, [2, 1, 0]);
        assert_eq!(stats.peak_background, 2);
        assert_eq!(stats.peak_in_flight, 3);
    }

    #[test]
    fn second_foreground_waits_for_the_first() {
        let scheduler = Arc::new(Scheduler::new());
        let first = scheduler.admit(PriorityTier::Foreground);
        let (tx, rx) = mpsc::channel();
        let handle = {
            let scheduler = Arc::clone(&scheduler);
            thread::spawn(move || {
                let _permit = scheduler.admit(PriorityTier::Foreground);
                tx.send(()).unwrap();
            })
        };
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        drop(first);
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn waiting_exclusive_blocks_new_background() {
        let scheduler = Arc::new(Scheduler::new());
        let background = scheduler.admit(PriorityTier::Background);
        let (tx, rx) = mpsc::channel();
        let exclusive = {
            let scheduler = Arc::clone(&scheduler);
            let tx = tx.clone();
            thread::spawn(move || {
                let _permit = scheduler.admit(PriorityTier::Exclusive);
                tx.send("exclusive").unwrap();
                thread::sleep(Duration::from_millis(50));
            })
        };
        // Let the exclusive request register as waiting.
        while lock(&scheduler.state).exclusive_waiting == 0 {
            thread::yield_now();
        }
        let late = {
            let scheduler = Arc::clone(&scheduler);
            thread::spawn(move || {
                let _permit = scheduler.admit(PriorityTier::Background);
                tx.send("background").unwrap();
            })
        };
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        drop(background);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "exclusive");
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "background");
        exclusive.join().unwrap();
        late.join().unwrap();
    }
}
