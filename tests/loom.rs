#![allow(missing_docs)]
#![cfg(feature = "loom")]

use loom::{
    model::Builder,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
};
use ncg::{
    config::Config,
    graph::Graph,
    loader::{NodeRecord, Topology},
    node::Node,
    observer::Observer,
    scheduler::Scheduler,
    system::{EvaluationError, System},
    tensor::NutrientHeader,
    types::{NodeId, PriorityTier},
};

fn model(f: impl Fn() + Sync + Send + 'static) {
    let mut builder = Builder::new();
    builder.preemption_bound = Some(3);
    builder.check(f);
}

fn nid(x: u32) -> NodeId {
    NodeId::from(x)
}

/// Counts aggregation steps, indexed by numeric node id minus one.
#[derive(Debug)]
struct Counter(Vec<AtomicUsize>);

impl Counter {
    fn new(capacity: usize) -> Self {
        Self((0..capacity).map(|_| AtomicUsize::new(0)).collect())
    }

    fn get(&self, id: u32) -> usize {
        self.0[id as usize - 1].load(Ordering::Relaxed)
    }
}

impl Observer for Counter {
    fn aggregation_started(&self, node: &Node) {
        let idx: usize = node.id().as_str().parse().unwrap();
        self.0[idx - 1].fetch_add(1, Ordering::Relaxed);
    }
}

fn build(records: Vec<(u32, NodeRecord)>) -> Graph {
    let mut topology = Topology::new(NutrientHeader::new(["calories"]).unwrap());
    for (id, record) in records {
        topology.insert(nid(id), record).unwrap();
    }
    Graph::construct(topology, &Config::default()).expect("setup must succeed")
}

#[test]
fn loom_shared_child_is_computed_once() {
    model(|| {
        // Graph:
        //   1(10 g)  2(30 g)
        //       \    /
        //        3(40 g)
        //       /    \
        //   4(40 g)  5(40 g)
        // Density of 3 = (10 * 1 + 30 * 5) / 40 = 4, and 4 and 5 inherit it.
        // Shuffled key order exercises the topological sort.
        let graph = build(vec![
            (4, NodeRecord::composite("Top", "g", 40.0, [nid(3)])),
            (3, NodeRecord::composite("Mid", "g", 40.0, [nid(1), nid(2)])),
            (1, NodeRecord::leaf("A", "g", 10.0, [1.0])),
            (5, NodeRecord::composite("Top", "g", 40.0, [nid(3)])),
            (2, NodeRecord::leaf("B", "g", 30.0, [5.0])),
        ]);
        let system = Arc::new(System::with_observer(graph, Counter::new(5)));

        let handle = {
            let system = Arc::clone(&system);
            thread::spawn(move || system.evaluate("4").map(|density| density[0]))
        };
        let mine = system.evaluate("5").map(|density| density[0]);
        let theirs = handle.join().unwrap();

        assert_eq!(mine, Ok(4.0));
        assert_eq!(theirs, Ok(4.0));
        let counter = system.observer();
        assert_eq!(counter.get(1), 0);
        assert_eq!(counter.get(2), 0);
        assert_eq!(counter.get(3), 1);
        assert_eq!(counter.get(4), 1);
        assert_eq!(counter.get(5), 1);
        assert!(core::ptr::eq(
            system.cached("3").unwrap(),
            system.evaluate("3").unwrap()
        ));
    });
}

#[test]
fn loom_failed_evaluation_leaves_cache_empty() {
    model(|| {
        // Graph:
        //   1(0 g)
        //     |
        //   2(0 g)
        // Aggregating 2 fails. A caller that slept on the other's attempt gets
        // that attempt's error; only a caller arriving after the failure
        // settled starts an attempt of its own.
        let graph = build(vec![
            (2, NodeRecord::composite("Nothing", "g", 0.0, [nid(1)])),
            (1, NodeRecord::leaf("Air", "g", 0.0, [0.0])),
        ]);
        let system = Arc::new(System::with_observer(graph, Counter::new(2)));
        let expected = EvaluationError::TotalMassZero { node: nid(2) };

        let handle = {
            let system = Arc::clone(&system);
            thread::spawn(move || system.evaluate("2").map(|_| ()))
        };
        assert_eq!(system.evaluate("2").map(|_| ()), Err(expected.clone()));
        assert_eq!(handle.join().unwrap(), Err(expected));

        assert!(!system.is_cached("2"));
        let attempts = system.observer().get(2);
        assert!(attempts == 1 || attempts == 2, "{attempts} attempts");
        assert_eq!(system.scheduler().in_flight(), 0);
    });
}

#[test]
fn loom_exclusive_permit_runs_alone() {
    model(|| {
        let scheduler = Arc::new(Scheduler::new());
        let exclusive_active = Arc::new(AtomicBool::new(false));
        let others = Arc::new(AtomicUsize::new(0));

        let handle = {
            let (scheduler, exclusive_active, others) = (
                Arc::clone(&scheduler),
                Arc::clone(&exclusive_active),
                Arc::clone(&others),
            );
            thread::spawn(move || {
                let _permit = scheduler.admit(PriorityTier::Exclusive);
                exclusive_active.store(true, Ordering::SeqCst);
                assert_eq!(others.load(Ordering::SeqCst), 0);
                exclusive_active.store(false, Ordering::SeqCst);
            })
        };

        {
            let _permit = scheduler.admit(PriorityTier::Background);
            others.fetch_add(1, Ordering::SeqCst);
            assert!(!exclusive_active.load(Ordering::SeqCst));
            others.fetch_sub(1, Ordering::SeqCst);
        }
        handle.join().unwrap();

        let stats = scheduler.stats();
        assert_eq!(stats.admitted, [1, 0, 1]);
        assert_eq!(stats.peak_in_flight, 1);
    });
}
