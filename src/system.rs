mod evaluate;

/// Failure of a single query.
pub use crate::system::evaluate::EvaluationError;
use crate::{
    config::Config,
    graph::{Graph, UnknownNodeError},
    loader::{DataLoader, LoadError},
    node::Node,
    observer::Observer,
    scheduler::{self, Scheduler},
    tensor::NutrientTensor,
    types::NodeIndex,
};
use derive_more::Debug;

/// The computation engine: a constructed [`Graph`], its admission gate and an
/// [`Observer`].
///
/// Share it across threads by reference (or behind an `Arc`); every query
/// takes `&self`. Densities are computed on first request and cached on the
/// nodes for the lifetime of the system.
#[must_use]
#[derive(Debug)]
pub struct System<O = ()> {
    graph: Graph,
    scheduler: Scheduler,
    #[debug(skip)]
    observer: O,
    #[debug(skip)]
    pool: Option<rayon::ThreadPool>,
}

impl System {
    /// System over `graph` without observation.
    pub fn new(graph: Graph) -> Self {
        Self::with_observer(graph, ())
    }

    /// Load a topology and construct the graph in one go.
    ///
    /// # Errors
    /// If the loader fails or the topology is not a valid graph.
    pub fn load<L: DataLoader>(loader: &L, config: &Config) -> Result<Self, LoadError<L::Error>> {
        let topology = loader.load().map_err(LoadError::Loader)?;
        Ok(Self::new(Graph::construct(topology, config)?))
    }
}

impl<O: Observer> System<O> {
    /// System over `graph` reporting aggregation steps to `observer`.
    pub fn with_observer(graph: Graph, observer: O) -> Self {
        Self {
            graph,
            scheduler: Scheduler::new(),
            observer,
            pool: None,
        }
    }

    /// Run batch evaluations on `pool` instead of the global rayon pool.
    pub fn with_thread_pool(mut self, pool: rayon::ThreadPool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// The underlying graph.
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// The admission gate, e.g. for its statistics.
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// The observer.
    pub fn observer(&self) -> &O {
        &self.observer
    }

    /// Nutrient density per 100 g of `id`.
    ///
    /// Cache hits are a lock-free read. Otherwise children are resolved first
    /// and the node's own aggregation is admitted by its tier. The result is
    /// cached exactly once and repeated calls return the same tensor.
    ///
    /// # Errors
    /// [`EvaluationError`] for an unknown id or a composite that cannot be
    /// aggregated; nothing is cached for the failing node and its ancestors.
    pub fn evaluate(&self, id: &str) -> Result<&NutrientTensor, EvaluationError> {
        self.resolve(self.index_of(id)?)
    }

    /// Absolute nutrient amounts in the node's `quantity_in_grams`, i.e. the
    /// density scaled by `quantity_in_grams / 100`.
    ///
    /// # Errors
    /// Same as [`System::evaluate`].
    pub fn total_nutrients(&self, id: &str) -> Result<NutrientTensor, EvaluationError> {
        let idx = self.index_of(id)?;
        let density = self.resolve(idx)?;
        Ok(density.scaled(self.graph.at(idx).quantity_in_grams / 100.0))
    }

    /// Density of `id` paired with the nutrient codes, in header order.
    ///
    /// # Errors
    /// Same as [`System::evaluate`].
    pub fn nutrient_profile(&self, id: &str) -> Result<Vec<(&str, f64)>, EvaluationError> {
        let density = self.evaluate(id)?;
        Ok(self
            .graph
            .header()
            .codes()
            .zip(density.iter().copied())
            .collect())
    }

    /// Whether the density of `id` is available without computation.
    #[must_use]
    pub fn is_cached(&self, id: &str) -> bool {
        self.cached(id).is_some()
    }

    /// The density of `id` if it is available without computation.
    #[must_use]
    pub fn cached(&self, id: &str) -> Option<&NutrientTensor> {
        self.graph.get(id)?.density()
    }

    /// Order in which [`System::evaluate_batch`] dispatches `ids`.
    ///
    /// # Errors
    /// If an id is not in the graph.
    pub fn plan_batch<S: AsRef<str>>(&self, ids: &[S]) -> Result<Vec<&Node>, UnknownNodeError> {
        let requests = ids
            .iter()
            .map(|id| {
                let id = id.as_ref();
                self.graph
                    .index_of(id)
                    .ok_or_else(|| UnknownNodeError(id.into()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(scheduler::plan(&self.graph, &requests)
            .into_iter()
            .map(|pos| self.graph.at(requests[pos]))
            .collect())
    }

    /// Evaluate many nodes concurrently on rayon.
    ///
    /// Requests are started in [`System::plan_batch`] order; results come
    /// back in the order of `ids`. Shared sub-ingredients are still computed
    /// once: workers touching the same node coalesce on it.
    #[cfg(not(feature = "loom"))]
    pub fn evaluate_batch<S: AsRef<str>>(
        &self,
        ids: &[S],
    ) -> Vec<Result<&NutrientTensor, EvaluationError>> {
        let mut results = Vec::with_capacity(ids.len());
        let mut requests = Vec::with_capacity(ids.len());
        let mut positions = Vec::with_capacity(ids.len());
        for (pos, id) in ids.iter().enumerate() {
            match self.index_of(id.as_ref()) {
                Ok(idx) => {
                    requests.push(idx);
                    positions.push(pos);
                    results.push(None);
                }
                Err(err) => results.push(Some(Err(err))),
            }
        }
        let order = scheduler::plan(&self.graph, &requests);

        let (tx, rx) = std::sync::mpsc::channel();
        match &self.pool {
            Some(pool) => {
                pool.scope_fifo(|scope| self.dispatch(scope, &order, &requests, &positions, &tx));
            }
            None => rayon::scope_fifo(|scope| {
                self.dispatch(scope, &order, &requests, &positions, &tx);
            }),
        }
        drop(tx);
        for (pos, outcome) in rx {
            results[pos] = Some(outcome);
        }
        results
            .into_iter()
            .map(|outcome| outcome.expect("System::evaluate_batch: [1]"))
            .collect()
    }

    #[cfg(not(feature = "loom"))]
    fn dispatch<'a>(
        &'a self,
        scope: &rayon::ScopeFifo<'a>,
        order: &[usize],
        requests: &[NodeIndex],
        positions: &[usize],
        tx: &std::sync::mpsc::Sender<(usize, Result<&'a NutrientTensor, EvaluationError>)>,
    ) {
        for &slot in order {
            let (idx, pos, tx) = (requests[slot], positions[slot], tx.clone());
            scope.spawn_fifo(move |_| {
                // The receiver outlives the scope.
                let _ = tx.send((pos, self.resolve(idx)));
            });
        }
    }

    fn index_of(&self, id: &str) -> Result<NodeIndex, EvaluationError> {
        self.graph
            .index_of(id)
            .ok_or_else(|| UnknownNodeError(id.into()).into())
    }
}
