use crate::{
    slot::OnceSlot,
    system::EvaluationError,
    tensor::NutrientTensor,
    types::{NodeId, NodeIndex, PriorityTier},
};
use core::time::Duration;
use derive_more::Debug;

/// Descriptive part of a node, immutable after construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeSpec {
    /// Food, ingredient or sub-ingredient description.
    pub name: String,
    /// Everyday output unit.
    pub unit: String,
}

/// A food, ingredient or sub-ingredient quantity inside a [`crate::graph::Graph`].
///
/// Everything except the density cache is fixed at construction. The cache
/// goes from empty to populated at most once; leaves are created populated.
#[must_use]
#[derive(Debug)]
pub struct Node {
    pub(crate) id: NodeId,
    pub(crate) spec: NodeSpec,
    pub(crate) quantity_in_grams: f64,
    /// Arena indices of the constituents, in loader order.
    pub(crate) children: Box<[NodeIndex]>,
    /// Number of nodes listing this one as a child.
    pub(crate) parents_total: u32,
    pub(crate) tier: PriorityTier,
    pub(crate) span_seconds: f64,
    pub(crate) density: OnceSlot<NutrientTensor, EvaluationError>,
}

impl Node {
    /// External identity.
    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// Name and unit.
    pub fn spec(&self) -> &NodeSpec {
        &self.spec
    }

    /// Description of the food.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Everyday unit of the food.
    #[must_use]
    pub fn unit(&self) -> &str {
        &self.spec.unit
    }

    /// Mass represented within each parent, or the serving size of a root.
    #[must_use]
    pub fn quantity_in_grams(&self) -> f64 {
        self.quantity_in_grams
    }

    /// Whether the density is loader-supplied rather than derived.
    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Number of constituents.
    #[must_use]
    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    /// Number of parents referencing this node. Greater than one for shared
    /// sub-ingredients.
    #[must_use]
    pub fn parent_count(&self) -> usize {
        self.parents_total as usize
    }

    /// Concurrency class of this node's aggregation step.
    pub fn tier(&self) -> PriorityTier {
        self.tier
    }

    /// Advisory self-cost in seconds.
    #[must_use]
    pub fn span_seconds(&self) -> f64 {
        self.span_seconds
    }

    /// Advisory self-cost, or `None` if the span does not fit a [`Duration`].
    #[must_use]
    pub fn span(&self) -> Option<Duration> {
        Duration::try_from_secs_f64(self.span_seconds).ok()
    }

    /// Density per 100 g if it is available without computation.
    #[must_use]
    pub fn density(&self) -> Option<&NutrientTensor> {
        self.density.get()
    }
}
