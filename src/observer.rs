use crate::{node::Node, system::EvaluationError, tensor::NutrientTensor};
use std::sync::Arc;

/// Hooks around a node's own aggregation step.
///
/// Both methods run while the step holds its scheduler permit, so they see
/// exactly the concurrency the tier allows. They must not evaluate other
/// nodes of the same system.
pub trait Observer: Send + Sync {
    /// The node was admitted and is about to aggregate its children.
    fn aggregation_started(&self, node: &Node) {
        let _ = node;
    }

    /// The node finished aggregating; on success the tensor is about to be
    /// cached.
    fn aggregation_finished(
        &self,
        node: &Node,
        outcome: Result<&NutrientTensor, &EvaluationError>,
    ) {
        let _ = (node, outcome);
    }
}

impl Observer for () {}

impl<O: Observer + ?Sized> Observer for Arc<O> {
    fn aggregation_started(&self, node: &Node) {
        (**self).aggregation_started(node);
    }

    fn aggregation_finished(
        &self,
        node: &Node,
        outcome: Result<&NutrientTensor, &EvaluationError>,
    ) {
        (**self).aggregation_finished(node, outcome);
    }
}
