use crate::{
    graph::UnknownNodeError,
    node::Node,
    observer::Observer,
    system::System,
    tensor::NutrientTensor,
    types::{HashSet, NodeId, NodeIndex},
};
use thiserror::Error;

/// Failure of a single query.
///
/// Scoped to the request: the shared cache is left empty for the failing node
/// and its ancestors, so a later request retries from scratch.
#[derive(Debug, Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum EvaluationError {
    /// The requested identity is not in the graph.
    #[error(transparent)]
    UnknownNode(#[from] UnknownNodeError),
    /// A composite reached aggregation without constituents.
    #[error("composite {node} has no children")]
    EmptyChildSet {
        /// Offending composite.
        node: NodeId,
    },
    /// The children of a composite weigh nothing in total.
    #[error("children of {node} have zero total mass")]
    TotalMassZero {
        /// Offending composite.
        node: NodeId,
    },
}

impl<O: Observer> System<O> {
    /// Density of the node at `idx`, computing and caching it if needed.
    ///
    /// Uncached descendants are claimed children first from an explicit work
    /// list, so call depth does not grow with the depth of the graph.
    /// Concurrent calls for the same uncached node coalesce on the node's slot:
    /// one caller aggregates, the others sleep until it publishes or fails.
    pub(crate) fn resolve(&self, idx: NodeIndex) -> Result<&NutrientTensor, EvaluationError> {
        let node = self.graph.at(idx);
        if let Some(density) = node.density() {
            return Ok(density);
        }
        for pending in self.uncached_below(idx) {
            let node = self.graph.at(pending);
            node.density.get_or_try_init(|| self.aggregate(node))?;
        }
        Ok(node.density().expect("System::resolve: [1]"))
    }

    /// Uncached nodes reachable from `root` through uncached nodes, in
    /// post-order: every node comes after its uncached children, `root` last.
    fn uncached_below(&self, root: NodeIndex) -> Vec<NodeIndex> {
        let mut order = Vec::new();
        let mut visited = HashSet::default();
        let mut stack = vec![(root, false)];
        while let Some((idx, expanded)) = stack.pop() {
            if expanded {
                order.push(idx);
                continue;
            }
            if !visited.insert(idx) {
                continue;
            }
            stack.push((idx, true));
            for &child in self.graph.at(idx).children.iter().rev() {
                if self.graph.at(child).density().is_none() && !visited.contains(&child) {
                    stack.push((child, false));
                }
            }
        }
        order
    }

    /// Collect the children's densities, then run this node's own step under
    /// its tier's permit. The permit is taken only after the children are
    /// resolved.
    fn aggregate(&self, node: &Node) -> Result<NutrientTensor, EvaluationError> {
        let mut weighted = Vec::with_capacity(node.children.len());
        for &child in &node.children {
            // Normally a cache hit: `resolve` settles children first.
            let density = self.resolve(child)?;
            weighted.push((self.graph.at(child).quantity_in_grams, density));
        }

        let _permit = self.scheduler.admit(node.tier);
        self.observer.aggregation_started(node);
        let outcome = weighted_average(node, &weighted, self.graph.header().dimension());
        self.observer.aggregation_finished(node, outcome.as_ref());
        match &outcome {
            Ok(_) => log::debug!(
                "computed density of {} ({}) from {} children",
                node.id,
                node.spec.name,
                weighted.len()
            ),
            Err(err) => log::debug!("evaluation of {} failed: {err}", node.id),
        }
        outcome
    }
}

/// `Σ mᵢ·dᵢ / Σ mᵢ`, elementwise.
fn weighted_average(
    node: &Node,
    children: &[(f64, &NutrientTensor)],
    dimension: usize,
) -> Result<NutrientTensor, EvaluationError> {
    if children.is_empty() {
        return Err(EvaluationError::EmptyChildSet {
            node: node.id.clone(),
        });
    }
    let total_mass: f64 = children.iter().map(|&(mass, _)| mass).sum();
    if total_mass == 0.0 {
        return Err(EvaluationError::TotalMassZero {
            node: node.id.clone(),
        });
    }
    let mut density = NutrientTensor::zeros(dimension);
    for &(mass, child) in children {
        density.accumulate_weighted(mass, child);
    }
    density.scale_in_place(total_mass.recip());
    Ok(density)
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use crate::{node::NodeSpec, slot::OnceSlot, types::PriorityTier};

    fn composite(children: usize) -> Node {
        Node {
            id: "soup".into(),
            spec: NodeSpec {
                name: "Soup".to_owned(),
                unit: "bowl".to_owned(),
            },
            quantity_in_grams: 300.0,
            children: (0..children as NodeIndex).collect(),
            parents_total: 0,
            tier: PriorityTier::Background,
            span_seconds: 0.0,
            density: OnceSlot::empty(),
        }
    }

    #[test]
    fn empty_child_set_is_rejected() {
        let err = weighted_average(&composite(0), &[], 2).unwrap_err();
        assert_eq!(err, EvaluationError::EmptyChildSet { node: "soup".into() });
    }

    #[test]
    fn zero_total_mass_is_rejected() {
        let broth = NutrientTensor::from([5.0, 0.3]);
        let err = weighted_average(&composite(1), &[(0.0, &broth)], 2).unwrap_err();
        assert_eq!(err, EvaluationError::TotalMassZero { node: "soup".into() });
    }

    #[test]
    fn average_is_weighted_by_mass() {
        let broth = NutrientTensor::from([5.0, 0.3]);
        let meat = NutrientTensor::from([165.0, 31.0]);
        let density =
            weighted_average(&composite(2), &[(250.0, &broth), (50.0, &meat)], 2).unwrap();
        assert!((density[0] - 95.0 / 3.0).abs() < 1e-9);
        assert!((density[1] - 16.25 / 3.0).abs() < 1e-9);
    }
}
