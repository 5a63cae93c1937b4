use crate::{
    config::{Config, MassCheck},
    graph::{CostEstimate, Graph},
    loader::{NodeRecord, Topology},
    node::{Node, NodeSpec},
    slot::OnceSlot,
    types::{HashSet, IndexMap, IndexSet, NodeId, NodeIndex, PriorityTier},
};
use core::hash::{Hash, Hasher};
use rustc_hash::{FxBuildHasher, FxHasher};
use std::collections::VecDeque;
use thiserror::Error;
use unzip3::Unzip3;

/// Reasons a loaded topology cannot become a [`Graph`].
///
/// Construction is all-or-nothing: on any of these no graph is produced.
#[derive(Debug, Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum GraphSetupError {
    /// Some nodes can reach themselves through their children. Lists every
    /// node that could not be ordered: cycle members and everything above them.
    #[error("graph contains cycle(s) through {nodes:?}")]
    CyclicGraph {
        /// Unresolved nodes, in loader order.
        nodes: Vec<NodeId>,
    },
    /// A leaf density does not have one slot per header nutrient.
    #[error("density of {node} has {actual} nutrients, header has {expected}")]
    DimensionMismatch {
        /// Offending leaf.
        node: NodeId,
        /// Header dimension.
        expected: usize,
        /// Tensor dimension.
        actual: usize,
    },
    /// Children's masses do not add up to the parent's declared mass.
    #[error(
        "children of {node} weigh {children_total} g, declared {declared} g (tolerance {tolerance})"
    )]
    MassMismatch {
        /// Offending composite.
        node: NodeId,
        /// Parent's own quantity.
        declared: f64,
        /// Sum of the children's quantities.
        children_total: f64,
        /// Relative tolerance in effect.
        tolerance: f64,
    },
    /// A node without children came without a density.
    #[error("leaf {node} has no nutrient density")]
    MissingLeafDensity {
        /// Offending leaf.
        node: NodeId,
    },
    /// A node with children came with a density; composites are always derived.
    #[error("composite {node} must not carry a nutrient density")]
    UnexpectedDensity {
        /// Offending composite.
        node: NodeId,
    },
    /// A child reference names no node of the topology.
    #[error("{node} references unknown child {child}")]
    UnknownChild {
        /// Referencing node.
        node: NodeId,
        /// Missing child.
        child: NodeId,
    },
    /// A child is listed twice by the same parent.
    #[error("{node} lists child {child} more than once")]
    DuplicateChild {
        /// Referencing node.
        node: NodeId,
        /// Repeated child.
        child: NodeId,
    },
    /// Two records share an identity.
    #[error("node {node} is defined more than once")]
    DuplicateNode {
        /// Repeated identity.
        node: NodeId,
    },
    /// Quantity is negative or not finite.
    #[error("{node} has invalid quantity {quantity} g")]
    InvalidQuantity {
        /// Offending node.
        node: NodeId,
        /// Supplied quantity.
        quantity: f64,
    },
    /// Span is negative or not finite.
    #[error("{node} has invalid span {span} s")]
    InvalidSpan {
        /// Offending node.
        node: NodeId,
        /// Supplied span.
        span: f64,
    },
    /// Tier outside `0..=2`.
    #[error("{node} has invalid priority tier {tier}")]
    InvalidTier {
        /// Offending node.
        node: NodeId,
        /// Supplied tier.
        tier: u8,
    },
    /// A leaf density holds NaN or an infinity.
    #[error("density of {node} is not finite at nutrient #{index}")]
    NonFiniteDensity {
        /// Offending leaf.
        node: NodeId,
        /// Position of the first bad value.
        index: usize,
    },
}

struct NodeSetupLayout<'a> {
    node_idx: NodeIndex,
    tier: PriorityTier,
    cost: CostEstimate,
    fingerprint: u64,
    parents: Option<&'a IndexSet<NodeId>>,
}

impl Graph {
    /// Build a graph from loader output by:
    /// - validating every record on its own (ranges, tier, leaf/composite
    ///   population, tensor dimension, child references),
    /// - seeding the topological order with the leaves,
    /// - Kahn-like processing towards the top-level foods with progress-based
    ///   cycle detection, deriving depth, critical path and fingerprint
    ///   on the way,
    /// - checking mass conservation of every composite,
    /// - materialising the arena in topological order.
    ///
    /// # Panics
    /// In case of internal invariant violations, or more than `u32::MAX` nodes.
    ///
    /// # Errors
    /// Any [`GraphSetupError`]; no partially valid graph is ever returned.
    #[allow(clippy::too_many_lines)]
    pub fn construct(topology: Topology, config: &Config) -> Result<Self, GraphSetupError> {
        // Example:
        //
        //   broth   meat
        //      \    /
        //       soup      rice
        //          \      /
        //           dinner
        //
        // - Leaves: broth, meat, rice => first in the arena, depth 0.
        // - soup depends on broth and meat => depth 1.
        // - dinner depends on soup and rice => depth 1 + max(1, 0) = 2.
        // - Arena order: broth, meat, rice, soup, dinner.
        let (header, mut records) = topology.into_parts();

        // Phase 1: validate records and build the reverse adjacency.
        // parents_of: NodeId(child) -> set of NodeId(parent) listing it.
        let max_cap = records.len().saturating_sub(1);
        let mut parents_of: IndexMap<NodeId, IndexSet<NodeId>> =
            IndexMap::with_capacity_and_hasher(max_cap, FxBuildHasher);
        let mut tiers = Vec::with_capacity(records.len());
        for (id, record) in &records {
            tiers.push(validate_record(id, record, &records, &header)?);
            for child in &record.children {
                parents_of.entry(child.clone()).or_default().insert(id.clone());
            }
        }

        // Phase 2: seed the order with leaves. They have no dependencies, get
        // consecutive indexes from 0 and depth 0.
        let mut node_info_map: IndexMap<NodeId, NodeSetupLayout<'_>> = records
            .iter()
            .zip(&tiers)
            .filter(|((_, record), _)| record.children.is_empty())
            .enumerate()
            .map(|(idx, ((id, record), &tier))| {
                (
                    id.clone(),
                    NodeSetupLayout {
                        node_idx: idx.try_into().expect("Graph::construct: [1]"),
                        tier,
                        cost: CostEstimate {
                            depth: 0,
                            critical_path: record.span_seconds,
                        },
                        fingerprint: fingerprint(record, core::iter::empty()),
                        parents: parents_of.get(id),
                    },
                )
            })
            .collect();

        // Without a single leaf every node sits on or above a cycle.
        if node_info_map.is_empty() && !records.is_empty() {
            return Err(GraphSetupError::CyclicGraph {
                nodes: records.keys().cloned().collect(),
            });
        }

        let num_leaves = node_info_map.len().try_into().expect("Graph::construct: [2]");

        // Phase 3: worklist of composites that might have all children placed.
        let max_cap = records.len() - node_info_map.len();
        let mut pending_queue = VecDeque::with_capacity(max_cap);
        let mut pending_set = HashSet::with_capacity_and_hasher(max_cap, FxBuildHasher);
        for info in node_info_map.values() {
            let Some(parents) = info.parents else {
                continue;
            };
            for parent_id in parents {
                if pending_set.insert(parent_id) {
                    pending_queue.push_back(parent_id);
                }
            }
        }

        // Phase 4: Kahn-like processing with progress detection.
        // A popped composite whose children are all placed gets the next index;
        // otherwise it is dropped and will be re-enqueued once a missing child
        // is placed. No placement within as many iterations as the queue held
        // at the last placement means the remainder is cyclic.
        let mut last_progress_iter = 0usize;
        let mut last_progress_queue_len = pending_queue.len();
        let mut iter = 0usize;

        'process_pending: while let Some(node_id) = pending_queue.pop_front() {
            let removed = pending_set.remove(node_id);
            assert!(removed, "Graph::construct: [3]");
            if iter
                .checked_sub(last_progress_iter)
                .expect("Graph::construct: [4]")
                >= last_progress_queue_len
            {
                break;
            }
            iter = iter.checked_add(1).expect("Graph::construct: [5]");
            let (record_idx, _, record) = records
                .get_full(node_id)
                .expect("Graph::construct: [6]");
            let mut depth = 1;
            let mut longest_child_path = 0.0f64;
            let mut child_fingerprints = Vec::with_capacity(record.children.len());
            for child_id in &record.children {
                let Some(child_info) = node_info_map.get(child_id) else {
                    continue 'process_pending;
                };
                depth = depth.max(
                    child_info
                        .cost
                        .depth
                        .checked_add(1)
                        .expect("Graph::construct: [7]"),
                );
                longest_child_path = longest_child_path.max(child_info.cost.critical_path);
                child_fingerprints.push(child_info.fingerprint);
            }
            let layout = NodeSetupLayout {
                node_idx: node_info_map
                    .len()
                    .try_into()
                    .expect("Graph::construct: [8]"),
                tier: tiers[record_idx],
                cost: CostEstimate {
                    depth,
                    critical_path: record.span_seconds + longest_child_path,
                },
                fingerprint: fingerprint(record, child_fingerprints.into_iter()),
                parents: parents_of.get(node_id),
            };
            let inserted_new = node_info_map.insert(node_id.clone(), layout).is_none();
            assert!(inserted_new, "Graph::construct: [9]");

            if let Some(parents) = parents_of.get(node_id) {
                for parent_id in parents {
                    if pending_set.insert(parent_id) {
                        pending_queue.push_back(parent_id);
                    }
                }
            }
            last_progress_iter = iter;
            last_progress_queue_len = pending_queue.len();
        }
        drop(pending_queue);
        drop(pending_set);

        if node_info_map.len() != records.len() {
            return Err(GraphSetupError::CyclicGraph {
                nodes: records
                    .keys()
                    .filter(|id| !node_info_map.contains_key(*id))
                    .cloned()
                    .collect(),
            });
        }

        // Phase 5: mass conservation, in topological order.
        for id in node_info_map.keys() {
            let record = &records[id];
            if record.children.is_empty() {
                continue;
            }
            let children_total: f64 = record
                .children
                .iter()
                .map(|child| records[child].quantity_in_grams)
                .sum();
            if config.mass_conserved(record.quantity_in_grams, children_total) {
                continue;
            }
            match config.check_mode() {
                MassCheck::Strict => {
                    return Err(GraphSetupError::MassMismatch {
                        node: id.clone(),
                        declared: record.quantity_in_grams,
                        children_total,
                        tolerance: config.tolerance(),
                    });
                }
                MassCheck::Warn => log::warn!(
                    "children of {id} weigh {children_total} g, declared {} g; \
                     aggregating by children's masses",
                    record.quantity_in_grams,
                ),
            }
        }

        // Phase 6: materialise nodes, estimates and fingerprints in
        // topological order.
        let (nodes, costs, fingerprints): (Vec<_>, Vec<_>, Vec<_>) = node_info_map
            .iter()
            .enumerate()
            .map(|(idx, (node_id, info))| {
                let &NodeSetupLayout {
                    node_idx,
                    tier,
                    cost,
                    fingerprint,
                    parents,
                } = info;
                assert_eq!(idx, node_idx as usize, "Graph::construct: [10]");
                let NodeRecord {
                    name,
                    unit,
                    quantity_in_grams,
                    priority_tier: _,
                    span_seconds,
                    children,
                    leaf_density,
                } = records
                    .swap_remove(node_id)
                    .expect("Graph::construct: [11]");
                let children = children
                    .iter()
                    .map(|child| node_info_map[child].node_idx)
                    .collect();
                let density = match leaf_density {
                    Some(density) => OnceSlot::ready(density),
                    None => OnceSlot::empty(),
                };
                let node = Node {
                    id: node_id.clone(),
                    spec: NodeSpec { name, unit },
                    quantity_in_grams,
                    children,
                    parents_total: parents
                        .map_or(0, IndexSet::len)
                        .try_into()
                        .expect("Graph::construct: [12]"),
                    tier,
                    span_seconds,
                    density,
                };
                (node, cost, fingerprint)
            })
            .unzip3();

        assert!(records.is_empty(), "Graph::construct: [13]");
        drop(records);

        let graph = Self {
            header,
            nodes,
            costs,
            fingerprints,
            num_leaves,
            id_to_index: node_info_map
                .into_iter()
                .map(|(id, info)| (id, info.node_idx))
                .collect(),
        };
        assert_eq!(graph.nodes.len(), graph.costs.len(), "Graph::construct: [14]");
        assert_eq!(
            graph.nodes.len(),
            graph.id_to_index.len(),
            "Graph::construct: [15]"
        );
        log::info!(
            "nutrient graph: {} nodes ({} leaves, {} roots), max depth {}, {} nutrients",
            graph.len(),
            graph.leaves().len(),
            graph.roots().count(),
            graph.costs.iter().map(|cost| cost.depth).max().unwrap_or(0),
            graph.header.dimension(),
        );
        Ok(graph)
    }
}

fn validate_record(
    id: &NodeId,
    record: &NodeRecord,
    records: &IndexMap<NodeId, NodeRecord>,
    header: &crate::tensor::NutrientHeader,
) -> Result<PriorityTier, GraphSetupError> {
    let node = || id.clone();
    if !record.quantity_in_grams.is_finite() || record.quantity_in_grams < 0.0 {
        return Err(GraphSetupError::InvalidQuantity {
            node: node(),
            quantity: record.quantity_in_grams,
        });
    }
    if !record.span_seconds.is_finite() || record.span_seconds < 0.0 {
        return Err(GraphSetupError::InvalidSpan {
            node: node(),
            span: record.span_seconds,
        });
    }
    let tier = PriorityTier::from_raw(record.priority_tier).ok_or_else(|| {
        GraphSetupError::InvalidTier {
            node: node(),
            tier: record.priority_tier,
        }
    })?;

    match (&record.leaf_density, record.children.is_empty()) {
        (None, true) => return Err(GraphSetupError::MissingLeafDensity { node: node() }),
        (Some(_), false) => return Err(GraphSetupError::UnexpectedDensity { node: node() }),
        (Some(density), true) => {
            if density.dimension() != header.dimension() {
                return Err(GraphSetupError::DimensionMismatch {
                    node: node(),
                    expected: header.dimension(),
                    actual: density.dimension(),
                });
            }
            if let Some(index) = density.first_non_finite() {
                return Err(GraphSetupError::NonFiniteDensity {
                    node: node(),
                    index,
                });
            }
        }
        (None, false) => {}
    }

    let mut seen = HashSet::with_capacity_and_hasher(record.children.len(), FxBuildHasher);
    for child in &record.children {
        if child == id {
            return Err(GraphSetupError::CyclicGraph {
                nodes: vec![node()],
            });
        }
        if !records.contains_key(child) {
            return Err(GraphSetupError::UnknownChild {
                node: node(),
                child: child.clone(),
            });
        }
        if !seen.insert(child) {
            return Err(GraphSetupError::DuplicateChild {
                node: node(),
                child: child.clone(),
            });
        }
    }
    Ok(tier)
}

/// Hash of name, unit, mass, leaf density and ordered child fingerprints.
fn fingerprint(record: &NodeRecord, child_fingerprints: impl Iterator<Item = u64>) -> u64 {
    let mut hasher = FxHasher::default();
    record.name.hash(&mut hasher);
    record.unit.hash(&mut hasher);
    record.quantity_in_grams.to_bits().hash(&mut hasher);
    if let Some(density) = &record.leaf_density {
        for value in density.iter() {
            value.to_bits().hash(&mut hasher);
        }
    }
    for child in child_fingerprints {
        child.hash(&mut hasher);
    }
    hasher.finish()
}
