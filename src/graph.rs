mod setup;

/// Error returned by `Graph::construct` when the loaded topology is invalid.
pub use crate::graph::setup::GraphSetupError;
use crate::{
    node::Node,
    tensor::NutrientHeader,
    types::{HashMap, HashSet, IndexMap, NodeId, NodeIndex},
};
use derive_more::Debug;
use rustc_hash::FxBuildHasher;
use thiserror::Error;

/// Lookup of an identity the graph does not contain.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown node {0}")]
pub struct UnknownNodeError(pub NodeId);

/// Scheduling estimates derived from spans at construction time.
#[derive(Debug, Copy, Clone, PartialEq, Default)]
pub struct CostEstimate {
    /// Longest leaf-to-node path, in edges. Leaves have depth 0.
    pub depth: u32,
    /// Own span plus the largest critical path among the children, in seconds.
    pub critical_path: f64,
}

/// Immutable arena of nodes in topological order, leaves first.
///
/// Children are referenced by arena index only, so a sub-ingredient shared by
/// several foods is stored once and no node can point back at an ancestor.
/// Acyclicity is established once by `construct` and never re-checked.
#[must_use]
#[derive(Debug)]
pub struct Graph {
    header: NutrientHeader,
    /// Arena. A node's children always have smaller indices than the node.
    nodes: Vec<Node>,
    /// Per-node estimates, aligned with `nodes`.
    costs: Vec<CostEstimate>,
    /// Per-node structural hashes, aligned with `nodes`.
    #[debug(skip)]
    fingerprints: Vec<u64>,
    /// Leaves occupy `nodes[..num_leaves]`.
    num_leaves: NodeIndex,
    #[debug(skip)]
    id_to_index: HashMap<NodeId, NodeIndex>,
}

impl Graph {
    /// Nutrient code mapping shared by every tensor in the graph.
    pub fn header(&self) -> &NutrientHeader {
        &self.header
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Look a node up by identity.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Node> {
        self.index_of(id).map(|idx| self.at(idx))
    }

    /// Look a node up by identity.
    ///
    /// # Errors
    /// If the graph has no node `id`.
    pub fn node(&self, id: &str) -> Result<&Node, UnknownNodeError> {
        self.get(id).ok_or_else(|| UnknownNodeError(id.into()))
    }

    /// Every node in topological order: each node appears after all of its
    /// children.
    #[must_use]
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Nodes whose density is supplied by the loader.
    #[must_use]
    pub fn leaves(&self) -> &[Node] {
        &self.nodes[..self.num_leaves as usize]
    }

    /// Nodes whose density is derived, in topological order.
    #[must_use]
    pub fn composites(&self) -> &[Node] {
        &self.nodes[self.num_leaves as usize..]
    }

    /// Constituents of `node` in loader order.
    pub fn children<'a>(&'a self, node: &'a Node) -> impl ExactSizeIterator<Item = &'a Node> + 'a {
        node.children.iter().map(|&idx| self.at(idx))
    }

    /// Nodes that no other node references, i.e. the top-level foods.
    pub fn roots(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|node| node.parents_total == 0)
    }

    /// Members of `scope` that no other member of `scope` lists as a child.
    ///
    /// Duplicates in `scope` are ignored; the result keeps first-seen order.
    ///
    /// # Errors
    /// If a member of `scope` is not in the graph.
    pub fn roots_within<'s>(
        &self,
        scope: impl IntoIterator<Item = &'s str>,
    ) -> Result<Vec<&Node>, UnknownNodeError> {
        let mut members = Vec::new();
        let mut seen = HashSet::with_hasher(FxBuildHasher);
        for id in scope {
            let idx = self
                .index_of(id)
                .ok_or_else(|| UnknownNodeError(id.into()))?;
            if seen.insert(idx) {
                members.push(idx);
            }
        }
        let referenced: HashSet<NodeIndex> = members
            .iter()
            .flat_map(|&idx| self.at(idx).children.iter().copied())
            .filter(|child| seen.contains(child))
            .collect();
        Ok(members
            .into_iter()
            .filter(|idx| !referenced.contains(idx))
            .map(|idx| self.at(idx))
            .collect())
    }

    /// Nodes whose name equals `name`, in topological order.
    pub fn find_by_name<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Node> + 'a {
        self.nodes.iter().filter(move |node| node.spec.name == name)
    }

    /// `id` and every node reachable from it, each once, in topological order.
    ///
    /// # Errors
    /// If the graph has no node `id`.
    pub fn descendants(&self, id: &str) -> Result<Vec<&Node>, UnknownNodeError> {
        let reachable = self.reachable_from(self.index_or_err(id)?);
        Ok(self
            .nodes
            .iter()
            .zip(reachable)
            .filter_map(|(node, reached)| reached.then_some(node))
            .collect())
    }

    /// Depth and critical-path estimate of `id`.
    ///
    /// # Errors
    /// If the graph has no node `id`.
    pub fn cost(&self, id: &str) -> Result<CostEstimate, UnknownNodeError> {
        Ok(self.costs[self.index_or_err(id)? as usize])
    }

    /// Sum of spans of `id` and all its distinct descendants: the estimated
    /// cost of computing `id` from scratch on a single thread.
    ///
    /// # Errors
    /// If the graph has no node `id`.
    pub fn total_span(&self, id: &str) -> Result<f64, UnknownNodeError> {
        let reachable = self.reachable_from(self.index_or_err(id)?);
        Ok(self
            .nodes
            .iter()
            .zip(reachable)
            .filter(|(_, reached)| *reached)
            .map(|(node, _)| node.span_seconds)
            .sum())
    }

    /// Structural hash of `id` and everything below it. Equal for subgraphs
    /// with identical names, units, masses and leaf densities regardless of
    /// node identities.
    ///
    /// # Errors
    /// If the graph has no node `id`.
    pub fn fingerprint(&self, id: &str) -> Result<u64, UnknownNodeError> {
        Ok(self.fingerprints[self.index_or_err(id)? as usize])
    }

    /// Groups of two or more structurally identical nodes: equivalent
    /// subgraphs that a loader could merge. Fingerprints only bucket the
    /// candidates; members of a group are confirmed equal node by node.
    /// Groups follow topological order of their first member.
    #[must_use]
    pub fn equivalent_groups(&self) -> Vec<Vec<&Node>> {
        let mut buckets: IndexMap<u64, Vec<Vec<NodeIndex>>> = IndexMap::default();
        for (idx, &fingerprint) in (0..).zip(&self.fingerprints) {
            let classes = buckets.entry(fingerprint).or_default();
            match classes
                .iter_mut()
                .find(|class| self.structurally_equal(class[0], idx))
            {
                Some(class) => class.push(idx),
                None => classes.push(vec![idx]),
            }
        }
        let mut groups: Vec<Vec<NodeIndex>> = buckets
            .into_values()
            .flatten()
            .filter(|class| class.len() > 1)
            .collect();
        groups.sort_unstable_by_key(|class| class[0]);
        groups
            .into_iter()
            .map(|class| class.into_iter().map(|idx| self.at(idx)).collect())
            .collect()
    }

    /// Whether the subgraphs below `lhs` and `rhs` match in names, units,
    /// masses, leaf densities and child order.
    fn structurally_equal(&self, lhs: NodeIndex, rhs: NodeIndex) -> bool {
        let mut pending = vec![(lhs, rhs)];
        let mut checked = HashSet::default();
        while let Some((lhs, rhs)) = pending.pop() {
            if lhs == rhs || !checked.insert((lhs, rhs)) {
                continue;
            }
            let (a, b) = (self.at(lhs), self.at(rhs));
            let same_density = match (a.is_leaf(), b.is_leaf()) {
                (true, true) => match (a.density(), b.density()) {
                    (Some(a), Some(b)) => a
                        .iter()
                        .zip(b.iter())
                        .all(|(x, y)| x.to_bits() == y.to_bits()),
                    _ => false,
                },
                (false, false) => true,
                _ => false,
            };
            if !same_density
                || self.fingerprints[lhs as usize] != self.fingerprints[rhs as usize]
                || a.spec != b.spec
                || a.quantity_in_grams.to_bits() != b.quantity_in_grams.to_bits()
                || a.children.len() != b.children.len()
            {
                return false;
            }
            pending.extend(a.children.iter().copied().zip(b.children.iter().copied()));
        }
        true
    }

    #[inline]
    pub(crate) fn index_of(&self, id: &str) -> Option<NodeIndex> {
        self.id_to_index.get(id).copied()
    }

    fn index_or_err(&self, id: &str) -> Result<NodeIndex, UnknownNodeError> {
        self.index_of(id).ok_or_else(|| UnknownNodeError(id.into()))
    }

    #[inline]
    pub(crate) fn at(&self, idx: NodeIndex) -> &Node {
        &self.nodes[idx as usize]
    }

    #[inline]
    pub(crate) fn cost_at(&self, idx: NodeIndex) -> CostEstimate {
        self.costs[idx as usize]
    }

    /// Reachability mask over the arena. Children precede parents, so one
    /// descending sweep from `root` marks everything below it.
    fn reachable_from(&self, root: NodeIndex) -> Vec<bool> {
        let mut reached = vec![false; self.nodes.len()];
        reached[root as usize] = true;
        for idx in (0..=root as usize).rev() {
            if reached[idx] {
                for &child in &self.nodes[idx].children {
                    reached[child as usize] = true;
                }
            }
        }
        reached
    }
}
