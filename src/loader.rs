use crate::{
    graph::GraphSetupError,
    tensor::{NutrientHeader, NutrientTensor},
    types::{IndexMap, NodeId},
};
use core::{error::Error, fmt::Debug};
use thiserror::Error;

/// Source of graph topology, e.g. a parser over survey food, ingredient,
/// portion and nutrient tables.
///
/// The loader resolves every raw table into fully-formed leaf tensors and
/// child references; the graph never sees raw tabular data.
pub trait DataLoader {
    /// Loader-specific failure.
    type Error: Error + Send + Sync + 'static;

    /// Produce the flat topology of every node the graph should contain.
    fn load(&self) -> Result<Topology, Self::Error>;
}

/// Failure of [`crate::system::System::load`].
#[derive(Debug, Error)]
pub enum LoadError<E: Error + 'static> {
    /// The loader itself failed.
    #[error("data loader failed")]
    Loader(#[source] E),
    /// The loaded topology is not a valid graph.
    #[error(transparent)]
    Setup(#[from] GraphSetupError),
}

/// One node as delivered by a data loader.
///
/// Tiers are raw integers here and validated at graph construction.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeRecord {
    /// Descriptive name, e.g. the survey's main food description.
    pub name: String,
    /// Everyday unit of the food, e.g. `cup` or `oz`.
    pub unit: String,
    /// Mass this node contributes to each parent, or the serving size of a root.
    pub quantity_in_grams: f64,
    /// Concurrency class, one of `0`, `1` or `2`.
    pub priority_tier: u8,
    /// Advisory self-cost of the node's own aggregation step.
    pub span_seconds: f64,
    /// Ordered constituents. Empty for leaves.
    pub children: Vec<NodeId>,
    /// Density per 100 g; required for leaves, forbidden otherwise.
    pub leaf_density: Option<NutrientTensor>,
}

impl NodeRecord {
    /// A leaf with a loader-supplied density, tier 0 and zero span.
    pub fn leaf(
        name: impl Into<String>,
        unit: impl Into<String>,
        quantity_in_grams: f64,
        density: impl Into<NutrientTensor>,
    ) -> Self {
        Self {
            name: name.into(),
            unit: unit.into(),
            quantity_in_grams,
            priority_tier: 0,
            span_seconds: 0.0,
            children: Vec::new(),
            leaf_density: Some(density.into()),
        }
    }

    /// A composite whose density is derived from `children`; tier 0, zero span.
    pub fn composite<I, C>(
        name: impl Into<String>,
        unit: impl Into<String>,
        quantity_in_grams: f64,
        children: I,
    ) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<NodeId>,
    {
        Self {
            name: name.into(),
            unit: unit.into(),
            quantity_in_grams,
            priority_tier: 0,
            span_seconds: 0.0,
            children: children.into_iter().map(Into::into).collect(),
            leaf_density: None,
        }
    }

    /// Override the raw priority tier.
    #[must_use]
    pub fn with_tier(mut self, tier: u8) -> Self {
        self.priority_tier = tier;
        self
    }

    /// Override the span estimate.
    #[must_use]
    pub fn with_span(mut self, span_seconds: f64) -> Self {
        self.span_seconds = span_seconds;
        self
    }
}

/// Flat loader output: the nutrient header plus one record per node.
///
/// Record order is irrelevant; construction sorts topologically.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    header: NutrientHeader,
    records: IndexMap<NodeId, NodeRecord>,
}

impl Topology {
    /// Empty topology over `header`.
    #[must_use]
    pub fn new(header: NutrientHeader) -> Self {
        Self {
            header,
            records: IndexMap::default(),
        }
    }

    /// Add a node.
    ///
    /// # Errors
    /// If `id` was already added.
    pub fn insert(
        &mut self,
        id: impl Into<NodeId>,
        record: NodeRecord,
    ) -> Result<&mut Self, GraphSetupError> {
        let id = id.into();
        if self.records.contains_key(&id) {
            return Err(GraphSetupError::DuplicateNode { node: id });
        }
        self.records.insert(id, record);
        Ok(self)
    }

    /// The nutrient header shared by every tensor.
    #[must_use]
    pub fn header(&self) -> &NutrientHeader {
        &self.header
    }

    /// Records in insertion order.
    #[must_use]
    pub fn records(&self) -> &IndexMap<NodeId, NodeRecord> {
        &self.records
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no record was added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub(crate) fn into_parts(self) -> (NutrientHeader, IndexMap<NodeId, NodeRecord>) {
        (self.header, self.records)
    }
}

impl DataLoader for Topology {
    type Error = core::convert::Infallible;

    fn load(&self) -> Result<Topology, Self::Error> {
        Ok(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_ids_are_rejected() {
        let header = NutrientHeader::new(["calories"]).unwrap();
        let mut topology = Topology::new(header);
        topology
            .insert("broth", NodeRecord::leaf("Broth", "cup", 250.0, [5.0]))
            .unwrap();
        let err = topology
            .insert("broth", NodeRecord::leaf("Broth", "cup", 250.0, [5.0]))
            .unwrap_err();
        assert_eq!(err, GraphSetupError::DuplicateNode { node: "broth".into() });
        assert_eq!(topology.len(), 1);
    }

    #[test]
    fn record_builders_set_scheduling_fields() {
        let record = NodeRecord::composite("Soup", "bowl", 300.0, ["broth", "meat"])
            .with_tier(2)
            .with_span(0.5);
        assert_eq!(record.priority_tier, 2);
        assert_eq!(record.span_seconds, 0.5);
        assert_eq!(record.children, vec![NodeId::from("broth"), NodeId::from("meat")]);
        assert!(record.leaf_density.is_none());
    }
}
