use crate::sync::UnsafeCell;
use core::{borrow::Borrow, fmt};
use derive_more::{Deref, DerefMut, Display};
use indexmap::{IndexMap as _IndexMap, IndexSet as _IndexSet};
use rustc_hash::FxBuildHasher;
use std::{
    collections::{HashMap as _HashMap, HashSet as _HashSet},
    sync::Arc,
};

/// A minimal `UnsafeCell` wrapper that is `Sync` when `T: Send + Sync`.
///
/// Used for the write-once density slot: the single writer publishes through an
/// atomic state with `Release` ordering, readers only dereference after an
/// `Acquire` load observes the published state.
#[derive(Debug, Deref, DerefMut)]
#[repr(transparent)]
pub(crate) struct SyncUnsafeCell<T>(UnsafeCell<T>);

unsafe impl<T: Send + Sync> Sync for SyncUnsafeCell<T> {}

impl<T> SyncUnsafeCell<T> {
    pub(crate) fn new(val: T) -> Self {
        Self(UnsafeCell::new(val))
    }
}

/// External identity of a node, e.g. a survey food code or ingredient code.
///
/// Cheap to clone; borrows as `str` so maps keyed by `NodeId` can be queried
/// with plain string slices.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Display)]
#[display("{_0}")]
pub struct NodeId(Arc<str>);

impl NodeId {
    /// The identity as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl Borrow<str> for NodeId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.into())
    }
}

impl From<String> for NodeId {
    fn from(value: String) -> Self {
        Self(value.into())
    }
}

impl From<u32> for NodeId {
    /// Survey food and ingredient codes are numeric.
    fn from(code: u32) -> Self {
        Self(code.to_string().into())
    }
}

/// Concurrency class of a node's own aggregation step.
///
/// Granularity is per node: each node's aggregation is admitted separately,
/// never a whole top-level query.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Display)]
#[repr(u8)]
pub enum PriorityTier {
    /// Tier 0: shares the machine with any other tier-0 step and one tier-1 step.
    #[display("background")]
    Background = 0,
    /// Tier 1: at most one in flight, tier-0 work continues alongside.
    #[display("foreground")]
    Foreground = 1,
    /// Tier 2: nothing else may be in flight.
    #[display("exclusive")]
    Exclusive = 2,
}

impl PriorityTier {
    /// All tiers in ascending order.
    pub const ALL: [Self; 3] = [Self::Background, Self::Foreground, Self::Exclusive];

    /// Decode a raw tier as delivered by a data loader.
    #[must_use]
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Background),
            1 => Some(Self::Foreground),
            2 => Some(Self::Exclusive),
            _ => None,
        }
    }

    /// Position of the tier in per-tier tables.
    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Position of a node inside the graph arena. Arena order is topological,
/// leaves first.
pub(crate) type NodeIndex = u32;

pub(crate) type HashMap<K, V> = _HashMap<K, V, FxBuildHasher>;
pub(crate) type HashSet<T> = _HashSet<T, FxBuildHasher>;
/// `IndexMap` type with fast hasher.
pub type IndexMap<K, V> = _IndexMap<K, V, FxBuildHasher>;
/// `IndexSet` type with fast hasher.
pub type IndexSet<T> = _IndexSet<T, FxBuildHasher>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiers_decode_only_known_values() {
        assert_eq!(PriorityTier::from_raw(0), Some(PriorityTier::Background));
        assert_eq!(PriorityTier::from_raw(1), Some(PriorityTier::Foreground));
        assert_eq!(PriorityTier::from_raw(2), Some(PriorityTier::Exclusive));
        assert_eq!(PriorityTier::from_raw(3), None);
        assert_eq!(PriorityTier::Exclusive.index(), 2);
    }

    #[test]
    fn node_id_borrows_as_str() {
        let mut map: HashMap<NodeId, u8> = HashMap::default();
        map.insert(NodeId::from("ChickenSoup"), 1);
        map.insert(NodeId::from(11_111_000u32), 2);
        assert_eq!(map.get("ChickenSoup"), Some(&1));
        assert_eq!(map.get("11111000"), Some(&2));
        assert_eq!(NodeId::from("x").to_string(), "x");
        assert_eq!(format!("{:?}", NodeId::from("x")), "\"x\"");
    }
}
