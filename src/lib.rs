//! Lazily evaluated nutrient composition over a shared food hierarchy.
//!
//! Foods are built from ingredients, which are built from sub-ingredients.
//! Each is a node of a directed acyclic graph carrying a mass in grams; leaves
//! carry a nutrient density per 100 g supplied by a data loader, and every
//! other node's density is the mass-weighted average of its children's. This
//! crate:
//! - Builds an arena of nodes in topological order and rejects cycles,
//!   dangling references, dimension mismatches and mass-conservation
//!   violations at construction time.
//! - Computes densities on demand and caches each one exactly once. Concurrent
//!   requests for the same node coalesce into a single computation; cache hits
//!   are a lock-free read.
//! - Admits each node's own aggregation step through a three-tier gate:
//!   background steps share, foreground steps are exclusive among themselves,
//!   exclusive steps run alone.
//!
//! Key modules:
//! - `loader`: the `DataLoader` boundary and its `Topology` output.
//! - `graph`: construction, validation and traversal.
//! - `system`: the query interface (`evaluate`, `total_nutrients`, batches).
//! - `scheduler`: the tiered admission gate and span-based batch planning.
//!
//! Quick start:
//! 1. Build a `NutrientHeader` and a `Topology` of `NodeRecord`s (or
//!    implement `DataLoader`).
//! 2. Call `Graph::construct` with a `Config`, wrap the graph in a `System`.
//! 3. Call `System::evaluate` from as many threads as needed.
//!
//! ```
//! use ncg::{
//!     config::Config,
//!     graph::Graph,
//!     loader::{NodeRecord, Topology},
//!     system::System,
//!     tensor::NutrientHeader,
//! };
//!
//! let header = NutrientHeader::new(["calories", "protein"])?;
//! let mut topology = Topology::new(header);
//! topology
//!     .insert("broth", NodeRecord::leaf("Chicken broth", "cup", 250.0, [5.0, 0.3]))?
//!     .insert("meat", NodeRecord::leaf("Chicken meat", "oz", 50.0, [165.0, 31.0]))?
//!     .insert("soup", NodeRecord::composite("Chicken soup", "bowl", 300.0, ["broth", "meat"]))?;
//!
//! let system = System::new(Graph::construct(topology, &Config::default())?);
//! let total = system.total_nutrients("soup")?;
//! assert!((total[0] - 95.0).abs() < 1e-9);
//! assert!((total[1] - 16.25).abs() < 1e-9);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

/// Graph construction settings (mass-conservation tolerance and mode).
pub mod config;
/// The node arena.
///
/// Construction (validation, topological ordering, cycle detection, cost
/// estimates and fingerprints) and read-only traversal.
pub mod graph;
/// Boundary with the data loader that parses survey tables.
pub mod loader;
/// Nodes and their write-once density cache.
pub mod node;
/// Hooks invoked around aggregation steps.
pub mod observer;
/// Three-tier admission gate for aggregation steps.
pub mod scheduler;
mod slot;
mod sync;
/// Query interface: lazy, memoized, concurrent evaluation.
pub mod system;
/// Nutrient tensors and the nutrient code header.
pub mod tensor;
/// Identities, tiers and hashing aliases.
pub mod types;
