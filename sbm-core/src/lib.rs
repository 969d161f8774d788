//! Stochastic block model inference core.
//!
//! In-memory SBM state and the incremental update machinery that lets an
//! MCMC sampler explore partitions of a graph by evaluating the
//! description-length cost of moving one vertex at a time: a
//! block-contracted multigraph kept consistent with the assignment under
//! every move, virtual move deltas computed without materialising the
//! move, hierarchical stacking of states (nested SBM), real-valued edge
//! covariates and an overlapping (half-edge) variant.
//!
//! # References
//!
//! Peixoto (2014). "Efficient Monte Carlo and greedy heuristic for the
//! inference of stochastic block models." Phys. Rev. E 89, 012804.
//!
//! Peixoto (2017). "Nonparametric Bayesian inference of the
//! microcanonical stochastic block model." Phys. Rev. E 95, 012317.

/// Multigraph container with stable edge ids
pub mod graph;

/// Error kinds of the public operations
pub mod errors;

/// Index set with O(1) insert/erase/sample
pub mod idx_set;

/// Entropy terms and the `EntropyArgs` configuration
pub mod entropy;

/// Block-edge index (dense table / hash)
pub mod emat;

/// Move-delta accumulator
pub mod entries;

/// Partition / degree / edge-count description-length counters
pub mod partition_stats;

/// Per-block edge-endpoint sampler
pub mod egroups;

/// Edge covariates (weighted SBM)
pub mod recs;

/// The authoritative SBM state
pub mod block_state;

/// Half-edge bookkeeping for the overlapping variant
pub mod overlap_stats;

/// Overlapping SBM state
pub mod overlap_state;

/// Chain of coupled states (nested SBM)
pub mod hierarchy;

pub use block_state::{BlockState, StateOptions};
pub use entropy::{DegreeDlKind, EntropyArgs};
pub use errors::StateError;
pub use graph::Multigraph;
pub use hierarchy::{BaseState, Hierarchy};
pub use overlap_state::{OverlapBlockState, OverlapOptions};
