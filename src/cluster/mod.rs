//! Cluster topology: worker identity, the N-d process-group mesh, and the
//! MoE hybrid topology glue built on top of it.

pub mod context;
pub mod mesh;
pub mod topology;

pub use context::ClusterContext;
pub use mesh::{CommGroup, ProcessGroupMesh};
pub use topology::{MoeHybridTopology, TopologyConfig};
