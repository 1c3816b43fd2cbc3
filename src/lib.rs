//! # shardr
//!
//! **Distributed MoE training coordination — process-group mesh, gradient
//! routing, ZeRO-style sharded optimizer.**
//!
//! shardr coordinates the workers of a mixture-of-experts training job. It
//! owns no forward/backward math: models are consumed through a parameter
//! registry interface, and collectives go through a pluggable transport.
//!
//! ## Layers
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  cluster::topology   MoE hybrid layout, group wiring          │
//! ├──────────────────────────────────────────────────────────────┤
//! │  optimizer           sharded AdamW, buckets, loss scale, clip │
//! │  partition           expert/regular gradient routing          │
//! │  checkpoint          per-(group, param) shard payloads        │
//! ├──────────────────────────────────────────────────────────────┤
//! │  cluster::mesh       N-d rank ↔ coordinate, group derivation  │
//! │  comm                GroupComm collectives over a transport   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design
//!
//! - **Deterministic topology**: every group is a pure function of rank and
//!   config; workers agree without negotiation
//! - **Two reduction lanes**: regular parameters reduce over the
//!   data-parallel group, expert parameters over the expert-data-parallel
//!   group, under one optimizer
//! - **Overlap by contract**: asynchronous bucket reduction requires the
//!   caller to acknowledge that every group member must reduce every step
//! - **Globally consistent skip**: the overflow verdict is combined over the
//!   whole worker set, so all workers apply or skip a step together

pub mod checkpoint;
pub mod cluster;
pub mod comm;
pub mod error;
pub mod model;
pub mod optimizer;
pub mod partition;

pub use checkpoint::CheckpointGroups;
pub use cluster::{ClusterContext, CommGroup, MoeHybridTopology, ProcessGroupMesh, TopologyConfig};
pub use comm::{local::LocalTransport, CollectiveTransport, GroupComm, NoopComm, ReduceOp};
pub use error::{Error, Result};
pub use model::{HybridModel, ParamDescriptor, ParamId, ParamKind};
pub use optimizer::{
    AdamWConfig, ShardedZeroOptimizer, StepOutcome, ZeroOptimizerConfig,
};
pub use partition::{assign, GroupRole, Partition};
