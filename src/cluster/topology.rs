//! MoE hybrid topology
//!
//! Derives every communication group of a mixed-parallelism MoE job from
//! four axis sizes and wires the sharded optimizer to them. Two meshes are
//! built over the same worker set: the outer (dp, pp, tp) mesh for regular
//! parameters and the (moe-dp, ep, moe-tp) mesh for expert parameters, with
//! `dp = world / (tp * pp)` and `moe_dp = world / (ep * moe_tp)`. Both
//! derivations are pure functions of rank and config, so workers agree on
//! every group without negotiation.

use std::sync::Arc;

use crate::checkpoint::CheckpointGroups;
use crate::cluster::{ClusterContext, CommGroup, ProcessGroupMesh};
use crate::comm::{CollectiveTransport, GroupComm};
use crate::error::{Error, Result};
use crate::model::HybridModel;
use crate::optimizer::{AdamWConfig, ShardedZeroOptimizer, ZeroOptimizerConfig};

const DP_AXIS: usize = 0;
const PP_AXIS: usize = 1;
const TP_AXIS: usize = 2;

const MOE_DP_AXIS: usize = 0;
const EP_AXIS: usize = 1;
const MOE_TP_AXIS: usize = 2;

/// Parallelism layout plus the optimizer configuration it carries.
#[derive(Debug, Clone)]
pub struct TopologyConfig {
    pub tp_size: usize,
    pub pp_size: usize,
    pub ep_size: usize,
    /// Tensor parallelism inside an expert. Only 1 is supported.
    pub moe_tp_size: usize,
    /// When off with dp > 1 and no pipeline, the job runs DDP-style and
    /// must tolerate parameters that receive no gradient.
    pub use_zero: bool,
    pub zero: ZeroOptimizerConfig,
    pub adamw: AdamWConfig,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            tp_size: 1,
            pp_size: 1,
            ep_size: 1,
            moe_tp_size: 1,
            use_zero: true,
            zero: ZeroOptimizerConfig::default(),
            adamw: AdamWConfig::default(),
        }
    }
}

impl TopologyConfig {
    pub fn with_tp_size(mut self, tp_size: usize) -> Self {
        self.tp_size = tp_size;
        self
    }

    pub fn with_pp_size(mut self, pp_size: usize) -> Self {
        self.pp_size = pp_size;
        self
    }

    pub fn with_ep_size(mut self, ep_size: usize) -> Self {
        self.ep_size = ep_size;
        self
    }

    pub fn with_zero(mut self, zero: ZeroOptimizerConfig) -> Self {
        self.zero = zero;
        self
    }

    pub fn with_adamw(mut self, adamw: AdamWConfig) -> Self {
        self.adamw = adamw;
        self
    }
}

/// All communication groups of one worker in a hybrid MoE job, with the
/// gradient-reduction groups already bound to live channels.
pub struct MoeHybridTopology {
    ctx: ClusterContext,
    config: TopologyConfig,
    dp_size: usize,
    moe_dp_size: usize,
    dp_group: CommGroup,
    pp_group: CommGroup,
    tp_group: CommGroup,
    moe_dp_group: CommGroup,
    ep_group: CommGroup,
    world_group: CommGroup,
    dp_comm: Arc<dyn GroupComm>,
    moe_dp_comm: Arc<dyn GroupComm>,
    world_comm: Arc<dyn GroupComm>,
    tolerate_unused_params: bool,
}

impl std::fmt::Debug for MoeHybridTopology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MoeHybridTopology")
            .field("dp_size", &self.dp_size)
            .field("moe_dp_size", &self.moe_dp_size)
            .finish_non_exhaustive()
    }
}

impl MoeHybridTopology {
    /// Derive both meshes from `config`, validate the layout, and bind the
    /// gradient-reduction groups through `transport`.
    pub fn new(
        ctx: ClusterContext,
        config: TopologyConfig,
        transport: &dyn CollectiveTransport,
    ) -> Result<Self> {
        if config.moe_tp_size != 1 {
            return Err(Error::config(format!(
                "expert tensor parallelism is not implemented, got moe_tp_size {}",
                config.moe_tp_size
            )));
        }
        let world = ctx.world_size();
        let outer_denom = config.tp_size * config.pp_size;
        if outer_denom == 0 || world % outer_denom != 0 {
            return Err(Error::config(format!(
                "world_size {world} is not divisible by tp_size {} * pp_size {}",
                config.tp_size, config.pp_size
            )));
        }
        let dp_size = world / outer_denom;
        let moe_denom = config.ep_size * config.moe_tp_size;
        if moe_denom == 0 || world % moe_denom != 0 {
            return Err(Error::config(format!(
                "world_size {world} is not divisible by ep_size {} * moe_tp_size {}",
                config.ep_size, config.moe_tp_size
            )));
        }
        let moe_dp_size = world / moe_denom;

        let outer = ProcessGroupMesh::new(ctx, &[dp_size, config.pp_size, config.tp_size])?;
        let moe = ProcessGroupMesh::new(ctx, &[moe_dp_size, config.ep_size, config.moe_tp_size])?;

        let dp_group = outer.group_along_axis(DP_AXIS)?;
        let pp_group = outer.group_along_axis(PP_AXIS)?;
        let tp_group = outer.group_along_axis(TP_AXIS)?;
        let moe_dp_group = moe.group_along_axis(MOE_DP_AXIS)?;
        let ep_group = moe.group_along_axis(EP_AXIS)?;
        let world_group = outer.world_group();

        let dp_comm = transport.bind(&dp_group, "dp")?;
        let moe_dp_comm = transport.bind(&moe_dp_group, "moe-dp")?;
        let world_comm = transport.bind(&world_group, "world")?;

        let tolerate_unused_params =
            !config.use_zero && dp_size > 1 && config.pp_size == 1;
        if tolerate_unused_params {
            log::warn!(
                "DDP-style layout (dp {dp_size}, no pipeline, no state sharding): \
                 unrouted experts leave parameters without gradients, which this \
                 layout must tolerate"
            );
        }
        log::debug!(
            "topology for rank {}/{world}: dp {dp_size}, pp {}, tp {}, \
             ep {}, moe-dp {moe_dp_size}",
            ctx.rank(),
            config.pp_size,
            config.tp_size,
            config.ep_size,
        );

        Ok(Self {
            ctx,
            config,
            dp_size,
            moe_dp_size,
            dp_group,
            pp_group,
            tp_group,
            moe_dp_group,
            ep_group,
            world_group,
            dp_comm,
            moe_dp_comm,
            world_comm,
            tolerate_unused_params,
        })
    }

    /// Build the sharded optimizer against `model`'s current parameter list
    /// and wire the model's master-refresh hook to it.
    ///
    /// With expert parallelism on, the local expert parameter set differs
    /// from the pre-sharding list the caller classified against, so the
    /// optimizer is rebuilt against the model as it stands now.
    pub fn configure(&self, model: &mut HybridModel) -> Result<ShardedZeroOptimizer> {
        let mut opt = ShardedZeroOptimizer::builder(self.config.zero.clone(), self.config.adamw.clone())
            .base(
                self.dp_comm.clone(),
                self.world_comm.clone(),
                self.config.pp_size > 1,
            )
            .with_expert_groups(self.moe_dp_comm.clone())
            .build(model)?;
        if self.config.ep_size > 1 {
            opt.reinitialize(model)?;
        }
        model.set_update_master_hook(opt.master_refresh_hook());
        Ok(opt)
    }

    /// The stable group handles the checkpoint coordinator addresses shards
    /// by.
    pub fn checkpoint_groups(&self) -> CheckpointGroups {
        CheckpointGroups {
            dp: self.dp_group.clone(),
            pp: self.pp_group.clone(),
            tp: self.tp_group.clone(),
            ep: self.ep_group.clone(),
            moe_dp: self.moe_dp_group.clone(),
        }
    }

    pub fn context(&self) -> ClusterContext {
        self.ctx
    }

    pub fn dp_size(&self) -> usize {
        self.dp_size
    }

    pub fn moe_dp_size(&self) -> usize {
        self.moe_dp_size
    }

    pub fn dp_group(&self) -> &CommGroup {
        &self.dp_group
    }

    pub fn pp_group(&self) -> &CommGroup {
        &self.pp_group
    }

    pub fn tp_group(&self) -> &CommGroup {
        &self.tp_group
    }

    pub fn moe_dp_group(&self) -> &CommGroup {
        &self.moe_dp_group
    }

    pub fn ep_group(&self) -> &CommGroup {
        &self.ep_group
    }

    pub fn world_group(&self) -> &CommGroup {
        &self.world_group
    }

    /// Whether this layout must tolerate parameters that received no
    /// gradient (DDP-style mode, advisory only).
    pub fn tolerate_unused_params(&self) -> bool {
        self.tolerate_unused_params
    }
}
