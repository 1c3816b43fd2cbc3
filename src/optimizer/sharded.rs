//! ZeRO-style sharded optimizer over heterogeneous communication groups
//!
//! Consumes the expert/regular partition and runs one reduction lane per
//! group: bucketed gradient reduction (optionally overlapped with backward),
//! dynamic loss scaling with a globally consistent overflow verdict,
//! optional global-norm clipping combined across groups, and AdamW applied
//! only to the locally owned shard of each parameter, with a per-group
//! all-gather reassembling the full updated values.
//!
//! Construction is a two-phase builder: phase 1 supplies the base groups
//! (data-parallel + whole-world combine), phase 2 explicitly augments with
//! the MoE groups before `build`. Requesting communication overlap or
//! gradient partitioning without acknowledging the every-member-must-reduce
//! requirement is a configuration error, not a warning.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use rayon::prelude::*;

use crate::comm::{GroupComm, NoopComm, ReduceOp};
use crate::error::{Error, Result};
use crate::model::{HybridModel, MasterParamHook, ParamId};
use crate::optimizer::adamw::{AdamW, AdamWConfig};
use crate::optimizer::bucket::GradientBucketManager;
use crate::optimizer::grad_clip;
use crate::optimizer::loss_scale::{spans_have_overflow, DynamicGradScaler};
use crate::partition::{assign, GroupRole, Partition};

const REDUCE_ACK: &str = "every member of an expert's group must reduce a matching gradient \
every step; a worker that skips an unused expert's collective stalls all peers in that \
expert's group indefinitely";

/// Sharded optimizer configuration.
///
/// Defaults mirror the usual mixed-precision setup: scale 2^16 within
/// [1, 2^24], x2 growth every 2000 clean steps with hysteresis 2, x0.5
/// backoff, 1 MiB reduce buckets, clipping off.
#[derive(Debug, Clone)]
pub struct ZeroOptimizerConfig {
    pub initial_scale: f64,
    pub min_scale: f64,
    pub max_scale: f64,
    pub growth_factor: f64,
    pub backoff_factor: f64,
    pub growth_interval: u64,
    pub hysteresis: u64,
    /// 0 disables clipping.
    pub clip_grad_norm: f64,
    /// Bucket flush threshold in bytes.
    pub reduce_bucket_size: usize,
    /// Issue bucket reductions asynchronously during backward.
    pub overlap_communication: bool,
    /// ZeRO stage 2: drop non-owned gradient storage after reduction.
    pub partition_grads: bool,
    /// Acknowledge the every-member-must-reduce requirement; required for
    /// overlap or gradient partitioning, forces overlap on.
    pub force_overlap_comm: bool,
    /// Storage-placement hint for optimizer state; no effect on ownership.
    pub cpu_offload: bool,
    /// Divide reduced gradients by the owning group's size.
    pub average_gradients: bool,
}

impl Default for ZeroOptimizerConfig {
    fn default() -> Self {
        Self {
            initial_scale: 65536.0,
            min_scale: 1.0,
            max_scale: 16_777_216.0,
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2000,
            hysteresis: 2,
            clip_grad_norm: 0.0,
            reduce_bucket_size: 1024 * 1024,
            overlap_communication: false,
            partition_grads: false,
            force_overlap_comm: false,
            cpu_offload: false,
            average_gradients: true,
        }
    }
}

impl ZeroOptimizerConfig {
    pub fn with_overlap(mut self, overlap: bool) -> Self {
        self.overlap_communication = overlap;
        self
    }

    pub fn with_partition_grads(mut self, partition: bool) -> Self {
        self.partition_grads = partition;
        self
    }

    pub fn with_force_overlap_comm(mut self, force: bool) -> Self {
        self.force_overlap_comm = force;
        self
    }

    pub fn with_clip_grad_norm(mut self, max_norm: f64) -> Self {
        self.clip_grad_norm = max_norm;
        self
    }

    pub fn with_reduce_bucket_size(mut self, bytes: usize) -> Self {
        self.reduce_bucket_size = bytes;
        self
    }
}

/// Where optimizer-state shards are stored. Orthogonal to shard ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatePlacement {
    Device,
    Host,
}

/// The contiguous slice of a parameter owned by this worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ShardSpan {
    pub start: usize,
    pub len: usize,
}

/// Per-(group, parameter) optimizer state for the owned span.
pub(crate) struct ShardState {
    pub(crate) span: ShardSpan,
    pub(crate) numel: usize,
    pub(crate) master: Vec<f32>,
    pub(crate) m: Vec<f32>,
    pub(crate) v: Vec<f32>,
}

pub(crate) struct ShardStore {
    pub(crate) shards: HashMap<(GroupRole, ParamId), ShardState>,
    pub(crate) placement: StatePlacement,
}

/// One reduction lane: a communication group plus the ordered parameters
/// routed through it.
struct Lane {
    role: GroupRole,
    comm: Arc<dyn GroupComm>,
    params: Vec<ParamId>,
    buckets: GradientBucketManager,
}

/// Step state machine position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepPhase {
    Accumulating,
    Reducing,
    Scaling,
    Stepped,
}

/// What one `step` call did.
#[derive(Debug, Clone, Copy)]
pub struct StepOutcome {
    /// False when the step was skipped on overflow.
    pub applied: bool,
    /// Pre-clip global gradient norm, when clipping is enabled.
    pub grad_norm: Option<f64>,
    /// Loss scale after this step's update.
    pub loss_scale: f64,
    /// Completed steps, including skipped ones.
    pub step: u64,
}

/// Phase-1 builder state: base coordination groups.
struct BasePhase {
    dp_comm: Arc<dyn GroupComm>,
    world_comm: Arc<dyn GroupComm>,
    use_pipeline: bool,
}

/// Phase-2 builder state: MoE groups.
struct MoePhase {
    moe_dp_comm: Arc<dyn GroupComm>,
}

/// Two-phase builder for [`ShardedZeroOptimizer`].
pub struct ZeroOptimizerBuilder {
    config: ZeroOptimizerConfig,
    adamw: AdamWConfig,
    base: Option<BasePhase>,
    moe: Option<MoePhase>,
}

impl ZeroOptimizerBuilder {
    /// Phase 1: base coordination state. `world_comm` spans every worker and
    /// carries the per-step overflow verdict; `dp_comm` reduces regular
    /// parameters.
    pub fn base(
        mut self,
        dp_comm: Arc<dyn GroupComm>,
        world_comm: Arc<dyn GroupComm>,
        use_pipeline: bool,
    ) -> Self {
        self.base = Some(BasePhase {
            dp_comm,
            world_comm,
            use_pipeline,
        });
        self
    }

    /// Phase 2: MoE groups. `moe_dp_comm` reduces expert parameters; its
    /// members hold disjoint owned spans covering every expert parameter,
    /// so it is also the group the expert gradient-norm partial reduces
    /// over.
    pub fn with_expert_groups(mut self, moe_dp_comm: Arc<dyn GroupComm>) -> Self {
        self.moe = Some(MoePhase { moe_dp_comm });
        self
    }

    /// Validate the configuration and build against `model`'s current
    /// parameter list.
    pub fn build(self, model: &HybridModel) -> Result<ShardedZeroOptimizer> {
        let mut config = self.config;

        if !config.force_overlap_comm
            && (config.overlap_communication || config.partition_grads)
        {
            return Err(Error::config(format!(
                "{REDUCE_ACK}; set overlap_communication=false and partition_grads=false, \
                 or acknowledge the requirement with force_overlap_comm=true"
            )));
        }
        if config.force_overlap_comm {
            config.overlap_communication = true;
            log::warn!("communication overlap forced on: {REDUCE_ACK}");
        }

        let base = self.base.ok_or_else(|| {
            Error::config("builder phase 1 missing: call base() before build()")
        })?;

        let partition = assign(&model.descriptors());
        let has_experts = !partition.params_for(GroupRole::ExpertDataParallel).is_empty();
        let moe = match self.moe {
            Some(moe) => moe,
            None if has_experts => {
                return Err(Error::config(
                    "builder phase 2 missing: model has expert parameters but \
                     with_expert_groups() was not called",
                ))
            }
            None => MoePhase {
                moe_dp_comm: Arc::new(NoopComm),
            },
        };

        if base.dp_comm.group_size() == 1 {
            log::warn!(
                "sharded optimizer over a size-1 data-parallel group adds coordination \
                 overhead without memory savings"
            );
        }
        if has_experts && moe.moe_dp_comm.group_size() == 1 {
            log::warn!(
                "sharded optimizer over a size-1 expert-data-parallel group adds \
                 coordination overhead without memory savings"
            );
        }

        let scaler = DynamicGradScaler::new(
            config.initial_scale,
            config.min_scale,
            config.max_scale,
            config.growth_factor,
            config.backoff_factor,
            config.growth_interval,
            config.hysteresis,
        )?;

        let placement = if config.cpu_offload {
            StatePlacement::Host
        } else {
            StatePlacement::Device
        };
        log::debug!("optimizer state placement: {placement:?}");

        let overlap = config.overlap_communication;
        let (lanes, shards) = ShardedZeroOptimizer::init_lanes(
            &partition,
            base.dp_comm.clone(),
            moe.moe_dp_comm.clone(),
            config.reduce_bucket_size,
            overlap,
            model,
        )?;

        Ok(ShardedZeroOptimizer {
            config,
            adamw: AdamW::new(self.adamw),
            scaler,
            lanes,
            world_comm: base.world_comm,
            dp_comm: base.dp_comm,
            moe_dp_comm: moe.moe_dp_comm,
            store: Arc::new(RwLock::new(ShardStore { shards, placement })),
            use_pipeline: base.use_pipeline,
            phase: StepPhase::Accumulating,
            steps: 0,
        })
    }
}

/// The sharded optimizer core.
pub struct ShardedZeroOptimizer {
    config: ZeroOptimizerConfig,
    adamw: AdamW,
    scaler: DynamicGradScaler,
    lanes: Vec<Lane>,
    world_comm: Arc<dyn GroupComm>,
    dp_comm: Arc<dyn GroupComm>,
    moe_dp_comm: Arc<dyn GroupComm>,
    pub(crate) store: Arc<RwLock<ShardStore>>,
    use_pipeline: bool,
    phase: StepPhase,
    steps: u64,
}

impl std::fmt::Debug for ShardedZeroOptimizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardedZeroOptimizer")
            .field("phase", &self.phase)
            .field("steps", &self.steps)
            .finish_non_exhaustive()
    }
}

impl ShardedZeroOptimizer {
    /// Start the two-phase builder.
    pub fn builder(config: ZeroOptimizerConfig, adamw: AdamWConfig) -> ZeroOptimizerBuilder {
        ZeroOptimizerBuilder {
            config,
            adamw,
            base: None,
            moe: None,
        }
    }

    fn init_lanes(
        partition: &Partition,
        dp_comm: Arc<dyn GroupComm>,
        moe_dp_comm: Arc<dyn GroupComm>,
        bucket_bytes: usize,
        overlap: bool,
        model: &HybridModel,
    ) -> Result<(Vec<Lane>, HashMap<(GroupRole, ParamId), ShardState>)> {
        let mut lanes = Vec::new();
        let mut shards = HashMap::new();

        for (role, ids) in partition.entries() {
            let comm = match role {
                GroupRole::DataParallel => dp_comm.clone(),
                GroupRole::ExpertDataParallel => moe_dp_comm.clone(),
            };
            let size = comm.group_size();
            let rank = comm.group_rank();

            let mut info = Vec::with_capacity(ids.len());
            for &id in ids {
                let param = model.param(id)?;
                let numel = param.descriptor().numel;
                info.push((id, numel));

                let span = shard_span(numel, size, rank);
                let master = param.data()[span.start..span.start + span.len].to_vec();
                shards.insert(
                    (*role, id),
                    ShardState {
                        span,
                        numel,
                        m: vec![0.0; span.len],
                        v: vec![0.0; span.len],
                        master,
                    },
                );
            }

            lanes.push(Lane {
                role: *role,
                comm: comm.clone(),
                params: ids.clone(),
                buckets: GradientBucketManager::new(&info, comm, bucket_bytes, overlap),
            });
        }
        Ok((lanes, shards))
    }

    /// Rebuild lanes and shard state against the model's *current* parameter
    /// list, keeping the loss scale and timestep.
    ///
    /// Required after expert resharding has changed the locally owned
    /// parameter set; the group topology must be unchanged.
    pub fn reinitialize(&mut self, model: &HybridModel) -> Result<()> {
        let partition = assign(&model.descriptors());
        let (lanes, shards) = Self::init_lanes(
            &partition,
            self.dp_comm.clone(),
            self.moe_dp_comm.clone(),
            self.config.reduce_bucket_size,
            self.config.overlap_communication,
            model,
        )?;
        self.lanes = lanes;
        self.store.write().shards = shards;
        self.phase = StepPhase::Accumulating;
        Ok(())
    }

    /// Route one ready gradient to its group's bucket. In overlap mode a
    /// completed bucket's reduction is issued asynchronously; this call
    /// never blocks on peers.
    pub fn grad_ready(&mut self, id: ParamId, grad: &[f32]) -> Result<()> {
        if self.phase != StepPhase::Accumulating {
            return Err(Error::Training {
                reason: format!("grad_ready in phase {:?}", self.phase),
            });
        }
        for lane in &mut self.lanes {
            if lane.buckets.tracks(id) {
                lane.buckets.grad_ready(id, grad)?;
                return Ok(());
            }
        }
        Err(Error::Training {
            reason: format!("parameter {} is not routed through any group", id.0),
        })
    }

    /// Deposit every gradient currently stored on the model, in parameter
    /// order — the blocking-mode equivalent of per-gradient hooks.
    pub fn reduce_model_grads(&mut self, model: &HybridModel) -> Result<()> {
        let grads: Vec<(ParamId, Vec<f32>)> = model
            .params()
            .iter()
            .filter_map(|p| p.grad().map(|g| (p.descriptor().id, g.to_vec())))
            .collect();
        for (id, grad) in grads {
            self.grad_ready(id, &grad)?;
        }
        Ok(())
    }

    /// Synchronization boundary: drain buckets, resolve the global overflow
    /// verdict, clip, update owned shards, reassemble full parameters.
    ///
    /// Every worker must call this every step; the overflow combine runs on
    /// the whole-world group so the skip/apply decision is identical
    /// everywhere. On overflow the update is skipped and the scale backs
    /// off; this is not an error.
    pub fn step(&mut self, model: &mut HybridModel) -> Result<StepOutcome> {
        self.phase = StepPhase::Reducing;
        let mut reduced: HashMap<ParamId, Vec<f32>> = HashMap::new();
        for lane in &mut self.lanes {
            let scale = if self.config.average_gradients {
                1.0 / lane.comm.group_size() as f64
            } else {
                1.0
            };
            lane.buckets.drain(scale, &mut reduced)?;
        }
        if self.config.partition_grads {
            self.retain_owned_spans(&mut reduced);
        }

        self.phase = StepPhase::Scaling;
        let inv_scale = self.scaler.inv_scale();
        for grad in reduced.values_mut() {
            for v in grad.iter_mut() {
                *v = (*v as f64 * inv_scale) as f32;
            }
        }

        let local_overflow = spans_have_overflow(reduced.values().map(|g| g.as_slice()));
        let mut flag = [if local_overflow { 1.0f32 } else { 0.0 }];
        self.world_comm.all_reduce(&mut flag, ReduceOp::Max)?;
        if flag[0] > 0.0 {
            self.scaler.update(true);
            self.steps += 1;
            log::warn!(
                "gradient overflow at step {}; skipping update, loss scale now {}",
                self.steps,
                self.scaler.scale()
            );
            self.finish_step(model);
            return Ok(StepOutcome {
                applied: false,
                grad_norm: None,
                loss_scale: self.scaler.scale(),
                step: self.steps,
            });
        }

        let mut grad_norm = None;
        if self.config.clip_grad_norm > 0.0 {
            let norm = self.combined_grad_norm(&reduced)?;
            if let Some(factor) = grad_clip::clip_factor(norm, self.config.clip_grad_norm)? {
                for grad in reduced.values_mut() {
                    grad_clip::scale_span(grad, factor);
                }
            }
            grad_norm = Some(norm);
        }

        self.adamw.advance();
        {
            let partitioned = self.config.partition_grads;
            let mut store = self.store.write();
            let adamw = &self.adamw;
            let mut jobs: Vec<(&mut ShardState, &[f32])> = store
                .shards
                .iter_mut()
                .filter_map(|((_, id), shard)| {
                    reduced.get(id).map(|grad| {
                        let span = shard.span;
                        let grad_span = if partitioned {
                            &grad[..]
                        } else {
                            &grad[span.start..span.start + span.len]
                        };
                        (shard, grad_span)
                    })
                })
                .collect();
            jobs.par_iter_mut().for_each(|(shard, grad_span)| {
                let span_len = shard.span.len;
                debug_assert_eq!(grad_span.len(), span_len);
                adamw.update_span(&mut shard.master, grad_span, &mut shard.m, &mut shard.v);
            });
        }

        self.gather_updated_params(model)?;

        self.phase = StepPhase::Stepped;
        self.scaler.update(false);
        self.steps += 1;
        let outcome = StepOutcome {
            applied: true,
            grad_norm,
            loss_scale: self.scaler.scale(),
            step: self.steps,
        };
        self.finish_step(model);
        Ok(outcome)
    }

    /// Stage 2: once a bucket's reduction has completed, each worker keeps
    /// only the gradient span it owns and releases the rest of the buffer
    /// before the overflow check, clipping, and update.
    ///
    /// The overflow verdict stays complete: owned spans are disjoint and
    /// cover every parameter within each group, and the verdict is combined
    /// over the whole world, so some member sees every value.
    fn retain_owned_spans(&self, reduced: &mut HashMap<ParamId, Vec<f32>>) {
        let store = self.store.read();
        for lane in &self.lanes {
            for &id in &lane.params {
                if let (Some(shard), Some(grad)) =
                    (store.shards.get(&(lane.role, id)), reduced.get_mut(&id))
                {
                    let span = shard.span;
                    *grad = grad[span.start..span.start + span.len].to_vec();
                }
            }
        }
    }

    /// Per-group partial sums of squares over owned spans, reduced within
    /// each group, then combined locally.
    ///
    /// One reduce per lane suffices: a lane's owned spans are disjoint and
    /// cover every parameter it routes, so the group sum is already the
    /// full sum for that role. Reducing the expert partial a second time
    /// over the expert axis would count it `ep_size` times — every member
    /// of an expert-axis group holds the same full expert partial after the
    /// expert-data-parallel reduce.
    fn combined_grad_norm(&self, reduced: &HashMap<ParamId, Vec<f32>>) -> Result<f64> {
        let partitioned = self.config.partition_grads;
        let store = self.store.read();
        let mut partials = Vec::with_capacity(self.lanes.len());
        for lane in &self.lanes {
            let local: f64 = lane
                .params
                .iter()
                .filter_map(|id| {
                    let shard = store.shards.get(&(lane.role, *id))?;
                    let grad = reduced.get(id)?;
                    let span = shard.span;
                    let owned = if partitioned {
                        &grad[..]
                    } else {
                        &grad[span.start..span.start + span.len]
                    };
                    Some(grad_clip::owned_sq_sum([owned]))
                })
                .sum();
            partials.push(grad_clip::reduce_partial_sq(lane.comm.as_ref(), local)?);
        }
        Ok(grad_clip::combine_partials(&partials))
    }

    /// All-gather each parameter's updated shards in group-rank order and
    /// write the full value back to the model.
    fn gather_updated_params(&self, model: &mut HybridModel) -> Result<()> {
        let store = self.store.read();
        for lane in &self.lanes {
            let size = lane.comm.group_size();
            for &id in &lane.params {
                let shard = store.shards.get(&(lane.role, id)).ok_or_else(|| {
                    Error::Training {
                        reason: format!("missing shard state for param {}", id.0),
                    }
                })?;
                let param = model.param_mut(id)?;
                if size == 1 {
                    param.data_mut().copy_from_slice(&shard.master);
                    continue;
                }
                let chunk = shard.numel.div_ceil(size);
                let mut padded = vec![0.0f32; chunk];
                padded[..shard.span.len].copy_from_slice(&shard.master);
                let gathered = lane.comm.all_gather(&padded)?;
                param.data_mut().copy_from_slice(&gathered[..shard.numel]);
            }
        }
        Ok(())
    }

    fn finish_step(&mut self, model: &mut HybridModel) {
        for lane in &mut self.lanes {
            lane.buckets.reset();
        }
        model.clear_grads();
        self.phase = StepPhase::Accumulating;
    }

    /// Hook for [`HybridModel::update_master_params`]: refreshes every owned
    /// master shard from the model's current parameter values (e.g. after a
    /// checkpoint load replaced the weights).
    pub fn master_refresh_hook(&self) -> MasterParamHook {
        let store = self.store.clone();
        Box::new(move |model: &HybridModel| {
            let mut store = store.write();
            for ((_, id), shard) in store.shards.iter_mut() {
                let data = model.param(*id)?.data();
                let span = shard.span;
                shard
                    .master
                    .copy_from_slice(&data[span.start..span.start + span.len]);
            }
            Ok(())
        })
    }

    /// The shard span this worker owns for `(role, id)`.
    pub fn shard_span(&self, role: GroupRole, id: ParamId) -> Option<ShardSpan> {
        self.store.read().shards.get(&(role, id)).map(|s| s.span)
    }

    pub fn loss_scale(&self) -> f64 {
        self.scaler.scale()
    }

    /// Completed `step` calls, including overflow-skipped ones.
    pub fn completed_steps(&self) -> u64 {
        self.steps
    }

    /// Applied optimizer timesteps (skipped steps excluded).
    pub fn timestep(&self) -> u64 {
        self.adamw.timestep()
    }

    pub fn set_lr(&mut self, lr: f64) {
        self.adamw.set_lr(lr);
    }

    pub fn lr(&self) -> f64 {
        self.adamw.config().lr
    }

    pub fn overlap_enabled(&self) -> bool {
        self.config.overlap_communication
    }

    pub fn uses_pipeline(&self) -> bool {
        self.use_pipeline
    }

    pub fn state_placement(&self) -> StatePlacement {
        self.store.read().placement
    }

    pub(crate) fn adamw_timestep(&self) -> u64 {
        self.adamw.timestep()
    }

    pub(crate) fn restore_timestep(&mut self, timestep: u64) {
        self.adamw.restore_timestep(timestep);
    }
}

/// Contiguous chunk of `numel` owned by `rank` out of `size` members.
fn shard_span(numel: usize, size: usize, rank: usize) -> ShardSpan {
    if size <= 1 {
        return ShardSpan {
            start: 0,
            len: numel,
        };
    }
    let chunk = numel.div_ceil(size);
    let start = (rank * chunk).min(numel);
    let len = chunk.min(numel - start);
    ShardSpan { start, len }
}
