//! Checkpoint shard interface
//!
//! Serialized state is addressed per (group role, parameter): each worker
//! owns exactly the optimizer-state span the sharded optimizer assigned it,
//! and shard boundaries are stable while the topology is unchanged, so a
//! coordinator can save and restore without any resharding step. File
//! layout and storage are the caller's concern; this module only produces
//! and consumes shard payloads and exposes the group handles a coordinator
//! addresses them by.

use serde::{Deserialize, Serialize};

use crate::cluster::CommGroup;
use crate::error::{Error, Result};
use crate::model::ParamId;
use crate::optimizer::sharded::ShardedZeroOptimizer;
use crate::partition::GroupRole;

/// The stable group handles checkpoint placement is keyed by.
#[derive(Debug, Clone)]
pub struct CheckpointGroups {
    pub dp: CommGroup,
    pub pp: CommGroup,
    pub tp: CommGroup,
    pub ep: CommGroup,
    pub moe_dp: CommGroup,
}

/// One worker's owned optimizer-state span for one parameter.
#[derive(Debug, Serialize, Deserialize)]
struct ShardPayload {
    param: ParamId,
    role: GroupRole,
    start: usize,
    len: usize,
    numel: usize,
    timestep: u64,
    master: Vec<f32>,
    m: Vec<f32>,
    v: Vec<f32>,
}

impl ShardedZeroOptimizer {
    /// Serialize the locally owned shard of `(role, id)`.
    pub fn get_shard(&self, role: GroupRole, id: ParamId) -> Result<Vec<u8>> {
        let store = self.store.read();
        let shard = store.shards.get(&(role, id)).ok_or_else(|| Error::Checkpoint {
            reason: format!("no {role} shard for parameter {}", id.0),
        })?;
        let payload = ShardPayload {
            param: id,
            role,
            start: shard.span.start,
            len: shard.span.len,
            numel: shard.numel,
            timestep: self.adamw_timestep(),
            master: shard.master.clone(),
            m: shard.m.clone(),
            v: shard.v.clone(),
        };
        serde_json::to_vec(&payload).map_err(|e| Error::Checkpoint {
            reason: format!("shard encode failed: {e}"),
        })
    }

    /// Restore the locally owned shard of `(role, id)` from `bytes`.
    ///
    /// The payload must address this exact parameter and role, and its span
    /// must match the span the current topology assigns this worker; a
    /// payload saved under a different topology is rejected rather than
    /// silently resharded. The first restored shard fixes the optimizer
    /// timestep; shards carrying a different timestep are rejected rather
    /// than mixed.
    pub fn set_shard(&mut self, role: GroupRole, id: ParamId, bytes: &[u8]) -> Result<()> {
        let payload: ShardPayload =
            serde_json::from_slice(bytes).map_err(|e| Error::Checkpoint {
                reason: format!("shard decode failed: {e}"),
            })?;
        if payload.param != id || payload.role != role {
            return Err(Error::Checkpoint {
                reason: format!(
                    "payload addresses {} parameter {}, expected {role} parameter {}",
                    payload.role, payload.param.0, id.0
                ),
            });
        }
        // All shards of one checkpoint carry the same timestep; the first
        // restore adopts it and later ones must agree, so shards saved at
        // different steps cannot be mixed silently.
        let current = self.adamw_timestep();
        if current != 0 && payload.timestep != current {
            return Err(Error::Checkpoint {
                reason: format!(
                    "shard timestep {} conflicts with previously restored timestep \
                     {current}; restore all shards of one checkpoint into a freshly \
                     built optimizer",
                    payload.timestep
                ),
            });
        }
        let mut store = self.store.write();
        let shard = store.shards.get_mut(&(role, id)).ok_or_else(|| Error::Checkpoint {
            reason: format!("no {role} shard for parameter {}", id.0),
        })?;
        if payload.numel != shard.numel
            || payload.start != shard.span.start
            || payload.len != shard.span.len
        {
            return Err(Error::Checkpoint {
                reason: format!(
                    "shard boundaries changed: payload [{}, +{}) of {}, \
                     current topology owns [{}, +{}) of {}",
                    payload.start,
                    payload.len,
                    payload.numel,
                    shard.span.start,
                    shard.span.len,
                    shard.numel
                ),
            });
        }
        if payload.master.len() != payload.len
            || payload.m.len() != payload.len
            || payload.v.len() != payload.len
        {
            return Err(Error::Checkpoint {
                reason: format!(
                    "shard vectors must have span length {}, got master {} m {} v {}",
                    payload.len,
                    payload.master.len(),
                    payload.m.len(),
                    payload.v.len()
                ),
            });
        }
        shard.master = payload.master;
        shard.m = payload.m;
        shard.v = payload.v;
        drop(store);
        self.restore_timestep(payload.timestep);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::NoopComm;
    use crate::model::{HybridModel, ParamKind};
    use crate::optimizer::{AdamWConfig, ZeroOptimizerConfig};
    use std::sync::Arc;

    fn configured() -> (HybridModel, ShardedZeroOptimizer) {
        let mut model = HybridModel::new();
        model.add_param("w", ParamKind::Regular, vec![1.0; 4]);
        model.add_param("e", ParamKind::Expert, vec![2.0; 4]);
        let opt = ShardedZeroOptimizer::builder(
            ZeroOptimizerConfig::default(),
            AdamWConfig::default(),
        )
        .base(Arc::new(NoopComm), Arc::new(NoopComm), false)
        .with_expert_groups(Arc::new(NoopComm))
        .build(&model)
        .unwrap();
        (model, opt)
    }

    fn step_once(model: &mut HybridModel, opt: &mut ShardedZeroOptimizer) {
        let scale = opt.loss_scale() as f32;
        model.set_grad(ParamId(0), vec![scale; 4]).unwrap();
        model.set_grad(ParamId(1), vec![scale; 4]).unwrap();
        opt.reduce_model_grads(model).unwrap();
        assert!(opt.step(model).unwrap().applied);
    }

    #[test]
    fn test_shard_roundtrip_restores_state() {
        let (mut model, mut opt) = configured();
        step_once(&mut model, &mut opt);
        let bytes = opt.get_shard(GroupRole::DataParallel, ParamId(0)).unwrap();

        // A freshly built optimizer adopts the saved state.
        let (model2, mut opt2) = configured();
        let _ = model2;
        opt2.set_shard(GroupRole::DataParallel, ParamId(0), &bytes)
            .unwrap();
        assert_eq!(opt2.timestep(), 1);
        let restored = opt2.get_shard(GroupRole::DataParallel, ParamId(0)).unwrap();
        assert_eq!(restored, bytes);
    }

    #[test]
    fn test_get_shard_unknown_role_rejected() {
        let (_, opt) = configured();
        // Param 0 is regular; asking for its expert shard is a miss.
        assert!(opt
            .get_shard(GroupRole::ExpertDataParallel, ParamId(0))
            .is_err());
    }

    #[test]
    fn test_set_shard_wrong_address_rejected() {
        let (_, mut opt) = configured();
        let bytes = opt.get_shard(GroupRole::DataParallel, ParamId(0)).unwrap();
        let err = opt
            .set_shard(GroupRole::ExpertDataParallel, ParamId(1), &bytes)
            .unwrap_err();
        assert!(matches!(err, Error::Checkpoint { .. }));
    }

    #[test]
    fn test_set_shard_boundary_mismatch_rejected() {
        let (_, mut opt) = configured();
        let bytes = opt.get_shard(GroupRole::DataParallel, ParamId(0)).unwrap();
        let mut payload: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        payload["start"] = serde_json::json!(2);
        let tampered = serde_json::to_vec(&payload).unwrap();
        let err = opt
            .set_shard(GroupRole::DataParallel, ParamId(0), &tampered)
            .unwrap_err();
        assert!(err.to_string().contains("boundaries"));
    }

    #[test]
    fn test_set_shard_mixed_timesteps_rejected() {
        let (mut model, mut opt) = configured();
        step_once(&mut model, &mut opt);
        let dense = opt.get_shard(GroupRole::DataParallel, ParamId(0)).unwrap();
        let expert = opt
            .get_shard(GroupRole::ExpertDataParallel, ParamId(1))
            .unwrap();
        let mut stale: serde_json::Value = serde_json::from_slice(&expert).unwrap();
        stale["timestep"] = serde_json::json!(2);
        let stale = serde_json::to_vec(&stale).unwrap();

        let (_, mut opt2) = configured();
        opt2.set_shard(GroupRole::DataParallel, ParamId(0), &dense)
            .unwrap();
        let err = opt2
            .set_shard(GroupRole::ExpertDataParallel, ParamId(1), &stale)
            .unwrap_err();
        assert!(err.to_string().contains("timestep"));
        // A shard from the same checkpoint still restores.
        opt2.set_shard(GroupRole::ExpertDataParallel, ParamId(1), &expert)
            .unwrap();
        assert_eq!(opt2.timestep(), 1);
    }

    #[test]
    fn test_set_shard_garbage_rejected() {
        let (_, mut opt) = configured();
        assert!(opt
            .set_shard(GroupRole::DataParallel, ParamId(0), b"not json")
            .is_err());
    }
}
