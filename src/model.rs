//! Model-facing parameter registry
//!
//! The optimizer core never sees forward/backward math; it consumes the
//! model through this interface: an ordered list of parameter descriptors,
//! per-parameter f32 data and gradients, and the explicit
//! `update_master_params` hook that checkpoint restore drives.
//!
//! Whether a parameter is an expert is a capability field set once at
//! model-build time, not inferred by runtime inspection, so every worker
//! classifies identically from its local (structurally identical) view.

use crate::error::{Error, Result};

/// What a parameter is, for gradient routing purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ParamKind {
    /// Replicated across data-parallel workers.
    Regular,
    /// Owned by one expert; communicates over the expert-data-parallel group.
    Expert,
}

/// Stable parameter identity: the index in the model's ordered parameter
/// list. Workers agree on ids without communication because the
/// pre-sharding parameter list is structurally identical everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct ParamId(pub usize);

impl ParamId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Immutable parameter metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamDescriptor {
    pub id: ParamId,
    pub name: String,
    pub numel: usize,
    pub kind: ParamKind,
}

/// A named tensor-shaped value plus its per-step gradient slot.
#[derive(Debug, Clone)]
pub struct Parameter {
    desc: ParamDescriptor,
    data: Vec<f32>,
    grad: Option<Vec<f32>>,
}

impl Parameter {
    pub fn descriptor(&self) -> &ParamDescriptor {
        &self.desc
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn grad(&self) -> Option<&[f32]> {
        self.grad.as_deref()
    }
}

/// Hook installed by optimizer construction; refreshes the optimizer's
/// master copies from the model's current parameter values.
pub type MasterParamHook = Box<dyn Fn(&HybridModel) -> Result<()> + Send + Sync>;

/// Wrapped model as seen by the coordination layer.
///
/// Parameter set membership is fixed after construction: no dynamic
/// add/remove mid-training. Replacing the parameter list (expert resharding)
/// means building a new `HybridModel` and reinitializing the optimizer.
#[derive(Default)]
pub struct HybridModel {
    params: Vec<Parameter>,
    master_hook: Option<MasterParamHook>,
}

impl HybridModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a parameter; returns its stable id. Registration order must
    /// be identical on every worker.
    pub fn add_param(&mut self, name: impl Into<String>, kind: ParamKind, data: Vec<f32>) -> ParamId {
        let id = ParamId(self.params.len());
        self.params.push(Parameter {
            desc: ParamDescriptor {
                id,
                name: name.into(),
                numel: data.len(),
                kind,
            },
            data,
            grad: None,
        });
        id
    }

    pub fn num_params(&self) -> usize {
        self.params.len()
    }

    /// Ordered descriptors of every parameter.
    pub fn descriptors(&self) -> Vec<ParamDescriptor> {
        self.params.iter().map(|p| p.desc.clone()).collect()
    }

    pub fn param(&self, id: ParamId) -> Result<&Parameter> {
        self.params.get(id.0).ok_or_else(|| Error::Training {
            reason: format!("unknown parameter id {}", id.0),
        })
    }

    pub fn param_mut(&mut self, id: ParamId) -> Result<&mut Parameter> {
        self.params.get_mut(id.0).ok_or_else(|| Error::Training {
            reason: format!("unknown parameter id {}", id.0),
        })
    }

    pub fn params(&self) -> &[Parameter] {
        &self.params
    }

    /// Deposit a gradient for `id`, as backward computation would.
    pub fn set_grad(&mut self, id: ParamId, grad: Vec<f32>) -> Result<()> {
        let param = self.param_mut(id)?;
        if grad.len() != param.desc.numel {
            return Err(Error::Training {
                reason: format!(
                    "gradient length {} does not match parameter '{}' numel {}",
                    grad.len(),
                    param.desc.name,
                    param.desc.numel
                ),
            });
        }
        param.grad = Some(grad);
        Ok(())
    }

    /// Drop all gradients; called between steps.
    pub fn clear_grads(&mut self) {
        for p in &mut self.params {
            p.grad = None;
        }
    }

    /// Install the master-refresh callback. Wired by optimizer construction;
    /// not a user-facing API.
    pub fn set_update_master_hook(&mut self, hook: MasterParamHook) {
        self.master_hook = Some(hook);
    }

    /// Refresh the optimizer's master copies from current parameter values.
    ///
    /// Delegates to the hook registered at optimizer construction; calling
    /// it on an unconfigured model is a usage error.
    pub fn update_master_params(&self) -> Result<()> {
        match &self.master_hook {
            Some(hook) => hook(self),
            None => Err(Error::Training {
                reason: "update_master_params called before optimizer wiring".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toy_model() -> HybridModel {
        let mut m = HybridModel::new();
        m.add_param("embed.weight", ParamKind::Regular, vec![0.0; 8]);
        m.add_param("expert.0.w", ParamKind::Expert, vec![0.0; 4]);
        m
    }

    #[test]
    fn test_param_ids_are_registration_order() {
        let m = toy_model();
        let descs = m.descriptors();
        assert_eq!(descs[0].id, ParamId(0));
        assert_eq!(descs[0].kind, ParamKind::Regular);
        assert_eq!(descs[1].id, ParamId(1));
        assert_eq!(descs[1].kind, ParamKind::Expert);
        assert_eq!(descs[1].numel, 4);
    }

    #[test]
    fn test_set_grad_validates_length() {
        let mut m = toy_model();
        assert!(m.set_grad(ParamId(0), vec![1.0; 8]).is_ok());
        assert!(m.set_grad(ParamId(0), vec![1.0; 3]).is_err());
        assert!(m.set_grad(ParamId(9), vec![1.0; 3]).is_err());
    }

    #[test]
    fn test_clear_grads() {
        let mut m = toy_model();
        m.set_grad(ParamId(1), vec![1.0; 4]).unwrap();
        assert!(m.param(ParamId(1)).unwrap().grad().is_some());
        m.clear_grads();
        assert!(m.param(ParamId(1)).unwrap().grad().is_none());
    }

    #[test]
    fn test_update_master_params_requires_wiring() {
        let m = toy_model();
        assert!(m.update_master_params().is_err());
    }

    #[test]
    fn test_update_master_params_delegates() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let mut m = toy_model();
        let called = Arc::new(AtomicBool::new(false));
        let flag = called.clone();
        m.set_update_master_hook(Box::new(move |_model| {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        }));
        m.update_master_params().unwrap();
        assert!(called.load(Ordering::SeqCst));
    }
}
