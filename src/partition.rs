//! Parameter-to-group assignment
//!
//! Splits the full ordered parameter list into one list per target
//! communication group: expert parameters route through the
//! expert-data-parallel group, everything else through the data-parallel
//! group. The partition is stable (each sub-list keeps the input's relative
//! order) because bucket construction downstream is order-sensitive for
//! reproducible communication scheduling.

use crate::model::{ParamDescriptor, ParamId, ParamKind};

/// Which communication group a parameter's gradients reduce over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum GroupRole {
    /// Regular parameters: the data-parallel group.
    DataParallel,
    /// Expert parameters: the moe-data-parallel group.
    ExpertDataParallel,
}

impl std::fmt::Display for GroupRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GroupRole::DataParallel => write!(f, "dp"),
            GroupRole::ExpertDataParallel => write!(f, "moe-dp"),
        }
    }
}

impl GroupRole {
    fn of(kind: ParamKind) -> Self {
        match kind {
            ParamKind::Regular => GroupRole::DataParallel,
            ParamKind::Expert => GroupRole::ExpertDataParallel,
        }
    }
}

/// Disjoint, exhaustive cover of the parameter set, one ordered list per
/// group. Two roles today; the layout generalizes to N.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    entries: Vec<(GroupRole, Vec<ParamId>)>,
}

impl Partition {
    /// Ordered (role, params) entries. Roles with no parameters still
    /// appear, with an empty list.
    pub fn entries(&self) -> &[(GroupRole, Vec<ParamId>)] {
        &self.entries
    }

    /// The ordered parameter list assigned to `role`.
    pub fn params_for(&self, role: GroupRole) -> &[ParamId] {
        self.entries
            .iter()
            .find(|(r, _)| *r == role)
            .map(|(_, ids)| ids.as_slice())
            .unwrap_or(&[])
    }

    /// The role owning `id`, if the partition covers it.
    pub fn role_of(&self, id: ParamId) -> Option<GroupRole> {
        self.entries
            .iter()
            .find(|(_, ids)| ids.contains(&id))
            .map(|(role, _)| *role)
    }

    /// Total number of parameters covered.
    pub fn len(&self) -> usize {
        self.entries.iter().map(|(_, ids)| ids.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Partition `params` by kind. Pure and deterministic: every worker computes
/// the same partition from its local descriptor list without communication.
///
/// Must run against the *pre-resharding* parameter list; once expert
/// parameters have been sharded along the expert axis the local list
/// changes, and any optimizer built against the old list has to be rebuilt
/// (see [`ShardedZeroOptimizer::reinitialize`]).
///
/// [`ShardedZeroOptimizer::reinitialize`]: crate::optimizer::ShardedZeroOptimizer::reinitialize
pub fn assign(params: &[ParamDescriptor]) -> Partition {
    let mut regular = Vec::new();
    let mut expert = Vec::new();
    for desc in params {
        match GroupRole::of(desc.kind) {
            GroupRole::DataParallel => regular.push(desc.id),
            GroupRole::ExpertDataParallel => expert.push(desc.id),
        }
    }
    Partition {
        entries: vec![
            (GroupRole::DataParallel, regular),
            (GroupRole::ExpertDataParallel, expert),
        ],
    }
}
