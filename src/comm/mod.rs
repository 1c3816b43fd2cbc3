//! Group-scoped collective communication
//!
//! The optimizer core speaks to its peers through `GroupComm`, a trait over
//! one communication group. A [`CollectiveTransport`] binds the pure
//! topology handles produced by the mesh to live `GroupComm` instances; the
//! binding key is the ordered member rank list, which every member computes
//! identically, so no runtime negotiation is needed.
//!
//! [`LocalTransport`](local::LocalTransport) provides an in-process
//! implementation for tests; single-member groups bind to the zero-cost
//! [`NoopComm`] regardless of transport.

pub mod local;

use std::sync::Arc;

use crate::cluster::CommGroup;
use crate::error::Result;

/// Elementwise reduction applied by a collective.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Max,
    Min,
}

impl ReduceOp {
    pub(crate) fn combine(self, acc: &mut [f32], contribution: &[f32]) {
        match self {
            ReduceOp::Sum => {
                for (a, &c) in acc.iter_mut().zip(contribution) {
                    *a += c;
                }
            }
            ReduceOp::Max => {
                for (a, &c) in acc.iter_mut().zip(contribution) {
                    *a = a.max(c);
                }
            }
            ReduceOp::Min => {
                for (a, &c) in acc.iter_mut().zip(contribution) {
                    *a = a.min(c);
                }
            }
        }
    }
}

/// Completion handle for an asynchronously issued reduction.
///
/// Issuing never blocks the producer; the reduced buffer is obtained by
/// [`wait`](PendingReduce::wait), which blocks until every group member has
/// contributed. There is no timeout at this layer: a missing participant
/// blocks its peers indefinitely (the documented deadlock hazard).
pub struct PendingReduce {
    inner: PendingInner,
}

enum PendingInner {
    /// Degenerate group or blocking transport: result already available.
    Ready(Vec<f32>),
    /// In-flight round on a live transport.
    InFlight(Box<dyn FnOnce() -> Result<Vec<f32>> + Send>),
}

impl PendingReduce {
    /// A reduction that completed at issue time.
    pub fn ready(buf: Vec<f32>) -> Self {
        Self {
            inner: PendingInner::Ready(buf),
        }
    }

    pub(crate) fn in_flight(wait: Box<dyn FnOnce() -> Result<Vec<f32>> + Send>) -> Self {
        Self {
            inner: PendingInner::InFlight(wait),
        }
    }

    /// Block until the collective completes and return the reduced buffer.
    pub fn wait(self) -> Result<Vec<f32>> {
        match self.inner {
            PendingInner::Ready(buf) => Ok(buf),
            PendingInner::InFlight(wait) => wait(),
        }
    }
}

/// Collective operations over one communication group.
///
/// Implementations are shared read-only across a worker (`Arc`), but each
/// worker drives its collectives from a single thread of control per step,
/// issuing them in identical program order on every member (SPMD).
pub trait GroupComm: Send + Sync {
    /// This worker's position within the group.
    fn group_rank(&self) -> usize;

    /// Number of members.
    fn group_size(&self) -> usize;

    /// Reduce `buf` elementwise across all members, in place. Blocks until
    /// every member has entered the matching call.
    fn all_reduce(&self, buf: &mut [f32], op: ReduceOp) -> Result<()>;

    /// Issue a reduction without blocking; completion is awaited through the
    /// returned handle.
    fn all_reduce_async(&self, buf: Vec<f32>, op: ReduceOp) -> Result<PendingReduce>;

    /// Gather equal-length shards from all members, concatenated in group
    /// rank order.
    fn all_gather(&self, shard: &[f32]) -> Result<Vec<f32>>;

    /// Block until every member has entered the barrier.
    fn barrier(&self) -> Result<()>;
}

/// Binds pure topology handles to live communication channels.
pub trait CollectiveTransport: Send + Sync {
    /// Attach the calling worker to `group` under `label`.
    ///
    /// Deterministic: all members bind the same channel because they pass
    /// identical (label, rank list) pairs. The label keeps logically
    /// distinct groups with identical membership (e.g. a data-parallel
    /// group that happens to span the whole world) on separate collective
    /// streams.
    fn bind(&self, group: &CommGroup, label: &str) -> Result<Arc<dyn GroupComm>>;
}

/// Fast no-op path for single-member groups.
///
/// Every collective degenerates to a local copy; no synchronization at all.
pub struct NoopComm;

impl GroupComm for NoopComm {
    fn group_rank(&self) -> usize {
        0
    }

    fn group_size(&self) -> usize {
        1
    }

    fn all_reduce(&self, _buf: &mut [f32], _op: ReduceOp) -> Result<()> {
        Ok(())
    }

    fn all_reduce_async(&self, buf: Vec<f32>, _op: ReduceOp) -> Result<PendingReduce> {
        Ok(PendingReduce::ready(buf))
    }

    fn all_gather(&self, shard: &[f32]) -> Result<Vec<f32>> {
        Ok(shard.to_vec())
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reduce_op_combine() {
        let mut acc = vec![1.0, 5.0, -2.0];
        ReduceOp::Sum.combine(&mut acc, &[1.0, 1.0, 1.0]);
        assert_eq!(acc, vec![2.0, 6.0, -1.0]);
        ReduceOp::Max.combine(&mut acc, &[0.0, 10.0, 0.0]);
        assert_eq!(acc, vec![2.0, 10.0, 0.0]);
        ReduceOp::Min.combine(&mut acc, &[3.0, 3.0, 3.0]);
        assert_eq!(acc, vec![2.0, 3.0, 0.0]);
    }

    #[test]
    fn test_noop_comm_is_identity() {
        let comm = NoopComm;
        let mut buf = vec![1.0, 2.0];
        comm.all_reduce(&mut buf, ReduceOp::Sum).unwrap();
        assert_eq!(buf, vec![1.0, 2.0]);

        let pending = comm.all_reduce_async(vec![3.0], ReduceOp::Sum).unwrap();
        assert_eq!(pending.wait().unwrap(), vec![3.0]);

        assert_eq!(comm.all_gather(&[7.0, 8.0]).unwrap(), vec![7.0, 8.0]);
        comm.barrier().unwrap();
    }
}
