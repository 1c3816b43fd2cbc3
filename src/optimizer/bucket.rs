//! Gradient buckets for overlapping reduction with backward
//!
//! Each communication group gets one manager. Parameters are packed, in
//! partition order, into contiguous buckets of at most `bucket_size_bytes`;
//! a bucket whose gradients have all arrived is flushed through a single
//! collective — asynchronously in overlap mode, so the producer never
//! blocks. Remaining buckets are flushed and awaited at the step boundary
//! (`drain`), and buffers are reused across steps after `reset`.
//!
//! A bucket that received *no* gradient this step is skipped entirely: no
//! collective is entered for it. On a worker that skipped an expert, this is
//! exactly the condition that leaves the expert's peers blocked — the
//! documented hazard, preserved rather than papered over.

use std::collections::HashMap;
use std::mem;
use std::sync::Arc;

use crate::comm::{GroupComm, PendingReduce, ReduceOp};
use crate::error::{Error, Result};
use crate::model::ParamId;

const F32_BYTES: usize = 4;

enum BucketState {
    Filling,
    InFlight(PendingReduce),
    Reduced(Vec<f32>),
    Drained,
}

struct Bucket {
    params: Vec<ParamId>,
    numels: Vec<usize>,
    offsets: Vec<usize>,
    flat: Vec<f32>,
    received: Vec<bool>,
    n_received: usize,
    state: BucketState,
}

/// Bucketed gradient reduction over one group.
pub struct GradientBucketManager {
    comm: Arc<dyn GroupComm>,
    overlap: bool,
    buckets: Vec<Bucket>,
    param_to_bucket: HashMap<ParamId, usize>,
}

impl GradientBucketManager {
    /// Build buckets from `(id, numel)` pairs in partition order.
    ///
    /// A parameter larger than `bucket_size_bytes` gets a bucket of its own;
    /// bucket boundaries depend only on the ordered pairs and the threshold,
    /// so every group member builds the identical layout.
    pub fn new(
        param_info: &[(ParamId, usize)],
        comm: Arc<dyn GroupComm>,
        bucket_size_bytes: usize,
        overlap: bool,
    ) -> Self {
        let mut buckets: Vec<Bucket> = Vec::new();
        let mut param_to_bucket = HashMap::new();
        let mut current: Vec<(ParamId, usize)> = Vec::new();
        let mut current_bytes = 0usize;

        let mut seal = |current: &mut Vec<(ParamId, usize)>, buckets: &mut Vec<Bucket>| {
            if current.is_empty() {
                return;
            }
            let mut offsets = Vec::with_capacity(current.len());
            let mut total = 0usize;
            for &(_, numel) in current.iter() {
                offsets.push(total);
                total += numel;
            }
            let idx = buckets.len();
            for &(id, _) in current.iter() {
                param_to_bucket.insert(id, idx);
            }
            buckets.push(Bucket {
                params: current.iter().map(|&(id, _)| id).collect(),
                numels: current.iter().map(|&(_, n)| n).collect(),
                offsets,
                flat: vec![0.0; total],
                received: vec![false; current.len()],
                n_received: 0,
                state: BucketState::Filling,
            });
            current.clear();
        };

        for &(id, numel) in param_info {
            let bytes = numel * F32_BYTES;
            if !current.is_empty() && current_bytes + bytes > bucket_size_bytes {
                seal(&mut current, &mut buckets);
                current_bytes = 0;
            }
            current.push((id, numel));
            current_bytes += bytes;
        }
        seal(&mut current, &mut buckets);

        Self {
            comm,
            overlap,
            buckets,
            param_to_bucket,
        }
    }

    pub fn num_buckets(&self) -> usize {
        self.buckets.len()
    }

    pub fn group_size(&self) -> usize {
        self.comm.group_size()
    }

    /// Whether `id` reduces through this manager.
    pub fn tracks(&self, id: ParamId) -> bool {
        self.param_to_bucket.contains_key(&id)
    }

    /// Deposit a ready gradient. When this completes the bucket, the bucket
    /// is flushed; in overlap mode the flush never blocks.
    ///
    /// Returns `true` when the deposit triggered a flush.
    pub fn grad_ready(&mut self, id: ParamId, grad: &[f32]) -> Result<bool> {
        let Some(&idx) = self.param_to_bucket.get(&id) else {
            return Ok(false); // not routed through this group
        };
        let bucket = &mut self.buckets[idx];
        if !matches!(bucket.state, BucketState::Filling) {
            return Err(Error::Training {
                reason: format!("gradient for param {} deposited after its bucket flushed", id.0),
            });
        }
        let slot = bucket
            .params
            .iter()
            .position(|&p| p == id)
            .ok_or_else(|| Error::Training {
                reason: format!("param {} mapped to a bucket that does not hold it", id.0),
            })?;
        if bucket.received[slot] {
            return Err(Error::Training {
                reason: format!("duplicate gradient for param {} in one step", id.0),
            });
        }
        if grad.len() != bucket.numels[slot] {
            return Err(Error::Training {
                reason: format!(
                    "gradient length {} does not match param {} numel {}",
                    grad.len(),
                    id.0,
                    bucket.numels[slot]
                ),
            });
        }
        let start = bucket.offsets[slot];
        bucket.flat[start..start + grad.len()].copy_from_slice(grad);
        bucket.received[slot] = true;
        bucket.n_received += 1;

        if bucket.n_received == bucket.params.len() {
            Self::flush(&self.comm, self.overlap, bucket)?;
            return Ok(true);
        }
        Ok(false)
    }

    fn flush(comm: &Arc<dyn GroupComm>, overlap: bool, bucket: &mut Bucket) -> Result<()> {
        let flat = mem::take(&mut bucket.flat);
        if overlap {
            let pending = comm.all_reduce_async(flat, ReduceOp::Sum)?;
            bucket.state = BucketState::InFlight(pending);
        } else {
            let mut buf = flat;
            comm.all_reduce(&mut buf, ReduceOp::Sum)?;
            bucket.state = BucketState::Reduced(buf);
        }
        Ok(())
    }

    /// Synchronization boundary: flush partially filled buckets (missing
    /// members contribute zeros), await every in-flight reduction, scale by
    /// `scale`, and write per-parameter gradients into `out`.
    ///
    /// Buckets with no received gradient are skipped and their parameters do
    /// not appear in `out`.
    pub fn drain(&mut self, scale: f64, out: &mut HashMap<ParamId, Vec<f32>>) -> Result<()> {
        // Flush stragglers first so every collective is in flight before the
        // first wait — within one worker, buckets reduce in the order their
        // flush was issued.
        for bucket in &mut self.buckets {
            if matches!(bucket.state, BucketState::Filling) && bucket.n_received > 0 {
                Self::flush(&self.comm, self.overlap, bucket)?;
            }
        }

        for bucket in &mut self.buckets {
            let reduced = match mem::replace(&mut bucket.state, BucketState::Drained) {
                BucketState::Filling => {
                    bucket.state = BucketState::Filling;
                    continue; // untouched this step
                }
                BucketState::InFlight(pending) => pending.wait()?,
                BucketState::Reduced(buf) => buf,
                BucketState::Drained => {
                    return Err(Error::Training {
                        reason: "bucket drained twice without reset".to_string(),
                    })
                }
            };
            for (slot, &id) in bucket.params.iter().enumerate() {
                let start = bucket.offsets[slot];
                let end = start + bucket.numels[slot];
                let mut grad = reduced[start..end].to_vec();
                if scale != 1.0 {
                    for v in &mut grad {
                        *v = (*v as f64 * scale) as f32;
                    }
                }
                out.insert(id, grad);
            }
        }
        Ok(())
    }

    /// Reset all buckets for the next step, reusing buffers.
    pub fn reset(&mut self) {
        for bucket in &mut self.buckets {
            let total: usize = bucket.numels.iter().sum();
            bucket.flat.clear();
            bucket.flat.resize(total, 0.0);
            for r in &mut bucket.received {
                *r = false;
            }
            bucket.n_received = 0;
            bucket.state = BucketState::Filling;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::NoopComm;

    fn manager(sizes: &[usize], bucket_bytes: usize) -> GradientBucketManager {
        let info: Vec<(ParamId, usize)> = sizes
            .iter()
            .enumerate()
            .map(|(i, &n)| (ParamId(i), n))
            .collect();
        GradientBucketManager::new(&info, Arc::new(NoopComm), bucket_bytes, false)
    }

    #[test]
    fn test_small_params_share_one_bucket() {
        let mgr = manager(&[100, 200], 25 * 1024 * 1024);
        assert_eq!(mgr.num_buckets(), 1);
    }

    #[test]
    fn test_threshold_splits_buckets() {
        // 100 f32 = 400 bytes; threshold 400 → two buckets
        let mgr = manager(&[100, 100], 400);
        assert_eq!(mgr.num_buckets(), 2);
    }

    #[test]
    fn test_flush_and_drain_roundtrip() {
        let mut mgr = manager(&[3, 2], 25 * 1024 * 1024);
        assert!(!mgr.grad_ready(ParamId(0), &[1.0, 2.0, 3.0]).unwrap());
        assert!(mgr.grad_ready(ParamId(1), &[4.0, 5.0]).unwrap());

        let mut out = HashMap::new();
        mgr.drain(1.0, &mut out).unwrap();
        assert_eq!(out[&ParamId(0)], vec![1.0, 2.0, 3.0]);
        assert_eq!(out[&ParamId(1)], vec![4.0, 5.0]);
    }

    #[test]
    fn test_drain_applies_scale() {
        let mut mgr = manager(&[2], 1024);
        mgr.grad_ready(ParamId(0), &[2.0, 4.0]).unwrap();
        let mut out = HashMap::new();
        mgr.drain(0.5, &mut out).unwrap();
        assert_eq!(out[&ParamId(0)], vec![1.0, 2.0]);
    }

    #[test]
    fn test_partial_bucket_flushes_with_zeros_at_drain() {
        let mut mgr = manager(&[2, 2], 1024);
        mgr.grad_ready(ParamId(1), &[7.0, 8.0]).unwrap();
        let mut out = HashMap::new();
        mgr.drain(1.0, &mut out).unwrap();
        assert_eq!(out[&ParamId(0)], vec![0.0, 0.0], "missing grad reduces as zeros");
        assert_eq!(out[&ParamId(1)], vec![7.0, 8.0]);
    }

    #[test]
    fn test_untouched_bucket_is_skipped() {
        let mut mgr = manager(&[100, 100], 400); // two buckets
        mgr.grad_ready(ParamId(0), &[1.0; 100]).unwrap();
        let mut out = HashMap::new();
        mgr.drain(1.0, &mut out).unwrap();
        assert!(out.contains_key(&ParamId(0)));
        assert!(!out.contains_key(&ParamId(1)), "no grad, no collective, no output");
    }

    #[test]
    fn test_untracked_param_ignored() {
        let mut mgr = manager(&[2], 1024);
        assert!(!mgr.grad_ready(ParamId(42), &[1.0]).unwrap());
    }

    #[test]
    fn test_duplicate_grad_rejected() {
        let mut mgr = manager(&[2, 2], 25 * 1024 * 1024);
        mgr.grad_ready(ParamId(0), &[1.0, 1.0]).unwrap();
        assert!(mgr.grad_ready(ParamId(0), &[1.0, 1.0]).is_err());
    }

    #[test]
    fn test_grad_length_validated() {
        let mut mgr = manager(&[2], 1024);
        assert!(mgr.grad_ready(ParamId(0), &[1.0]).is_err());
    }

    #[test]
    fn test_reset_allows_next_step() {
        let mut mgr = manager(&[2], 1024);
        mgr.grad_ready(ParamId(0), &[1.0, 1.0]).unwrap();
        let mut out = HashMap::new();
        mgr.drain(1.0, &mut out).unwrap();

        mgr.reset();
        mgr.grad_ready(ParamId(0), &[3.0, 3.0]).unwrap();
        let mut out2 = HashMap::new();
        mgr.drain(1.0, &mut out2).unwrap();
        assert_eq!(out2[&ParamId(0)], vec![3.0, 3.0]);
    }
}
