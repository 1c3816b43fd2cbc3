//! Gradient clipping by global norm across heterogeneous groups
//!
//! Each communication group independently reduces its own partial
//! sum-of-squares; the partials are then combined locally into one global
//! norm (every worker is a member of each role's group, so the final
//! combine needs no further collective). The resulting clip factor is
//! applied to all gradients, making clipping consistent across groups with
//! different member counts.

use crate::comm::{GroupComm, ReduceOp};
use crate::error::{Error, Result};

/// Sum of squares over this worker's owned spans.
pub fn owned_sq_sum<'a>(spans: impl IntoIterator<Item = &'a [f32]>) -> f64 {
    spans
        .into_iter()
        .flat_map(|span| span.iter())
        .map(|&v| (v as f64) * (v as f64))
        .sum()
}

/// Reduce a partial sum-of-squares across one group.
///
/// Owned shards are disjoint and cover each parameter, so the group sum is
/// the full sum over that group's parameters.
pub fn reduce_partial_sq(comm: &dyn GroupComm, local_sq: f64) -> Result<f64> {
    if comm.group_size() == 1 {
        return Ok(local_sq);
    }
    let mut buf = [local_sq as f32];
    comm.all_reduce(&mut buf, ReduceOp::Sum)?;
    Ok(buf[0] as f64)
}

/// Combine per-group partials into the global norm.
pub fn combine_partials(partials: &[f64]) -> f64 {
    partials.iter().sum::<f64>().sqrt()
}

/// Scale factor that caps the global norm at `max_norm`, or `None` when the
/// norm is already within bounds.
pub fn clip_factor(total_norm: f64, max_norm: f64) -> Result<Option<f64>> {
    if max_norm <= 0.0 {
        return Err(Error::Training {
            reason: format!("max_norm must be positive, got {max_norm}"),
        });
    }
    if total_norm > max_norm {
        Ok(Some(max_norm / (total_norm + 1e-6)))
    } else {
        Ok(None)
    }
}

/// Apply a clip factor in place.
pub fn scale_span(span: &mut [f32], factor: f64) {
    for v in span.iter_mut() {
        *v = (*v as f64 * factor) as f32;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::NoopComm;

    #[test]
    fn test_owned_sq_sum() {
        let a = vec![3.0f32, 0.0];
        let b = vec![0.0f32, 4.0];
        let sq = owned_sq_sum([a.as_slice(), b.as_slice()]);
        assert!((sq - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_combine_partials_matches_single_group() {
        // Splitting the same gradients across two groups must give the same
        // norm as one group holding everything.
        let one_group = combine_partials(&[9.0 + 16.0]);
        let two_groups = combine_partials(&[9.0, 16.0]);
        assert!((one_group - two_groups).abs() < 1e-12);
        assert!((two_groups - 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_clip_factor_noop_under_max() {
        assert!(clip_factor(1.0, 5.0).unwrap().is_none());
    }

    #[test]
    fn test_clip_factor_caps_norm() {
        let factor = clip_factor(5.0, 1.0).unwrap().unwrap();
        let mut grad = vec![3.0f32, 4.0];
        scale_span(&mut grad, factor);
        let norm = (grad[0] as f64 * grad[0] as f64 + grad[1] as f64 * grad[1] as f64).sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_clip_factor_rejects_non_positive_max() {
        assert!(clip_factor(1.0, 0.0).is_err());
        assert!(clip_factor(1.0, -1.0).is_err());
    }

    #[test]
    fn test_reduce_partial_degenerate_group() {
        let sq = reduce_partial_sq(&NoopComm, 7.5).unwrap();
        assert_eq!(sq, 7.5);
    }
}
