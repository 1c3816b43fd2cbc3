//! Immutable cluster identity
//!
//! `ClusterContext` replaces ambient "current rank / world size" globals:
//! every component that needs to know who it is receives the context
//! explicitly at construction time.

use crate::error::{Error, Result};

/// One worker's identity within the job.
///
/// Immutable for the lifetime of the job. Cheap to copy; pass it by value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterContext {
    rank: usize,
    world_size: usize,
}

impl ClusterContext {
    /// Create a context for `rank` out of `world_size` workers.
    pub fn new(rank: usize, world_size: usize) -> Result<Self> {
        if world_size == 0 {
            return Err(Error::config("world_size must be positive"));
        }
        if rank >= world_size {
            return Err(Error::config(format!(
                "rank {rank} out of range for world_size {world_size}"
            )));
        }
        Ok(Self { rank, world_size })
    }

    /// Context for a single-worker job.
    pub fn single() -> Self {
        Self {
            rank: 0,
            world_size: 1,
        }
    }

    /// This worker's global rank in `[0, world_size)`.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Total number of workers in the job.
    pub fn world_size(&self) -> usize {
        self.world_size
    }
}
