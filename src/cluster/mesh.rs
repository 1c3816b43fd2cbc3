//! N-dimensional process-group mesh
//!
//! Organizes the worker set into an N-d coordinate space and derives, per
//! axis, the communication group of all workers sharing this worker's
//! coordinates on every *other* axis. Group membership is a pure function of
//! rank and axis sizes, so every worker enumerates the same groups locally
//! with no negotiation.

use crate::cluster::ClusterContext;
use crate::error::{Error, Result};

/// A communication group as pure topology data.
///
/// Created once when the mesh is built, immutable afterwards. `ranks` is
/// ordered ascending along the varying axis, so all members agree on the
/// group layout and on each member's position in it. The handle carries no
/// transport state; bind it through a
/// [`CollectiveTransport`](crate::comm::CollectiveTransport) to communicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommGroup {
    axis: usize,
    ranks: Vec<usize>,
    group_rank: usize,
}

impl CommGroup {
    pub(crate) fn new(axis: usize, ranks: Vec<usize>, group_rank: usize) -> Self {
        debug_assert!(group_rank < ranks.len());
        Self {
            axis,
            ranks,
            group_rank,
        }
    }

    /// The mesh axis this group varies along.
    pub fn axis(&self) -> usize {
        self.axis
    }

    /// Ordered global ranks of the members.
    pub fn ranks(&self) -> &[usize] {
        &self.ranks
    }

    /// Number of members.
    pub fn size(&self) -> usize {
        self.ranks.len()
    }

    /// The calling worker's position within the group.
    pub fn group_rank(&self) -> usize {
        self.group_rank
    }

    /// Whether `rank` is a member.
    pub fn contains(&self, rank: usize) -> bool {
        self.ranks.contains(&rank)
    }
}

/// N-dimensional coordinate space over the worker set.
///
/// Axis sizes are ordered; their product must equal the world size. Rank to
/// coordinate mapping is row-major mixed-radix (last axis varies fastest),
/// and is a bijection.
#[derive(Debug, Clone)]
pub struct ProcessGroupMesh {
    ctx: ClusterContext,
    axis_sizes: Vec<usize>,
}

impl ProcessGroupMesh {
    /// Build a mesh over `axis_sizes`.
    ///
    /// Fails with a configuration error if any axis size is zero or if the
    /// product of sizes does not equal the context's world size.
    pub fn new(ctx: ClusterContext, axis_sizes: &[usize]) -> Result<Self> {
        if axis_sizes.is_empty() {
            return Err(Error::config("mesh requires at least one axis"));
        }
        if axis_sizes.contains(&0) {
            return Err(Error::config(format!(
                "axis sizes must be positive, got {axis_sizes:?}"
            )));
        }
        let product: usize = axis_sizes.iter().product();
        if product != ctx.world_size() {
            return Err(Error::config(format!(
                "axis sizes {:?} multiply to {}, but world_size is {}",
                axis_sizes,
                product,
                ctx.world_size()
            )));
        }
        Ok(Self {
            ctx,
            axis_sizes: axis_sizes.to_vec(),
        })
    }

    /// The context this mesh was built with.
    pub fn context(&self) -> ClusterContext {
        self.ctx
    }

    /// Ordered axis extents.
    pub fn axis_sizes(&self) -> &[usize] {
        &self.axis_sizes
    }

    /// Number of axes.
    pub fn num_axes(&self) -> usize {
        self.axis_sizes.len()
    }

    /// Decompose a global rank into its per-axis coordinates.
    pub fn coordinate(&self, rank: usize) -> Vec<usize> {
        let mut coord = vec![0; self.axis_sizes.len()];
        let mut rest = rank;
        for (i, &size) in self.axis_sizes.iter().enumerate().rev() {
            coord[i] = rest % size;
            rest /= size;
        }
        coord
    }

    /// Compose per-axis coordinates back into a global rank.
    pub fn rank_of(&self, coord: &[usize]) -> usize {
        debug_assert_eq!(coord.len(), self.axis_sizes.len());
        let mut rank = 0;
        for (&c, &size) in coord.iter().zip(&self.axis_sizes) {
            debug_assert!(c < size);
            rank = rank * size + c;
        }
        rank
    }

    /// The calling worker's group along `axis`: all ranks sharing its
    /// coordinates on every other axis, ordered by their coordinate on
    /// `axis`. A size-1 axis degenerates to a single-member group.
    pub fn group_along_axis(&self, axis: usize) -> Result<CommGroup> {
        self.group_along_axis_for(axis, self.ctx.rank())
    }

    /// Same as [`group_along_axis`](Self::group_along_axis) but for an
    /// arbitrary member rank. Used by tests to check cross-worker agreement.
    pub fn group_along_axis_for(&self, axis: usize, rank: usize) -> Result<CommGroup> {
        if axis >= self.axis_sizes.len() {
            return Err(Error::config(format!(
                "axis {axis} out of range for {}-axis mesh",
                self.axis_sizes.len()
            )));
        }
        let mut coord = self.coordinate(rank);
        let mut ranks = Vec::with_capacity(self.axis_sizes[axis]);
        for c in 0..self.axis_sizes[axis] {
            coord[axis] = c;
            ranks.push(self.rank_of(&coord));
        }
        let my_coord = self.coordinate(rank)[axis];
        Ok(CommGroup::new(axis, ranks, my_coord))
    }

    /// The group of all workers, independent of any axis.
    pub fn world_group(&self) -> CommGroup {
        CommGroup::new(
            usize::MAX,
            (0..self.ctx.world_size()).collect(),
            self.ctx.rank(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mesh(rank: usize, world: usize, sizes: &[usize]) -> ProcessGroupMesh {
        let ctx = ClusterContext::new(rank, world).unwrap();
        ProcessGroupMesh::new(ctx, sizes).unwrap()
    }

    #[test]
    fn test_mesh_rejects_size_mismatch() {
        let ctx = ClusterContext::new(0, 8).unwrap();
        assert!(ProcessGroupMesh::new(ctx, &[2, 3]).is_err());
        assert!(ProcessGroupMesh::new(ctx, &[]).is_err());
        assert!(ProcessGroupMesh::new(ctx, &[8, 0]).is_err());
    }

    #[test]
    fn test_coordinate_bijection() {
        let m = mesh(0, 24, &[2, 3, 4]);
        for rank in 0..24 {
            let coord = m.coordinate(rank);
            assert_eq!(m.rank_of(&coord), rank, "coord {coord:?}");
        }
    }

    #[test]
    fn test_last_axis_varies_fastest() {
        let m = mesh(0, 8, &[2, 4]);
        assert_eq!(m.coordinate(0), vec![0, 0]);
        assert_eq!(m.coordinate(1), vec![0, 1]);
        assert_eq!(m.coordinate(4), vec![1, 0]);
        assert_eq!(m.coordinate(7), vec![1, 3]);
    }

    #[test]
    fn test_group_along_axis_membership() {
        // world 8 as (dp=2, ep=4): rank 5 has coord [1, 1]
        let m = mesh(5, 8, &[2, 4]);

        // Along axis 1 (ep): peers share dp coord 1 → ranks 4..8
        let ep = m.group_along_axis(1).unwrap();
        assert_eq!(ep.ranks(), &[4, 5, 6, 7]);
        assert_eq!(ep.group_rank(), 1);
        assert_eq!(ep.size(), 4);

        // Along axis 0 (dp): peers share ep coord 1 → ranks 1 and 5
        let dp = m.group_along_axis(0).unwrap();
        assert_eq!(dp.ranks(), &[1, 5]);
        assert_eq!(dp.group_rank(), 1);
    }

    #[test]
    fn test_group_agreement_across_members() {
        // Every pair of workers sharing all-but-one coordinate must resolve
        // to the identical rank list for that axis.
        let world = 24;
        let sizes = [2, 3, 4];
        for axis in 0..sizes.len() {
            for rank in 0..world {
                let m = mesh(rank, world, &sizes);
                let g = m.group_along_axis(axis).unwrap();
                assert_eq!(g.ranks()[g.group_rank()], rank);
                for &peer in g.ranks() {
                    let pg = m.group_along_axis_for(axis, peer).unwrap();
                    assert_eq!(pg.ranks(), g.ranks(), "axis {axis} rank {rank} peer {peer}");
                }
            }
        }
    }

    #[test]
    fn test_size_one_axis_degenerates() {
        let m = mesh(3, 8, &[2, 4, 1]);
        let g = m.group_along_axis(2).unwrap();
        assert_eq!(g.size(), 1);
        assert_eq!(g.ranks(), &[3]);
        assert_eq!(g.group_rank(), 0);
    }

    #[test]
    fn test_world_group() {
        let m = mesh(2, 6, &[2, 3]);
        let g = m.world_group();
        assert_eq!(g.size(), 6);
        assert_eq!(g.group_rank(), 2);
    }

    #[test]
    fn test_axis_out_of_range() {
        let m = mesh(0, 4, &[2, 2]);
        assert!(m.group_along_axis(2).is_err());
    }
}
