//! In-process transport for tests and single-machine demos
//!
//! Worker threads sharing one `LocalTransport` rendezvous per
//! (group, sequence number) round. A round completes only when every member
//! has contributed, which gives the real completion semantics of the wire
//! transports this stands in for: a member that never issues the matching
//! call blocks its peers forever.
//!
//! Each worker binds a group once and issues collectives on it in program
//! order; the per-member sequence counter pairs the Nth call on one member
//! with the Nth call on every other member (SPMD).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::cluster::CommGroup;
use crate::comm::{CollectiveTransport, GroupComm, NoopComm, PendingReduce, ReduceOp};
use crate::error::{Error, Result};

/// Shared rendezvous state for in-process workers.
///
/// Clone one handle per worker thread; binds are keyed by the group's
/// ordered rank list, so all members attach to the same channel.
#[derive(Clone, Default)]
pub struct LocalTransport {
    registry: Arc<Mutex<HashMap<(String, Vec<usize>), Arc<GroupShared>>>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CollectiveTransport for LocalTransport {
    fn bind(&self, group: &CommGroup, label: &str) -> Result<Arc<dyn GroupComm>> {
        if group.size() == 1 {
            return Ok(Arc::new(NoopComm));
        }
        let key = (label.to_string(), group.ranks().to_vec());
        let shared = {
            let mut registry = self.registry.lock();
            registry
                .entry(key)
                .or_insert_with(|| Arc::new(GroupShared::new(group.size())))
                .clone()
        };
        Ok(Arc::new(LocalComm {
            shared,
            group_rank: group.group_rank(),
            size: group.size(),
            next_seq: AtomicU64::new(0),
        }))
    }
}

struct GroupShared {
    size: usize,
    state: Mutex<HashMap<u64, Round>>,
    cv: Condvar,
}

struct Round {
    kind: RoundKind,
    contributed: usize,
    collected: usize,
    done: bool,
    failed: Option<String>,
}

enum RoundKind {
    Reduce { op: ReduceOp, acc: Vec<f32> },
    Gather { parts: Vec<Option<Vec<f32>>> },
    Barrier,
}

impl GroupShared {
    fn new(size: usize) -> Self {
        Self {
            size,
            state: Mutex::new(HashMap::new()),
            cv: Condvar::new(),
        }
    }

    /// Deposit this member's contribution for round `seq`. Never blocks.
    fn contribute(
        &self,
        seq: u64,
        make: impl FnOnce() -> RoundKind,
        merge: impl FnOnce(&mut RoundKind) -> std::result::Result<(), String>,
    ) {
        let mut rounds = self.state.lock();
        let round = rounds.entry(seq).or_insert_with(|| Round {
            kind: make(),
            contributed: 0,
            collected: 0,
            done: false,
            failed: None,
        });
        if round.failed.is_none() && round.contributed > 0 {
            if let Err(reason) = merge(&mut round.kind) {
                round.failed = Some(reason);
            }
        }
        round.contributed += 1;
        if round.contributed == self.size {
            round.done = true;
            self.cv.notify_all();
        }
    }

    /// Block until round `seq` completes, then collect its result.
    fn collect(&self, seq: u64) -> Result<RoundResult> {
        let mut rounds = self.state.lock();
        loop {
            if rounds.get(&seq).map(|r| r.done).unwrap_or(false) {
                break;
            }
            self.cv.wait(&mut rounds);
        }
        let round = rounds.get_mut(&seq).expect("round present while waiting");
        if let Some(reason) = &round.failed {
            let reason = reason.clone();
            round.collected += 1;
            if round.collected == self.size {
                rounds.remove(&seq);
            }
            return Err(Error::comm(reason));
        }
        let result = match &round.kind {
            RoundKind::Reduce { acc, .. } => RoundResult::Buffer(acc.clone()),
            RoundKind::Gather { parts } => {
                let mut out = Vec::new();
                for part in parts {
                    out.extend_from_slice(part.as_ref().expect("all parts present when done"));
                }
                RoundResult::Buffer(out)
            }
            RoundKind::Barrier => RoundResult::Empty,
        };
        round.collected += 1;
        if round.collected == self.size {
            rounds.remove(&seq);
        }
        Ok(result)
    }
}

enum RoundResult {
    Buffer(Vec<f32>),
    Empty,
}

impl RoundResult {
    fn into_buffer(self) -> Vec<f32> {
        match self {
            RoundResult::Buffer(buf) => buf,
            RoundResult::Empty => Vec::new(),
        }
    }
}

/// One member's endpoint on a multi-member group.
pub struct LocalComm {
    shared: Arc<GroupShared>,
    group_rank: usize,
    size: usize,
    next_seq: AtomicU64,
}

impl GroupComm for LocalComm {
    fn group_rank(&self) -> usize {
        self.group_rank
    }

    fn group_size(&self) -> usize {
        self.size
    }

    fn all_reduce(&self, buf: &mut [f32], op: ReduceOp) -> Result<()> {
        let pending = self.all_reduce_async(buf.to_vec(), op)?;
        let reduced = pending.wait()?;
        buf.copy_from_slice(&reduced);
        Ok(())
    }

    fn all_reduce_async(&self, buf: Vec<f32>, op: ReduceOp) -> Result<PendingReduce> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let len = buf.len();
        let contribution = buf;
        self.shared.contribute(
            seq,
            {
                let contribution = contribution.clone();
                move || RoundKind::Reduce {
                    op,
                    acc: contribution,
                }
            },
            move |kind| match kind {
                RoundKind::Reduce { op: acc_op, acc } => {
                    if acc.len() != len {
                        return Err(format!(
                            "all_reduce length mismatch: {} vs {len}",
                            acc.len()
                        ));
                    }
                    if *acc_op != op {
                        return Err("all_reduce op mismatch between members".to_string());
                    }
                    op.combine(acc, &contribution);
                    Ok(())
                }
                _ => Err("collective kind mismatch: expected all_reduce".to_string()),
            },
        );
        let shared = self.shared.clone();
        Ok(PendingReduce::in_flight(Box::new(move || {
            shared.collect(seq).map(RoundResult::into_buffer)
        })))
    }

    fn all_gather(&self, shard: &[f32]) -> Result<Vec<f32>> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let size = self.size;
        let rank = self.group_rank;
        let len = shard.len();
        let mine = shard.to_vec();
        self.shared.contribute(
            seq,
            {
                let mine = mine.clone();
                move || {
                    let mut parts = vec![None; size];
                    parts[rank] = Some(mine);
                    RoundKind::Gather { parts }
                }
            },
            move |kind| match kind {
                RoundKind::Gather { parts } => {
                    if let Some(prev) = parts.iter().flatten().next() {
                        if prev.len() != len {
                            return Err(format!(
                                "all_gather shard length mismatch: {} vs {len}",
                                prev.len()
                            ));
                        }
                    }
                    if parts[rank].is_some() {
                        return Err(format!("duplicate all_gather contribution from rank {rank}"));
                    }
                    parts[rank] = Some(mine);
                    Ok(())
                }
                _ => Err("collective kind mismatch: expected all_gather".to_string()),
            },
        );
        self.shared.collect(seq).map(RoundResult::into_buffer)
    }

    fn barrier(&self) -> Result<()> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.shared.contribute(
            seq,
            || RoundKind::Barrier,
            |kind| match kind {
                RoundKind::Barrier => Ok(()),
                _ => Err("collective kind mismatch: expected barrier".to_string()),
            },
        );
        self.shared.collect(seq).map(|_| ())
    }
}
