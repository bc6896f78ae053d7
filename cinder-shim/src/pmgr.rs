//! Legacy PMGR collective dialect (spec 4.6, optional). A sequence of
//! binary opcodes executed collectively: one packet per task, read in
//! rank order, the shim computing and returning each collective's
//! "dual" per spec 4.6. Mixing opcodes within a generation is a
//! `PROTOCOL_ERROR`.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use cinder_common::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmgrOp {
    Open,
    Close,
    Abort,
    Barrier,
    Bcast,
    Gather,
    Scatter,
    Allgather,
    Alltoall,
}

impl PmgrOp {
    pub fn from_byte(b: u8) -> Result<Self> {
        Ok(match b {
            0 => PmgrOp::Open,
            1 => PmgrOp::Close,
            2 => PmgrOp::Abort,
            3 => PmgrOp::Barrier,
            4 => PmgrOp::Bcast,
            5 => PmgrOp::Gather,
            6 => PmgrOp::Scatter,
            7 => PmgrOp::Allgather,
            8 => PmgrOp::Alltoall,
            other => return Err(Error::validation(format!("unknown PMGR opcode {other}"))),
        })
    }
}

struct Round {
    op: Option<PmgrOp>,
    packets: Vec<Option<Vec<u8>>>,
    waiters: Vec<Option<oneshot::Sender<Result<Vec<u8>>>>>,
    received: usize,
}

impl Round {
    fn new(size: usize) -> Self {
        Self {
            op: None,
            packets: vec![None; size],
            waiters: (0..size).map(|_| None).collect(),
            received: 0,
        }
    }
}

/// One collective coordinator per step. Root is always rank 0, matching
/// the convention the legacy PMGR client libraries assume.
pub struct PmgrCoordinator {
    size: usize,
    round: Mutex<Round>,
}

impl PmgrCoordinator {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            round: Mutex::new(Round::new(size)),
        }
    }

    /// Submits rank's packet for `op`. Resolves once every rank in the
    /// round has submitted for the *same* opcode; a rank submitting a
    /// different opcode while a round is in flight is a protocol
    /// error for every participant.
    pub async fn submit(&self, rank: usize, op: PmgrOp, payload: Vec<u8>) -> Result<Vec<u8>> {
        if rank >= self.size {
            return Err(Error::validation("PMGR rank out of range"));
        }
        let (tx, rx) = oneshot::channel();
        let ready = {
            let mut round = self.round.lock();
            match round.op {
                Some(existing) if existing != op => {
                    return Err(Error::integrity("PROTOCOL_ERROR: mixed PMGR opcodes in one generation"));
                }
                _ => round.op = Some(op),
            }
            if round.packets[rank].is_some() {
                return Err(Error::integrity("PROTOCOL_ERROR: duplicate PMGR packet from rank"));
            }
            round.packets[rank] = Some(payload);
            round.waiters[rank] = Some(tx);
            round.received += 1;
            round.received == self.size
        };
        if ready {
            self.complete_round();
        }
        rx.await.map_err(|_| Error::integrity("PMGR round aborted"))?
    }

    fn complete_round(&self) {
        let (op, packets, waiters) = {
            let mut round = self.round.lock();
            let op = round.op.take().expect("round completed without an opcode");
            let packets: Vec<Vec<u8>> = round.packets.iter_mut().map(|p| p.take().unwrap_or_default()).collect();
            let waiters: Vec<_> = round.waiters.iter_mut().map(|w| w.take()).collect();
            *round = Round::new(self.size);
            (op, packets, waiters)
        };
        let results = dual(op, &packets);
        for (waiter, result) in waiters.into_iter().zip(results) {
            if let Some(tx) = waiter {
                let _ = tx.send(Ok(result));
            }
        }
    }
}

/// Computes each rank's output packet for a completed collective round.
fn dual(op: PmgrOp, packets: &[Vec<u8>]) -> Vec<Vec<u8>> {
    let n = packets.len();
    match op {
        PmgrOp::Open | PmgrOp::Close | PmgrOp::Abort | PmgrOp::Barrier => vec![Vec::new(); n],
        PmgrOp::Bcast => vec![packets[0].clone(); n],
        PmgrOp::Gather => {
            let mut all = Vec::new();
            for p in packets {
                all.extend_from_slice(p);
            }
            (0..n).map(|i| if i == 0 { all.clone() } else { Vec::new() }).collect()
        }
        PmgrOp::Scatter => {
            let root = &packets[0];
            let chunk = root.len() / n.max(1);
            (0..n)
                .map(|i| {
                    let start = i * chunk;
                    let end = if i == n - 1 { root.len() } else { start + chunk };
                    root[start..end].to_vec()
                })
                .collect()
        }
        PmgrOp::Allgather => {
            let mut all = Vec::new();
            for p in packets {
                all.extend_from_slice(p);
            }
            vec![all; n]
        }
        PmgrOp::Alltoall => {
            // Each rank's packet is pre-partitioned into `n` equal
            // slices; rank j's result is the concatenation over i of
            // rank i's slice destined for j (the classic transpose).
            let slices: Vec<Vec<&[u8]>> = packets
                .iter()
                .map(|p| {
                    let chunk = p.len() / n.max(1);
                    (0..n)
                        .map(|j| {
                            let start = j * chunk;
                            let end = if j == n - 1 { p.len() } else { start + chunk };
                            &p[start..end]
                        })
                        .collect()
                })
                .collect();
            (0..n)
                .map(|j| slices.iter().flat_map(|s| s[j].to_vec()).collect())
                .collect()
        }
    }
}

pub type PmgrCoordinatorRef = Arc<PmgrCoordinator>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bcast_delivers_roots_packet_to_every_rank() {
        let coord = Arc::new(PmgrCoordinator::new(3));
        let c1 = coord.clone();
        let t1 = tokio::spawn(async move { c1.submit(1, PmgrOp::Bcast, vec![]).await });
        let c2 = coord.clone();
        let t2 = tokio::spawn(async move { c2.submit(2, PmgrOp::Bcast, vec![]).await });
        let r0 = coord.submit(0, PmgrOp::Bcast, vec![9, 9]).await.unwrap();
        assert_eq!(r0, vec![9, 9]);
        assert_eq!(t1.await.unwrap().unwrap(), vec![9, 9]);
        assert_eq!(t2.await.unwrap().unwrap(), vec![9, 9]);
    }

    #[tokio::test]
    async fn gather_is_root_only() {
        let coord = Arc::new(PmgrCoordinator::new(2));
        let c1 = coord.clone();
        let t1 = tokio::spawn(async move { c1.submit(1, PmgrOp::Gather, vec![2]).await });
        let r0 = coord.submit(0, PmgrOp::Gather, vec![1]).await.unwrap();
        assert_eq!(r0, vec![1, 2]);
        assert_eq!(t1.await.unwrap().unwrap(), Vec::<u8>::new());
    }

    #[tokio::test]
    async fn scatter_splits_roots_packet() {
        let coord = Arc::new(PmgrCoordinator::new(2));
        let c1 = coord.clone();
        let t1 = tokio::spawn(async move { c1.submit(1, PmgrOp::Scatter, vec![]).await });
        let r0 = coord.submit(0, PmgrOp::Scatter, vec![1, 2, 3, 4]).await.unwrap();
        assert_eq!(r0, vec![1, 2]);
        assert_eq!(t1.await.unwrap().unwrap(), vec![3, 4]);
    }

    #[tokio::test]
    async fn alltoall_transposes_slices() {
        let coord = Arc::new(PmgrCoordinator::new(2));
        let c1 = coord.clone();
        let t1 = tokio::spawn(async move { c1.submit(1, PmgrOp::Alltoall, vec![30, 40]).await });
        let r0 = coord.submit(0, PmgrOp::Alltoall, vec![10, 20]).await.unwrap();
        // rank 0 gets its own slice-to-0 (10) plus rank 1's slice-to-0 (30)
        assert_eq!(r0, vec![10, 30]);
        assert_eq!(t1.await.unwrap().unwrap(), vec![20, 40]);
    }

    #[tokio::test]
    async fn mixed_opcodes_in_one_round_are_a_protocol_error() {
        let coord = Arc::new(PmgrCoordinator::new(2));
        let c1 = coord.clone();
        let t1 = tokio::spawn(async move { c1.submit(1, PmgrOp::Bcast, vec![]).await });
        tokio::task::yield_now().await;
        let err = coord.submit(0, PmgrOp::Gather, vec![1]).await.unwrap_err();
        assert_eq!(err.kind, cinder_common::error::ErrorKind::Integrity);
        drop(t1);
    }
}
