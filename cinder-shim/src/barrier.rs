//! Step-wide PMI barrier (spec 4.6). Fail-stop collective: every one
//! of `size` tasks must call `wait` with the barrier's current
//! generation before any of them returns; a disconnecting peer aborts
//! every current waiter with `PEER_LOST` instead of letting the round
//! hang, per spec 4.6 and the suspension-point rule of spec 5 ("no
//! unbounded wait is permitted").

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use cinder_common::error::{Error, Result};

use crate::kvs::Kvs;

enum Outcome {
    Published(u64),
    PeerLost,
}

struct Round {
    generation: u64,
    waiters: Vec<oneshot::Sender<Outcome>>,
}

pub struct Barrier {
    size: usize,
    kvs: Arc<Kvs>,
    round: Mutex<Round>,
}

impl Barrier {
    pub fn new(size: usize, kvs: Arc<Kvs>) -> Self {
        Self {
            size,
            kvs,
            round: Mutex::new(Round {
                generation: 0,
                waiters: Vec::new(),
            }),
        }
    }

    /// Blocks until every task has called `wait` for the same
    /// generation, then publishes the KVS's pending writes and
    /// returns the new generation. `expected_generation` must match
    /// the barrier's current round; a mismatch is a protocol error
    /// the caller's client library is expected never to trigger since
    /// it tracks its own local generation counter.
    pub async fn wait(&self, expected_generation: u64) -> Result<u64> {
        let (tx, rx) = oneshot::channel();
        let complete = {
            let mut round = self.round.lock();
            if round.generation != expected_generation {
                return Err(Error::integrity(format!(
                    "barrier generation mismatch: caller at {expected_generation}, shim at {}",
                    round.generation
                )));
            }
            round.waiters.push(tx);
            round.waiters.len() >= self.size
        };
        if complete {
            self.complete_round();
        }
        match rx.await {
            Ok(Outcome::Published(gen)) => Ok(gen),
            Ok(Outcome::PeerLost) | Err(_) => Err(Error::integrity("PEER_LOST")),
        }
    }

    fn complete_round(&self) {
        let waiters = {
            let mut round = self.round.lock();
            round.generation += 1;
            std::mem::take(&mut round.waiters)
        };
        let new_gen = self.kvs.publish_pending();
        for tx in waiters {
            let _ = tx.send(Outcome::Published(new_gen));
        }
    }

    /// Called when a task connection drops while the barrier has
    /// outstanding waiters for the current round: aborts every
    /// waiter with `PEER_LOST` rather than leaving the round to hang
    /// forever (spec 4.6: "the shim aborts the barrier with
    /// `PEER_LOST` to all waiters").
    pub fn abort(&self) {
        let waiters = {
            let mut round = self.round.lock();
            if round.waiters.is_empty() {
                return;
            }
            std::mem::take(&mut round.waiters)
        };
        for tx in waiters {
            let _ = tx.send(Outcome::PeerLost);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[tokio::test]
    async fn all_participants_unblock_together() {
        let kvs = Arc::new(Kvs::new(256, 1024));
        let mut staged = HashMap::new();
        staged.insert("x".to_string(), "1".to_string());
        kvs.commit(staged);
        let barrier = Arc::new(Barrier::new(3, kvs.clone()));

        let b1 = barrier.clone();
        let t1 = tokio::spawn(async move { b1.wait(0).await });
        let b2 = barrier.clone();
        let t2 = tokio::spawn(async move { b2.wait(0).await });
        tokio::task::yield_now().await;
        assert_eq!(barrier.wait(0).await.unwrap(), 1);
        assert_eq!(t1.await.unwrap().unwrap(), 1);
        assert_eq!(t2.await.unwrap().unwrap(), 1);
        assert_eq!(kvs.get("x"), Some("1".to_string()));
    }

    #[tokio::test]
    async fn abort_rejects_outstanding_waiters() {
        let kvs = Arc::new(Kvs::new(256, 1024));
        let barrier = Arc::new(Barrier::new(3, kvs));
        let b1 = barrier.clone();
        let t1 = tokio::spawn(async move { b1.wait(0).await });
        let b2 = barrier.clone();
        let t2 = tokio::spawn(async move { b2.wait(0).await });
        tokio::task::yield_now().await;
        barrier.abort();
        assert!(t1.await.unwrap().is_err());
        assert!(t2.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn generation_mismatch_is_a_protocol_error() {
        let kvs = Arc::new(Kvs::new(256, 1024));
        let barrier = Barrier::new(3, kvs);
        assert!(barrier.wait(5).await.is_err());
    }
}
