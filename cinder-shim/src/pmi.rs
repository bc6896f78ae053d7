//! PMI wire protocol server (spec 4.6, 6): length-bounded, newline-
//! terminated frames of space-separated `key=value` keywords. One TCP
//! connection per task; calls on that connection are handled one at a
//! time, in order.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LinesCodec};

use cinder_common::error::{Error, ErrorKind, Result};

use crate::barrier::Barrier;
use crate::kvs::Kvs;

pub struct PmiServer {
    pub kvs: Arc<Kvs>,
    pub barrier: Arc<Barrier>,
    pub size: u32,
    pub max_frame_bytes: usize,
}

impl PmiServer {
    pub async fn bind(addr: &str) -> Result<(TcpListener, SocketAddr)> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::with_source(ErrorKind::Internal, format!("bind PMI listener on {addr}"), e))?;
        let local = listener
            .local_addr()
            .map_err(|e| Error::with_source(ErrorKind::Internal, "PMI listener has no local addr", e))?;
        Ok((listener, local))
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((socket, peer)) => {
                    let this = self.clone();
                    tokio::spawn(async move {
                        this.handle_connection(socket).await;
                        tracing::debug!(%peer, "PMI connection closed");
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "PMI accept failed");
                    return;
                }
            }
        }
    }

    async fn handle_connection(&self, socket: TcpStream) {
        let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(self.max_frame_bytes));
        let mut session = Session::default();
        loop {
            let line = match framed.next().await {
                Some(Ok(line)) => line,
                Some(Err(e)) => {
                    tracing::debug!(error = %e, "PMI frame error");
                    break;
                }
                None => break,
            };
            let fields = parse_keywords(&line);
            let reply = if fields.get("cmd").map(|s| s.as_str()) == Some("barrier") {
                self.handle_barrier(&mut session).await
            } else {
                self.handle_frame(&mut session, &fields)
            };
            if framed.send(reply).await.is_err() {
                break;
            }
        }
        // A task disconnecting mid-barrier must not hang its peers
        // (spec 4.6: fail-stop barrier).
        self.barrier.abort();
    }

    async fn handle_barrier(&self, session: &mut Session) -> String {
        match self.barrier.wait(session.barrier_generation).await {
            Ok(new_gen) => {
                session.barrier_generation = new_gen;
                // Committed pairs are now visible; a fresh `Iter` after
                // a barrier should see them, so drop any snapshot
                // taken before this round published.
                session.iter_snapshot = None;
                format!("rc=0 gen={new_gen}")
            }
            Err(_) => "rc=1 error=PEER_LOST".to_string(),
        }
    }

    fn handle_frame(&self, session: &mut Session, fields: &HashMap<String, String>) -> String {
        match fields.get("cmd").map(|s| s.as_str()) {
            Some("init") => {
                let rank: u32 = fields.get("rank").and_then(|s| s.parse().ok()).unwrap_or(0);
                if rank >= self.size {
                    return error_reply("rank out of range");
                }
                session.rank = Some(rank);
                format!("rc=0 rank={rank} size={} spawned=0", self.size)
            }
            Some("put") => {
                let (Some(key), Some(value)) = (fields.get("key"), fields.get("value")) else {
                    return error_reply("put requires key and value");
                };
                if let Err(e) = self.kvs.check_bounds(key, value) {
                    return error_reply(&e.reason);
                }
                session.scratch.insert(key.clone(), value.clone());
                "rc=0".to_string()
            }
            Some("commit") => {
                let staged = std::mem::take(&mut session.scratch);
                self.kvs.commit(staged);
                "rc=0".to_string()
            }
            Some("get") => match fields.get("key") {
                Some(key) => match self.kvs.get(key) {
                    Some(value) => format!("rc=0 value={value}"),
                    None => "rc=1 error=NOT_FOUND".to_string(),
                },
                None => error_reply("get requires key"),
            },
            Some("iter") => {
                if session.iter_snapshot.is_none() {
                    session.iter_snapshot = Some(self.kvs.snapshot());
                    session.iter_cursor = 0;
                }
                let snapshot = session.iter_snapshot.as_ref().unwrap();
                match snapshot.get(session.iter_cursor) {
                    Some((k, v)) => {
                        session.iter_cursor += 1;
                        format!("rc=0 key={k} value={v}")
                    }
                    None => "rc=0 done=1".to_string(),
                }
            }
            Some("spawn") | Some("spawn_multiple") | Some("publish_name") | Some("lookup_name")
            | Some("parse_option") => "rc=1 error=UNSUPPORTED".to_string(),
            _ => error_reply("PROTOCOL_ERROR"),
        }
    }
}

fn error_reply(reason: &str) -> String {
    format!("rc=1 error={reason}")
}

#[derive(Default)]
struct Session {
    rank: Option<u32>,
    scratch: HashMap<String, String>,
    iter_snapshot: Option<Vec<(String, String)>>,
    iter_cursor: usize,
    barrier_generation: u64,
}

fn parse_keywords(line: &str) -> HashMap<String, String> {
    line.split_whitespace()
        .filter_map(|tok| tok.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(size: u32) -> PmiServer {
        let kvs = Arc::new(Kvs::new(256, 1024));
        let barrier = Arc::new(Barrier::new(size as usize, kvs.clone()));
        PmiServer {
            kvs,
            barrier,
            size,
            max_frame_bytes: 64 * 1024,
        }
    }

    #[test]
    fn init_reports_rank_and_size() {
        let srv = server(4);
        let mut session = Session::default();
        let reply = srv.handle_frame(&mut session, &parse_keywords("cmd=init rank=2"));
        assert_eq!(reply, "rc=0 rank=2 size=4 spawned=0");
    }

    #[test]
    fn get_before_any_commit_is_not_found() {
        let srv = server(1);
        let mut session = Session::default();
        let reply = srv.handle_frame(&mut session, &parse_keywords("cmd=get key=missing"));
        assert_eq!(reply, "rc=1 error=NOT_FOUND");
    }

    #[test]
    fn put_then_get_before_commit_is_still_not_found() {
        let srv = server(1);
        let mut session = Session::default();
        srv.handle_frame(&mut session, &parse_keywords("cmd=put key=x value=1"));
        let reply = srv.handle_frame(&mut session, &parse_keywords("cmd=get key=x"));
        assert_eq!(reply, "rc=1 error=NOT_FOUND");
    }

    #[test]
    fn oversize_put_is_validation_error() {
        let srv = server(1);
        let mut session = Session::default();
        let long_value = "x".repeat(2000);
        let line = format!("cmd=put key=x value={long_value}");
        let reply = srv.handle_frame(&mut session, &parse_keywords(&line));
        assert!(reply.starts_with("rc=1"));
    }

    #[test]
    fn unsupported_entry_points_report_unsupported() {
        let srv = server(1);
        let mut session = Session::default();
        for cmd in ["spawn", "spawn_multiple", "publish_name", "lookup_name", "parse_option"] {
            let reply = srv.handle_frame(&mut session, &parse_keywords(&format!("cmd={cmd}")));
            assert_eq!(reply, "rc=1 error=UNSUPPORTED");
        }
    }
}
