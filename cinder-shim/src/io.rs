//! I/O fan-out (spec 4.7). Each task dials one TCP stream per
//! direction back to the shim, opening with a one-line header so the
//! shim can demux by `(taskId, stream)` without a shared control
//! channel. The interactive client (out of scope; only its endpoint
//! contract matters here) dials the same listener with a `CLIENT`
//! header identifying the logical stream it wants to read or feed.
//! Only the logical stream semantics are specified (spec 1: the
//! multiplexer's line-buffering/label cosmetics are a non-goal), so
//! bytes are copied verbatim, never split or prefixed.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};

use cinder_common::error::{Error, ErrorKind, Result};

#[derive(Debug, Clone)]
pub enum IoMode {
    All,
    None,
    Task(u32),
    /// A per-task filename pattern with `%t %n %N %j %J %s %0<w><spec>`
    /// placeholders (spec 4.7).
    Pattern(String),
}

impl IoMode {
    pub fn parse(s: &str) -> Self {
        match s {
            "all" => IoMode::All,
            "none" => IoMode::None,
            other => other
                .strip_prefix("task")
                .and_then(|n| n.parse().ok())
                .map(IoMode::Task)
                .unwrap_or_else(|| IoMode::Pattern(other.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub enum StdinMode {
    None,
    Broadcast,
    Task(u32),
}

impl StdinMode {
    pub fn parse(s: &str) -> Self {
        match s {
            "none" => StdinMode::None,
            "broadcast" => StdinMode::Broadcast,
            other => other
                .strip_prefix("task")
                .and_then(|n| n.parse().ok())
                .map(StdinMode::Task)
                .unwrap_or(StdinMode::None),
        }
    }
}

#[derive(Clone)]
struct OutChunk {
    task_id: u32,
    stream: &'static str,
    data: Vec<u8>,
}

pub struct IoContext {
    pub job_id: u64,
    pub step_id: u32,
}

pub struct IoRouter {
    ctx: IoContext,
    io_mode: IoMode,
    stdin_mode: StdinMode,
    out_tx: broadcast::Sender<OutChunk>,
    stdin_txs: Mutex<HashMap<u32, mpsc::UnboundedSender<Vec<u8>>>>,
    file_sinks: Mutex<HashMap<(u32, &'static str), Arc<tokio::sync::Mutex<tokio::fs::File>>>>,
    signal_relay: Option<Arc<crate::signal::SignalRelay>>,
}

impl IoRouter {
    pub fn new(
        ctx: IoContext,
        io_mode: IoMode,
        stdin_mode: StdinMode,
        signal_relay: Option<Arc<crate::signal::SignalRelay>>,
    ) -> Arc<Self> {
        let (out_tx, _) = broadcast::channel(1024);
        Arc::new(Self {
            ctx,
            io_mode,
            stdin_mode,
            out_tx,
            stdin_txs: Mutex::new(HashMap::new()),
            file_sinks: Mutex::new(HashMap::new()),
            signal_relay,
        })
    }

    pub async fn bind(addr: &str) -> Result<(TcpListener, SocketAddr)> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::with_source(ErrorKind::Internal, format!("bind I/O listener on {addr}"), e))?;
        let local = listener
            .local_addr()
            .map_err(|e| Error::with_source(ErrorKind::Internal, "I/O listener has no local addr", e))?;
        Ok((listener, local))
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((socket, peer)) => {
                    let this = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = this.handle_connection(socket).await {
                            tracing::debug!(%peer, error = %e, "I/O connection ended");
                        }
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "I/O accept failed");
                    return;
                }
            }
        }
    }

    async fn handle_connection(&self, mut socket: TcpStream) -> Result<()> {
        let header = read_header_line(&mut socket).await?;
        match parse_header(&header)? {
            Header::Task { task_id, node_id: _, stream: "stdout" } => self.pump_task_out(socket, task_id, "stdout").await,
            Header::Task { task_id, node_id: _, stream: "stderr" } => self.pump_task_out(socket, task_id, "stderr").await,
            Header::Task { task_id, node_id: _, stream: "stdin" } => self.pump_task_stdin(socket, task_id).await,
            Header::Task { stream, .. } => Err(Error::validation(format!("unknown task stream {stream}"))),
            Header::Client { stream: "stdout" } => self.pump_client_out(socket, "stdout").await,
            Header::Client { stream: "stderr" } => self.pump_client_out(socket, "stderr").await,
            Header::Client { stream: "stdin" } => self.pump_client_stdin(socket).await,
            Header::Client { stream: "sigint" } => self.pump_client_sigint(socket).await,
            Header::Client { stream } => Err(Error::validation(format!("unknown client stream {stream}"))),
        }
    }

    /// Task stdout/stderr flows task -> shim; route per `io_mode`.
    async fn pump_task_out(&self, mut socket: TcpStream, task_id: u32, stream: &'static str) -> Result<()> {
        let mut buf = [0u8; 8192];
        loop {
            let n = socket
                .read(&mut buf)
                .await
                .map_err(|e| Error::with_source(ErrorKind::Unavailable, "task out stream read failed", e))?;
            if n == 0 {
                return Ok(());
            }
            self.route_out(task_id, stream, &buf[..n]).await?;
        }
    }

    async fn route_out(&self, task_id: u32, stream: &'static str, data: &[u8]) -> Result<()> {
        match &self.io_mode {
            IoMode::All => {
                let _ = self.out_tx.send(OutChunk { task_id, stream, data: data.to_vec() });
                Ok(())
            }
            IoMode::None => Ok(()),
            IoMode::Task(n) => {
                if task_id == *n {
                    let _ = self.out_tx.send(OutChunk { task_id, stream, data: data.to_vec() });
                }
                Ok(())
            }
            IoMode::Pattern(pattern) => {
                let sink = self.file_sink(pattern, task_id, stream).await?;
                let mut file = sink.lock().await;
                file.write_all(data)
                    .await
                    .map_err(|e| Error::with_source(ErrorKind::Internal, "per-task sink write failed", e))
            }
        }
    }

    async fn file_sink(
        &self,
        pattern: &str,
        task_id: u32,
        stream: &'static str,
    ) -> Result<Arc<tokio::sync::Mutex<tokio::fs::File>>> {
        if let Some(sink) = self.file_sinks.lock().get(&(task_id, stream)).cloned() {
            return Ok(sink);
        }
        let path = expand_pattern(pattern, &self.ctx, task_id, 0);
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| Error::with_source(ErrorKind::Internal, format!("open I/O sink {path}"), e))?;
        let sink = Arc::new(tokio::sync::Mutex::new(file));
        self.file_sinks.lock().insert((task_id, stream), sink.clone());
        Ok(sink)
    }

    /// Task stdin socket: shim writes client-routed bytes into it.
    async fn pump_task_stdin(&self, mut socket: TcpStream, task_id: u32) -> Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.stdin_txs.lock().insert(task_id, tx);
        while let Some(chunk) = rx.recv().await {
            if socket.write_all(&chunk).await.is_err() {
                break;
            }
        }
        self.stdin_txs.lock().remove(&task_id);
        Ok(())
    }

    /// Client connection reading the interleaved/forwarded output.
    async fn pump_client_out(&self, mut socket: TcpStream, wanted_stream: &'static str) -> Result<()> {
        let mut rx = self.out_tx.subscribe();
        loop {
            match rx.recv().await {
                Ok(chunk) if chunk.stream == wanted_stream => {
                    if socket.write_all(&chunk.data).await.is_err() {
                        return Ok(());
                    }
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            }
        }
    }

    /// Client stdin connection: bytes flow client -> shim -> tasks,
    /// per `stdin_mode` (spec 4.7: unicast on `taskN`, copy on
    /// `broadcast`).
    async fn pump_client_stdin(&self, mut socket: TcpStream) -> Result<()> {
        let mut buf = [0u8; 8192];
        loop {
            let n = socket
                .read(&mut buf)
                .await
                .map_err(|e| Error::with_source(ErrorKind::Unavailable, "client stdin read failed", e))?;
            if n == 0 {
                return Ok(());
            }
            let chunk = buf[..n].to_vec();
            match &self.stdin_mode {
                StdinMode::None => {}
                StdinMode::Task(target) => {
                    if let Some(tx) = self.stdin_txs.lock().get(target) {
                        let _ = tx.send(chunk);
                    }
                }
                StdinMode::Broadcast => {
                    for tx in self.stdin_txs.lock().values() {
                        let _ = tx.send(chunk.clone());
                    }
                }
            }
        }
    }
    /// Client SIGINT connection: one relay call per line received,
    /// so a terminal's double-Ctrl-C maps to two lines on the wire.
    async fn pump_client_sigint(&self, mut socket: TcpStream) -> Result<()> {
        let mut buf = [0u8; 64];
        loop {
            let n = socket
                .read(&mut buf)
                .await
                .map_err(|e| Error::with_source(ErrorKind::Unavailable, "client sigint read failed", e))?;
            if n == 0 {
                return Ok(());
            }
            if let Some(relay) = &self.signal_relay {
                if let Err(e) = relay.handle_sigint().await {
                    tracing::warn!(error = %e, "failed to relay client SIGINT");
                }
            }
        }
    }
}

enum Header<'a> {
    Task { task_id: u32, node_id: u32, stream: &'a str },
    Client { stream: &'a str },
}

async fn read_header_line(socket: &mut TcpStream) -> Result<String> {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = socket
            .read(&mut byte)
            .await
            .map_err(|e| Error::with_source(ErrorKind::Unavailable, "I/O header read failed", e))?;
        if n == 0 || byte[0] == b'\n' {
            break;
        }
        buf.push(byte[0]);
        if buf.len() > 256 {
            return Err(Error::validation("I/O connection header too long"));
        }
    }
    String::from_utf8(buf).map_err(|e| Error::with_source(ErrorKind::Validation, "I/O header not utf-8", e))
}

fn parse_header(line: &str) -> Result<Header<'_>> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    match fields.as_slice() {
        ["TASK", task_id, "NODE", node_id, "STREAM", stream] => Ok(Header::Task {
            task_id: task_id
                .parse()
                .map_err(|_| Error::validation("malformed TASK id in I/O header"))?,
            node_id: node_id
                .parse()
                .map_err(|_| Error::validation("malformed NODE id in I/O header"))?,
            stream,
        }),
        ["CLIENT", "STREAM", stream] => Ok(Header::Client { stream }),
        _ => Err(Error::validation(format!("malformed I/O connection header: {line}"))),
    }
}

/// Expands the per-task filename pattern (spec 4.7): `%t` task id,
/// `%n` node id, `%N` node name, `%j` job id, `%J` job.step, `%s` step
/// id, `%0<w><spec>` zero-padded width. The shim only ever learns a
/// numeric node id from a task's connection header (the node-name
/// table lives in the controller), so `%N` falls back to the numeric
/// id, matching `%n`.
fn expand_pattern(pattern: &str, ctx: &IoContext, task_id: u32, node_id: u32) -> String {
    let mut out = String::with_capacity(pattern.len());
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        let mut width = 0usize;
        if chars.peek() == Some(&'0') {
            chars.next();
            while let Some(d) = chars.peek().filter(|d| d.is_ascii_digit()) {
                width = width * 10 + d.to_digit(10).unwrap() as usize;
                chars.next();
            }
        }
        match chars.next() {
            Some('t') => out.push_str(&pad(task_id.to_string(), width)),
            Some('n') => out.push_str(&pad(node_id.to_string(), width)),
            Some('N') => out.push_str(&pad(node_id.to_string(), width)),
            Some('j') => out.push_str(&pad(ctx.job_id.to_string(), width)),
            Some('J') => out.push_str(&format!("{}.{}", ctx.job_id, ctx.step_id)),
            Some('s') => out.push_str(&pad(ctx.step_id.to_string(), width)),
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }
    out
}

fn pad(s: String, width: usize) -> String {
    if s.len() >= width {
        s
    } else {
        format!("{}{}", "0".repeat(width - s.len()), s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_mode_parses_named_variants() {
        assert!(matches!(IoMode::parse("all"), IoMode::All));
        assert!(matches!(IoMode::parse("none"), IoMode::None));
        assert!(matches!(IoMode::parse("task3"), IoMode::Task(3)));
        assert!(matches!(IoMode::parse("/tmp/out-%t.log"), IoMode::Pattern(_)));
    }

    #[test]
    fn stdin_mode_parses_named_variants() {
        assert!(matches!(StdinMode::parse("broadcast"), StdinMode::Broadcast));
        assert!(matches!(StdinMode::parse("task2"), StdinMode::Task(2)));
        assert!(matches!(StdinMode::parse("none"), StdinMode::None));
    }

    #[test]
    fn pattern_expands_zero_padded_task_id() {
        let ctx = IoContext { job_id: 7, step_id: 1 };
        let out = expand_pattern("out-%04t.%J.log", &ctx, 3, 0);
        assert_eq!(out, "out-0003.7.1.log");
    }

    #[test]
    fn header_parses_task_and_client_lines() {
        assert!(matches!(
            parse_header("TASK 3 NODE 1 STREAM stdout").unwrap(),
            Header::Task { task_id: 3, node_id: 1, stream: "stdout" }
        ));
        assert!(matches!(
            parse_header("CLIENT STREAM stdin").unwrap(),
            Header::Client { stream: "stdin" }
        ));
        assert!(parse_header("garbage").is_err());
    }
}
