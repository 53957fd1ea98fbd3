//! IPC client: one connection to the daemon, any number of concurrent,
//! independently-awaited calls over it.
//!
//! Each call gets a fresh monotonically increasing id; a background reader
//! task correlates every incoming response back to the caller that issued the
//! matching request. Disconnects, peer closes and timeouts all resolve the
//! affected callers deterministically; a call is never left pending forever.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::{IpcError, Result};
use crate::ipc::codec::{encode_frame, FrameDecoder};
use crate::ipc::wire::{Message, RequestId};

/// Default per-call timeout, measured from send.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(30_000);

#[cfg(unix)]
type Stream = tokio::net::UnixStream;
#[cfg(unix)]
type WriteHalf = tokio::net::unix::OwnedWriteHalf;
#[cfg(unix)]
type ReadHalf = tokio::net::unix::OwnedReadHalf;

#[cfg(not(unix))]
type Stream = tokio::net::TcpStream;
#[cfg(not(unix))]
type WriteHalf = tokio::net::tcp::OwnedWriteHalf;
#[cfg(not(unix))]
type ReadHalf = tokio::net::tcp::OwnedReadHalf;

/// Where to connect and how long to wait on each call.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub socket_path: std::path::PathBuf,
    pub tcp_port: u16,
    pub timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            socket_path: crate::env::socket_path(),
            tcp_port: crate::env::tcp_port(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

type Waiter = oneshot::Sender<std::result::Result<Value, IpcError>>;
type Pending = Arc<std::sync::Mutex<HashMap<u64, Waiter>>>;

struct Connection {
    writer: Arc<Mutex<WriteHalf>>,
    pending: Pending,
    next_id: AtomicU64,
    open: Arc<AtomicBool>,
    reader_task: JoinHandle<()>,
}

/// The caller-side request-correlation engine.
pub struct IpcClient {
    config: ClientConfig,
    conn: Mutex<Option<Connection>>,
}

impl IpcClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            conn: Mutex::new(None),
        }
    }

    /// Open the transport connection.
    ///
    /// Not idempotent: connecting while already connected is an explicit
    /// error rather than a second hidden connection.
    pub async fn connect(&self) -> Result<()> {
        let mut conn = self.conn.lock().await;
        if conn.is_some() {
            return Err(IpcError::AlreadyConnected);
        }

        let stream = open_stream(&self.config).await?;
        let (read_half, write_half) = stream.into_split();

        let pending: Pending = Arc::new(std::sync::Mutex::new(HashMap::new()));
        let open = Arc::new(AtomicBool::new(true));
        let reader_task = tokio::spawn(read_loop(
            read_half,
            Arc::clone(&pending),
            Arc::clone(&open),
        ));

        *conn = Some(Connection {
            writer: Arc::new(Mutex::new(write_half)),
            pending,
            next_id: AtomicU64::new(1),
            open,
            reader_task,
        });
        trace!("Connected to daemon");
        Ok(())
    }

    pub async fn is_connected(&self) -> bool {
        self.conn
            .lock()
            .await
            .as_ref()
            .is_some_and(|c| c.open.load(Ordering::Acquire))
    }

    /// Issue one request and await its own response.
    ///
    /// Resolves with the handler's result, or fails with the server-reported
    /// error, a timeout, or a connection failure. Multiple calls may be
    /// outstanding at once and complete in any order.
    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let (writer, pending, id) = {
            let conn = self.conn.lock().await;
            let conn = conn.as_ref().ok_or(IpcError::NotConnected)?;
            if !conn.open.load(Ordering::Acquire) {
                return Err(IpcError::ConnectionClosed);
            }
            (
                Arc::clone(&conn.writer),
                Arc::clone(&conn.pending),
                conn.next_id.fetch_add(1, Ordering::Relaxed),
            )
        };

        let (tx, rx) = oneshot::channel();
        pending
            .lock()
            .expect("pending map lock poisoned")
            .insert(id, tx);

        let message = Message::request(Some(RequestId::from(id)), method, params);
        if let Err(err) = write_message(&writer, &message).await {
            pending
                .lock()
                .expect("pending map lock poisoned")
                .remove(&id);
            return Err(err);
        }
        trace!(method = %method, id = id, "Request sent");

        match tokio::time::timeout(self.config.timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            // Waiter dropped without a response: reader task tore down.
            Ok(Err(_)) => Err(IpcError::ConnectionClosed),
            Err(_) => {
                pending
                    .lock()
                    .expect("pending map lock poisoned")
                    .remove(&id);
                debug!(method = %method, id = id, "Call timed out");
                Err(IpcError::Timeout {
                    method: method.to_string(),
                    after: self.config.timeout,
                })
            }
        }
    }

    /// Send a notification (`id = null`). Resolves once the bytes are handed
    /// to the transport; no response is expected or waited for.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let writer = {
            let conn = self.conn.lock().await;
            let conn = conn.as_ref().ok_or(IpcError::NotConnected)?;
            if !conn.open.load(Ordering::Acquire) {
                return Err(IpcError::ConnectionClosed);
            }
            Arc::clone(&conn.writer)
        };
        let message = Message::request(None, method, params);
        write_message(&writer, &message).await
    }

    /// Close the connection, failing every still-pending call.
    ///
    /// Safe to call when never connected.
    pub async fn disconnect(&self) {
        let Some(conn) = self.conn.lock().await.take() else {
            return;
        };
        conn.open.store(false, Ordering::Release);
        conn.reader_task.abort();
        fail_all_pending(&conn.pending);
        conn.writer.lock().await.shutdown().await.ok();
        trace!("Disconnected from daemon");
    }
}

#[cfg(unix)]
async fn open_stream(config: &ClientConfig) -> Result<Stream> {
    Ok(Stream::connect(&config.socket_path).await?)
}

#[cfg(not(unix))]
async fn open_stream(config: &ClientConfig) -> Result<Stream> {
    Ok(Stream::connect(("127.0.0.1", config.tcp_port)).await?)
}

async fn write_message(writer: &Arc<Mutex<WriteHalf>>, message: &Message) -> Result<()> {
    let frame = encode_frame(&message.serialize()?)?;
    let mut writer = writer.lock().await;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Background task: decode frames, correlate responses to waiting callers.
async fn read_loop(mut reader: ReadHalf, pending: Pending, open: Arc<AtomicBool>) {
    let mut decoder = FrameDecoder::new();
    let mut chunk = [0u8; 8192];

    'outer: loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) => {
                debug!("Daemon closed the connection");
                break;
            }
            Ok(n) => n,
            Err(err) => {
                debug!("Connection read error: {err}");
                break;
            }
        };
        decoder.push(&chunk[..n]);
        loop {
            match decoder.next_frame() {
                Ok(Some(frame)) => settle_frame(&frame, &pending),
                Ok(None) => break,
                Err(err) => {
                    warn!("Framing error from daemon: {err}");
                    break 'outer;
                }
            }
        }
    }

    open.store(false, Ordering::Release);
    fail_all_pending(&pending);
}

fn settle_frame(frame: &[u8], pending: &Pending) {
    let Some(message) = Message::parse(frame) else {
        warn!("Discarding unparseable message from daemon");
        return;
    };
    let (id, outcome) = match message {
        Message::Success { id, result } => (id, Ok(result)),
        Message::Error { id, error } => (
            id,
            Err(IpcError::Rpc {
                code: error.code,
                message: error.message,
                data: error.data,
            }),
        ),
        Message::Request { method, .. } => {
            trace!(method = %method, "Ignoring request-shaped message from daemon");
            return;
        }
    };
    let Some(RequestId::Int(id)) = id else {
        debug!("Response with null or non-numeric id discarded");
        return;
    };
    let waiter = pending
        .lock()
        .expect("pending map lock poisoned")
        .remove(&(id as u64));
    match waiter {
        // Receiver may have timed out already; a dead send is fine.
        Some(waiter) => drop(waiter.send(outcome)),
        None => debug!(id = id, "Response with no outstanding call discarded"),
    }
}

fn fail_all_pending(pending: &Pending) {
    let waiters: Vec<Waiter> = {
        let mut pending = pending.lock().expect("pending map lock poisoned");
        pending.drain().map(|(_, w)| w).collect()
    };
    for waiter in waiters {
        waiter.send(Err(IpcError::ConnectionClosed)).ok();
    }
}
