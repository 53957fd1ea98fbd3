//! IPC server: listens on the daemon socket, accepts concurrent client
//! connections and dispatches decoded requests to registered method handlers.
//!
//! Every accepted connection gets its own accumulation buffer and read loop,
//! fully isolated from the others. Requests on one connection are dispatched
//! concurrently and may complete out of order; each response carries the
//! request's own id so the client can re-associate them.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::error::{IpcError, Result};
use crate::ipc::codec::{encode_frame, FrameDecoder};
use crate::ipc::wire::{self, Message, RequestId};

/// Failure reported by a method handler.
///
/// Carries the wire error code directly so a handler can tag a failure as its
/// own (`server`) instead of an internal fault, or reject bad parameters.
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct MethodError {
    pub code: i64,
    pub message: String,
    pub data: Option<Value>,
}

impl MethodError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            code: wire::INTERNAL_ERROR,
            message: message.into(),
            data: None,
        }
    }

    pub fn server(message: impl Into<String>) -> Self {
        Self {
            code: wire::SERVER_ERROR,
            message: message.into(),
            data: None,
        }
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self {
            code: wire::INVALID_PARAMS,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

impl From<anyhow::Error> for MethodError {
    fn from(err: anyhow::Error) -> Self {
        MethodError::internal(err.to_string())
    }
}

/// One RPC surface contributed by the kernel or a plugin.
#[async_trait]
pub trait MethodHandler: Send + Sync {
    async fn handle(&self, params: Option<Value>) -> std::result::Result<Value, MethodError>;
}

type BoxHandlerFn =
    Box<dyn Fn(Option<Value>) -> BoxFuture<'static, std::result::Result<Value, MethodError>> + Send + Sync>;

struct FnHandler(BoxHandlerFn);

#[async_trait]
impl MethodHandler for FnHandler {
    async fn handle(&self, params: Option<Value>) -> std::result::Result<Value, MethodError> {
        (self.0)(params).await
    }
}

/// Transport address the server binds to.
///
/// `socket_path` is used on POSIX; `tcp_port` (loopback only) everywhere else.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub socket_path: std::path::PathBuf,
    pub tcp_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: crate::env::socket_path(),
            tcp_port: crate::env::tcp_port(),
        }
    }
}

type Registry = Arc<RwLock<HashMap<String, Arc<dyn MethodHandler>>>>;

struct Listening {
    shutdown: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

/// The daemon-side connection/dispatch engine.
pub struct IpcServer {
    config: ServerConfig,
    methods: Registry,
    listening: Mutex<Option<Listening>>,
}

impl IpcServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            methods: Arc::new(RwLock::new(HashMap::new())),
            listening: Mutex::new(None),
        }
    }

    /// Register (or replace) the handler for `name`. Last registration wins.
    ///
    /// Callable before or after [`start`](Self::start); visible to the next
    /// dispatch immediately, never to dispatches already in flight.
    pub fn register_method(&self, name: impl Into<String>, handler: Arc<dyn MethodHandler>) {
        let name = name.into();
        debug!(method = %name, "Registering method handler");
        self.methods
            .write()
            .expect("method registry lock poisoned")
            .insert(name, handler);
    }

    /// Closure convenience over [`register_method`](Self::register_method).
    pub fn register_fn<F, Fut>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = std::result::Result<Value, MethodError>> + Send + 'static,
    {
        self.register_method(
            name,
            Arc::new(FnHandler(Box::new(move |params| Box::pin(f(params))))),
        );
    }

    /// Begin listening on the configured transport address.
    ///
    /// Errors if already started: a daemon instance owns exactly one listener.
    /// A stale socket file left by a prior unclean shutdown is removed first.
    pub async fn start(&self) -> Result<()> {
        let mut listening = self.listening.lock().await;
        if listening.is_some() {
            return Err(IpcError::AlreadyStarted);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let accept_task = self.bind_and_accept(shutdown_rx).await?;

        *listening = Some(Listening {
            shutdown: shutdown_tx,
            accept_task,
        });
        Ok(())
    }

    #[cfg(unix)]
    async fn bind_and_accept(&self, shutdown: watch::Receiver<bool>) -> Result<JoinHandle<()>> {
        let path = self.config.socket_path.clone();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if path.exists() {
            debug!(path = %path.display(), "Removing stale socket file");
            std::fs::remove_file(&path)?;
        }
        let listener = tokio::net::UnixListener::bind(&path)?;
        info!(path = %path.display(), "IPC server listening");

        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;

        let methods = Arc::clone(&self.methods);
        Ok(tokio::spawn(accept_loop(listener, methods, shutdown)))
    }

    #[cfg(not(unix))]
    async fn bind_and_accept(&self, shutdown: watch::Receiver<bool>) -> Result<JoinHandle<()>> {
        let addr = format!("127.0.0.1:{}", self.config.tcp_port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        info!(addr = %addr, "IPC server listening");

        let methods = Arc::clone(&self.methods);
        Ok(tokio::spawn(accept_loop(listener, methods, shutdown)))
    }

    /// Stop accepting, close every open connection, release the listener.
    ///
    /// Safe to call when never started, and safe to call twice.
    pub async fn stop(&self) {
        let Some(listening) = self.listening.lock().await.take() else {
            return;
        };
        listening.shutdown.send(true).ok();
        if let Err(err) = listening.accept_task.await {
            if !err.is_cancelled() {
                error!("Accept loop task failed: {err}");
            }
        }
        #[cfg(unix)]
        if self.config.socket_path.exists() {
            std::fs::remove_file(&self.config.socket_path).ok();
        }
        info!("IPC server stopped");
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

#[cfg(unix)]
async fn accept_loop(
    listener: tokio::net::UnixListener,
    methods: Registry,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            conn = listener.accept() => match conn {
                Ok((stream, _)) => {
                    let methods = Arc::clone(&methods);
                    let shutdown = shutdown.clone();
                    tokio::spawn(serve_connection(stream, methods, shutdown));
                }
                Err(err) => error!("Accept error: {err}"),
            },
            _ = shutdown.changed() => break,
        }
    }
}

#[cfg(not(unix))]
async fn accept_loop(
    listener: tokio::net::TcpListener,
    methods: Registry,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            conn = listener.accept() => match conn {
                Ok((stream, _)) => {
                    let methods = Arc::clone(&methods);
                    let shutdown = shutdown.clone();
                    tokio::spawn(serve_connection(stream, methods, shutdown));
                }
                Err(err) => error!("Accept error: {err}"),
            },
            _ = shutdown.changed() => break,
        }
    }
}

/// Per-connection read/decode/dispatch loop.
///
/// Exits on peer disconnect, transport error, framing error or server stop.
/// A handler failure never tears the connection down.
async fn serve_connection<S>(stream: S, methods: Registry, mut shutdown: watch::Receiver<bool>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    trace!("Connection accepted");
    let (mut reader, writer) = tokio::io::split(stream);
    let writer = Arc::new(Mutex::new(writer));
    let mut decoder = FrameDecoder::new();
    let mut chunk = [0u8; 8192];

    'conn: loop {
        tokio::select! {
            read = reader.read(&mut chunk) => {
                let n = match read {
                    Ok(0) => {
                        trace!("Peer disconnected");
                        break 'conn;
                    }
                    Ok(n) => n,
                    Err(err) => {
                        debug!("Connection read error: {err}");
                        break 'conn;
                    }
                };
                decoder.push(&chunk[..n]);
                loop {
                    match decoder.next_frame() {
                        Ok(Some(frame)) => {
                            if !dispatch_frame(&frame, &methods, &writer) {
                                break 'conn;
                            }
                        }
                        Ok(None) => break,
                        Err(err) => {
                            warn!("Closing connection: {err}");
                            break 'conn;
                        }
                    }
                }
            }
            _ = shutdown.changed() => {
                trace!("Server stopping, closing connection");
                break 'conn;
            }
        }
    }

    // In-flight handler tasks still hold writer clones; shutting the stream
    // down here makes the close visible to the peer immediately instead of
    // when the last handler finishes.
    writer.lock().await.shutdown().await.ok();
}

/// Route one decoded frame. Returns `false` when the connection must close.
fn dispatch_frame<W>(frame: &[u8], methods: &Registry, writer: &Arc<Mutex<W>>) -> bool
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    let Some(message) = Message::parse(frame) else {
        // Malformed payload: answer only if an id can be recovered from the
        // raw bytes, otherwise the connection is not worth keeping.
        return match Message::recover_id(frame) {
            Some(id) => {
                warn!("Request failed to parse, replying with parse error");
                let response =
                    Message::error(Some(id), wire::PARSE_ERROR, "invalid request payload", None);
                spawn_write(Arc::clone(writer), response);
                true
            }
            None => {
                warn!("Unparseable payload with no recoverable id, closing connection");
                false
            }
        };
    };

    match message {
        Message::Request {
            id: Some(id),
            method,
            params,
        } => {
            let methods = Arc::clone(methods);
            let writer = Arc::clone(writer);
            tokio::spawn(async move {
                let response = run_handler(&methods, &method, params, id).await;
                write_message(&writer, &response).await;
            });
        }
        Message::Request {
            id: None,
            method,
            params,
        } => {
            // Notification: run the handler if one exists, never respond.
            let handler = lookup(methods, &method);
            match handler {
                Some(handler) => {
                    tokio::spawn(async move {
                        if let Err(err) = handler.handle(params).await {
                            debug!(method = %method, "Notification handler failed: {err}");
                        }
                    });
                }
                None => trace!(method = %method, "Notification for unknown method dropped"),
            }
        }
        Message::Success { .. } | Message::Error { .. } => {
            trace!("Ignoring response-shaped message from client");
        }
    }
    true
}

fn lookup(methods: &Registry, name: &str) -> Option<Arc<dyn MethodHandler>> {
    methods
        .read()
        .expect("method registry lock poisoned")
        .get(name)
        .cloned()
}

async fn run_handler(
    methods: &Registry,
    method: &str,
    params: Option<Value>,
    id: RequestId,
) -> Message {
    let Some(handler) = lookup(methods, method) else {
        debug!(method = %method, "Method not found");
        return Message::error(
            Some(id),
            wire::METHOD_NOT_FOUND,
            format!("method not found: {method}"),
            None,
        );
    };
    trace!(method = %method, "Dispatching request");
    match handler.handle(params).await {
        Ok(result) => Message::success(Some(id), result),
        Err(err) => {
            debug!(method = %method, code = err.code, "Handler failed: {err}");
            Message::error(Some(id), err.code, err.message, err.data)
        }
    }
}

fn spawn_write<W>(writer: Arc<Mutex<W>>, message: Message)
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        write_message(&writer, &message).await;
    });
}

async fn write_message<W>(writer: &Arc<Mutex<W>>, message: &Message)
where
    W: AsyncWrite + Send + Unpin,
{
    let frame = match message.serialize().map_err(IpcError::from).and_then(|bytes| {
        encode_frame(&bytes).map_err(IpcError::from)
    }) {
        Ok(frame) => frame,
        Err(err) => {
            error!("Failed to encode response: {err}");
            return;
        }
    };
    let mut writer = writer.lock().await;
    if let Err(err) = writer.write_all(&frame).await {
        debug!("Failed to write response: {err}");
        return;
    }
    if let Err(err) = writer.flush().await {
        debug!("Failed to flush response: {err}");
    }
}
