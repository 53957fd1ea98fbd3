use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use crate::ipc::codec::FrameError;

/// Errors surfaced by the IPC substrate.
///
/// Transport failures, timeouts and server-reported RPC errors are distinct
/// variants so callers can tell "the daemon said no" apart from "the daemon
/// is gone" and decide whether a retry makes sense.
#[derive(Error, Debug)]
pub enum IpcError {
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    #[error("not connected")]
    NotConnected,

    #[error("already connected")]
    AlreadyConnected,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("server already started")]
    AlreadyStarted,

    #[error("timed out after {after:?} waiting for response to '{method}'")]
    Timeout { method: String, after: Duration },

    #[error("rpc error {code}: {message}")]
    Rpc {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    #[error("framing error: {0}")]
    Frame(#[from] FrameError),

    #[error("serialization error: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, IpcError>;
