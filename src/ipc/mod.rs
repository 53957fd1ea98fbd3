//! Inter-process communication substrate.
//!
//! The daemon and the CLI talk JSON-RPC 2.0 over a private stream transport
//! (Unix domain socket on POSIX, loopback TCP elsewhere). Layered leaves
//! first:
//!
//! ```text
//! ┌────────────────────────────────────────────────┐
//! │  server (dispatch)        client (correlation) │
//! ├────────────────────────────────────────────────┤
//! │  codec  — length-prefixed framing              │
//! ├────────────────────────────────────────────────┤
//! │  wire   — JSON-RPC message shapes, no I/O      │
//! └────────────────────────────────────────────────┘
//! ```

pub mod client;
pub mod codec;
pub mod server;
pub mod wire;

pub use client::{ClientConfig, IpcClient, DEFAULT_TIMEOUT};
pub use codec::{encode_frame, FrameDecoder, FrameError};
pub use server::{IpcServer, MethodError, MethodHandler, ServerConfig};
pub use wire::{Message, RequestId, RpcError};
