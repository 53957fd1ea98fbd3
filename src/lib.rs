//! conductor: a local process orchestration daemon and its CLI.
//!
//! The crate splits into the transport core and the daemon built on it:
//!
//! - [`ipc`] carries JSON-RPC 2.0 over length-prefixed frames on a local
//!   socket, with a concurrent server and a request-correlating client.
//! - [`bus`] is the in-process event bus plugins publish lifecycle events on.
//! - [`fsm`] is the table-driven state machine each managed process runs.
//! - [`daemon`] assembles kernel, supervisor and config store into the
//!   long-running side; [`commands`] is the CLI talking to it.

pub mod args;
pub mod bus;
pub mod commands;
pub mod daemon;
pub mod env;
pub mod error;
pub mod fsm;
pub mod ipc;
pub mod output;

pub use bus::{EventBus, HandlerId};
pub use error::{IpcError, Result};
pub use fsm::{HookId, StateMachine};
pub use ipc::client::{ClientConfig, IpcClient};
pub use ipc::server::{IpcServer, MethodError, MethodHandler, ServerConfig};
