//! The long-running daemon side of conductor.
//!
//! The [`kernel`] hosts plugins over a shared IPC server and event bus; the
//! [`supervisor`] plugin manages child processes and the [`config_store`]
//! plugin seeds it from the TOML config file. [`runtime::run`] wires it all
//! together behind a pid file.

pub mod config_store;
pub mod kernel;
pub mod log_buffer;
pub mod pidfile;
pub mod runtime;
pub mod supervisor;

pub use config_store::ConfigStore;
pub use kernel::{Kernel, KernelContext, Plugin};
pub use log_buffer::LogBuffer;
pub use pidfile::PidFile;
pub use runtime::{run, DaemonOptions};
pub use supervisor::{ProcessInfo, ProcessSpec, ProcessState, ProcessSupervisor};
