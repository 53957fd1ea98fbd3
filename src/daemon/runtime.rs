//! Daemon entry point: pid file handling, kernel assembly, signal wiring.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use tokio::sync::watch;
use tracing::{info, warn};

use super::config_store::ConfigStore;
use super::kernel::Kernel;
use super::pidfile::PidFile;
use super::supervisor::ProcessSupervisor;
use crate::ipc::server::ServerConfig;

#[derive(Debug, Clone)]
pub struct DaemonOptions {
    pub socket_path: PathBuf,
    pub pid_path: PathBuf,
    pub config_path: PathBuf,
    pub tcp_port: u16,
}

impl Default for DaemonOptions {
    fn default() -> Self {
        Self {
            socket_path: crate::env::socket_path(),
            pid_path: crate::env::pid_path(),
            config_path: crate::env::config_path(),
            tcp_port: crate::env::tcp_port(),
        }
    }
}

/// Run the daemon in the foreground until a shutdown signal or RPC arrives.
pub async fn run(opts: DaemonOptions) -> Result<()> {
    let mut pidfile = PidFile::new(&opts.pid_path);
    if let Some(pid) = pidfile.live_pid() {
        bail!("daemon already running (pid {pid})");
    }
    pidfile.claim()?;

    let mut kernel = Kernel::new(ServerConfig {
        socket_path: opts.socket_path.clone(),
        tcp_port: opts.tcp_port,
    });
    let supervisor = ProcessSupervisor::new(Arc::clone(kernel.bus()));
    kernel.add_plugin(Arc::new(supervisor.clone()));
    kernel.add_plugin(Arc::new(ConfigStore::new(
        &opts.config_path,
        supervisor.clone(),
    )));

    kernel.start().await?;
    supervisor.start_autostart().await;
    spawn_signal_listener(kernel.shutdown_handle());
    info!(
        socket = %opts.socket_path.display(),
        pid = std::process::id(),
        "Daemon running"
    );

    kernel.wait_shutdown().await;
    info!("Shutting down");
    kernel.stop().await;
    Ok(())
}

#[cfg(unix)]
fn spawn_signal_listener(shutdown: watch::Sender<bool>) {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(err) => {
                warn!("Failed to install SIGTERM handler: {err}");
                return;
            }
        };
        tokio::select! {
            _ = term.recv() => info!("SIGTERM received"),
            _ = tokio::signal::ctrl_c() => info!("Interrupt received"),
        }
        shutdown.send(true).ok();
    });
}

#[cfg(not(unix))]
fn spawn_signal_listener(shutdown: watch::Sender<bool>) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received");
                shutdown.send(true).ok();
            }
            Err(err) => warn!("Failed to install interrupt handler: {err}"),
        }
    });
}
