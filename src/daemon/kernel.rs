//! Plugin kernel: owns the shared event bus and the IPC server, loads
//! plugins and wires their RPC surfaces and event subscriptions.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::bus::EventBus;
use crate::ipc::server::{IpcServer, ServerConfig};

/// One unit of orchestration logic hosted by the kernel.
///
/// `init` runs before the server starts listening; it is where a plugin
/// registers its RPC methods and event subscriptions through the context.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    async fn init(&self, ctx: &KernelContext) -> Result<()>;

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

/// Capabilities handed to each plugin during `init`.
pub struct KernelContext {
    pub server: Arc<IpcServer>,
    pub bus: Arc<EventBus>,
}

pub struct Kernel {
    server: Arc<IpcServer>,
    bus: Arc<EventBus>,
    plugins: Vec<Arc<dyn Plugin>>,
    started_at: Instant,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Kernel {
    pub fn new(server_config: ServerConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            server: Arc::new(IpcServer::new(server_config)),
            bus: Arc::new(EventBus::new()),
            plugins: Vec::new(),
            started_at: Instant::now(),
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub fn server(&self) -> &Arc<IpcServer> {
        &self.server
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn add_plugin(&mut self, plugin: Arc<dyn Plugin>) {
        self.plugins.push(plugin);
    }

    /// Handle that trips the kernel's shutdown from anywhere.
    pub fn shutdown_handle(&self) -> watch::Sender<bool> {
        self.shutdown_tx.clone()
    }

    /// Initialize every plugin, register the kernel's own RPC surface and
    /// start the listener.
    pub async fn start(&self) -> Result<()> {
        self.register_kernel_methods();

        let ctx = KernelContext {
            server: Arc::clone(&self.server),
            bus: Arc::clone(&self.bus),
        };
        for plugin in &self.plugins {
            plugin
                .init(&ctx)
                .await
                .with_context(|| format!("plugin '{}' failed to initialize", plugin.name()))?;
            info!(plugin = plugin.name(), "Plugin initialized");
            self.bus
                .emit("kernel:plugin_loaded", json!({ "name": plugin.name() }))?;
        }

        self.server.start().await?;
        self.bus.emit("daemon:started", Value::Null)?;
        Ok(())
    }

    fn register_kernel_methods(&self) {
        let started_at = self.started_at;
        let plugin_names: Vec<String> =
            self.plugins.iter().map(|p| p.name().to_string()).collect();
        self.server.register_fn("daemon.status", move |_params| {
            let plugins = plugin_names.clone();
            async move {
                Ok(json!({
                    "version": env!("CARGO_PKG_VERSION"),
                    "pid": std::process::id(),
                    "uptime_secs": started_at.elapsed().as_secs(),
                    "plugins": plugins,
                }))
            }
        });

        let shutdown = self.shutdown_tx.clone();
        self.server.register_fn("daemon.shutdown", move |_params| {
            let shutdown = shutdown.clone();
            async move {
                info!("Shutdown requested over IPC");
                shutdown.send(true).ok();
                Ok(Value::Null)
            }
        });
    }

    /// Block until something trips the shutdown handle.
    pub async fn wait_shutdown(&self) {
        let mut rx = self.shutdown_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Tear down: plugins in reverse load order, then the server and bus.
    pub async fn stop(&self) {
        self.bus.emit("daemon:stopping", Value::Null).ok();
        for plugin in self.plugins.iter().rev() {
            if let Err(err) = plugin.shutdown().await {
                warn!(plugin = plugin.name(), "Plugin shutdown failed: {err}");
            }
        }
        self.server.stop().await;
        self.bus.remove_all();
        info!("Kernel stopped");
    }
}
