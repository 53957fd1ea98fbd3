//! TOML-backed process definitions.
//!
//! The config file carries `[[process]]` tables, each one a [`ProcessSpec`].
//! On daemon start the store seeds the supervisor with every definition; the
//! `config.reload` method re-reads the file without a restart.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use super::kernel::{KernelContext, Plugin};
use super::supervisor::{ProcessSpec, ProcessSupervisor};
use crate::ipc::server::MethodError;

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default, rename = "process")]
    processes: Vec<ProcessSpec>,
}

#[derive(Clone)]
pub struct ConfigStore {
    path: PathBuf,
    supervisor: ProcessSupervisor,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>, supervisor: ProcessSupervisor) -> Self {
        Self {
            path: path.into(),
            supervisor,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the file and push every definition into the supervisor.
    ///
    /// A missing file is an empty configuration, not an error.
    pub fn load(&self) -> Result<usize> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No config file, starting empty");
                return Ok(0);
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read {}", self.path.display()))
            }
        };
        let config: ConfigFile = toml::from_str(&raw)
            .with_context(|| format!("invalid config in {}", self.path.display()))?;
        let count = config.processes.len();
        for spec in config.processes {
            self.supervisor.define(spec);
        }
        info!(path = %self.path.display(), processes = count, "Config loaded");
        Ok(count)
    }
}

#[async_trait]
impl Plugin for ConfigStore {
    fn name(&self) -> &str {
        "config"
    }

    async fn init(&self, ctx: &KernelContext) -> Result<()> {
        let count = self.load()?;
        ctx.bus.emit(
            "config:loaded",
            json!({ "path": self.path.display().to_string(), "processes": count }),
        )?;

        let store = self.clone();
        let bus = std::sync::Arc::clone(&ctx.bus);
        ctx.server.register_fn("config.reload", move |_params| {
            let store = store.clone();
            let bus = std::sync::Arc::clone(&bus);
            async move {
                let count = store
                    .load()
                    .map_err(|err| MethodError::server(err.to_string()))?;
                bus.emit(
                    "config:changed",
                    json!({ "path": store.path.display().to_string(), "processes": count }),
                )
                .map_err(MethodError::from)?;
                Ok(json!({ "processes": count }))
            }
        });
        Ok(())
    }
}
