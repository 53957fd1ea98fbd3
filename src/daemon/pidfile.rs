//! Pid file bookkeeping for the daemon process.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};

pub struct PidFile {
    path: PathBuf,
    owned: bool,
}

impl PidFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            owned: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Pid recorded in the file, if it exists and parses.
    pub fn read(&self) -> Option<u32> {
        let raw = std::fs::read_to_string(&self.path).ok()?;
        raw.trim().parse().ok()
    }

    /// Pid of a live daemon recorded in the file, if any.
    ///
    /// A file pointing at a dead pid is stale, not a running daemon.
    pub fn live_pid(&self) -> Option<u32> {
        let pid = self.read()?;
        if process_alive(pid) {
            Some(pid)
        } else {
            debug!(pid = pid, "Stale pid file ignored");
            None
        }
    }

    /// Record the current process. The file is removed again on drop.
    pub fn claim(&mut self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, format!("{}\n", std::process::id()))
            .with_context(|| format!("failed to write pid file {}", self.path.display()))?;
        self.owned = true;
        Ok(())
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if self.owned {
            if let Err(err) = std::fs::remove_file(&self.path) {
                warn!(path = %self.path.display(), "Failed to remove pid file: {err}");
            }
        }
    }
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    // Signal 0 probes for existence without delivering anything.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    // No cheap liveness probe; treat any recorded pid as live and let the
    // bind failure report the real story.
    true
}
