//! Environment-driven configuration: socket, pid and config file locations.
//!
//! The socket path is a fixed, documented value per daemon instance, not
//! negotiated. Every value can be overridden through a `CONDUCTOR_*` env var
//! for tests and multi-instance setups.

use std::path::PathBuf;

pub const ENV_DIR: &str = "CONDUCTOR_DIR";
pub const ENV_SOCKET: &str = "CONDUCTOR_SOCKET";
pub const ENV_PID: &str = "CONDUCTOR_PID";
pub const ENV_CONFIG: &str = "CONDUCTOR_CONFIG";
pub const ENV_TCP_PORT: &str = "CONDUCTOR_TCP_PORT";

const FALLBACK_BASE_DIR: &str = "~/.config";
const SUBDIR: &str = "conductor";

/// Loopback port used on platforms without usable Unix sockets.
pub const DEFAULT_TCP_PORT: u16 = 14731;

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Base directory for daemon state ($CONDUCTOR_DIR or ~/.config/conductor).
pub fn base_dir() -> PathBuf {
    let dir = env_opt(ENV_DIR).map(PathBuf::from).unwrap_or_else(|| {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(FALLBACK_BASE_DIR))
            .join(SUBDIR)
    });
    tracing::trace!(dir = %dir.display(), "Resolved base directory");
    dir
}

/// Daemon socket path ($CONDUCTOR_SOCKET or <base>/conductord.sock).
pub fn socket_path() -> PathBuf {
    env_opt(ENV_SOCKET)
        .map(PathBuf::from)
        .unwrap_or_else(|| base_dir().join("conductord.sock"))
}

/// Daemon pid file path ($CONDUCTOR_PID or <base>/conductord.pid).
pub fn pid_path() -> PathBuf {
    env_opt(ENV_PID)
        .map(PathBuf::from)
        .unwrap_or_else(|| base_dir().join("conductord.pid"))
}

/// Process definitions file ($CONDUCTOR_CONFIG or <base>/processes.toml).
pub fn config_path() -> PathBuf {
    env_opt(ENV_CONFIG)
        .map(PathBuf::from)
        .unwrap_or_else(|| base_dir().join("processes.toml"))
}

/// Loopback TCP port for non-POSIX platforms ($CONDUCTOR_TCP_PORT or default).
pub fn tcp_port() -> u16 {
    env_opt(ENV_TCP_PORT)
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_TCP_PORT)
}
