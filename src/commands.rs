//! CLI command implementations: thin wrappers over the daemon's RPC surface.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde_json::json;

use crate::daemon::runtime::{self, DaemonOptions};
use crate::daemon::supervisor::{ProcessInfo, ProcessSpec};
use crate::ipc::client::{ClientConfig, IpcClient};
use crate::output::Console;

fn client_config(socket: Option<PathBuf>) -> ClientConfig {
    let mut config = ClientConfig::default();
    if let Some(socket) = socket {
        config.socket_path = socket;
    }
    config
}

async fn connected_client(socket: Option<PathBuf>) -> Result<IpcClient> {
    let client = IpcClient::new(client_config(socket));
    client
        .connect()
        .await
        .context("cannot reach the daemon; is it running? (conductor daemon run)")?;
    Ok(client)
}

pub async fn daemon_run(socket: Option<PathBuf>) -> Result<()> {
    let mut opts = DaemonOptions::default();
    if let Some(socket) = socket {
        opts.socket_path = socket;
    }
    runtime::run(opts).await
}

pub async fn daemon_status(console: &Console, socket: Option<PathBuf>) -> Result<()> {
    let client = connected_client(socket).await?;
    let status = client.call("daemon.status", None).await?;
    client.disconnect().await;

    console.success("daemon is running");
    for key in ["version", "pid", "uptime_secs"] {
        if let Some(value) = status.get(key) {
            console.detail(key, value);
        }
    }
    if let Some(plugins) = status.get("plugins").and_then(|p| p.as_array()) {
        let names: Vec<&str> = plugins.iter().filter_map(|p| p.as_str()).collect();
        console.detail("plugins", names.join(", "));
    }
    Ok(())
}

pub async fn daemon_shutdown(console: &Console, socket: Option<PathBuf>) -> Result<()> {
    let client = connected_client(socket).await?;
    client.call("daemon.shutdown", None).await?;
    client.disconnect().await;
    console.success("shutdown requested");
    Ok(())
}

pub async fn list(console: &Console, socket: Option<PathBuf>) -> Result<()> {
    let client = connected_client(socket).await?;
    let result = client.call("list", None).await?;
    client.disconnect().await;

    let processes: Vec<ProcessInfo> =
        serde_json::from_value(result).context("unexpected response shape from daemon")?;
    if processes.is_empty() {
        console.info("no processes defined");
        return Ok(());
    }
    console.line(format!(
        "{:<20} {:<10} {:>8} {:>10} {:>9}",
        "NAME", "STATE", "PID", "UPTIME", "RESTARTS"
    ));
    for p in processes {
        let pid = p.pid.map(|pid| pid.to_string()).unwrap_or_else(|| "-".into());
        let uptime = p
            .uptime_secs
            .map(|s| format!("{s}s"))
            .unwrap_or_else(|| "-".into());
        console.line(format!(
            "{:<20} {:<10} {:>8} {:>10} {:>9}",
            p.name, p.state, pid, uptime, p.restarts
        ));
        if let Some(err) = p.last_error {
            console.detail("last error", err);
        }
    }
    Ok(())
}

pub async fn start(
    console: &Console,
    socket: Option<PathBuf>,
    name: String,
    command: Option<String>,
    args: Vec<String>,
) -> Result<()> {
    let spec = command.map(|command| ProcessSpec {
        name: name.clone(),
        command,
        args,
        env: Default::default(),
        cwd: None,
        autorestart: true,
        max_restarts: 3,
        autostart: false,
    });
    let params = json!({ "name": name, "spec": spec });

    let client = connected_client(socket).await?;
    client.call("start", Some(params)).await?;
    client.disconnect().await;
    console.success(format!("started {name}"));
    Ok(())
}

pub async fn stop(
    console: &Console,
    socket: Option<PathBuf>,
    name: String,
    force: bool,
) -> Result<()> {
    let client = connected_client(socket).await?;
    client
        .call("stop", Some(json!({ "name": name, "force": force })))
        .await?;
    client.disconnect().await;
    console.success(format!("stopped {name}"));
    Ok(())
}

pub async fn restart(console: &Console, socket: Option<PathBuf>, name: String) -> Result<()> {
    let client = connected_client(socket).await?;
    client.call("restart", Some(json!({ "name": name }))).await?;
    client.disconnect().await;
    console.success(format!("restarted {name}"));
    Ok(())
}

pub async fn delete(console: &Console, socket: Option<PathBuf>, name: String) -> Result<()> {
    let client = connected_client(socket).await?;
    client.call("delete", Some(json!({ "name": name }))).await?;
    client.disconnect().await;
    console.success(format!("deleted {name}"));
    Ok(())
}

pub async fn logs(
    console: &Console,
    socket: Option<PathBuf>,
    name: String,
    lines: usize,
) -> Result<()> {
    let client = connected_client(socket).await?;
    let result = client
        .call("logs", Some(json!({ "name": name, "lines": lines })))
        .await?;
    client.disconnect().await;

    let captured = result
        .get("lines")
        .and_then(|l| l.as_array())
        .context("unexpected response shape from daemon")?;
    if captured.is_empty() {
        console.info(format!("no output captured for {name}"));
        return Ok(());
    }
    for line in captured.iter().filter_map(|l| l.as_str()) {
        console.line(line);
    }
    Ok(())
}
