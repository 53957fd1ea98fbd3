//! Process supervisor plugin: spawns, watches and restarts managed child
//! processes, and exposes the `list`/`start`/`stop`/`restart`/`delete`/`logs`
//! RPC surface.
//!
//! Each managed process drives its lifecycle through its own state machine;
//! an after-transition hook broadcasts every state change on the event bus so
//! other plugins can observe lifecycles without touching the supervisor.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::kernel::{KernelContext, Plugin};
use super::log_buffer::LogBuffer;
use crate::bus::EventBus;
use crate::fsm::StateMachine;
use crate::ipc::server::MethodError;

const WATCHDOG_INTERVAL: Duration = Duration::from_secs(1);
const GRACEFUL_STOP_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_LOG_LINES: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
}

impl ProcessState {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessState::Stopped => "stopped",
            ProcessState::Starting => "starting",
            ProcessState::Running => "running",
            ProcessState::Stopping => "stopping",
            ProcessState::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessEvent {
    Spawn,
    Spawned,
    SpawnFailed,
    Stop,
    Exited,
    Crash,
}

impl ProcessEvent {
    fn as_str(self) -> &'static str {
        match self {
            ProcessEvent::Spawn => "spawn",
            ProcessEvent::Spawned => "spawned",
            ProcessEvent::SpawnFailed => "spawn_failed",
            ProcessEvent::Stop => "stop",
            ProcessEvent::Exited => "exited",
            ProcessEvent::Crash => "crash",
        }
    }
}

fn lifecycle_rules() -> Vec<(ProcessState, ProcessEvent, ProcessState)> {
    use ProcessEvent::*;
    use ProcessState::*;
    vec![
        (Stopped, Spawn, Starting),
        (Failed, Spawn, Starting),
        (Starting, Spawned, Running),
        (Starting, SpawnFailed, Failed),
        (Running, Stop, Stopping),
        (Running, Exited, Stopped),
        (Running, Crash, Failed),
        (Stopping, Exited, Stopped),
    ]
}

/// Declarative definition of one managed process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessSpec {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub cwd: Option<std::path::PathBuf>,
    #[serde(default = "default_true")]
    pub autorestart: bool,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde(default)]
    pub autostart: bool,
}

fn default_true() -> bool {
    true
}

fn default_max_restarts() -> u32 {
    3
}

/// Snapshot returned by the `list` method.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub name: String,
    pub state: String,
    pub pid: Option<u32>,
    pub uptime_secs: Option<u64>,
    pub restarts: u32,
    pub last_error: Option<String>,
}

struct ManagedProcess {
    spec: ProcessSpec,
    machine: StateMachine<ProcessState, ProcessEvent>,
    child: Option<Child>,
    started_at: Option<Instant>,
    restarts: u32,
    last_error: Option<String>,
}

impl ManagedProcess {
    fn new(spec: ProcessSpec, bus: Arc<EventBus>) -> Self {
        let name = spec.name.clone();
        let mut machine = StateMachine::new(ProcessState::Stopped, lifecycle_rules());
        machine.after_transition(move |from, to, event| -> BoxFuture<'static, Result<()>> {
            let bus = Arc::clone(&bus);
            let payload = json!({
                "name": name.clone(),
                "from": from.as_str(),
                "to": to.as_str(),
                "event": event.as_str(),
            });
            Box::pin(async move { bus.emit("process:state", payload) })
        });
        Self {
            spec,
            machine,
            child: None,
            started_at: None,
            restarts: 0,
            last_error: None,
        }
    }

    fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(|c| c.id())
    }

    fn to_info(&self) -> ProcessInfo {
        ProcessInfo {
            name: self.spec.name.clone(),
            state: self.machine.state().as_str().to_string(),
            pid: self.pid(),
            uptime_secs: self.started_at.map(|t| t.elapsed().as_secs()),
            restarts: self.restarts,
            last_error: self.last_error.clone(),
        }
    }
}

struct Inner {
    procs: RwLock<HashMap<String, ManagedProcess>>,
    definitions: std::sync::RwLock<HashMap<String, ProcessSpec>>,
    logs: Arc<LogBuffer>,
    bus: Arc<EventBus>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
}

/// The supervisor itself; cheap to clone into method-handler closures.
#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<Inner>,
}

impl ProcessSupervisor {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            inner: Arc::new(Inner {
                procs: RwLock::new(HashMap::new()),
                definitions: std::sync::RwLock::new(HashMap::new()),
                logs: Arc::new(LogBuffer::default()),
                bus,
                watchdog: Mutex::new(None),
            }),
        }
    }

    /// Register (or replace) a process definition without starting it.
    pub fn define(&self, spec: ProcessSpec) {
        debug!(process = %spec.name, "Process defined");
        self.inner
            .definitions
            .write()
            .expect("definitions lock poisoned")
            .insert(spec.name.clone(), spec);
    }

    /// Names of defined processes flagged for automatic start.
    pub fn autostart_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .definitions
            .read()
            .expect("definitions lock poisoned")
            .values()
            .filter(|spec| spec.autostart)
            .map(|spec| spec.name.clone())
            .collect();
        names.sort();
        names
    }

    pub async fn start(&self, name: &str, spec_override: Option<ProcessSpec>) -> Result<()> {
        let mut procs = self.inner.procs.write().await;

        let proc = match procs.entry(name.to_string()) {
            std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::hash_map::Entry::Vacant(entry) => {
                let spec = spec_override
                    .clone()
                    .or_else(|| {
                        self.inner
                            .definitions
                            .read()
                            .expect("definitions lock poisoned")
                            .get(name)
                            .cloned()
                    })
                    .ok_or_else(|| anyhow::anyhow!("unknown process: {name}"))?;
                entry.insert(ManagedProcess::new(spec, Arc::clone(&self.inner.bus)))
            }
        };
        if let Some(spec) = spec_override {
            if !proc.machine.is(&ProcessState::Stopped) && !proc.machine.is(&ProcessState::Failed) {
                bail!("process '{name}' must be stopped before its spec can change");
            }
            proc.spec = spec;
        }

        if !proc.machine.transition(&ProcessEvent::Spawn).await? {
            bail!(
                "process '{name}' is already {}",
                proc.machine.state().as_str()
            );
        }
        proc.last_error = None;

        match spawn_child(&proc.spec, &self.inner.logs) {
            Ok(child) => {
                let pid = child.id();
                info!(process = %name, pid = ?pid, "Process started");
                proc.child = Some(child);
                proc.started_at = Some(Instant::now());
                proc.machine.transition(&ProcessEvent::Spawned).await?;
                self.inner
                    .bus
                    .emit("process:started", json!({ "name": name, "pid": pid }))?;
                Ok(())
            }
            Err(err) => {
                warn!(process = %name, "Spawn failed: {err}");
                proc.last_error = Some(err.to_string());
                proc.machine.transition(&ProcessEvent::SpawnFailed).await?;
                self.inner.bus.emit(
                    "process:failed",
                    json!({ "name": name, "error": err.to_string() }),
                )?;
                Err(err)
            }
        }
    }

    pub async fn stop(&self, name: &str, force: bool) -> Result<()> {
        let mut child = {
            let mut procs = self.inner.procs.write().await;
            let proc = procs
                .get_mut(name)
                .ok_or_else(|| anyhow::anyhow!("unknown process: {name}"))?;

            if !proc.machine.transition(&ProcessEvent::Stop).await? {
                bail!("process '{name}' is not running");
            }
            proc.child.take()
        };

        // The graceful-stop window can last seconds; terminate outside the
        // lock so list, start and the watchdog stay responsive. The entry is
        // in `stopping` meanwhile, which rejects a concurrent start.
        if let Some(child) = child.as_mut() {
            terminate(child, force).await;
        }

        let mut procs = self.inner.procs.write().await;
        if let Some(proc) = procs.get_mut(name) {
            proc.started_at = None;
            proc.machine.transition(&ProcessEvent::Exited).await?;
        }
        info!(process = %name, "Process stopped");
        self.inner
            .bus
            .emit("process:stopped", json!({ "name": name }))?;
        Ok(())
    }

    pub async fn restart(&self, name: &str) -> Result<()> {
        let running = {
            let procs = self.inner.procs.read().await;
            procs
                .get(name)
                .is_some_and(|p| p.machine.is(&ProcessState::Running))
        };
        if running {
            self.stop(name, false).await?;
        }
        self.start(name, None).await
    }

    pub async fn delete(&self, name: &str) -> Result<()> {
        let running = {
            let procs = self.inner.procs.read().await;
            procs
                .get(name)
                .is_some_and(|p| p.machine.is(&ProcessState::Running))
        };
        if running {
            self.stop(name, true).await?;
        }

        let removed = self.inner.procs.write().await.remove(name).is_some();
        let defined = self
            .inner
            .definitions
            .write()
            .expect("definitions lock poisoned")
            .remove(name)
            .is_some();
        if !removed && !defined {
            bail!("unknown process: {name}");
        }
        self.inner.logs.clear(name);
        info!(process = %name, "Process deleted");
        self.inner
            .bus
            .emit("process:deleted", json!({ "name": name }))?;
        Ok(())
    }

    pub async fn list(&self) -> Vec<ProcessInfo> {
        let procs = self.inner.procs.read().await;
        let mut infos: Vec<ProcessInfo> = procs.values().map(ManagedProcess::to_info).collect();
        // Defined but never started processes show up as stopped.
        let definitions = self
            .inner
            .definitions
            .read()
            .expect("definitions lock poisoned");
        for (name, _) in definitions.iter() {
            if !procs.contains_key(name) {
                infos.push(ProcessInfo {
                    name: name.clone(),
                    state: ProcessState::Stopped.as_str().to_string(),
                    pid: None,
                    uptime_secs: None,
                    restarts: 0,
                    last_error: None,
                });
            }
        }
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    pub fn logs(&self, name: &str, lines: usize) -> Vec<String> {
        self.inner.logs.tail(name, lines)
    }

    pub async fn start_autostart(&self) {
        for name in self.autostart_names() {
            info!(process = %name, "Auto-starting process");
            if let Err(err) = self.start(&name, None).await {
                warn!(process = %name, "Auto-start failed: {err}");
            }
        }
    }

    pub async fn stop_all(&self) {
        let names: Vec<String> = {
            let procs = self.inner.procs.read().await;
            procs
                .iter()
                .filter(|(_, p)| !p.machine.is(&ProcessState::Stopped))
                .map(|(name, _)| name.clone())
                .collect()
        };
        for name in names {
            if let Err(err) = self.stop(&name, false).await {
                debug!(process = %name, "Stop during shutdown: {err}");
            }
        }
    }

    /// One watchdog pass: reap exited children, restart crashed ones.
    async fn check_children(&self) {
        let mut procs = self.inner.procs.write().await;
        for (name, proc) in procs.iter_mut() {
            if !proc.machine.is(&ProcessState::Running) {
                continue;
            }
            let Some(child) = proc.child.as_mut() else {
                continue;
            };
            let status = match child.try_wait() {
                Ok(Some(status)) => status,
                Ok(None) => continue,
                Err(err) => {
                    warn!(process = %name, "Failed to poll child: {err}");
                    continue;
                }
            };

            proc.child = None;
            proc.started_at = None;

            if status.success() {
                info!(process = %name, "Process exited cleanly");
                if let Err(err) = proc.machine.transition(&ProcessEvent::Exited).await {
                    warn!(process = %name, "Lifecycle hook failed: {err}");
                }
                self.inner
                    .bus
                    .emit("process:exited", json!({ "name": name }))
                    .ok();
                continue;
            }

            warn!(process = %name, status = %status, "Process died unexpectedly");
            proc.last_error = Some(format!("exited with {status}"));
            if let Err(err) = proc.machine.transition(&ProcessEvent::Crash).await {
                warn!(process = %name, "Lifecycle hook failed: {err}");
            }
            self.inner
                .bus
                .emit(
                    "process:crashed",
                    json!({ "name": name, "status": status.to_string() }),
                )
                .ok();

            if proc.spec.autorestart && proc.restarts < proc.spec.max_restarts {
                proc.restarts += 1;
                info!(
                    process = %name,
                    attempt = proc.restarts,
                    max = proc.spec.max_restarts,
                    "Restarting crashed process"
                );
                if let Err(err) = respawn(proc, &self.inner.logs).await {
                    warn!(process = %name, "Restart failed: {err}");
                }
            }
        }
    }
}

async fn respawn(proc: &mut ManagedProcess, logs: &Arc<LogBuffer>) -> Result<()> {
    if !proc.machine.transition(&ProcessEvent::Spawn).await? {
        bail!("cannot respawn from state {}", proc.machine.state().as_str());
    }
    match spawn_child(&proc.spec, logs) {
        Ok(child) => {
            proc.child = Some(child);
            proc.started_at = Some(Instant::now());
            proc.machine.transition(&ProcessEvent::Spawned).await?;
            Ok(())
        }
        Err(err) => {
            proc.last_error = Some(err.to_string());
            proc.machine.transition(&ProcessEvent::SpawnFailed).await?;
            Err(err)
        }
    }
}

fn spawn_child(spec: &ProcessSpec, logs: &Arc<LogBuffer>) -> Result<Child> {
    let mut cmd = Command::new(&spec.command);
    cmd.args(&spec.args);
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }
    if let Some(cwd) = &spec.cwd {
        cmd.current_dir(cwd);
    }
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = cmd.spawn()?;
    spawn_log_readers(&spec.name, &mut child, logs);
    Ok(child)
}

fn spawn_log_readers(name: &str, child: &mut Child, logs: &Arc<LogBuffer>) {
    if let Some(stdout) = child.stdout.take() {
        let logs = Arc::clone(logs);
        let name = name.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                logs.push(&name, line);
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        let logs = Arc::clone(logs);
        let name = name.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                logs.push(&name, line);
            }
        });
    }
}

async fn terminate(child: &mut Child, force: bool) {
    #[cfg(unix)]
    if !force {
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
            if tokio::time::timeout(GRACEFUL_STOP_TIMEOUT, child.wait())
                .await
                .is_ok()
            {
                return;
            }
            warn!(pid = pid, "Graceful stop timed out, killing");
        }
    }
    #[cfg(not(unix))]
    let _ = force;
    child.kill().await.ok();
}

fn params<T: serde::de::DeserializeOwned>(raw: Option<Value>) -> Result<T, MethodError> {
    serde_json::from_value(raw.unwrap_or(Value::Null))
        .map_err(|err| MethodError::invalid_params(err.to_string()))
}

#[derive(Deserialize)]
struct NameParams {
    name: String,
}

#[derive(Deserialize)]
struct StartParams {
    name: String,
    #[serde(default)]
    spec: Option<ProcessSpec>,
}

#[derive(Deserialize)]
struct StopParams {
    name: String,
    #[serde(default)]
    force: bool,
}

#[derive(Deserialize)]
struct LogsParams {
    name: String,
    #[serde(default = "default_log_lines")]
    lines: usize,
}

fn default_log_lines() -> usize {
    DEFAULT_LOG_LINES
}

#[async_trait]
impl Plugin for ProcessSupervisor {
    fn name(&self) -> &str {
        "supervisor"
    }

    async fn init(&self, ctx: &KernelContext) -> Result<()> {
        let sup = self.clone();
        ctx.server.register_fn("list", move |_params| {
            let sup = sup.clone();
            async move {
                serde_json::to_value(sup.list().await)
                    .map_err(|err| MethodError::internal(err.to_string()))
            }
        });

        let sup = self.clone();
        ctx.server.register_fn("start", move |raw| {
            let sup = sup.clone();
            async move {
                let p: StartParams = params(raw)?;
                sup.start(&p.name, p.spec)
                    .await
                    .map_err(|err| MethodError::server(err.to_string()))?;
                Ok(Value::Null)
            }
        });

        let sup = self.clone();
        ctx.server.register_fn("stop", move |raw| {
            let sup = sup.clone();
            async move {
                let p: StopParams = params(raw)?;
                sup.stop(&p.name, p.force)
                    .await
                    .map_err(|err| MethodError::server(err.to_string()))?;
                Ok(Value::Null)
            }
        });

        let sup = self.clone();
        ctx.server.register_fn("restart", move |raw| {
            let sup = sup.clone();
            async move {
                let p: NameParams = params(raw)?;
                sup.restart(&p.name)
                    .await
                    .map_err(|err| MethodError::server(err.to_string()))?;
                Ok(Value::Null)
            }
        });

        let sup = self.clone();
        ctx.server.register_fn("delete", move |raw| {
            let sup = sup.clone();
            async move {
                let p: NameParams = params(raw)?;
                sup.delete(&p.name)
                    .await
                    .map_err(|err| MethodError::server(err.to_string()))?;
                Ok(Value::Null)
            }
        });

        let sup = self.clone();
        ctx.server.register_fn("logs", move |raw| {
            let sup = sup.clone();
            async move {
                let p: LogsParams = params(raw)?;
                Ok(json!({ "lines": sup.logs(&p.name, p.lines) }))
            }
        });

        let sup = self.clone();
        let watchdog = tokio::spawn(async move {
            let mut interval = tokio::time::interval(WATCHDOG_INTERVAL);
            loop {
                interval.tick().await;
                sup.check_children().await;
            }
        });
        *self.inner.watchdog.lock().await = Some(watchdog);
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        if let Some(watchdog) = self.inner.watchdog.lock().await.take() {
            watchdog.abort();
        }
        self.stop_all().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, command: &str, args: &[&str]) -> ProcessSpec {
        ProcessSpec {
            name: name.to_string(),
            command: command.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            env: HashMap::new(),
            cwd: None,
            autorestart: false,
            max_restarts: 0,
            autostart: false,
        }
    }

    #[tokio::test]
    async fn unknown_process_cannot_start() {
        let sup = ProcessSupervisor::new(Arc::new(EventBus::new()));
        let err = sup.start("ghost", None).await.unwrap_err();
        assert!(err.to_string().contains("unknown process"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn start_list_stop_roundtrip() {
        let bus = Arc::new(EventBus::new());
        let events = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen = Arc::clone(&events);
        bus.on("process:*", move |topic, _| {
            seen.lock().unwrap().push(topic.to_string());
            Ok(())
        });

        let sup = ProcessSupervisor::new(Arc::clone(&bus));
        sup.define(spec("sleeper", "sleep", &["30"]));
        sup.start("sleeper", None).await.unwrap();

        let list = sup.list().await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].name, "sleeper");
        assert_eq!(list[0].state, "running");
        assert!(list[0].pid.is_some());

        sup.stop("sleeper", false).await.unwrap();
        let list = sup.list().await;
        assert_eq!(list[0].state, "stopped");

        let events = events.lock().unwrap();
        assert!(events.contains(&"process:started".to_string()));
        assert!(events.contains(&"process:stopped".to_string()));
        assert!(events.contains(&"process:state".to_string()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn double_start_is_rejected() {
        let sup = ProcessSupervisor::new(Arc::new(EventBus::new()));
        sup.define(spec("sleeper", "sleep", &["30"]));
        sup.start("sleeper", None).await.unwrap();
        let err = sup.start("sleeper", None).await.unwrap_err();
        assert!(err.to_string().contains("already"));
        sup.stop("sleeper", true).await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn list_stays_responsive_during_graceful_stop() {
        let sup = ProcessSupervisor::new(Arc::new(EventBus::new()));
        // Ignores SIGTERM, so the graceful window runs its full course.
        sup.define(spec("stubborn", "sh", &["-c", "trap '' TERM; sleep 30"]));
        sup.start("stubborn", None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let stopper = sup.clone();
        let stopping = tokio::spawn(async move { stopper.stop("stubborn", false).await });
        tokio::time::sleep(Duration::from_millis(200)).await;

        let listed = tokio::time::timeout(Duration::from_millis(500), sup.list())
            .await
            .expect("list blocked while a graceful stop was draining");
        assert_eq!(listed[0].state, "stopping");

        stopping.await.unwrap().unwrap();
        assert_eq!(sup.list().await[0].state, "stopped");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn watchdog_reaps_clean_exit() {
        let sup = ProcessSupervisor::new(Arc::new(EventBus::new()));
        sup.define(spec("oneshot", "true", &[]));
        sup.start("oneshot", None).await.unwrap();
        // Give the child a moment to exit, then reap.
        tokio::time::sleep(Duration::from_millis(200)).await;
        sup.check_children().await;
        let list = sup.list().await;
        assert_eq!(list[0].state, "stopped");
    }
}
