//! Forks, monitors, recycles, and terminates worker subprocesses.
//!
//! Each worker is spawned with piped stdio: stdin carries supervisor →
//! worker IPC, stdout carries worker → supervisor IPC, and stderr lines
//! are forwarded into this process's tracing output tagged with the worker
//! id. The registry holds at most one live record per worker id; records
//! disappear when the child exits or is explicitly terminated.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::ipc::{self, ParentMsg, WorkerMsg};
use crate::secret::{SecretsError, SecretsSource};

/// How long a freshly forked worker has to report ready.
pub const READY_TIMEOUT: Duration = Duration::from_secs(30);

/// Grace given to a worker between shutdown request and escalation.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("worker config error: missing `{0}`")]
    Config(&'static str),

    #[error("failed to spawn worker `{0}`: {1}")]
    Spawn(String, #[source] std::io::Error),

    #[error("worker `{0}` reported a fatal error: {1}")]
    Worker(String, String),

    #[error("worker `{0}` exited before becoming ready")]
    EarlyExit(String),

    #[error("worker `{0}` did not become ready within {1:?}")]
    ReadyTimeout(String, Duration),

    #[error("no worker registered under `{0}`")]
    UnknownWorker(String),

    #[error("worker `{0}` is already restarting")]
    Busy(String),

    #[error("worker `{0}` is already running")]
    AlreadyRunning(String),

    #[error(transparent)]
    Secrets(#[from] SecretsError),
}

/// Supervisor-side record of one running worker.
pub struct WorkerHandle {
    id: String,
    url: String,
    port: u16,
    config: WorkerConfig,
    script_path: PathBuf,
    pid: i32,
    ipc: mpsc::UnboundedSender<ParentMsg>,
    exit: watch::Receiver<Option<i32>>,
}

impl WorkerHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn script_path(&self) -> &Path {
        &self.script_path
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    /// Ask the worker to drain and stop. Returns false when the IPC
    /// channel is already gone.
    pub fn request_shutdown(&self) -> bool {
        self.ipc.send(ParentMsg::Shutdown).is_ok()
    }

    pub fn signal(&self, sig: Signal) {
        if let Err(e) = kill(Pid::from_raw(self.pid), sig) {
            debug!(worker = %self.id, pid = self.pid, signal = %sig, error = %e, "signal delivery failed");
        }
    }

    /// SIGKILL, no questions asked.
    pub fn kill(&self) {
        self.signal(Signal::SIGKILL);
    }

    /// Wait up to `timeout` for the child to exit.
    pub async fn wait_exit(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait_exit_forever())
            .await
            .unwrap_or(false)
    }

    async fn wait_exit_forever(&self) -> bool {
        let mut rx = self.exit.clone();
        loop {
            if rx.borrow_and_update().is_some() {
                return true;
            }
            if rx.changed().await.is_err() {
                return rx.borrow().is_some();
            }
        }
    }

    /// Graceful close: shutdown request, then SIGTERM, then SIGKILL, with
    /// [`SHUTDOWN_GRACE`] between the steps.
    pub async fn close(&self) {
        self.request_shutdown();
        self.escalate_until_exit().await;
    }

    async fn escalate_until_exit(&self) {
        if self.wait_exit(SHUTDOWN_GRACE).await {
            return;
        }
        warn!(worker = %self.id, "no exit after shutdown request, sending SIGTERM");
        self.signal(Signal::SIGTERM);
        if self.wait_exit(SHUTDOWN_GRACE).await {
            return;
        }
        warn!(worker = %self.id, "no exit after SIGTERM, sending SIGKILL");
        self.kill();
        let _ = self.wait_exit(SHUTDOWN_GRACE).await;
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("id", &self.id)
            .field("url", &self.url)
            .field("pid", &self.pid)
            .field("exited", &self.has_exited())
            .finish()
    }
}

#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

struct SupervisorInner {
    secrets: Arc<dyn SecretsSource>,
    workers: DashMap<String, Arc<WorkerHandle>>,
    restarting: DashSet<String>,
    counter: AtomicU64,
    ready_timeout: Duration,
}

impl Supervisor {
    pub fn new(secrets: Arc<dyn SecretsSource>) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                secrets,
                workers: DashMap::new(),
                restarting: DashSet::new(),
                counter: AtomicU64::new(0),
                ready_timeout: READY_TIMEOUT,
            }),
        }
    }

    /// Shrink the ready timeout; tests exercise the failure paths with it.
    pub fn with_ready_timeout(secrets: Arc<dyn SecretsSource>, ready_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                secrets,
                workers: DashMap::new(),
                restarting: DashSet::new(),
                counter: AtomicU64::new(0),
                ready_timeout,
            }),
        }
    }

    pub fn get_worker(&self, id: &str) -> Option<Arc<WorkerHandle>> {
        self.inner.workers.get(id).map(|e| Arc::clone(e.value()))
    }

    pub fn list_workers(&self) -> Vec<Arc<WorkerHandle>> {
        self.inner.workers.iter().map(|e| Arc::clone(e.value())).collect()
    }

    pub fn is_restarting(&self, id: &str) -> bool {
        self.inner.restarting.contains(id)
    }

    /// Resolve id and environment for `config`, fork the worker script,
    /// and hand back its record once it reported ready.
    pub async fn create_worker(
        &self,
        script_path: &Path,
        config: WorkerConfig,
    ) -> Result<Arc<WorkerHandle>, SupervisorError> {
        let storage = config
            .storage
            .clone()
            .ok_or(SupervisorError::Config("storage"))?;

        let id = match config.id.as_deref() {
            Some(id) if !id.is_empty() => id.to_string(),
            _ if !config.url_prefix.is_empty() => config.url_prefix.clone(),
            _ => format!("process-{}", self.inner.counter.fetch_add(1, Ordering::SeqCst)),
        };
        if self.inner.workers.contains_key(&id) {
            return Err(SupervisorError::AlreadyRunning(id));
        }

        let env = match &config.env {
            Some(env) => env.clone(),
            None => self.inner.secrets.load(&id, &storage).await?,
        };

        let mut config = config;
        config.id = Some(id);
        self.fork(script_path, &config, &env).await
    }

    /// Spawn the worker script, send it `{type:"start"}`, and wait for its
    /// ready handshake. On ready the record is registered and persistent
    /// exit listeners keep the registry honest; every failure path leaves
    /// no child behind.
    pub async fn fork(
        &self,
        script_path: &Path,
        config: &WorkerConfig,
        env: &HashMap<String, String>,
    ) -> Result<Arc<WorkerHandle>, SupervisorError> {
        let id = config
            .id
            .clone()
            .ok_or(SupervisorError::Config("id"))?;

        let mut child = Command::new(script_path)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| SupervisorError::Spawn(id.clone(), e))?;
        let pid = child.id().map(|p| p as i32).unwrap_or(-1);
        info!(worker = %id, pid, script = %script_path.display(), "worker spawned");

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| SupervisorError::Spawn(id.clone(), std::io::Error::other("no stdin pipe")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SupervisorError::Spawn(id.clone(), std::io::Error::other("no stdout pipe")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SupervisorError::Spawn(id.clone(), std::io::Error::other("no stderr pipe")))?;

        // writer: queued parent messages → child stdin
        let (ipc_tx, mut ipc_rx) = mpsc::unbounded_channel::<ParentMsg>();
        tokio::spawn(async move {
            while let Some(msg) = ipc_rx.recv().await {
                let line = ipc::encode(&msg);
                if stdin.write_all(line.as_bytes()).await.is_err()
                    || stdin.write_all(b"\n").await.is_err()
                    || stdin.flush().await.is_err()
                {
                    break;
                }
            }
        });
        let _ = ipc_tx.send(ParentMsg::Start {
            config: config.clone(),
        });

        // stderr forwarder: the worker's log output, tagged with its id
        {
            let id = id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    info!(worker = %id, "{line}");
                }
            });
        }

        // stdout reader: the ready handshake, then fatal-error reports
        let (ready_tx, ready_rx) = oneshot::channel::<Result<(String, u16), SupervisorError>>();
        {
            let id = id.clone();
            tokio::spawn(async move {
                let mut ready_tx = Some(ready_tx);
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<WorkerMsg>(line) {
                        Ok(WorkerMsg::Ready { url, port }) => {
                            if let Some(tx) = ready_tx.take() {
                                let _ = tx.send(Ok((url, port)));
                            } else {
                                warn!(worker = %id, "duplicate ready message ignored");
                            }
                        }
                        Ok(WorkerMsg::Error { error: msg }) => {
                            if let Some(tx) = ready_tx.take() {
                                let _ = tx.send(Err(SupervisorError::Worker(id.clone(), msg)));
                            } else {
                                error!(worker = %id, error = %msg, "worker reported a fatal error");
                            }
                        }
                        Err(_) => debug!(worker = %id, %line, "non-ipc line on worker stdout"),
                    }
                }
                if let Some(tx) = ready_tx.take() {
                    let _ = tx.send(Err(SupervisorError::EarlyExit(id.clone())));
                }
            });
        }

        // exit watcher owns the child
        let (exit_tx, exit_rx) = watch::channel(None::<i32>);
        {
            let id = id.clone();
            tokio::spawn(async move {
                let code = match child.wait().await {
                    Ok(status) => status.code().unwrap_or(-1),
                    Err(e) => {
                        error!(worker = %id, error = %e, "wait on worker failed");
                        -1
                    }
                };
                info!(worker = %id, code, "worker exited");
                let _ = exit_tx.send(Some(code));
            });
        }

        match tokio::time::timeout(self.inner.ready_timeout, ready_rx).await {
            Ok(Ok(Ok((url, port)))) => {
                let handle = Arc::new(WorkerHandle {
                    id: id.clone(),
                    url,
                    port,
                    config: config.clone(),
                    script_path: script_path.to_path_buf(),
                    pid,
                    ipc: ipc_tx,
                    exit: exit_rx,
                });
                self.inner.workers.insert(id.clone(), Arc::clone(&handle));
                info!(worker = %id, url = %handle.url, "worker ready");

                // drop the record when this child (and not a successor
                // registered under the same id) goes away
                let sup = self.clone();
                let watched = Arc::clone(&handle);
                tokio::spawn(async move {
                    watched.wait_exit_forever().await;
                    sup.inner
                        .workers
                        .remove_if(&watched.id, |_, h| h.pid == watched.pid);
                });

                Ok(handle)
            }
            Ok(Ok(Err(e))) => {
                warn!(worker = %id, error = %e, "worker failed before ready, killing");
                let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
                Err(e)
            }
            Ok(Err(_closed)) => {
                let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
                Err(SupervisorError::EarlyExit(id))
            }
            Err(_elapsed) => {
                warn!(worker = %id, "ready timeout, sending SIGTERM");
                let _ = kill(Pid::from_raw(pid), Signal::SIGTERM);
                Err(SupervisorError::ReadyTimeout(id, self.inner.ready_timeout))
            }
        }
    }

    /// Recycle one worker: resolve a fresh environment, stop the old
    /// child (SIGKILL after [`SHUTDOWN_GRACE`]), and fork a new one with
    /// the same script and config. A second concurrent restart for the
    /// same id gets [`SupervisorError::Busy`].
    pub async fn restart(
        &self,
        id: &str,
        env: Option<HashMap<String, String>>,
    ) -> Result<Arc<WorkerHandle>, SupervisorError> {
        let handle = self
            .get_worker(id)
            .ok_or_else(|| SupervisorError::UnknownWorker(id.to_string()))?;
        if !self.inner.restarting.insert(id.to_string()) {
            return Err(SupervisorError::Busy(id.to_string()));
        }
        let result = self.restart_inner(&handle, env).await;
        self.inner.restarting.remove(id);
        result
    }

    async fn restart_inner(
        &self,
        handle: &Arc<WorkerHandle>,
        env: Option<HashMap<String, String>>,
    ) -> Result<Arc<WorkerHandle>, SupervisorError> {
        let env = match env {
            Some(env) if !env.is_empty() => env,
            _ => {
                let storage = handle
                    .config
                    .storage
                    .clone()
                    .ok_or(SupervisorError::Config("storage"))?;
                self.inner.secrets.load(&handle.id, &storage).await?
            }
        };

        handle.request_shutdown();
        if !handle.wait_exit(SHUTDOWN_GRACE).await {
            warn!(worker = %handle.id, "no exit within restart grace, sending SIGKILL");
            handle.kill();
            let _ = handle.wait_exit(SHUTDOWN_GRACE).await;
        }
        self.inner.workers.remove(&handle.id);

        self.fork(&handle.script_path, &handle.config, &env).await
    }

    /// Ask every worker to shut down and block until the last one exited
    /// or was force-terminated. The registry is empty afterwards.
    pub async fn terminate_all(&self) {
        let handles = self.list_workers();
        info!(count = handles.len(), "terminating all workers");
        for handle in &handles {
            handle.request_shutdown();
        }
        futures::future::join_all(handles.iter().map(|h| h.escalate_until_exit())).await;
        self.inner.workers.clear();
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("workers", &self.inner.workers.len())
            .field("restarting", &self.inner.restarting.len())
            .finish()
    }
}
