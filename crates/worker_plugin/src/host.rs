//! Host-side client for a plugin subprocess.
//!
//! [`PluginProcess::spawn`] launches the executable, pipes its stdio, and
//! runs two background tasks: a writer that drains a queue of outbound
//! lines into the child's stdin, and a reader that routes inbound lines —
//! responses are matched against an inflight map, `progress`/`end`
//! notifications are routed to the activity channel registered for the
//! originating `invoke` id, and anything else is logged and dropped.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, Command},
    sync::{mpsc, oneshot, Mutex},
};
use tracing::{debug, warn};

use crate::rpc::{
    AllowParams, EndParams, ExternalEventParams, GetDependenciesResult, GetInstanceParams,
    GetInstanceResult, InvokeParams, InvokeResult, Message, Method, ProgressParams, Request,
    Response,
};

#[derive(Debug, Error)]
pub enum HostError {
    #[error("failed to spawn plugin `{0}`: {1}")]
    Spawn(String, #[source] std::io::Error),
    #[error("plugin `{0}` closed its rpc channel")]
    ChannelClosed(String),
    #[error("plugin `{plugin}` returned rpc error {code}: {message}")]
    Rpc {
        plugin: String,
        code: i64,
        message: String,
    },
    #[error("unexpected payload from plugin `{0}`: {1}")]
    Payload(String, #[source] serde_json::Error),
}

/// Delayed-response activity reported by the plugin for one invocation.
#[derive(Debug, Clone)]
pub enum Activity {
    Progress(Value),
    End(Option<Value>),
}

/// A running plugin subprocess plus its rpc plumbing. Cheap to clone.
#[derive(Debug, Clone)]
pub struct PluginProcess {
    inner: Arc<ProcessInner>,
}

#[derive(Debug)]
struct ProcessInner {
    name: String,
    path: PathBuf,
    out: mpsc::UnboundedSender<String>,
    inflight: DashMap<i64, oneshot::Sender<Response>>,
    activity: DashMap<i64, mpsc::UnboundedSender<Activity>>,
    next_id: AtomicI64,
    child: Mutex<Option<Child>>,
}

impl PluginProcess {
    /// Launch the plugin executable and wire up the stdio protocol.
    pub fn spawn(name: &str, path: &Path) -> Result<Self, HostError> {
        let mut child = Command::new(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| HostError::Spawn(name.to_string(), e))?;

        let mut stdin = child.stdin.take().ok_or_else(|| {
            HostError::Spawn(name.to_string(), std::io::Error::other("no stdin pipe"))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            HostError::Spawn(name.to_string(), std::io::Error::other("no stdout pipe"))
        })?;

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let inner = Arc::new(ProcessInner {
            name: name.to_string(),
            path: path.to_path_buf(),
            out: out_tx,
            inflight: DashMap::new(),
            activity: DashMap::new(),
            next_id: AtomicI64::new(1),
            child: Mutex::new(Some(child)),
        });

        // writer: queued lines → child stdin
        tokio::spawn(async move {
            while let Some(line) = out_rx.recv().await {
                if stdin.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if stdin.write_all(b"\n").await.is_err() || stdin.flush().await.is_err() {
                    break;
                }
            }
        });

        // reader: child stdout → inflight responses / activity notifications
        let routing = Arc::clone(&inner);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<Message>(line) {
                    Ok(Message::Response(rsp)) => {
                        if let Some((_, tx)) = routing.inflight.remove(&rsp.id) {
                            let _ = tx.send(rsp);
                        } else {
                            debug!(plugin = %routing.name, id = rsp.id, "response with no inflight call");
                        }
                    }
                    Ok(Message::Request(req)) => routing.route_notification(req),
                    Err(_) => {
                        // plugins are told to keep stdout clean, but be forgiving
                        debug!(plugin = %routing.name, %line, "non-rpc line on plugin stdout");
                    }
                }
            }
            routing.fail_inflight();
            if let Some(mut child) = routing.child.lock().await.take() {
                let _ = child.kill().await;
            }
        });

        Ok(Self { inner })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    async fn call(&self, method: Method, params: Option<Value>) -> Result<Value, HostError> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.call_with_id(id, method, params).await
    }

    async fn call_with_id(
        &self,
        id: i64,
        method: Method,
        params: Option<Value>,
    ) -> Result<Value, HostError> {
        let (tx, rx) = oneshot::channel();
        self.inner.inflight.insert(id, tx);
        let req = Request::call(id, method, params);
        let line = serde_json::to_string(&req)
            .map_err(|e| HostError::Payload(self.inner.name.clone(), e))?;
        if self.inner.out.send(line).is_err() {
            self.inner.inflight.remove(&id);
            return Err(HostError::ChannelClosed(self.inner.name.clone()));
        }
        let rsp = rx
            .await
            .map_err(|_| HostError::ChannelClosed(self.inner.name.clone()))?;
        if let Some(err) = rsp.error {
            return Err(HostError::Rpc {
                plugin: self.inner.name.clone(),
                code: err.code,
                message: err.message,
            });
        }
        Ok(rsp.result.unwrap_or(Value::Null))
    }

    pub async fn get_dependencies(&self) -> Result<Vec<String>, HostError> {
        let v = self.call(Method::GetDependencies, None).await?;
        let r: GetDependenciesResult =
            serde_json::from_value(v).map_err(|e| HostError::Payload(self.inner.name.clone(), e))?;
        Ok(r.dependencies)
    }

    pub async fn get_instance(&self, name: &str) -> Result<GetInstanceResult, HostError> {
        let v = self
            .call(
                Method::GetInstance,
                Some(json!(GetInstanceParams { name: name.to_string() })),
            )
            .await?;
        serde_json::from_value(v).map_err(|e| HostError::Payload(self.inner.name.clone(), e))
    }

    /// Raw predicate verdict: only a strict JSON `false` denies.
    pub async fn allow(&self, params: AllowParams) -> Result<Value, HostError> {
        self.call(Method::Allow, Some(json!(params))).await
    }

    /// Invoke an operation. The returned receiver observes `progress` /
    /// `end` notifications the plugin sends for this invocation; it is
    /// registered before the request goes out so no activity can be lost.
    pub async fn invoke(
        &self,
        operation: &str,
        args: Vec<Value>,
    ) -> Result<(i64, InvokeResult, mpsc::UnboundedReceiver<Activity>), HostError> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (act_tx, act_rx) = mpsc::unbounded_channel();
        self.inner.activity.insert(id, act_tx);

        let res = self
            .call_with_id(
                id,
                Method::Invoke,
                Some(json!(InvokeParams {
                    operation: operation.to_string(),
                    args,
                })),
            )
            .await;
        let v = match res {
            Ok(v) => v,
            Err(e) => {
                self.inner.activity.remove(&id);
                return Err(e);
            }
        };
        let r: InvokeResult =
            serde_json::from_value(v).map_err(|e| HostError::Payload(self.inner.name.clone(), e))?;
        Ok((id, r, act_rx))
    }

    pub async fn get_public_methods(&self) -> Result<Option<Vec<String>>, HostError> {
        let v = self.call(Method::GetPublicMethods, None).await?;
        serde_json::from_value(v).map_err(|e| HostError::Payload(self.inner.name.clone(), e))
    }

    pub async fn shutdown(&self) -> Result<(), HostError> {
        self.call(Method::Shutdown, None).await.map(|_| ())
    }

    /// Forward external-webhook data to the plugin for a CMB invocation.
    pub fn send_external_event(&self, invoke_id: i64, data: Value) {
        let req = Request::notification(
            Method::ExternalEvent,
            serde_json::to_value(ExternalEventParams { invoke_id, data }).ok(),
        );
        if let Ok(line) = serde_json::to_string(&req) {
            let _ = self.inner.out.send(line);
        }
    }

    /// Drop the activity route for an invocation once its response reached
    /// a terminal state.
    pub fn release_invocation(&self, invoke_id: i64) {
        self.inner.activity.remove(&invoke_id);
    }

    /// Force-terminate the subprocess.
    pub async fn kill(&self) {
        if let Some(mut child) = self.inner.child.lock().await.take() {
            let _ = child.kill().await;
        }
    }
}

impl ProcessInner {
    fn route_notification(&self, req: Request) {
        match req.method.parse::<Method>() {
            Ok(Method::Progress) => {
                if let Ok(p) =
                    serde_json::from_value::<ProgressParams>(req.params.unwrap_or(Value::Null))
                {
                    if let Some(tx) = self.activity.get(&p.invoke_id) {
                        let _ = tx.send(Activity::Progress(p.data));
                    } else {
                        warn!(plugin = %self.name, invoke_id = p.invoke_id, "progress for unknown invocation");
                    }
                }
            }
            Ok(Method::End) => {
                if let Ok(p) = serde_json::from_value::<EndParams>(req.params.unwrap_or(Value::Null))
                {
                    if let Some(tx) = self.activity.get(&p.invoke_id) {
                        let _ = tx.send(Activity::End(p.result));
                    } else {
                        warn!(plugin = %self.name, invoke_id = p.invoke_id, "end for unknown invocation");
                    }
                }
            }
            _ => warn!(plugin = %self.name, method = %req.method, "unexpected request from plugin"),
        }
    }

    /// Wake every pending call with a closed-channel error by dropping the
    /// response senders.
    fn fail_inflight(&self) {
        self.inflight.clear();
        self.activity.clear();
    }
}
