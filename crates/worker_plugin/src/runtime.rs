//! Plugin-side runtime: wires stdin/stdout JSON-RPC traffic to a
//! user-supplied [`PluginService`] implementation.
//!
//! Plugins must keep stdout clean for the protocol; anything a plugin wants
//! to log goes to stderr (the worker forwards it).
//!
//! Usage:
//! ```ignore
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     worker_plugin::runtime::run(MyPlugin::default()).await
//! }
//! ```

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter},
    sync::mpsc::{self, UnboundedSender},
};
use tracing::warn;

use crate::rpc::{
    AllowParams, EndParams, ExternalEventParams, GetDependenciesResult, GetInstanceParams,
    GetInstanceResult, InvokeParams, InvokeResult, Message, Method, ProgressParams, Request,
    Response,
};

/// Handle given to `invoke` so a plugin can report delayed-response activity
/// after the call itself has returned. Clone it into background tasks.
#[derive(Debug, Clone)]
pub struct Responder {
    invoke_id: i64,
    out: UnboundedSender<String>,
}

impl Responder {
    pub fn invoke_id(&self) -> i64 {
        self.invoke_id
    }

    /// Report intermediate progress for a delayed invocation.
    pub fn progress(&self, data: Value) {
        self.notify(
            Method::Progress,
            serde_json::to_value(ProgressParams {
                invoke_id: self.invoke_id,
                data,
            })
            .ok(),
        );
    }

    /// Finish a delayed invocation. `result` is `None` for observable flavors.
    pub fn end(&self, result: Option<Value>) {
        self.notify(
            Method::End,
            serde_json::to_value(EndParams {
                invoke_id: self.invoke_id,
                result,
            })
            .ok(),
        );
    }

    fn notify(&self, method: Method, params: Option<Value>) {
        let req = Request::notification(method, params);
        if let Ok(line) = serde_json::to_string(&req) {
            let _ = self.out.send(line);
        }
    }
}

/// Description of the instance a module produced: its callable operations
/// and whether it carries an authorization predicate.
#[derive(Debug, Clone)]
pub struct InstanceInfo {
    pub methods: Vec<String>,
    pub has_allow: bool,
}

/// Implement this to author a plugin. One process hosts one plugin; the
/// plugin's registered name arrives via `get_instance`.
#[async_trait]
pub trait PluginService: Send + 'static {
    /// Names of plugins that must be registered before this one.
    async fn dependencies(&mut self) -> Vec<String> {
        Vec::new()
    }

    /// Construct the plugin instance. Called once, after every dependency
    /// has been registered on the host side.
    async fn get_instance(&mut self, name: &str) -> Result<InstanceInfo, String>;

    /// Authorization predicate. Return exactly `false` to deny; any other
    /// value permits.
    async fn allow(
        &mut self,
        for_whom: &str,
        email: Option<&str>,
        operation: &str,
        args: &[Value],
    ) -> Value;

    /// Execute an operation. Return [`InvokeResult`] with `kind: Sync` for
    /// an immediate result, or a delayed kind and use `responder` (from a
    /// background task) to deliver `progress` / `end` later.
    async fn invoke(
        &mut self,
        operation: &str,
        args: Vec<Value>,
        responder: Responder,
    ) -> Result<InvokeResult, String>;

    /// Externally callable operations, if the plugin declares them.
    fn public_methods(&self) -> Option<Vec<String>> {
        None
    }

    /// Called once before the host drops the process.
    async fn shutdown(&mut self) {}

    /// Data collected from the external webhook for a CMB invocation.
    async fn on_external_event(&mut self, _invoke_id: i64, _data: Value) {}
}

/// Runs the JSON-RPC stdin/stdout loop until EOF or a fatal I/O error.
pub async fn run<P: PluginService>(mut plugin: P) -> Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        let mut w = BufWriter::new(io::stdout());
        while let Some(line) = rx.recv().await {
            if w.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            if w.write_all(b"\n").await.is_err() || w.flush().await.is_err() {
                break;
            }
        }
    });

    let mut reader = BufReader::new(io::stdin()).lines();
    while let Some(line) = reader.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Message>(line) {
            Ok(Message::Request(req)) => {
                if handle_request(&mut plugin, req, &tx).await {
                    break; // shutdown acknowledged
                }
            }
            Ok(Message::Response(_)) => { /* stray response on stdin, ignore */ }
            Err(e) => {
                let err = Response::fail(0, -32700, "Parse error", Some(json!(e.to_string())));
                let _ = tx.send(serde_json::to_string(&err).unwrap_or_default());
            }
        }
    }

    Ok(())
}

/// Dispatch one request. Returns `true` when the plugin should exit.
async fn handle_request<P: PluginService>(
    plugin: &mut P,
    req: Request,
    tx: &UnboundedSender<String>,
) -> bool {
    fn enqueue(tx: &UnboundedSender<String>, resp: Response) {
        if let Ok(line) = serde_json::to_string(&resp) {
            let _ = tx.send(line);
        }
    }

    fn invalid_params(tx: &UnboundedSender<String>, id: i64, e: impl std::fmt::Display) {
        enqueue(tx, Response::fail(id, -32602, "Invalid params", Some(json!(e.to_string()))));
    }

    let id = req.id;
    match req.method.parse::<Method>() {
        Ok(Method::GetDependencies) => {
            if let Some(id) = id {
                let deps = plugin.dependencies().await;
                enqueue(
                    tx,
                    Response::success(id, json!(GetDependenciesResult { dependencies: deps })),
                );
            }
        }
        Ok(Method::GetInstance) => {
            let Some(id) = id else { return false };
            match serde_json::from_value::<GetInstanceParams>(req.params.unwrap_or(Value::Null)) {
                Ok(p) => match plugin.get_instance(&p.name).await {
                    Ok(info) => enqueue(
                        tx,
                        Response::success(
                            id,
                            json!(GetInstanceResult {
                                methods: info.methods,
                                has_allow: info.has_allow,
                            }),
                        ),
                    ),
                    Err(e) => enqueue(tx, Response::fail(id, -32000, e, None)),
                },
                Err(e) => invalid_params(tx, id, e),
            }
        }
        Ok(Method::Allow) => {
            let Some(id) = id else { return false };
            match serde_json::from_value::<AllowParams>(req.params.unwrap_or(Value::Null)) {
                Ok(p) => {
                    let verdict = plugin
                        .allow(&p.for_whom, p.email.as_deref(), &p.operation, &p.args)
                        .await;
                    enqueue(tx, Response::success(id, verdict));
                }
                Err(e) => invalid_params(tx, id, e),
            }
        }
        Ok(Method::Invoke) => {
            let Some(id) = id else { return false };
            match serde_json::from_value::<InvokeParams>(req.params.unwrap_or(Value::Null)) {
                Ok(p) => {
                    let responder = Responder {
                        invoke_id: id,
                        out: tx.clone(),
                    };
                    match plugin.invoke(&p.operation, p.args, responder).await {
                        Ok(r) => enqueue(tx, Response::success(id, json!(r))),
                        Err(e) => enqueue(tx, Response::fail(id, -32000, e, None)),
                    }
                }
                Err(e) => invalid_params(tx, id, e),
            }
        }
        Ok(Method::GetPublicMethods) => {
            if let Some(id) = id {
                enqueue(tx, Response::success(id, json!(plugin.public_methods())));
            }
        }
        Ok(Method::Shutdown) => {
            plugin.shutdown().await;
            if let Some(id) = id {
                enqueue(tx, Response::success(id, json!(null)));
            }
            return true;
        }
        Ok(Method::ExternalEvent) => {
            if let Ok(p) =
                serde_json::from_value::<ExternalEventParams>(req.params.unwrap_or(Value::Null))
            {
                plugin.on_external_event(p.invoke_id, p.data).await;
            }
        }
        Ok(Method::Progress) | Ok(Method::End) => {
            // host-bound notifications never arrive on a plugin's stdin
            warn!(method = %req.method, "unexpected host-bound method on plugin stdin");
        }
        Err(()) => {
            if let Some(id) = id {
                enqueue(tx, Response::fail(id, -32601, "Method not found", None));
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Probe;

    #[async_trait]
    impl PluginService for Probe {
        async fn get_instance(&mut self, _name: &str) -> Result<InstanceInfo, String> {
            Ok(InstanceInfo {
                methods: vec!["ping".into()],
                has_allow: true,
            })
        }

        async fn allow(
            &mut self,
            for_whom: &str,
            _email: Option<&str>,
            _operation: &str,
            _args: &[Value],
        ) -> Value {
            Value::Bool(for_whom != "blocked")
        }

        async fn invoke(
            &mut self,
            operation: &str,
            _args: Vec<Value>,
            _responder: Responder,
        ) -> Result<InvokeResult, String> {
            match operation {
                "ping" => Ok(InvokeResult {
                    kind: crate::rpc::InvokeKind::Sync,
                    result: Some(json!("pong")),
                }),
                other => Err(format!("no such operation `{other}`")),
            }
        }
    }

    async fn roundtrip(req: Request) -> Vec<Response> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut plugin = Probe;
        handle_request(&mut plugin, req, &tx).await;
        drop(tx);
        let mut out = Vec::new();
        while let Some(line) = rx.recv().await {
            out.push(serde_json::from_str(&line).unwrap());
        }
        out
    }

    #[tokio::test]
    async fn invoke_dispatches_and_responds() {
        let req = Request::call(1, Method::Invoke, Some(json!({"operation": "ping"})));
        let responses = roundtrip(req).await;
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].result, Some(json!({"kind": "sync", "result": "pong"})));
    }

    #[tokio::test]
    async fn allow_returns_raw_verdict() {
        let req = Request::call(
            2,
            Method::Allow,
            Some(json!({"forWhom": "blocked", "operation": "ping", "args": []})),
        );
        let responses = roundtrip(req).await;
        assert_eq!(responses[0].result, Some(json!(false)));
    }

    #[tokio::test]
    async fn unknown_method_is_rejected() {
        let req = Request::call(3, "definitelyNotAMethod", None);
        let responses = roundtrip(req).await;
        assert_eq!(responses[0].error.as_ref().unwrap().code, -32601);
    }

    #[tokio::test]
    async fn responder_emits_progress_and_end_notifications() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let responder = Responder { invoke_id: 9, out: tx };
        responder.progress(json!({"p": 10}));
        responder.end(Some(json!({"ok": true})));
        let first: Request = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(first.method, "progress");
        assert!(first.id.is_none());
        let second: Request = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(second.method, "end");
        assert_eq!(second.params.unwrap()["invokeId"], json!(9));
    }
}
