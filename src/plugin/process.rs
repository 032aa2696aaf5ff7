//! Process-backed plugins: each `<storage>/plugins/<name>.plugin`
//! executable becomes one [`ProcessPluginModule`]. Instantiation, the
//! allow predicate, and every operation travel over the worker_plugin
//! stdio protocol; delayed invocations are driven by a background task
//! that feeds the plugin's `progress`/`end` notifications into the
//! response the worker created for them.

use std::path::Path;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};
use worker_plugin::host::{Activity, PluginProcess};
use worker_plugin::rpc::{AllowParams, InvokeKind};

use crate::response::ResponseKind;

use super::{OpContext, Outcome, PluginInstance, PluginModule};

pub struct ProcessPluginModule {
    proc: PluginProcess,
}

impl ProcessPluginModule {
    /// Spawn the plugin executable. The module's name is the file's base
    /// name; the process stays up for the lifetime of the worker (or until
    /// a loader restart shuts it down).
    pub fn load(name: &str, path: &Path) -> anyhow::Result<Self> {
        let proc = PluginProcess::spawn(name, path)?;
        Ok(Self { proc })
    }
}

#[async_trait]
impl PluginModule for ProcessPluginModule {
    fn name(&self) -> &str {
        self.proc.name()
    }

    async fn dependencies(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.proc.get_dependencies().await?)
    }

    async fn instantiate(&self) -> anyhow::Result<Box<dyn PluginInstance>> {
        let info = self.proc.get_instance(self.proc.name()).await?;
        Ok(Box::new(ProcessPluginInstance {
            proc: self.proc.clone(),
            methods: info.methods,
            has_allow: info.has_allow,
        }))
    }
}

fn response_kind(kind: InvokeKind) -> Option<ResponseKind> {
    match kind {
        InvokeKind::Sync => None,
        InvokeKind::Slow => Some(ResponseKind::Slow),
        InvokeKind::Observable => Some(ResponseKind::Observable),
        InvokeKind::CmbSlow => Some(ResponseKind::CmbSlow),
        InvokeKind::CmbObservable => Some(ResponseKind::CmbObservable),
    }
}

pub struct ProcessPluginInstance {
    proc: PluginProcess,
    methods: Vec<String>,
    has_allow: bool,
}

#[async_trait]
impl PluginInstance for ProcessPluginInstance {
    fn name(&self) -> &str {
        self.proc.name()
    }

    fn has_allow(&self) -> bool {
        self.has_allow
    }

    async fn allow(
        &self,
        for_whom: &str,
        email: Option<&str>,
        operation: &str,
        args: &[Value],
    ) -> anyhow::Result<bool> {
        let verdict = self
            .proc
            .allow(AllowParams {
                for_whom: for_whom.to_string(),
                email: email.map(String::from),
                operation: operation.to_string(),
                args: args.to_vec(),
            })
            .await?;
        // only a strict false denies
        Ok(verdict != Value::Bool(false))
    }

    fn has_method(&self, operation: &str) -> bool {
        self.methods.iter().any(|m| m == operation)
    }

    async fn invoke(
        &self,
        operation: &str,
        args: Vec<Value>,
        ctx: &OpContext,
    ) -> anyhow::Result<Outcome> {
        let (invoke_id, result, mut activity) = self.proc.invoke(operation, args).await?;

        let Some(kind) = response_kind(result.kind) else {
            self.proc.release_invocation(invoke_id);
            return Ok(Outcome::Sync(result.result.unwrap_or(Value::Null)));
        };

        let response = ctx.engine.create(kind)?;

        if kind.is_cmb() {
            // route the external webhook's payload back into the plugin
            let proc = self.proc.clone();
            response.on_external_complete(move |data| {
                proc.send_external_event(invoke_id, data);
            });
        }

        // drive the plugin's progress/end notifications into the response
        let driver = response.clone();
        let proc = self.proc.clone();
        let plugin_name = self.proc.name().to_string();
        tokio::spawn(async move {
            while let Some(act) = activity.recv().await {
                match act {
                    Activity::Progress(data) => {
                        if let Err(e) = driver.progress(data).await {
                            warn!(plugin = %plugin_name, error = %e, "progress delivery failed");
                            break;
                        }
                    }
                    Activity::End(result) => {
                        if let Err(e) = driver.end(result).await {
                            warn!(plugin = %plugin_name, error = %e, "result delivery failed");
                        }
                        break;
                    }
                }
            }
            debug!(plugin = %plugin_name, invoke_id, "invocation activity drained");
            proc.release_invocation(invoke_id);
        });

        Ok(Outcome::Delayed(response))
    }

    async fn public_methods(&self) -> Vec<String> {
        match self.proc.get_public_methods().await {
            Ok(Some(methods)) => methods,
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!(plugin = %self.proc.name(), error = %e, "getPublicMethods failed");
                Vec::new()
            }
        }
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        self.proc.shutdown().await?;
        Ok(())
    }
}
