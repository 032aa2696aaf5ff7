//! Reference plugin exercising the whole contract: a sync method, delayed
//! methods with progress/end, an allow predicate with a deny list, and
//! declared dependencies. Integration tests copy this binary into a
//! worker's `plugins/` directory as `<name>.plugin`.
//!
//! Environment knobs:
//! * `PLUGIN_MOCK_DEPS` — comma-separated dependency names to declare
//! * `PLUGIN_MOCK_DENY` — comma-separated `forWhom` values to reject

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use worker_plugin::rpc::{InvokeKind, InvokeResult};
use worker_plugin::runtime::{run, InstanceInfo, PluginService, Responder};

fn env_list(key: &str) -> Vec<String> {
    std::env::var(key)
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[derive(Default)]
struct MockPlugin {
    name: String,
}

#[async_trait]
impl PluginService for MockPlugin {
    async fn dependencies(&mut self) -> Vec<String> {
        env_list("PLUGIN_MOCK_DEPS")
    }

    async fn get_instance(&mut self, name: &str) -> Result<InstanceInfo, String> {
        self.name = name.to_string();
        Ok(InstanceInfo {
            methods: vec![
                "testMethod".into(),
                "echo".into(),
                "slowMethod".into(),
                "observableMethod".into(),
            ],
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
        Value::Bool(!env_list("PLUGIN_MOCK_DENY").iter().any(|d| d == for_whom))
    }

    async fn invoke(
        &mut self,
        operation: &str,
        args: Vec<Value>,
        responder: Responder,
    ) -> Result<InvokeResult, String> {
        match operation {
            "testMethod" => Ok(InvokeResult {
                kind: InvokeKind::Sync,
                result: Some(json!(format!("Hello from {}", self.name))),
            }),
            "echo" => Ok(InvokeResult {
                kind: InvokeKind::Sync,
                result: Some(args.into_iter().next().unwrap_or(Value::Null)),
            }),
            "slowMethod" => {
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    responder.progress(json!({"p": 10}));
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    responder.end(Some(json!({"ok": true})));
                });
                Ok(InvokeResult {
                    kind: InvokeKind::Slow,
                    result: None,
                })
            }
            "observableMethod" => {
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    responder.progress(json!({"p": 50}));
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    responder.end(None);
                });
                Ok(InvokeResult {
                    kind: InvokeKind::Observable,
                    result: None,
                })
            }
            other => Err(format!("no such operation `{other}`")),
        }
    }

    fn public_methods(&self) -> Option<Vec<String>> {
        Some(vec!["testMethod".into(), "echo".into()])
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    run(MockPlugin::default()).await
}
