//! Command dispatch: validate the incoming command, authorize it against
//! the target plugin's predicate, invoke the operation, and classify the
//! result into an `operationType` for the HTTP envelope.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::plugin::loader::PluginLoader;
use crate::plugin::{OpContext, Outcome};

/// A command as received on `PUT <urlPrefix>/executeCommand`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    #[serde(default)]
    pub for_whom: String,
    /// Operation name on the plugin.
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub plugin_name: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<CommandOptions>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// Classified result of a dispatched command.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub operation_type: &'static str,
    pub result: Value,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("invalid command: missing or empty `{0}`")]
    BadCommand(&'static str),

    #[error("no plugin registered as `{0}`")]
    NoPlugin(String),

    #[error("plugin `{0}` exposes no allow predicate")]
    NoAllow(String),

    #[error("`{for_whom}` is not authorized to call `{plugin}.{operation}`")]
    Unauthorized {
        for_whom: String,
        plugin: String,
        operation: String,
    },

    #[error("plugin `{plugin}` has no operation `{operation}`")]
    NoMethod { plugin: String, operation: String },

    #[error("plugin operation failed: {0}")]
    Call(#[source] anyhow::Error),
}

impl DispatchError {
    /// HTTP status the envelope carries for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            DispatchError::BadCommand(_) => 400,
            _ => 500,
        }
    }
}

fn validate(cmd: &Command) -> Result<(), DispatchError> {
    if cmd.for_whom.is_empty() {
        return Err(DispatchError::BadCommand("forWhom"));
    }
    if cmd.name.is_empty() {
        return Err(DispatchError::BadCommand("name"));
    }
    if cmd.plugin_name.is_empty() {
        return Err(DispatchError::BadCommand("pluginName"));
    }
    Ok(())
}

pub async fn execute(loader: &PluginLoader, cmd: Command) -> Result<CommandOutcome, DispatchError> {
    if loader.is_restarting() {
        return Ok(CommandOutcome {
            operation_type: "restart",
            result: Value::Null,
        });
    }

    validate(&cmd)?;

    let plugin = loader
        .get(&cmd.plugin_name)
        .ok_or_else(|| DispatchError::NoPlugin(cmd.plugin_name.clone()))?;

    if !plugin.has_allow() {
        return Err(DispatchError::NoAllow(cmd.plugin_name.clone()));
    }

    let email = cmd.options.as_ref().and_then(|o| o.email.as_deref());
    let permitted = plugin
        .allow(&cmd.for_whom, email, &cmd.name, &cmd.args)
        .await
        .map_err(DispatchError::Call)?;
    if !permitted {
        return Err(DispatchError::Unauthorized {
            for_whom: cmd.for_whom.clone(),
            plugin: cmd.plugin_name.clone(),
            operation: cmd.name.clone(),
        });
    }

    if !plugin.has_method(&cmd.name) {
        return Err(DispatchError::NoMethod {
            plugin: cmd.plugin_name.clone(),
            operation: cmd.name.clone(),
        });
    }

    let ctx = OpContext {
        engine: loader.engine().clone(),
    };
    let outcome = plugin
        .invoke(&cmd.name, cmd.args, &ctx)
        .await
        .map_err(DispatchError::Call)?;

    Ok(classify(outcome))
}

fn classify(outcome: Outcome) -> CommandOutcome {
    let operation_type = outcome.operation_type();
    let result = match outcome {
        Outcome::Sync(value) => value,
        Outcome::Delayed(response) => Value::String(response.call_id().to_string()),
    };
    CommandOutcome {
        operation_type,
        result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cleanup::CleanupRegistry;
    use crate::config::Settings;
    use crate::plugin::testing::TestPlugin;
    use crate::response::{ResponseEngine, ResponseKind};
    use serde_json::json;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::Duration;

    fn loader_with(plugins: Vec<TestPlugin>) -> PluginLoader {
        let settings = Settings {
            internal_webhook_url: Some("http://127.0.0.1:9/hooks".into()),
            external_webhook_url: Some("http://127.0.0.1:9/poll".into()),
            webhook_expiry: Duration::from_secs(30),
            ..Default::default()
        };
        let engine = ResponseEngine::new(settings, CleanupRegistry::new());
        let dir = std::env::temp_dir();
        let loader = PluginLoader::new(dir, engine);
        for plugin in plugins {
            loader.register_instance(Arc::new(plugin)).unwrap();
        }
        loader
    }

    fn command(plugin: &str, name: &str, for_whom: &str) -> Command {
        Command {
            for_whom: for_whom.into(),
            name: name.into(),
            plugin_name: plugin.into(),
            args: vec![],
            options: None,
        }
    }

    #[tokio::test]
    async fn sync_result_is_classified_as_sync() {
        let loader = loader_with(vec![TestPlugin::new("A")]);
        let outcome = execute(&loader, command("A", "testMethod", "t")).await.unwrap();
        assert_eq!(outcome.operation_type, "sync");
        assert_eq!(outcome.result, json!("Hello from A"));
    }

    #[tokio::test]
    async fn undefined_result_stays_sync_with_null() {
        let loader = loader_with(vec![TestPlugin::new("A")]);
        let outcome = execute(&loader, command("A", "noResult", "t")).await.unwrap();
        assert_eq!(outcome.operation_type, "sync");
        assert_eq!(outcome.result, Value::Null);
    }

    #[tokio::test]
    async fn delayed_results_carry_their_call_id() {
        for (kind, tag) in [
            (ResponseKind::Slow, "slowLambda"),
            (ResponseKind::Observable, "observableLambda"),
            (ResponseKind::CmbSlow, "cmbSlowLambda"),
            (ResponseKind::CmbObservable, "cmbObservableLambda"),
        ] {
            let mut plugin = TestPlugin::new("A");
            plugin.delayed_kind = Some(kind);
            let loader = loader_with(vec![plugin]);
            let outcome = execute(&loader, command("A", "delayedMethod", "t"))
                .await
                .unwrap();
            assert_eq!(outcome.operation_type, tag);
            let call_id = outcome.result.as_str().expect("call id should be a string");
            assert!(!call_id.is_empty());
        }
    }

    #[tokio::test]
    async fn empty_fields_are_bad_commands() {
        let loader = loader_with(vec![TestPlugin::new("A")]);
        for (cmd, field) in [
            (command("A", "testMethod", ""), "forWhom"),
            (command("A", "", "t"), "name"),
            (command("", "testMethod", "t"), "pluginName"),
        ] {
            let err = execute(&loader, cmd).await.unwrap_err();
            assert_eq!(err.status_code(), 400);
            assert!(err.to_string().contains(field));
        }
    }

    #[tokio::test]
    async fn unknown_plugin_is_an_error() {
        let loader = loader_with(vec![]);
        let err = execute(&loader, command("ghost", "testMethod", "t"))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::NoPlugin(_)));
        assert_eq!(err.status_code(), 500);
    }

    #[tokio::test]
    async fn missing_allow_predicate_is_an_error() {
        let mut plugin = TestPlugin::new("A");
        plugin.has_allow = false;
        let loader = loader_with(vec![plugin]);
        let err = execute(&loader, command("A", "testMethod", "t"))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::NoAllow(_)));
    }

    #[tokio::test]
    async fn denied_caller_never_reaches_the_method() {
        let mut plugin = TestPlugin::new("A");
        plugin.deny = vec!["mallory".into()];
        let invoked = Arc::clone(&plugin.invoked);
        let loader = loader_with(vec![plugin]);
        let err = execute(&loader, command("A", "testMethod", "mallory"))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Unauthorized { .. }));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unknown_operation_is_no_method() {
        let loader = loader_with(vec![TestPlugin::new("A")]);
        let err = execute(&loader, command("A", "levitate", "t"))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::NoMethod { .. }));
    }

    #[tokio::test]
    async fn plugin_failures_surface_as_call_errors() {
        let loader = loader_with(vec![TestPlugin::new("A")]);
        let err = execute(&loader, command("A", "failing", "t")).await.unwrap_err();
        assert!(matches!(err, DispatchError::Call(_)));
        assert!(err.to_string().contains("operation failed"));
    }

    #[test]
    fn command_wire_names_are_camel_case() {
        let cmd: Command = serde_json::from_value(json!({
            "forWhom": "t",
            "name": "testMethod",
            "pluginName": "A",
            "args": [1, 2],
            "options": {"email": "t@example.com"}
        }))
        .unwrap();
        assert_eq!(cmd.for_whom, "t");
        assert_eq!(cmd.plugin_name, "A");
        assert_eq!(cmd.args.len(), 2);
        assert_eq!(cmd.options.unwrap().email.as_deref(), Some("t@example.com"));
    }
}
