//! Plugin contract as the worker sees it.
//!
//! A [`PluginModule`] is a discovered-but-not-yet-instantiated plugin: it
//! can report its dependencies and produce an instance. A
//! [`PluginInstance`] exposes named operations, an authorization predicate,
//! and an optional shutdown hook. The shipping implementation wraps a
//! subprocess speaking the worker_plugin stdio protocol
//! ([`process::ProcessPluginModule`]); tests register in-process instances
//! through the same seams.

pub mod dispatch;
pub mod loader;
pub mod process;

use async_trait::async_trait;
use serde_json::Value;

use crate::response::{DelayedResponse, ResponseEngine};

/// Per-invocation context handed to plugin operations.
#[derive(Clone)]
pub struct OpContext {
    pub engine: ResponseEngine,
}

/// What an operation produced: an immediate value, or a delayed response
/// that finishes through the webhook later.
pub enum Outcome {
    Sync(Value),
    Delayed(DelayedResponse),
}

impl Outcome {
    pub fn operation_type(&self) -> &'static str {
        match self {
            Outcome::Sync(_) => "sync",
            Outcome::Delayed(d) => d.kind().operation_type(),
        }
    }
}

impl std::fmt::Debug for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Sync(v) => f.debug_tuple("Sync").field(v).finish(),
            Outcome::Delayed(d) => f.debug_tuple("Delayed").field(&d.call_id()).finish(),
        }
    }
}

/// A loadable plugin module, keyed by its unique name.
#[async_trait]
pub trait PluginModule: Send + Sync {
    fn name(&self) -> &str;

    /// Names of plugins that must register before this one.
    async fn dependencies(&self) -> anyhow::Result<Vec<String>>;

    /// Produce the instance. Runs in dependency order during init.
    async fn instantiate(&self) -> anyhow::Result<Box<dyn PluginInstance>>;
}

/// A registered plugin instance.
#[async_trait]
pub trait PluginInstance: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the plugin carries an authorization predicate at all.
    fn has_allow(&self) -> bool {
        true
    }

    /// Authorization predicate. Only a strict `false` denies.
    async fn allow(
        &self,
        for_whom: &str,
        email: Option<&str>,
        operation: &str,
        args: &[Value],
    ) -> anyhow::Result<bool>;

    fn has_method(&self, operation: &str) -> bool;

    async fn invoke(
        &self,
        operation: &str,
        args: Vec<Value>,
        ctx: &OpContext,
    ) -> anyhow::Result<Outcome>;

    /// Externally callable operations the plugin declares, if any.
    async fn public_methods(&self) -> Vec<String> {
        Vec::new()
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
