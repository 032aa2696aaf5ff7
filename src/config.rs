use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Immutable record handed to a worker at fork time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerConfig {
    /// Stable worker id. When absent the supervisor derives one from the
    /// url prefix, falling back to `process-<n>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Path prefix the worker mounts its HTTP surface under.
    #[serde(default)]
    pub url_prefix: String,

    #[serde(default = "default_host")]
    pub host: String,

    /// Requested port; 0 asks the OS for an ephemeral one.
    #[serde(default)]
    pub port: u16,

    /// What to do when the requested port is taken.
    #[serde(default)]
    pub dynamic_port: DynamicPort,

    /// Storage root; `<storage>/plugins/` is scanned for plugin modules.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<PathBuf>,

    /// Explicit environment for the worker. When absent the supervisor
    /// consults its secrets source instead.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

/// Dynamic-port policy: `false`, `true` (unbounded probing), or a budget of
/// remaining attempts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DynamicPort {
    Flag(bool),
    Attempts(u32),
}

impl Default for DynamicPort {
    fn default() -> Self {
        DynamicPort::Flag(false)
    }
}

impl DynamicPort {
    pub fn is_enabled(&self) -> bool {
        match self {
            DynamicPort::Flag(b) => *b,
            DynamicPort::Attempts(n) => *n > 0,
        }
    }

    /// Remaining probe budget; `None` means unbounded.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            DynamicPort::Flag(_) => None,
            DynamicPort::Attempts(n) => Some(*n),
        }
    }
}

pub const WEBHOOK_EXPIRY_TIME: &str = "WEBHOOK_EXPIRY_TIME";
pub const INTERNAL_WEBHOOK_URL: &str = "INTERNAL_WEBHOOK_URL";
pub const EXTERNAL_WEBHOOK_URL: &str = "EXTERNAL_WEBHOOK_URL";
pub const SERVERLESS_ID: &str = "SERVERLESS_ID";

const DEFAULT_EXPIRY_MS: u64 = 300_000;

/// Environment-derived worker settings, read once at bootstrap and again
/// after a plugin-loader restart merges new variables in. Never re-read
/// mid-request.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub internal_webhook_url: Option<String>,
    pub external_webhook_url: Option<String>,
    pub serverless_id: Option<String>,
    pub webhook_expiry: Duration,
}

impl Settings {
    pub fn from_env() -> Self {
        let webhook_expiry = match env::var(WEBHOOK_EXPIRY_TIME) {
            Ok(raw) => match raw.parse::<u64>() {
                Ok(ms) => Duration::from_millis(ms),
                Err(_) => {
                    warn!(value = %raw, "unparseable {WEBHOOK_EXPIRY_TIME}, using default");
                    Duration::from_millis(DEFAULT_EXPIRY_MS)
                }
            },
            Err(_) => Duration::from_millis(DEFAULT_EXPIRY_MS),
        };
        Self {
            internal_webhook_url: env::var(INTERNAL_WEBHOOK_URL).ok(),
            external_webhook_url: env::var(EXTERNAL_WEBHOOK_URL).ok(),
            serverless_id: env::var(SERVERLESS_ID).ok(),
            webhook_expiry,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn dynamic_port_accepts_bool_and_integer() {
        let cfg: WorkerConfig = serde_json::from_value(json!({
            "urlPrefix": "api",
            "dynamicPort": true,
        }))
        .unwrap();
        assert_eq!(cfg.dynamic_port, DynamicPort::Flag(true));
        assert!(cfg.dynamic_port.is_enabled());
        assert_eq!(cfg.dynamic_port.attempts(), None);

        let cfg: WorkerConfig = serde_json::from_value(json!({
            "urlPrefix": "api",
            "dynamicPort": 5,
        }))
        .unwrap();
        assert_eq!(cfg.dynamic_port.attempts(), Some(5));

        let cfg: WorkerConfig = serde_json::from_value(json!({"urlPrefix": "api"})).unwrap();
        assert!(!cfg.dynamic_port.is_enabled());
    }

    #[test]
    fn worker_config_roundtrip() {
        let cfg = WorkerConfig {
            id: Some("w1".into()),
            url_prefix: "api".into(),
            host: "127.0.0.1".into(),
            port: 9123,
            dynamic_port: DynamicPort::Attempts(3),
            storage: Some(PathBuf::from("/tmp/faaslet")),
            env: None,
        };
        let v = serde_json::to_value(&cfg).unwrap();
        assert_eq!(v["urlPrefix"], json!("api"));
        assert_eq!(v["dynamicPort"], json!(3));
        let back: WorkerConfig = serde_json::from_value(v).unwrap();
        assert_eq!(back, cfg);
    }
}
