//! Supervisor ↔ worker IPC: newline-delimited JSON over the child's
//! stdin/stdout. The `type` tag discriminates; unknown tags fail to decode
//! and the receiver drops the line after logging it. Worker log output goes
//! to stderr so stdout stays protocol-only.

use serde::{Deserialize, Serialize};

use crate::config::WorkerConfig;

/// Messages the supervisor sends to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ParentMsg {
    /// Bootstrap: carries the full worker configuration.
    Start { config: WorkerConfig },
    /// Begin graceful termination.
    Shutdown,
}

/// Messages a worker sends to its supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WorkerMsg {
    /// The HTTP listener is up and all routes are registered.
    Ready { url: String, port: u16 },
    /// Fatal bootstrap failure or uncaught error; the worker exits next.
    Error { error: String },
}

/// Serialize a message to one protocol line (no trailing newline).
pub fn encode<T: Serialize>(msg: &T) -> String {
    // the IPC enums cannot fail to serialize
    serde_json::to_string(msg).unwrap_or_default()
}
