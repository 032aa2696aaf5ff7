//! Delayed responses: values a plugin operation hands back when its work
//! finishes after the HTTP request has already been answered. Each carries
//! a fresh call-id and reports progress and completion to the configured
//! internal webhook; CMB flavors additionally poll an external webhook.

mod engine;

pub use engine::{DelayedResponse, ResponseEngine};

use thiserror::Error;

/// The four delayed-response flavors. The tag drives the `operationType`
/// string the command dispatcher emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    Slow,
    Observable,
    CmbSlow,
    CmbObservable,
}

impl ResponseKind {
    pub fn operation_type(&self) -> &'static str {
        match self {
            ResponseKind::Slow => "slowLambda",
            ResponseKind::Observable => "observableLambda",
            ResponseKind::CmbSlow => "cmbSlowLambda",
            ResponseKind::CmbObservable => "cmbObservableLambda",
        }
    }

    /// CMB flavors poll the external webhook until it reports completion.
    pub fn is_cmb(&self) -> bool {
        matches!(self, ResponseKind::CmbSlow | ResponseKind::CmbObservable)
    }
}

/// Terminal and configuration errors for delayed responses.
#[derive(Debug, Clone, Error)]
pub enum ResponseError {
    #[error("missing configuration: {0}")]
    Config(&'static str),

    #[error("delayed response `{call_id}` expired after {timeout_ms} ms of inactivity")]
    Expired { call_id: String, timeout_ms: u64 },

    #[error("webhook delivery failed for `{call_id}`: {message}")]
    WebhookIo { call_id: String, message: String },
}

impl ResponseError {
    pub fn code(&self) -> &'static str {
        match self {
            ResponseError::Config(_) => "CONFIG",
            ResponseError::Expired { .. } => "EXPIRED",
            ResponseError::WebhookIo { .. } => "WEBHOOK_IO",
        }
    }

    pub fn call_id(&self) -> Option<&str> {
        match self {
            ResponseError::Config(_) => None,
            ResponseError::Expired { call_id, .. } => Some(call_id),
            ResponseError::WebhookIo { call_id, .. } => Some(call_id),
        }
    }
}
