//! JSON-RPC 2.0 wire types for the worker ↔ plugin stdio protocol.
//!
//! These structs mirror the [JSON-RPC 2.0 spec](https://www.jsonrpc.org/specification),
//! restricted to integer ids. They are transport-agnostic; faaslet carries
//! them as newline-delimited JSON over a child process's stdin/stdout.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::error;

pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC 2.0 Request object. `id` is omitted for notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
}

fn default_version() -> String {
    JSONRPC_VERSION.to_owned()
}

/// JSON-RPC 2.0 Error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// JSON-RPC 2.0 Response object. Exactly one of `result` / `error` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    pub id: i64,
}

/// Convenience enum so either side can `from_str::<Message>` a line without
/// inspecting it first. `Request` must stay first: a request also carries
/// an `id`, so the `Response` shape would otherwise match it too.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Request(Request),
    Response(Response),
}

impl Request {
    /// A *notification*: no response expected.
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            method: method.into(),
            params,
            id: None,
        }
    }

    /// A *call* expecting a response.
    pub fn call(id: i64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            method: method.into(),
            params,
            id: Some(id),
        }
    }
}

impl Response {
    pub fn success(id: i64, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn fail(id: i64, code: i64, message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
                data,
            }),
            id,
        }
    }
}

/// Strongly-typed method names used between the worker and its plugin
/// subprocesses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    // Module contract
    GetDependencies,
    GetInstance,
    GetPublicMethods,
    Shutdown,

    // Instance contract
    Allow,
    Invoke,

    // Delayed-response traffic
    Progress,
    End,
    ExternalEvent,
}

impl Method {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Method::GetDependencies => "getDependencies",
            Method::GetInstance => "getInstance",
            Method::GetPublicMethods => "getPublicMethods",
            Method::Shutdown => "shutdown",
            Method::Allow => "allow",
            Method::Invoke => "invoke",
            Method::Progress => "progress",
            Method::End => "end",
            Method::ExternalEvent => "externalEvent",
        }
    }
}

impl From<Method> for String {
    fn from(m: Method) -> Self {
        m.as_str().to_owned()
    }
}

impl std::str::FromStr for Method {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "getDependencies" => Ok(Method::GetDependencies),
            "getInstance" => Ok(Method::GetInstance),
            "getPublicMethods" => Ok(Method::GetPublicMethods),
            "shutdown" => Ok(Method::Shutdown),
            "allow" => Ok(Method::Allow),
            "invoke" => Ok(Method::Invoke),
            "progress" => Ok(Method::Progress),
            "end" => Ok(Method::End),
            "externalEvent" => Ok(Method::ExternalEvent),
            other => {
                error!("unknown plugin rpc method `{other}`");
                Err(())
            }
        }
    }
}

// -----------------------------------------------------------------------------
// Typed params / results
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetDependenciesResult {
    #[serde(default)]
    pub dependencies: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetInstanceParams {
    pub name: String,
}

/// Returned by `getInstance` so the host can enforce method existence and
/// the presence of an authorization predicate without extra round-trips.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetInstanceResult {
    pub methods: Vec<String>,
    pub has_allow: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllowParams {
    pub for_whom: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub operation: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokeParams {
    pub operation: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

/// How an `invoke` completed on the plugin side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InvokeKind {
    Sync,
    Slow,
    Observable,
    CmbSlow,
    CmbObservable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvokeResult {
    pub kind: InvokeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressParams {
    pub invoke_id: i64,
    pub data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndParams {
    pub invoke_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalEventParams {
    pub invoke_id: i64,
    pub data: Value,
}
