//! Plugin contract for faaslet workers.
//!
//! A plugin is a standalone executable dropped into `<storage>/plugins/` as
//! `<name>.plugin`. The worker spawns it and the two sides speak
//! line-delimited JSON-RPC 2.0 over the child's stdin/stdout:
//!
//! * host → plugin calls: `getDependencies`, `getInstance`, `allow`,
//!   `invoke`, `getPublicMethods`, `shutdown`
//! * plugin → host notifications: `progress`, `end` (delayed-response
//!   activity, keyed by the id of the originating `invoke` call)
//! * host → plugin notification: `externalEvent` (data collected from the
//!   external webhook on behalf of a CMB invocation)
//!
//! Plugin authors implement [`runtime::PluginService`] and hand it to
//! [`runtime::run`]; the worker side uses [`host::PluginProcess`].

pub mod host;
pub mod rpc;
pub mod runtime;
