//! Lifecycle engine behind [`DelayedResponse`].
//!
//! One engine lives in each worker. It owns the webhook HTTP client, the
//! registry of live responses, and the per-response background tasks: an
//! inactivity expiry timer and, for CMB flavors, a 1 Hz poll of the
//! external webhook. Completion is a one-way transition; listener and
//! cleanup lists drain exactly once, in the terminal step.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use dashmap::DashMap;
use rand::RngCore;
use serde_json::{json, Value};
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cleanup::CleanupRegistry;
use crate::config::Settings;

use super::{ResponseError, ResponseKind};

const SERVERLESS_ID_HEADER: &str = "x-serverless-id";

/// 256 bits of randomness, url-safe base64 without padding.
fn fresh_call_id() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

type CleanupCb = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;
type ErrorCb = Box<dyn FnOnce(&ResponseError) + Send>;
type ExternalCb = Box<dyn FnOnce(Value) + Send>;

#[derive(Clone)]
pub struct ResponseEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    settings: Settings,
    http: reqwest::Client,
    cleanup: CleanupRegistry,
    live: DashMap<String, Arc<ResponseCore>>,
}

impl ResponseEngine {
    pub fn new(settings: Settings, cleanup: CleanupRegistry) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                settings,
                http: reqwest::Client::new(),
                cleanup,
                live: DashMap::new(),
            }),
        }
    }

    pub fn cleanup_registry(&self) -> &CleanupRegistry {
        &self.inner.cleanup
    }

    /// Call-ids with an outstanding response.
    pub fn live_call_ids(&self) -> Vec<String> {
        self.inner.live.iter().map(|e| e.key().clone()).collect()
    }

    /// Create a delayed response: fresh call-id, expiry timer armed, an
    /// expiry trigger registered in the cleanup registry, and — when a
    /// serverless identity is configured — the call-id→worker mapping
    /// registered with the webhook router (best effort).
    pub fn create(&self, kind: ResponseKind) -> Result<DelayedResponse, ResponseError> {
        let settings = &self.inner.settings;
        let webhook_url = settings
            .internal_webhook_url
            .clone()
            .ok_or(ResponseError::Config(crate::config::INTERNAL_WEBHOOK_URL))?;
        let external_url = if kind.is_cmb() {
            Some(
                settings
                    .external_webhook_url
                    .clone()
                    .ok_or(ResponseError::Config(crate::config::EXTERNAL_WEBHOOK_URL))?,
            )
        } else {
            None
        };

        let call_id = fresh_call_id();
        let core = Arc::new(ResponseCore {
            call_id: call_id.clone(),
            kind,
            webhook_url,
            expiry: settings.webhook_expiry,
            engine: Arc::clone(&self.inner),
            listeners: Mutex::new(Listeners::default()),
            deadline: Mutex::new(Instant::now() + settings.webhook_expiry),
            completed_tx: watch::channel(false).0,
            wake: Notify::new(),
            expire_now: AtomicBool::new(false),
        });

        self.inner.live.insert(call_id.clone(), Arc::clone(&core));

        // cleanup-registry entry: executing it expires the response
        let trigger = Arc::downgrade(&core);
        self.inner.cleanup.register(&call_id, move || {
            if let Some(core) = trigger.upgrade() {
                core.expire_now.store(true, Ordering::SeqCst);
                core.wake.notify_one();
            }
            Ok(())
        });

        if let Some(serverless_id) = settings.serverless_id.clone() {
            let mapping = Arc::clone(&core);
            tokio::spawn(async move {
                let body = json!({
                    "callId": mapping.call_id,
                    "serverlessId": serverless_id,
                });
                if let Err(e) = mapping.put("registerMapping", body).await {
                    warn!(call_id = %mapping.call_id, error = %e, "failed to register serverless mapping");
                }
            });
        }

        tokio::spawn(run_expiry_timer(Arc::clone(&core)));
        if let Some(url) = external_url {
            tokio::spawn(run_cmb_poll(Arc::clone(&core), url));
        }

        Ok(DelayedResponse { core })
    }
}

impl std::fmt::Debug for ResponseEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseEngine")
            .field("live", &self.inner.live.len())
            .finish()
    }
}

#[derive(Default)]
struct Listeners {
    completed: bool,
    on_error: Vec<ErrorCb>,
    expiry_cleanups: Vec<CleanupCb>,
    resource_cleanups: Vec<CleanupCb>,
    external: Option<ExternalCb>,
}

/// Listener lists drained at the terminal transition.
struct TerminalParts {
    on_error: Vec<ErrorCb>,
    expiry_cleanups: Vec<CleanupCb>,
    resource_cleanups: Vec<CleanupCb>,
}

struct ResponseCore {
    call_id: String,
    kind: ResponseKind,
    webhook_url: String,
    expiry: Duration,
    engine: Arc<EngineInner>,
    listeners: Mutex<Listeners>,
    deadline: Mutex<Instant>,
    completed_tx: watch::Sender<bool>,
    wake: Notify,
    expire_now: AtomicBool,
}

impl ResponseCore {
    fn is_completed(&self) -> bool {
        self.listeners.lock().unwrap().completed
    }

    /// One-way completion transition. Returns the drained listener lists
    /// exactly once; later callers get `None` and must drop out.
    fn begin_completion(&self) -> Option<TerminalParts> {
        let mut st = self.listeners.lock().unwrap();
        if st.completed {
            return None;
        }
        st.completed = true;
        st.external = None;
        let parts = TerminalParts {
            on_error: std::mem::take(&mut st.on_error),
            expiry_cleanups: std::mem::take(&mut st.expiry_cleanups),
            resource_cleanups: std::mem::take(&mut st.resource_cleanups),
        };
        drop(st);
        let _ = self.completed_tx.send(true);
        Some(parts)
    }

    /// Reset the inactivity deadline.
    fn touch(&self) {
        *self.deadline.lock().unwrap() = Instant::now() + self.expiry;
        self.wake.notify_one();
    }

    async fn put(&self, path: &str, body: Value) -> Result<(), ResponseError> {
        let url = format!("{}/{}", self.webhook_url.trim_end_matches('/'), path);
        let mut req = self.engine.http.put(&url).json(&body);
        if let Some(sid) = &self.engine.settings.serverless_id {
            req = req.header(SERVERLESS_ID_HEADER, sid);
        }
        let io_err = |e: reqwest::Error| ResponseError::WebhookIo {
            call_id: self.call_id.clone(),
            message: e.to_string(),
        };
        let resp = req.send().await.map_err(io_err)?;
        resp.error_for_status().map(|_| ()).map_err(io_err)
    }

    async fn progress(&self, data: Value) -> Result<(), ResponseError> {
        if self.is_completed() {
            debug!(call_id = %self.call_id, "progress after completion, dropped");
            return Ok(());
        }
        self.touch();
        let body = json!({
            "callId": self.call_id,
            "status": "pending",
            "progress": data,
        });
        match self.put("progress", body).await {
            Ok(()) => Ok(()),
            Err(err) => {
                if let Some(parts) = self.begin_completion() {
                    self.run_error_path(parts, &err);
                }
                Err(err)
            }
        }
    }

    async fn end(&self, result: Option<Value>) -> Result<(), ResponseError> {
        let Some(parts) = self.begin_completion() else {
            debug!(call_id = %self.call_id, "end after completion, dropped");
            return Ok(());
        };
        self.touch();
        let mut body = json!({
            "callId": self.call_id,
            "status": "completed",
        });
        if let Some(result) = result {
            body["result"] = result;
        }
        match self.put("result", body).await {
            Ok(()) => {
                run_cleanups(&self.call_id, parts.resource_cleanups);
                self.engine.drop_entry(&self.call_id);
                Ok(())
            }
            Err(err) => {
                self.run_error_path(parts, &err);
                Err(err)
            }
        }
    }

    /// Inactivity expiry: completes with an `EXPIRED` error, then drains
    /// error listeners, expiry cleanups, and resource cleanups in that
    /// order.
    async fn expire(&self) {
        let Some(parts) = self.begin_completion() else {
            return;
        };
        let err = ResponseError::Expired {
            call_id: self.call_id.clone(),
            timeout_ms: self.expiry.as_millis() as u64,
        };
        warn!(call_id = %self.call_id, timeout_ms = self.expiry.as_millis() as u64, "delayed response expired");
        for cb in parts.on_error {
            cb(&err);
        }
        run_cleanups(&self.call_id, parts.expiry_cleanups);
        run_cleanups(&self.call_id, parts.resource_cleanups);
        self.engine.drop_entry(&self.call_id);
    }

    /// Shared terminal error path for webhook failures: error listeners,
    /// then resource cleanups, then registry removal.
    fn run_error_path(&self, parts: TerminalParts, err: &ResponseError) {
        warn!(call_id = %self.call_id, error = %err, "delayed response failed");
        for cb in parts.on_error {
            cb(err);
        }
        run_cleanups(&self.call_id, parts.resource_cleanups);
        self.engine.drop_entry(&self.call_id);
    }
}

fn run_cleanups(call_id: &str, callbacks: Vec<CleanupCb>) {
    for cb in callbacks {
        if let Err(e) = cb() {
            warn!(call_id, error = %e, "response cleanup callback failed");
        }
    }
}

impl EngineInner {
    /// Forget a terminal response: its cleanup-registry entry (the expiry
    /// trigger) is discarded, not executed.
    fn drop_entry(&self, call_id: &str) {
        self.cleanup.remove(call_id);
        self.live.remove(call_id);
    }
}

async fn run_expiry_timer(core: Arc<ResponseCore>) {
    let mut completed = core.completed_tx.subscribe();
    loop {
        if *completed.borrow() {
            return;
        }
        if core.expire_now.load(Ordering::SeqCst) {
            core.expire().await;
            return;
        }
        let deadline = *core.deadline.lock().unwrap();
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {
                // activity may have pushed the deadline while we slept
                let current = *core.deadline.lock().unwrap();
                if current <= Instant::now() && !core.expire_now.load(Ordering::SeqCst) {
                    core.expire().await;
                    return;
                }
            }
            _ = core.wake.notified() => {}
            _ = completed.changed() => {}
        }
    }
}

/// Poll the external webhook at 1 Hz until it reports completion or the
/// owning response reaches a terminal state, whichever comes first.
async fn run_cmb_poll(core: Arc<ResponseCore>, url: String) {
    let mut completed = core.completed_tx.subscribe();
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if core.is_completed() {
                    return;
                }
                let resp = match core
                    .engine
                    .http
                    .get(&url)
                    .query(&[("callId", core.call_id.as_str())])
                    .send()
                    .await
                {
                    Ok(r) => r,
                    Err(e) => {
                        debug!(call_id = %core.call_id, error = %e, "external webhook poll failed");
                        continue;
                    }
                };
                let Ok(body) = resp.json::<Value>().await else { continue };
                if body.get("status").and_then(Value::as_str) == Some("completed") {
                    let cb = core.listeners.lock().unwrap().external.take();
                    if let Some(cb) = cb {
                        cb(body);
                    }
                    return;
                }
            }
            res = completed.changed() => {
                if res.is_err() || *completed.borrow() {
                    return;
                }
            }
        }
    }
}

/// Handle a plugin operation returns to finish its work later. Cloneable;
/// all clones share one lifecycle.
#[derive(Clone)]
pub struct DelayedResponse {
    core: Arc<ResponseCore>,
}

impl DelayedResponse {
    pub fn call_id(&self) -> &str {
        &self.core.call_id
    }

    pub fn kind(&self) -> ResponseKind {
        self.core.kind
    }

    pub fn is_completed(&self) -> bool {
        self.core.is_completed()
    }

    /// Report intermediate progress. Resets the expiry timer; a delivery
    /// failure takes the error path. No-op once completed.
    pub async fn progress(&self, data: Value) -> Result<(), ResponseError> {
        self.core.progress(data).await
    }

    /// Finish the response. `result` is `None` for observable flavors.
    /// No-op once completed.
    pub async fn end(&self, result: Option<Value>) -> Result<(), ResponseError> {
        self.core.end(result).await
    }

    /// Register a listener for the terminal error. Fires at most once;
    /// dropped silently if the response is already completed.
    pub fn on_error(&self, cb: impl FnOnce(&ResponseError) + Send + 'static) {
        let mut st = self.core.listeners.lock().unwrap();
        if !st.completed {
            st.on_error.push(Box::new(cb));
        }
    }

    /// Runs when the response expires.
    pub fn add_cleanup_callback(
        &self,
        cb: impl FnOnce() -> anyhow::Result<()> + Send + 'static,
    ) {
        let mut st = self.core.listeners.lock().unwrap();
        if !st.completed {
            st.expiry_cleanups.push(Box::new(cb));
        }
    }

    /// Runs on explicit end or on the error path.
    pub fn add_resource_cleanup_callback(
        &self,
        cb: impl FnOnce() -> anyhow::Result<()> + Send + 'static,
    ) {
        let mut st = self.core.listeners.lock().unwrap();
        if !st.completed {
            st.resource_cleanups.push(Box::new(cb));
        }
    }

    /// CMB only: receives the external webhook's payload when it reports
    /// completion.
    pub fn on_external_complete(&self, cb: impl FnOnce(Value) + Send + 'static) {
        let mut st = self.core.listeners.lock().unwrap();
        if !st.completed {
            st.external = Some(Box::new(cb));
        }
    }
}

impl std::fmt::Debug for DelayedResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelayedResponse")
            .field("call_id", &self.core.call_id)
            .field("kind", &self.core.kind)
            .field("completed", &self.is_completed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Path, Query, State};
    use axum::http::HeaderMap;
    use axum::routing::{get, put};
    use axum::{Json, Router};
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    #[derive(Debug, Clone)]
    struct Recorded {
        path: String,
        body: Value,
        serverless_id: Option<String>,
    }

    #[derive(Clone)]
    struct ReceiverState {
        records: Arc<Mutex<Vec<Recorded>>>,
        polls: Arc<AtomicUsize>,
        poll_response: Arc<Mutex<Value>>,
    }

    async fn record_put(
        State(st): State<ReceiverState>,
        Path(path): Path<String>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> Json<Value> {
        let serverless_id = headers
            .get(SERVERLESS_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        st.records.lock().unwrap().push(Recorded {
            path,
            body,
            serverless_id,
        });
        Json(json!({"ok": true}))
    }

    async fn poll_get(
        State(st): State<ReceiverState>,
        Query(_q): Query<HashMap<String, String>>,
    ) -> Json<Value> {
        st.polls.fetch_add(1, Ordering::SeqCst);
        Json(st.poll_response.lock().unwrap().clone())
    }

    async fn spawn_receiver() -> (String, ReceiverState) {
        let st = ReceiverState {
            records: Arc::new(Mutex::new(Vec::new())),
            polls: Arc::new(AtomicUsize::new(0)),
            poll_response: Arc::new(Mutex::new(json!({"status": "pending"}))),
        };
        let app = Router::new()
            .route("/poll", get(poll_get))
            .route("/*path", put(record_put))
            .with_state(st.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), st)
    }

    fn engine_with(url: &str, expiry: Duration, serverless_id: Option<&str>) -> ResponseEngine {
        let settings = Settings {
            internal_webhook_url: Some(url.to_string()),
            external_webhook_url: Some(format!("{url}/poll")),
            serverless_id: serverless_id.map(String::from),
            webhook_expiry: expiry,
        };
        ResponseEngine::new(settings, CleanupRegistry::new())
    }

    #[tokio::test]
    async fn slow_roundtrip_progress_then_end() {
        let (url, st) = spawn_receiver().await;
        let engine = engine_with(&url, Duration::from_secs(5), None);
        let resp = engine.create(ResponseKind::Slow).unwrap();
        let call_id = resp.call_id().to_string();

        resp.progress(json!({"p": 10})).await.unwrap();
        resp.end(Some(json!({"ok": true}))).await.unwrap();
        // second end is a no-op
        resp.end(Some(json!({"ok": false}))).await.unwrap();

        let records = st.records.lock().unwrap().clone();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].path, "progress");
        assert_eq!(records[0].body["callId"], json!(call_id.clone()));
        assert_eq!(records[0].body["status"], json!("pending"));
        assert_eq!(records[0].body["progress"], json!({"p": 10}));
        assert_eq!(records[1].path, "result");
        assert_eq!(records[1].body["status"], json!("completed"));
        assert_eq!(records[1].body["result"], json!({"ok": true}));

        assert!(engine.live_call_ids().is_empty());
        assert!(engine.cleanup_registry().list().is_empty());
    }

    #[tokio::test]
    async fn observable_end_carries_no_result_field() {
        let (url, st) = spawn_receiver().await;
        let engine = engine_with(&url, Duration::from_secs(5), None);
        let resp = engine.create(ResponseKind::Observable).unwrap();
        resp.end(None).await.unwrap();
        let records = st.records.lock().unwrap().clone();
        assert_eq!(records.len(), 1);
        assert!(records[0].body.get("result").is_none());
    }

    #[tokio::test]
    async fn expiry_fires_error_listeners_exactly_once() {
        let (url, st) = spawn_receiver().await;
        let engine = engine_with(&url, Duration::from_millis(100), None);
        let resp = engine.create(ResponseKind::Slow).unwrap();
        let call_id = resp.call_id().to_string();

        let (tx, mut rx) = mpsc::unbounded_channel();
        resp.on_error(move |e| {
            let _ = tx.send((e.code(), e.call_id().map(String::from)));
        });
        let cleaned = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&cleaned);
        resp.add_cleanup_callback(move || {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        tokio::time::sleep(Duration::from_millis(400)).await;
        let (code, reported_id) = rx.recv().await.unwrap();
        assert_eq!(code, "EXPIRED");
        assert_eq!(reported_id.as_deref(), Some(call_id.as_str()));
        assert!(rx.try_recv().is_err(), "error listener fired more than once");
        assert_eq!(cleaned.load(Ordering::SeqCst), 1);

        // post-expiry activity is dropped
        resp.progress(json!({"late": true})).await.unwrap();
        resp.end(None).await.unwrap();
        assert!(st.records.lock().unwrap().is_empty());
        assert!(engine.live_call_ids().is_empty());
    }

    #[tokio::test]
    async fn progress_resets_the_expiry_timer() {
        let (url, _st) = spawn_receiver().await;
        let engine = engine_with(&url, Duration::from_millis(500), None);
        let resp = engine.create(ResponseKind::Slow).unwrap();
        let expired = Arc::new(AtomicUsize::new(0));
        let e = Arc::clone(&expired);
        resp.on_error(move |_| {
            e.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(300)).await;
        resp.progress(json!({"p": 1})).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        // 600 ms since creation, but only 300 ms since last activity
        assert_eq!(expired.load(Ordering::SeqCst), 0);
        resp.end(Some(json!({"done": true}))).await.unwrap();
        assert_eq!(expired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn executing_the_cleanup_registry_entry_expires_the_response() {
        let (url, _st) = spawn_receiver().await;
        let engine = engine_with(&url, Duration::from_secs(30), None);
        let resp = engine.create(ResponseKind::Slow).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        resp.on_error(move |e| {
            let _ = tx.send(e.code());
        });

        engine.cleanup_registry().execute(resp.call_id());
        let code = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(code, "EXPIRED");
    }

    #[tokio::test]
    async fn missing_internal_webhook_url_is_a_config_error() {
        let settings = Settings {
            internal_webhook_url: None,
            ..Default::default()
        };
        let engine = ResponseEngine::new(settings, CleanupRegistry::new());
        let err = engine.create(ResponseKind::Slow).unwrap_err();
        assert_eq!(err.code(), "CONFIG");
    }

    #[tokio::test]
    async fn cmb_flavor_requires_external_webhook_url() {
        let settings = Settings {
            internal_webhook_url: Some("http://127.0.0.1:1/hooks".into()),
            external_webhook_url: None,
            webhook_expiry: Duration::from_secs(5),
            ..Default::default()
        };
        let engine = ResponseEngine::new(settings, CleanupRegistry::new());
        assert_eq!(
            engine.create(ResponseKind::CmbSlow).unwrap_err().code(),
            "CONFIG"
        );
        // non-CMB flavors do not need it
        assert!(engine.create(ResponseKind::Slow).is_ok());
    }

    #[tokio::test]
    async fn serverless_mapping_is_registered_and_header_tags_requests() {
        let (url, st) = spawn_receiver().await;
        let engine = engine_with(&url, Duration::from_secs(5), Some("sls-42"));
        let resp = engine.create(ResponseKind::Slow).unwrap();

        // mapping registration is fire-and-forget; wait for it
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            let found = st
                .records
                .lock()
                .unwrap()
                .iter()
                .any(|r| r.path == "registerMapping");
            if found || std::time::Instant::now() > deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        resp.end(Some(json!(1))).await.unwrap();
        let records = st.records.lock().unwrap().clone();
        let mapping = records
            .iter()
            .find(|r| r.path == "registerMapping")
            .expect("mapping was never registered");
        assert_eq!(mapping.body["serverlessId"], json!("sls-42"));
        assert_eq!(mapping.serverless_id.as_deref(), Some("sls-42"));
        let result = records.iter().find(|r| r.path == "result").unwrap();
        assert_eq!(result.serverless_id.as_deref(), Some("sls-42"));
    }

    #[tokio::test]
    async fn webhook_failure_takes_the_error_path() {
        // nothing listens on this port
        let settings = Settings {
            internal_webhook_url: Some("http://127.0.0.1:9/hooks".into()),
            webhook_expiry: Duration::from_secs(5),
            ..Default::default()
        };
        let engine = ResponseEngine::new(settings, CleanupRegistry::new());
        let resp = engine.create(ResponseKind::Slow).unwrap();
        let freed = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&freed);
        resp.add_resource_cleanup_callback(move || {
            f.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        resp.on_error(move |e| {
            let _ = tx.send(e.code());
        });

        let err = resp.end(Some(json!(1))).await.unwrap_err();
        assert_eq!(err.code(), "WEBHOOK_IO");
        assert_eq!(rx.recv().await.unwrap(), "WEBHOOK_IO");
        assert_eq!(freed.load(Ordering::SeqCst), 1);
        assert!(engine.live_call_ids().is_empty());
    }

    #[tokio::test]
    async fn cmb_poll_delivers_external_payload_and_stops() {
        let (url, st) = spawn_receiver().await;
        let engine = engine_with(&url, Duration::from_secs(30), None);
        let resp = engine.create(ResponseKind::CmbSlow).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        resp.on_external_complete(move |data| {
            let _ = tx.send(data);
        });

        // let a pending poll or two happen, then flip to completed
        tokio::time::sleep(Duration::from_millis(1200)).await;
        *st.poll_response.lock().unwrap() = json!({"status": "completed", "payload": 7});

        let data = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(data["payload"], json!(7));

        let polls_after_completion = st.polls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(
            st.polls.load(Ordering::SeqCst),
            polls_after_completion,
            "polling continued after external completion"
        );

        resp.end(Some(json!({"ok": true}))).await.unwrap();
    }

    #[tokio::test]
    async fn terminal_completion_stops_cmb_polling() {
        let (url, st) = spawn_receiver().await;
        let engine = engine_with(&url, Duration::from_secs(30), None);
        let resp = engine.create(ResponseKind::CmbObservable).unwrap();
        resp.end(None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        let polls = st.polls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(st.polls.load(Ordering::SeqCst), polls);
    }

    #[tokio::test]
    async fn call_ids_are_unique_and_url_safe() {
        let a = fresh_call_id();
        let b = fresh_call_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 43); // 32 bytes, base64 no-pad
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }
}
