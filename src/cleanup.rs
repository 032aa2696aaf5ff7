//! Keyed registry of cleanup callbacks, one instance per worker process.
//! The delayed-response engine registers an expiry trigger per call-id;
//! embedders may hang arbitrary teardown work off the same key.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::warn;

type CleanupFn = Box<dyn FnOnce() -> anyhow::Result<()> + Send + Sync>;

#[derive(Clone, Default)]
pub struct CleanupRegistry {
    entries: Arc<DashMap<String, Vec<CleanupFn>>>,
}

impl CleanupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a callback under `call_id`.
    pub fn register(
        &self,
        call_id: &str,
        callback: impl FnOnce() -> anyhow::Result<()> + Send + Sync + 'static,
    ) {
        self.entries
            .entry(call_id.to_string())
            .or_default()
            .push(Box::new(callback));
    }

    /// Pop all callbacks for `call_id` and invoke them in registration
    /// order. A failing callback is logged and the rest still run.
    pub fn execute(&self, call_id: &str) {
        let Some((_, callbacks)) = self.entries.remove(call_id) else {
            return;
        };
        for cb in callbacks {
            if let Err(e) = cb() {
                warn!(call_id, error = %e, "cleanup callback failed");
            }
        }
    }

    /// Discard the entry without invoking anything.
    pub fn remove(&self, call_id: &str) {
        self.entries.remove(call_id);
    }

    /// Snapshot of the keys with pending callbacks.
    pub fn list(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }
}

impl std::fmt::Debug for CleanupRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupRegistry")
            .field("keys", &self.list())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[test]
    fn execute_runs_callbacks_in_order_and_clears_the_key() {
        let registry = CleanupRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let seen = Arc::clone(&seen);
            registry.register("call-1", move || {
                seen.lock().unwrap().push(i);
                Ok(())
            });
        }
        registry.execute("call-1");
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
        assert!(registry.list().is_empty());
    }

    #[test]
    fn failing_callback_does_not_stop_the_rest() {
        let registry = CleanupRegistry::new();
        let ran = Arc::new(AtomicUsize::new(0));
        registry.register("call-2", || anyhow::bail!("boom"));
        let ran2 = Arc::clone(&ran);
        registry.register("call-2", move || {
            ran2.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        registry.execute("call-2");
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn remove_discards_without_invoking() {
        let registry = CleanupRegistry::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = Arc::clone(&ran);
        registry.register("call-3", move || {
            ran2.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        registry.remove("call-3");
        registry.execute("call-3");
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert!(registry.list().is_empty());
    }

    #[test]
    fn list_reports_active_keys() {
        let registry = CleanupRegistry::new();
        registry.register("a", || Ok(()));
        registry.register("b", || Ok(()));
        let mut keys = registry.list();
        keys.sort();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn executing_an_absent_key_is_a_no_op() {
        CleanupRegistry::new().execute("missing");
    }
}
