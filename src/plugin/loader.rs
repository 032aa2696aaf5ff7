//! Discovery, ordering, and registration of plugins inside a worker.
//!
//! `init` scans `<storage>/plugins/*.plugin`, asks each module for its
//! dependencies, topologically sorts the graph, and instantiates plugins
//! in that order. `restart` tears everything down (shutting plugins down
//! in load order), optionally merges fresh environment variables in, and
//! runs `init` again; the dispatcher short-circuits while that happens.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use thiserror::Error;
use tracing::{info, warn};

use crate::plugin::dispatch::{self, Command, CommandOutcome, DispatchError};
use crate::plugin::process::ProcessPluginModule;
use crate::plugin::{PluginInstance, PluginModule};
use crate::response::ResponseEngine;
use crate::sort::{self, SortError};

pub const PLUGIN_EXT: &str = "plugin";

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error(transparent)]
    Cycle(#[from] SortError),

    #[error("duplicate plugin registration for `{0}`")]
    Duplicate(String),

    #[error("failed to scan plugin directory `{0}`: {1}")]
    Scan(PathBuf, #[source] std::io::Error),

    #[error("plugin `{0}` failed to load: {1}")]
    Load(String, #[source] anyhow::Error),
}

#[derive(Clone)]
pub struct PluginLoader {
    inner: Arc<LoaderInner>,
}

struct LoaderInner {
    storage: PathBuf,
    engine: ResponseEngine,
    plugins: DashMap<String, Arc<dyn PluginInstance>>,
    load_order: Mutex<Vec<String>>,
    initialized: AtomicBool,
    restarting: AtomicBool,
}

impl PluginLoader {
    pub fn new(storage: PathBuf, engine: ResponseEngine) -> Self {
        Self {
            inner: Arc::new(LoaderInner {
                storage,
                engine,
                plugins: DashMap::new(),
                load_order: Mutex::new(Vec::new()),
                initialized: AtomicBool::new(false),
                restarting: AtomicBool::new(false),
            }),
        }
    }

    pub fn engine(&self) -> &ResponseEngine {
        &self.inner.engine
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.initialized.load(Ordering::SeqCst)
    }

    pub fn is_restarting(&self) -> bool {
        self.inner.restarting.load(Ordering::SeqCst)
    }

    /// Names in the order plugins were registered.
    pub fn load_order(&self) -> Vec<String> {
        self.inner.load_order.lock().unwrap().clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn PluginInstance>> {
        self.inner.plugins.get(name).map(|e| Arc::clone(e.value()))
    }

    /// Discover and register everything under `<storage>/plugins/`.
    pub async fn init(&self) -> Result<(), LoaderError> {
        let modules = self.discover().await?;
        self.init_with(modules).await
    }

    /// Register a prepared set of modules in dependency order. `init`
    /// funnels through here; tests hand in in-process modules directly.
    pub async fn init_with(
        &self,
        modules: Vec<Arc<dyn PluginModule>>,
    ) -> Result<(), LoaderError> {
        let mut names = Vec::with_capacity(modules.len());
        let mut by_name: HashMap<String, Arc<dyn PluginModule>> = HashMap::new();
        for module in modules {
            let name = module.name().to_string();
            if by_name.insert(name.clone(), module).is_some() {
                return Err(LoaderError::Duplicate(name));
            }
            names.push(name);
        }

        let mut edges = HashMap::new();
        for name in &names {
            let deps = by_name[name]
                .dependencies()
                .await
                .map_err(|e| LoaderError::Load(name.clone(), e))?;
            edges.insert(name.clone(), deps);
        }

        let order = sort::sort(&names, &edges)?;

        for name in &order {
            let instance = by_name[name]
                .instantiate()
                .await
                .map_err(|e| LoaderError::Load(name.clone(), e))?;
            self.register_instance(Arc::from(instance))?;
        }

        self.inner.initialized.store(true, Ordering::SeqCst);
        info!(count = order.len(), order = ?order, "plugins initialized");
        Ok(())
    }

    /// Register one plugin from an explicit path, bypassing discovery.
    /// Its dependencies must already be registered.
    pub async fn register_plugin(&self, name: &str, path: &Path) -> Result<(), LoaderError> {
        let module = ProcessPluginModule::load(name, path)
            .map_err(|e| LoaderError::Load(name.to_string(), e))?;
        let instance = module
            .instantiate()
            .await
            .map_err(|e| LoaderError::Load(name.to_string(), e))?;
        self.register_instance(Arc::from(instance))
    }

    /// Register an already-built instance under its name.
    pub fn register_instance(
        &self,
        instance: Arc<dyn PluginInstance>,
    ) -> Result<(), LoaderError> {
        let name = instance.name().to_string();
        if self.inner.plugins.contains_key(&name) {
            return Err(LoaderError::Duplicate(name));
        }
        self.inner.plugins.insert(name.clone(), instance);
        self.inner.load_order.lock().unwrap().push(name);
        Ok(())
    }

    /// Validate, authorize, execute, classify. See [`dispatch`].
    pub async fn execute_command(&self, cmd: Command) -> Result<CommandOutcome, DispatchError> {
        dispatch::execute(self, cmd).await
    }

    pub async fn get_public_methods(&self, name: &str) -> Option<Vec<String>> {
        let plugin = self.get(name)?;
        Some(plugin.public_methods().await)
    }

    /// Shut every plugin down (in load order, tolerating per-plugin
    /// failures), wipe the registry, merge `env` into the process
    /// environment, and run `init` again. The restarting flag is cleared
    /// whether or not re-init succeeds.
    pub async fn restart(&self, env: Option<HashMap<String, String>>) -> Result<(), LoaderError> {
        self.inner.restarting.store(true, Ordering::SeqCst);
        let result = self.restart_inner(env).await;
        self.inner.restarting.store(false, Ordering::SeqCst);
        result
    }

    async fn restart_inner(
        &self,
        env: Option<HashMap<String, String>>,
    ) -> Result<(), LoaderError> {
        let order = self.load_order();
        for name in &order {
            if let Some(plugin) = self.get(name) {
                if let Err(e) = plugin.shutdown().await {
                    warn!(plugin = %name, error = %e, "plugin shutdown failed");
                }
            }
        }
        self.inner.plugins.clear();
        self.inner.load_order.lock().unwrap().clear();
        self.inner.initialized.store(false, Ordering::SeqCst);

        if let Some(env) = env {
            for (k, v) in env {
                std::env::set_var(k, v);
            }
        }

        self.init().await
    }

    async fn discover(&self) -> Result<Vec<Arc<dyn PluginModule>>, LoaderError> {
        let dir = self.inner.storage.join("plugins");
        if !dir.is_dir() {
            warn!(dir = %dir.display(), "plugin directory missing, starting with no plugins");
            return Ok(Vec::new());
        }

        let mut paths = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| LoaderError::Scan(dir.clone(), e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| LoaderError::Scan(dir.clone(), e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some(PLUGIN_EXT) {
                paths.push(path);
            }
        }
        // directory iteration order is not stable; file name order is
        paths.sort();

        if paths.is_empty() {
            warn!(dir = %dir.display(), "no plugin modules found");
        }

        let mut modules: Vec<Arc<dyn PluginModule>> = Vec::with_capacity(paths.len());
        for path in paths {
            let name = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_string();
            let module = ProcessPluginModule::load(&name, &path)
                .map_err(|e| LoaderError::Load(name.clone(), e))?;
            modules.push(Arc::new(module));
        }
        Ok(modules)
    }
}

impl std::fmt::Debug for PluginLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginLoader")
            .field("storage", &self.inner.storage)
            .field("plugins", &self.load_order())
            .field("initialized", &self.is_initialized())
            .field("restarting", &self.is_restarting())
            .finish()
    }
}
