//! The plugin registry: an atomically replaced snapshot of all plugins.
//!
//! Readers clone the current [`Snapshot`] under a shared lock and work on it
//! without holding any lock. A reload builds the next snapshot with no lock
//! held and takes the exclusive lock only to swap the pointer, so a reader
//! always sees one generation in full.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use tokio_util::sync::CancellationToken;

use crate::config::RuntimeConfig;
use crate::instance::PluginInstance;
use crate::loader::{PluginLoader, ReloadSummary};
use crate::runtime::InvocationLimits;
use crate::types::{PluginError, PluginResult};

/// All plugins as of one reload.
#[derive(Debug, Default)]
pub struct Snapshot {
    generation: u64,
    plugins: HashMap<String, Arc<PluginInstance>>,
}

impl Snapshot {
    pub fn new(generation: u64, plugins: HashMap<String, Arc<PluginInstance>>) -> Self {
        Self {
            generation,
            plugins,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn get(&self, id: &str) -> Option<&Arc<PluginInstance>> {
        self.plugins.get(id)
    }

    /// Every plugin, in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<PluginInstance>> {
        self.plugins.values()
    }

    /// Plugins with `active = true`, in unspecified order.
    pub fn active(&self) -> impl Iterator<Item = &Arc<PluginInstance>> {
        self.plugins.values().filter(|p| p.is_active())
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

/// Concurrent, read-heavy map from plugin id to instance.
pub struct PluginRegistry {
    config: RuntimeConfig,
    current: RwLock<Arc<Snapshot>>,
    next_generation: AtomicU64,
    /// Serializes reloads against each other; dispatch never takes it.
    reload_lock: Mutex<()>,
    /// Held by administrative edits across read, write and reload.
    edit_lock: Mutex<()>,
    cancel: CancellationToken,
}

impl PluginRegistry {
    /// Create an empty registry. Call [`PluginRegistry::reload`] to populate.
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            current: RwLock::new(Arc::new(Snapshot::default())),
            next_generation: AtomicU64::new(1),
            reload_lock: Mutex::new(()),
            edit_lock: Mutex::new(()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Serialize on-disk edits made through any manager sharing this registry.
    pub(crate) fn lock_edits(&self) -> MutexGuard<'_, ()> {
        self.edit_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Look up one plugin in the current snapshot.
    pub fn get(&self, id: &str) -> Option<Arc<PluginInstance>> {
        self.snapshot().get(id).cloned()
    }

    /// Rebuild every plugin from disk and swap the result in.
    pub fn reload(&self) -> PluginResult<ReloadSummary> {
        let _reloading = self.reload_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let limits = InvocationLimits::from_config(&self.config, self.cancel.child_token());
        let (plugins, summary) = PluginLoader::new(&self.config, limits, generation).discover()?;

        self.install(Snapshot::new(generation, plugins));

        tracing::info!(
            generation,
            discovered = summary.discovered,
            active = summary.active,
            loaded = summary.loaded,
            skipped = summary.skipped.len(),
            "Plugin registry reloaded"
        );
        Ok(summary)
    }

    /// [`PluginRegistry::reload`] on the blocking thread pool.
    pub async fn reload_async(self: Arc<Self>) -> PluginResult<ReloadSummary> {
        tokio::task::spawn_blocking(move || self.reload())
            .await
            .map_err(|e| PluginError::Task(e.to_string()))?
    }

    /// Replace the current snapshot.
    pub fn install(&self, snapshot: Snapshot) {
        let snapshot = Arc::new(snapshot);
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        *current = snapshot;
    }

    /// Interrupt running plugin code and refuse further invocations.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_manifest(root: &std::path::Path, id: &str) {
        let dir = root.join(id);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("plugin.json"), format!(r#"{{"id": "{id}"}}"#)).unwrap();
    }

    #[test]
    fn test_reload_replaces_snapshot() {
        let temp = TempDir::new().unwrap();
        write_manifest(temp.path(), "a");

        let registry = PluginRegistry::new(RuntimeConfig::default().with_plugin_dir(temp.path()));
        assert!(registry.snapshot().is_empty());

        let first = registry.reload().unwrap();
        assert_eq!(first.generation, 1);
        let old = registry.snapshot();
        assert!(registry.get("a").is_some());

        fs::remove_dir_all(temp.path().join("a")).unwrap();
        write_manifest(temp.path(), "b");
        let second = registry.reload().unwrap();
        assert_eq!(second.generation, 2);

        assert!(registry.get("a").is_none());
        assert!(registry.get("b").is_some());
        assert_eq!(registry.snapshot().generation(), 2);

        // A snapshot taken before the reload is untouched.
        assert_eq!(old.generation(), 1);
        assert!(old.get("a").is_some());
        assert!(old.get("b").is_none());
    }

    #[tokio::test]
    async fn test_reload_async() {
        let temp = TempDir::new().unwrap();
        write_manifest(temp.path(), "a");

        let registry = Arc::new(PluginRegistry::new(
            RuntimeConfig::default().with_plugin_dir(temp.path()),
        ));
        let summary = Arc::clone(&registry).reload_async().await.unwrap();
        assert_eq!(summary.discovered, 1);
        assert!(registry.get("a").is_some());
    }
}
