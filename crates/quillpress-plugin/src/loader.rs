//! Plugin discovery: turn a plugins directory into instances.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;

use crate::config::{PluginManifest, RuntimeConfig};
use crate::hooks::HookTable;
use crate::instance::{PluginInstance, RouteDefinition};
use crate::runtime::{EngineKind, HostBindings, InvocationLimits, ScriptEngine};
use crate::types::{PluginError, PluginResult};

/// Outcome of one full discovery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReloadSummary {
    /// Registry generation the pass produced.
    pub generation: u64,
    /// Plugins registered (active or not).
    pub discovered: usize,
    /// Registered plugins with `active = true`.
    pub active: usize,
    /// Active plugins whose engine loaded.
    pub loaded: usize,
    /// Directories skipped for a missing or invalid manifest.
    pub skipped: Vec<String>,
}

type EngineParts = (Arc<dyn ScriptEngine>, HookTable, Vec<RouteDefinition>);

/// Builds plugin instances from disk.
pub struct PluginLoader<'a> {
    config: &'a RuntimeConfig,
    limits: InvocationLimits,
    generation: u64,
}

impl<'a> PluginLoader<'a> {
    pub fn new(config: &'a RuntimeConfig, limits: InvocationLimits, generation: u64) -> Self {
        Self {
            config,
            limits,
            generation,
        }
    }

    /// Scan every immediate subdirectory of the plugins root.
    ///
    /// Per-plugin failures are logged and never abort the pass; only an
    /// unreadable (but existing) root is an error.
    pub fn discover(&self) -> PluginResult<(HashMap<String, Arc<PluginInstance>>, ReloadSummary)> {
        let mut plugins: HashMap<String, Arc<PluginInstance>> = HashMap::new();
        let mut summary = ReloadSummary {
            generation: self.generation,
            ..Default::default()
        };

        let root = &self.config.plugin_dir;
        if !root.exists() {
            tracing::debug!(dir = %root.display(), "Plugin directory does not exist");
            return Ok((plugins, summary));
        }

        let mut dirs: Vec<_> = std::fs::read_dir(root)?
            .flatten()
            .filter(|entry| entry.path().is_dir())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        dirs.sort();

        for dir_name in dirs {
            let instance = match self.load_one(root, &dir_name) {
                Ok(instance) => instance,
                Err(e) => {
                    tracing::warn!(dir = %dir_name, "Skipping plugin: {e}");
                    summary.skipped.push(dir_name);
                    continue;
                }
            };

            if let Some(existing) = plugins.get(instance.id()) {
                tracing::warn!(
                    id = %instance.id(),
                    dir = %dir_name,
                    kept = %existing.dir_name,
                    "Duplicate plugin id; skipping"
                );
                summary.skipped.push(dir_name);
                continue;
            }

            summary.discovered += 1;
            if instance.is_active() {
                summary.active += 1;
            }
            if instance.is_loaded() {
                summary.loaded += 1;
            }
            plugins.insert(instance.id().to_string(), Arc::new(instance));
        }

        Ok((plugins, summary))
    }

    /// Build one instance. Errors only for manifest problems; load problems
    /// produce an inert instance.
    pub fn load_one(&self, root: &Path, dir_name: &str) -> PluginResult<PluginInstance> {
        let path = root.join(dir_name);
        let manifest = PluginManifest::read_from_dir(&path)?;
        let instance = PluginInstance::inert(manifest, dir_name.to_string(), path, self.generation);

        if !instance.is_active() || !self.config.enabled {
            return Ok(instance);
        }

        match self.start_engine(instance.manifest.clone(), &instance.path) {
            Ok(Some((engine, hooks, routes))) => {
                tracing::info!(
                    id = %instance.id(),
                    engine = engine.name(),
                    hooks = hooks.names().len(),
                    routes = routes.len(),
                    "Plugin loaded"
                );
                Ok(instance.with_engine(engine, hooks, routes))
            }
            Ok(None) => Ok(instance),
            Err(e) => {
                tracing::error!(id = %instance.id(), "Plugin failed to load: {e}");
                Ok(instance)
            }
        }
    }

    fn start_engine(
        &self,
        manifest: PluginManifest,
        dir: &Path,
    ) -> PluginResult<Option<EngineParts>> {
        let entry = dir.join(&manifest.entry);
        let Some(kind) = EngineKind::from_entry(&entry) else {
            tracing::debug!(id = %manifest.id, entry = %manifest.entry, "No engine for entry file");
            return Ok(None);
        };

        let source = std::fs::read_to_string(&entry).map_err(|e| PluginError::LoadError {
            name: manifest.id.clone(),
            message: format!("cannot read {}: {e}", entry.display()),
        })?;

        let host = HostBindings::new(&manifest, manifest.resolve_config());
        let engine = kind.load(&source, host.clone(), self.limits.clone())?;
        let routes = host.finish_load();
        let hooks = HookTable::resolve(&manifest.id, &engine);

        Ok(Some((engine, hooks, routes)))
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::time::Duration;

    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::hooks::HookName;

    fn write_plugin(root: &Path, dir: &str, manifest: &str, entry: Option<(&str, &str)>) {
        let path = root.join(dir);
        fs::create_dir_all(&path).unwrap();
        fs::write(path.join("plugin.json"), manifest).unwrap();
        if let Some((name, source)) = entry {
            fs::write(path.join(name), source).unwrap();
        }
    }

    fn discover(config: &RuntimeConfig) -> (HashMap<String, Arc<PluginInstance>>, ReloadSummary) {
        let limits = InvocationLimits::new(Duration::from_secs(2), CancellationToken::new());
        PluginLoader::new(config, limits, 1).discover().unwrap()
    }

    #[test]
    fn test_missing_root_is_empty() {
        let temp = TempDir::new().unwrap();
        let config = RuntimeConfig::default().with_plugin_dir(temp.path().join("nope"));
        let (plugins, summary) = discover(&config);
        assert!(plugins.is_empty());
        assert_eq!(summary.discovered, 0);
    }

    #[test]
    fn test_discovery_outcomes() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();

        write_plugin(
            root,
            "good",
            r#"{"id": "good", "entry": "main.js", "active": true}"#,
            Some(("main.js", "function OnMarkdown(s) { return s; }")),
        );
        write_plugin(
            root,
            "off",
            r#"{"id": "off", "entry": "main.js", "active": false}"#,
            Some(("main.js", "function OnMarkdown(s) { return s; }")),
        );
        write_plugin(
            root,
            "broken",
            r#"{"id": "broken", "entry": "main.rhai", "active": true}"#,
            Some(("main.rhai", "fn OnMarkdown(s) {")),
        );
        write_plugin(
            root,
            "py",
            r#"{"id": "py", "entry": "main.py", "active": true}"#,
            Some(("main.py", "print(1)")),
        );
        write_plugin(root, "bad-json", "{", None);
        fs::create_dir_all(root.join("empty")).unwrap();
        fs::write(root.join("stray.txt"), "not a plugin").unwrap();

        let config = RuntimeConfig::default().with_plugin_dir(root);
        let (plugins, summary) = discover(&config);

        assert_eq!(summary.discovered, 4);
        assert_eq!(summary.active, 3);
        assert_eq!(summary.loaded, 1);
        assert_eq!(summary.skipped, vec!["bad-json".to_string(), "empty".to_string()]);

        assert!(plugins["good"].is_loaded());
        assert!(plugins["good"].hooks.contains(HookName::OnMarkdown));
        assert!(!plugins["off"].is_loaded());
        assert!(plugins["off"].hooks.is_empty());
        assert!(!plugins["broken"].is_loaded());
        assert!(plugins["broken"].is_active());
        assert!(!plugins["py"].is_loaded());
        assert!(plugins.values().all(|p| p.generation == 1));
    }

    #[test]
    fn test_duplicate_ids_keep_first() {
        let temp = TempDir::new().unwrap();
        write_plugin(temp.path(), "a", r#"{"id": "same", "name": "first"}"#, None);
        write_plugin(temp.path(), "b", r#"{"id": "same", "name": "second"}"#, None);

        let config = RuntimeConfig::default().with_plugin_dir(temp.path());
        let (plugins, summary) = discover(&config);
        assert_eq!(plugins.len(), 1);
        assert_eq!(plugins["same"].manifest.name, "first");
        assert_eq!(summary.skipped, vec!["b".to_string()]);
    }

    #[test]
    fn test_disabled_runtime_keeps_plugins_inert() {
        let temp = TempDir::new().unwrap();
        write_plugin(
            temp.path(),
            "good",
            r#"{"id": "good", "entry": "main.js", "active": true}"#,
            Some(("main.js", "function OnMarkdown(s) { return s; }")),
        );

        let config = RuntimeConfig::default()
            .with_plugin_dir(temp.path())
            .with_enabled(false);
        let (plugins, summary) = discover(&config);
        assert_eq!(summary.active, 1);
        assert_eq!(summary.loaded, 0);
        assert!(!plugins["good"].is_loaded());
    }

    #[test]
    fn test_missing_entry_file() {
        let temp = TempDir::new().unwrap();
        write_plugin(
            temp.path(),
            "ghost",
            r#"{"id": "ghost", "entry": "missing.js", "active": true}"#,
            None,
        );

        let config = RuntimeConfig::default().with_plugin_dir(temp.path());
        let (plugins, _) = discover(&config);
        assert!(plugins["ghost"].is_active());
        assert!(!plugins["ghost"].is_loaded());
    }
}
