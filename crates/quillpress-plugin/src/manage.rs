//! Administrative operations: list, toggle, configure, delete and install.
//!
//! The manifest on disk is the source of truth. Every mutating operation
//! rewrites files first and then performs a full reload, so the registry
//! never holds state that is not also on disk. Mutations are serialized per
//! registry, so concurrent edits to one manifest never drop each other.

use std::collections::HashMap;
use std::fs::{self, File};
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;

use crate::config::{PluginManifest, SettingDefinition};
use crate::hooks::HookName;
use crate::instance::{PluginInstance, RouteDefinition};
use crate::loader::ReloadSummary;
use crate::registry::PluginRegistry;
use crate::types::{PluginError, PluginResult};

/// Listing entry for one plugin.
#[derive(Debug, Clone, Serialize)]
pub struct PluginSummary {
    pub id: String,
    pub name: String,
    pub version: String,
    pub description: String,
    pub author: String,
    pub dir_name: String,
    pub active: bool,
    pub loaded: bool,
    pub engine: Option<&'static str>,
    pub hooks: Vec<HookName>,
    pub routes: Vec<RouteDefinition>,
    pub settings: Vec<SettingDefinition>,
}

impl From<&PluginInstance> for PluginSummary {
    fn from(plugin: &PluginInstance) -> Self {
        let manifest = &plugin.manifest;
        Self {
            id: manifest.id.clone(),
            name: manifest.display_name().to_string(),
            version: manifest.version.clone(),
            description: manifest.description.clone(),
            author: manifest.author.clone(),
            dir_name: plugin.dir_name.clone(),
            active: plugin.is_active(),
            loaded: plugin.is_loaded(),
            engine: plugin.engine_name(),
            hooks: plugin.hooks.names(),
            routes: plugin.routes.clone(),
            settings: manifest.settings.clone(),
        }
    }
}

/// Facade over a shared registry for administrative callers.
#[derive(Clone)]
pub struct PluginManager {
    registry: Arc<PluginRegistry>,
}

impl PluginManager {
    pub fn new(registry: Arc<PluginRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    /// Every registered plugin, sorted by id.
    pub fn list(&self) -> Vec<PluginSummary> {
        let snapshot = self.registry.snapshot();
        let mut plugins: Vec<PluginSummary> =
            snapshot.iter().map(|p| PluginSummary::from(p.as_ref())).collect();
        plugins.sort_by(|a, b| a.id.cmp(&b.id));
        plugins
    }

    pub fn get(&self, id: &str) -> PluginResult<Arc<PluginInstance>> {
        self.registry
            .get(id)
            .ok_or_else(|| PluginError::NotFound { id: id.to_string() })
    }

    /// Enable or disable a plugin.
    pub fn set_active(&self, id: &str, active: bool) -> PluginResult<ReloadSummary> {
        let _editing = self.registry.lock_edits();
        let plugin = self.get(id)?;
        let mut manifest = PluginManifest::read_from_dir(&plugin.path)?;
        manifest.active = active;
        manifest.write_to_dir(&plugin.path)?;

        tracing::info!(id, active, "Plugin toggled");
        self.registry.reload()
    }

    /// Store setting values. Keys the plugin does not declare are ignored.
    pub fn save_settings(&self, id: &str, values: &HashMap<String, String>) -> PluginResult<ReloadSummary> {
        let _editing = self.registry.lock_edits();
        let plugin = self.get(id)?;
        let mut manifest = PluginManifest::read_from_dir(&plugin.path)?;

        let mut updated = 0;
        for setting in &mut manifest.settings {
            if let Some(value) = values.get(&setting.key) {
                setting.value = value.clone();
                updated += 1;
            }
        }
        manifest.write_to_dir(&plugin.path)?;

        tracing::info!(id, updated, ignored = values.len().saturating_sub(updated), "Plugin settings saved");
        self.registry.reload()
    }

    /// Remove an inactive plugin's directory.
    pub fn delete(&self, id: &str) -> PluginResult<ReloadSummary> {
        let _editing = self.registry.lock_edits();
        let plugin = self.get(id)?;
        if plugin.is_active() {
            return Err(PluginError::StillActive { id: id.to_string() });
        }

        fs::remove_dir_all(&plugin.path)?;

        tracing::info!(id, dir = %plugin.path.display(), "Plugin deleted");
        self.registry.reload()
    }

    /// Extract a zip archive into the plugins directory.
    pub fn install_archive(&self, archive: &Path) -> PluginResult<ReloadSummary> {
        let _editing = self.registry.lock_edits();
        let root = &self.registry.config().plugin_dir;
        fs::create_dir_all(root)?;

        let extracted = extract_zip(archive, root)?;
        tracing::info!(archive = %archive.display(), files = extracted, "Plugin archive installed");
        self.registry.reload()
    }

    pub fn reload(&self) -> PluginResult<ReloadSummary> {
        self.registry.reload()
    }
}

/// Extract `archive` under `dest`, returning the number of files written.
/// Entries whose path would land outside `dest` are skipped.
fn extract_zip(archive: &Path, dest: &Path) -> PluginResult<usize> {
    let file = File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file)?;

    let mut written = 0;
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;

        let Some(relative) = entry.enclosed_name() else {
            tracing::warn!(entry = %entry.name(), "Skipping archive entry outside the plugins directory");
            continue;
        };
        let outpath = dest.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&outpath)?;
            continue;
        }

        if let Some(parent) = outpath.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&outpath)?;
        std::io::copy(&mut entry, &mut out)?;
        written += 1;
    }

    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use tempfile::TempDir;

    const MANIFEST: &str = r#"{
        "id": "greeter",
        "name": "Greeter",
        "entry": "main.js",
        "active": true,
        "settings": [
            {"key": "greeting", "type": "text", "value": "", "default": "hello"},
            {"key": "punct", "type": "select", "value": "!", "default": ".", "options": ["!", "."]}
        ]
    }"#;

    fn setup() -> (TempDir, PluginManager) {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("greeter");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("plugin.json"), MANIFEST).unwrap();
        fs::write(
            dir.join("main.js"),
            "function OnMarkdown(s) { return getConfig().greeting + ' ' + s + getConfig().punct; }",
        )
        .unwrap();

        let registry = PluginRegistry::new(RuntimeConfig::default().with_plugin_dir(temp.path()));
        registry.reload().unwrap();
        (temp, PluginManager::new(Arc::new(registry)))
    }

    #[test]
    fn test_list_and_get() {
        let (_temp, manager) = setup();
        let list = manager.list();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, "greeter");
        assert_eq!(list[0].name, "Greeter");
        assert!(list[0].loaded);
        assert_eq!(list[0].engine, Some("quickjs"));
        assert_eq!(list[0].hooks, vec![HookName::OnMarkdown]);

        assert!(manager.get("greeter").is_ok());
        assert!(matches!(manager.get("nope"), Err(PluginError::NotFound { .. })));
    }

    #[test]
    fn test_set_active_rewrites_manifest() {
        let (temp, manager) = setup();

        manager.set_active("greeter", false).unwrap();
        let on_disk = PluginManifest::read_from_dir(&temp.path().join("greeter")).unwrap();
        assert!(!on_disk.active);
        assert_eq!(on_disk.settings.len(), 2);
        assert!(!manager.get("greeter").unwrap().is_loaded());

        manager.set_active("greeter", true).unwrap();
        assert!(manager.get("greeter").unwrap().is_loaded());
    }

    #[test]
    fn test_save_settings() {
        let (temp, manager) = setup();
        let registry = Arc::clone(manager.registry());
        assert_eq!(registry.apply_filter(HookName::OnMarkdown, "x"), "hello x!");

        let values: HashMap<String, String> = [
            ("greeting".to_string(), "hey".to_string()),
            ("unknown".to_string(), "ignored".to_string()),
        ]
        .into_iter()
        .collect();
        manager.save_settings("greeter", &values).unwrap();

        let on_disk = PluginManifest::read_from_dir(&temp.path().join("greeter")).unwrap();
        assert_eq!(on_disk.settings[0].value, "hey");
        assert_eq!(on_disk.settings[1].value, "!");
        assert!(on_disk.settings.iter().all(|s| s.key != "unknown"));

        assert_eq!(registry.apply_filter(HookName::OnMarkdown, "x"), "hey x!");
    }

    #[test]
    fn test_concurrent_edits_are_not_lost() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("many");
        fs::create_dir_all(&dir).unwrap();
        let settings: Vec<String> = (0..8)
            .map(|i| format!(r#"{{"key": "k{i}", "type": "text", "value": ""}}"#))
            .collect();
        fs::write(
            dir.join("plugin.json"),
            format!(r#"{{"id": "many", "settings": [{}]}}"#, settings.join(",")),
        )
        .unwrap();

        let registry = Arc::new(PluginRegistry::new(RuntimeConfig::default().with_plugin_dir(temp.path())));
        registry.reload().unwrap();

        let writers: Vec<_> = (0..8)
            .map(|i| {
                // Separate managers over one registry still share the edit lock.
                let manager = PluginManager::new(Arc::clone(&registry));
                std::thread::spawn(move || {
                    let values = HashMap::from([(format!("k{i}"), format!("v{i}"))]);
                    manager.save_settings("many", &values).unwrap();
                    if i % 2 == 0 {
                        manager.set_active("many", i % 4 == 0).unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        let on_disk = PluginManifest::read_from_dir(&dir).unwrap();
        for (i, setting) in on_disk.settings.iter().enumerate() {
            assert_eq!(setting.value, format!("v{i}"));
        }
        let snapshot = registry.get("many").unwrap();
        assert_eq!(snapshot.manifest.settings, on_disk.settings);
    }

    #[test]
    fn test_delete_requires_inactive() {
        let (temp, manager) = setup();

        assert!(matches!(
            manager.delete("greeter"),
            Err(PluginError::StillActive { .. })
        ));
        assert!(temp.path().join("greeter").exists());

        manager.set_active("greeter", false).unwrap();
        manager.delete("greeter").unwrap();
        assert!(!temp.path().join("greeter").exists());
        assert!(manager.list().is_empty());
    }
}
