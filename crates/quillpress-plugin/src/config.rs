//! Runtime configuration, plugin manifests and resolved settings.

use std::path::{Path, PathBuf};
use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};

use crate::types::{PluginError, PluginResult};

/// File name of the manifest inside each plugin directory.
pub const MANIFEST_FILE: &str = "plugin.json";

/// Global plugin runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Directory where plugins are stored, one subdirectory per plugin.
    pub plugin_dir: PathBuf,

    /// Whether plugin engines are started at all.
    ///
    /// When false, plugins are still discovered and listed but stay inert.
    pub enabled: bool,

    /// Deadline for one evaluation or invocation, in milliseconds.
    pub invocation_timeout_ms: u64,

    /// Maximum heap per QuickJS runtime in MB (0 = unlimited).
    pub max_memory_mb: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("quillpress");

        Self {
            plugin_dir: config_dir.join("plugins"),
            enabled: true,
            invocation_timeout_ms: 5000,
            max_memory_mb: 64,
        }
    }
}

impl RuntimeConfig {
    /// Parse a configuration from TOML text. Missing keys keep their defaults.
    pub fn from_toml_str(text: &str) -> PluginResult<Self> {
        toml::from_str(text).map_err(|e| PluginError::ConfigError {
            message: e.to_string(),
        })
    }

    /// Load a configuration file.
    pub fn load(path: &Path) -> PluginResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Create a new config with a custom plugin directory.
    pub fn with_plugin_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.plugin_dir = dir.into();
        self
    }

    /// Set the invocation timeout.
    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.invocation_timeout_ms = timeout_ms;
        self
    }

    /// Enable or disable plugin engines.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Invocation timeout as a duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.invocation_timeout_ms)
    }

    /// Memory limit in bytes, if any. A limit too large to express in bytes
    /// is treated as unlimited.
    pub fn memory_limit(&self) -> Option<usize> {
        if self.max_memory_mb == 0 {
            return None;
        }
        self.max_memory_mb.checked_mul(1024 * 1024)
    }
}

/// Descriptor of a plugin, read from its `plugin.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginManifest {
    /// Unique plugin identity.
    pub id: String,

    /// Display name.
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub version: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub author: String,

    /// Entry point file (relative to the plugin directory).
    #[serde(default = "default_entry")]
    pub entry: String,

    /// Whether the plugin participates in dispatch.
    #[serde(default)]
    pub active: bool,

    /// Declared settings, in display order.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub settings: Vec<SettingDefinition>,
}

fn default_entry() -> String {
    "main.js".to_string()
}

fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

/// One configurable setting declared by a plugin.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SettingDefinition {
    pub key: String,

    #[serde(default)]
    pub label: String,

    /// Form control kind (text, textarea, radio, select, checkbox).
    #[serde(rename = "type", default)]
    pub kind: String,

    /// Stored value; empty means "use the default".
    #[serde(default)]
    pub value: String,

    #[serde(default)]
    pub default: String,

    /// Allowed options for radio/select kinds.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub options: Vec<String>,

    #[serde(default)]
    pub description: String,
}

impl SettingDefinition {
    /// The value a plugin sees: the stored value, else the default.
    pub fn effective_value(&self) -> &str {
        if self.value.is_empty() {
            &self.default
        } else {
            &self.value
        }
    }
}

impl PluginManifest {
    /// Parse and validate manifest text.
    pub fn parse(text: &str, path: &Path) -> PluginResult<Self> {
        let manifest: Self = serde_json::from_str(text).map_err(|e| PluginError::Manifest {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        if manifest.id.trim().is_empty() {
            return Err(PluginError::Manifest {
                path: path.to_path_buf(),
                message: "missing plugin id".to_string(),
            });
        }

        Ok(manifest)
    }

    /// Read the manifest of a plugin directory.
    pub fn read_from_dir(dir: &Path) -> PluginResult<Self> {
        let path = dir.join(MANIFEST_FILE);
        let text = std::fs::read_to_string(&path).map_err(|e| PluginError::Manifest {
            path: path.clone(),
            message: e.to_string(),
        })?;
        Self::parse(&text, &path)
    }

    /// Rewrite the manifest of a plugin directory.
    pub fn write_to_dir(&self, dir: &Path) -> PluginResult<()> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(dir.join(MANIFEST_FILE), text)?;
        Ok(())
    }

    /// Name used in log lines: display name, falling back to the id.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() { &self.id } else { &self.name }
    }

    /// Resolve the effective settings of this plugin.
    pub fn resolve_config(&self) -> ResolvedConfig {
        ResolvedConfig(
            self.settings
                .iter()
                .map(|s| (s.key.clone(), s.effective_value().to_string()))
                .collect(),
        )
    }
}

/// Effective key/value settings of one plugin, in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ResolvedConfig(IndexMap<String, String>);

impl ResolvedConfig {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, String)> for ResolvedConfig {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
