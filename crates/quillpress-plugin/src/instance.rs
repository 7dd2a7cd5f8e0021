//! Loaded plugins.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;

use crate::config::{PluginManifest, ResolvedConfig};
use crate::hooks::{HookName, HookTable};
use crate::runtime::ScriptEngine;
use crate::types::Value;

/// A route a plugin registered while loading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteDefinition {
    pub method: String,
    pub path: String,
    /// Name of the exported function that serves the route.
    pub handler: String,
}

impl RouteDefinition {
    pub fn new(method: &str, path: &str, handler: &str) -> Self {
        Self {
            method: method.to_string(),
            path: path.to_string(),
            handler: handler.to_string(),
        }
    }

    /// Exact match: method case-insensitively, path byte for byte.
    ///
    /// Parameterized routes never match; this matcher has no pattern support.
    pub fn matches(&self, method: &str, path: &str) -> bool {
        !self.is_parameterized() && self.method.eq_ignore_ascii_case(method) && self.path == path
    }

    /// Whether the path contains a `:param` segment.
    pub fn is_parameterized(&self) -> bool {
        self.path.contains(':')
    }
}

/// One discovered plugin as of a registry generation.
///
/// Never mutated after construction; a reload builds a new one.
pub struct PluginInstance {
    pub manifest: PluginManifest,

    /// Directory name under the plugins root.
    pub dir_name: String,

    /// Absolute path of the plugin directory.
    pub path: PathBuf,

    pub config: ResolvedConfig,
    pub routes: Vec<RouteDefinition>,
    pub hooks: HookTable,

    /// Registry generation that built this instance.
    pub generation: u64,

    engine: Option<Arc<dyn ScriptEngine>>,
}

impl PluginInstance {
    /// An instance with no engine: inactive, failed, or of unknown type.
    pub fn inert(manifest: PluginManifest, dir_name: String, path: PathBuf, generation: u64) -> Self {
        let config = manifest.resolve_config();
        Self {
            manifest,
            dir_name,
            path,
            config,
            routes: Vec::new(),
            hooks: HookTable::default(),
            generation,
            engine: None,
        }
    }

    /// Attach a loaded engine and what it registered.
    pub fn with_engine(
        mut self,
        engine: Arc<dyn ScriptEngine>,
        hooks: HookTable,
        routes: Vec<RouteDefinition>,
    ) -> Self {
        self.engine = Some(engine);
        self.hooks = hooks;
        self.routes = routes;
        self
    }

    pub fn id(&self) -> &str {
        &self.manifest.id
    }

    pub fn is_active(&self) -> bool {
        self.manifest.active
    }

    /// Whether an engine is attached.
    pub fn is_loaded(&self) -> bool {
        self.engine.is_some()
    }

    pub fn engine_name(&self) -> Option<&'static str> {
        self.engine.as_ref().map(|e| e.name())
    }

    /// Run one of this plugin's hooks.
    pub fn call_hook(&self, hook: HookName, input: &str) -> Option<String> {
        self.hooks.call(hook, input)
    }

    /// Invoke a route handler. Any failure is logged and yields `None`.
    pub fn invoke_handler(&self, handler: &str, path: &str) -> Option<Value> {
        let engine = self.engine.as_ref()?;
        match engine.invoke(handler, path) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(plugin = %self.id(), handler, "Route handler failed: {e}");
                None
            }
        }
    }
}

impl std::fmt::Debug for PluginInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginInstance")
            .field("id", &self.manifest.id)
            .field("dir_name", &self.dir_name)
            .field("active", &self.manifest.active)
            .field("engine", &self.engine_name())
            .field("hooks", &self.hooks)
            .field("routes", &self.routes)
            .field("generation", &self.generation)
            .finish()
    }
}
