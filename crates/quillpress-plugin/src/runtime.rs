//! Script engine trait and the host bindings shared by every engine.
//!
//! This module defines the language-agnostic [`ScriptEngine`] trait that
//! both engine adapters satisfy. The dispatcher only ever talks to plugins
//! through it.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::config::{PluginManifest, ResolvedConfig, RuntimeConfig};
use crate::instance::RouteDefinition;
use crate::js::JsEngine;
use crate::rhai::RhaiEngine;
use crate::types::{PluginError, PluginResult, Value};

/// A plugin's source, evaluated once and callable by export name afterwards.
pub trait ScriptEngine: Send + Sync {
    /// Get the name of this engine (e.g., "quickjs", "rhai").
    fn name(&self) -> &'static str;

    /// Check if the evaluated script exports a callable with this name.
    fn has_export(&self, name: &str) -> bool;

    /// Call an exported function with a single string argument.
    ///
    /// Returns `Ok(None)` if no such callable exists.
    fn invoke(&self, name: &str, arg: &str) -> PluginResult<Option<Value>>;
}

/// The engines a plugin entry file can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    /// ECMAScript, evaluated by QuickJS.
    JavaScript,
    /// Rhai, the Rust-syntax embedded scripting language.
    Rhai,
}

impl EngineKind {
    /// Pick an engine from the entry file's extension.
    pub fn from_entry(entry: &Path) -> Option<Self> {
        let ext = entry.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "js" => Some(Self::JavaScript),
            "rhai" => Some(Self::Rhai),
            _ => None,
        }
    }

    /// Evaluate `source` and return the loaded engine.
    pub fn load(
        self,
        source: &str,
        host: HostBindings,
        limits: InvocationLimits,
    ) -> PluginResult<Arc<dyn ScriptEngine>> {
        Ok(match self {
            Self::JavaScript => Arc::new(JsEngine::load(source, host, limits)?),
            Self::Rhai => Arc::new(RhaiEngine::load(source, host, limits)?),
        })
    }
}

/// State behind the host API one plugin sees.
#[derive(Clone)]
pub struct HostBindings {
    plugin: Arc<str>,
    config: Arc<ResolvedConfig>,
    routes: RouteSink,
}

impl HostBindings {
    pub fn new(manifest: &PluginManifest, config: ResolvedConfig) -> Self {
        Self {
            plugin: Arc::from(manifest.display_name()),
            config: Arc::new(config),
            routes: RouteSink::default(),
        }
    }

    /// Plugin name used to tag log lines.
    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    /// Backs `log(message)`.
    pub fn log(&self, message: &str) {
        tracing::info!(target: "plugin", plugin = %self.plugin, "{message}");
    }

    /// Backs `registerRoute(method, path, handlerName)`.
    pub fn register_route(&self, method: &str, path: &str, handler: &str) {
        let route = RouteDefinition::new(method, path, handler);
        if !self.routes.push(route) {
            tracing::warn!(
                plugin = %self.plugin,
                method, path, "Route registered after load; ignored"
            );
        }
    }

    /// Close route registration and take what was registered during load.
    pub fn finish_load(&self) -> Vec<RouteDefinition> {
        self.routes.seal()
    }
}

/// Routes collected while a plugin's top-level code runs.
#[derive(Clone, Default)]
struct RouteSink {
    inner: Arc<Mutex<SinkState>>,
}

#[derive(Default)]
struct SinkState {
    routes: Vec<RouteDefinition>,
    sealed: bool,
}

impl RouteSink {
    fn push(&self, route: RouteDefinition) -> bool {
        let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if state.sealed {
            return false;
        }
        state.routes.push(route);
        true
    }

    fn seal(&self) -> Vec<RouteDefinition> {
        let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        state.sealed = true;
        std::mem::take(&mut state.routes)
    }
}

/// Deadline and cancellation applied to every evaluation and invocation.
#[derive(Debug, Clone)]
pub struct InvocationLimits {
    pub timeout: Duration,
    pub cancel: CancellationToken,
    pub max_memory: Option<usize>,
}

impl InvocationLimits {
    pub fn new(timeout: Duration, cancel: CancellationToken) -> Self {
        Self {
            timeout,
            cancel,
            max_memory: None,
        }
    }

    pub fn from_config(config: &RuntimeConfig, cancel: CancellationToken) -> Self {
        Self {
            timeout: config.timeout(),
            cancel,
            max_memory: config.memory_limit(),
        }
    }
}

/// Interrupt state an engine polls while script code runs.
///
/// Armed for the duration of one call; engines check
/// [`Interrupt::triggered`] from their progress/interrupt callbacks.
#[derive(Debug, Clone)]
pub struct Interrupt {
    limits: InvocationLimits,
    deadline: Arc<Mutex<Option<Instant>>>,
}

impl Interrupt {
    pub fn new(limits: InvocationLimits) -> Self {
        Self {
            limits,
            deadline: Arc::new(Mutex::new(None)),
        }
    }

    /// Start the clock for one call. Disarmed when the guard drops.
    pub fn arm(&self) -> ArmedInterrupt<'_> {
        *self.deadline.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(Instant::now() + self.limits.timeout);
        ArmedInterrupt { interrupt: self }
    }

    /// Whether running script code should be stopped now.
    pub fn triggered(&self) -> bool {
        if self.limits.cancel.is_cancelled() {
            return true;
        }
        self.deadline
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Turn an engine failure into the interrupt error that caused it, if any.
    pub fn explain(&self, plugin: &str, error: PluginError) -> PluginError {
        if self.limits.cancel.is_cancelled() {
            PluginError::Cancelled {
                name: plugin.to_string(),
            }
        } else if self.triggered() {
            PluginError::Timeout {
                name: plugin.to_string(),
                timeout_ms: self.limits.timeout.as_millis() as u64,
            }
        } else {
            error
        }
    }
}

/// Guard returned by [`Interrupt::arm`].
pub struct ArmedInterrupt<'a> {
    interrupt: &'a Interrupt,
}

impl Drop for ArmedInterrupt<'_> {
    fn drop(&mut self) {
        *self
            .interrupt
            .deadline
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }
}
