//! Hot-reloadable plugin runtime for quillpress.
//!
//! Plugins are directories under a plugins root, each holding a
//! `plugin.json` manifest and one script entry point. Scripts run in an
//! embedded engine chosen by the entry file's extension: QuickJS for `.js`
//! (evaluated as a classic script), Rhai for `.rhai`.
//!
//! # Architecture
//!
//! Each engine implements the [`ScriptEngine`] trait once. The
//! [`PluginLoader`] turns a plugins directory into [`PluginInstance`]s, and
//! the [`PluginRegistry`] holds them as one immutable [`Snapshot`] that a
//! reload replaces wholesale. Dispatch (filters, request interception,
//! route matching) always runs against a single snapshot.
//!
//! # Host surface
//!
//! Plugins see three functions: `registerRoute(method, path, handler)`,
//! `log(message)` and `getConfig()`. They may export any of the fixed hooks
//! `OnContentRender`, `OnMarkdown`, `OnRequest` and `OnResponse`.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use quillpress_plugin::{HookName, PluginManager, PluginRegistry, RuntimeConfig};
//!
//! let registry = Arc::new(PluginRegistry::new(RuntimeConfig::default()));
//! registry.reload()?;
//!
//! let html = registry.apply_filter(HookName::OnContentRender, "<p>Hello</p>");
//! if let Some(page) = registry.apply_request_filter("/secret") {
//!     // serve `page` instead
//! }
//!
//! let manager = PluginManager::new(Arc::clone(&registry));
//! manager.set_active("reading-time", true)?;
//! ```

mod config;
mod dispatch;
mod hooks;
mod instance;
pub mod js;
mod loader;
mod manage;
mod registry;
pub mod rhai;
mod runtime;
mod types;

pub use config::{MANIFEST_FILE, PluginManifest, ResolvedConfig, RuntimeConfig, SettingDefinition};
pub use hooks::{HookFn, HookName, HookTable, ResponsePayload};
pub use instance::{PluginInstance, RouteDefinition};
pub use loader::{PluginLoader, ReloadSummary};
pub use manage::{PluginManager, PluginSummary};
pub use registry::{PluginRegistry, Snapshot};
pub use runtime::{EngineKind, HostBindings, Interrupt, InvocationLimits, ScriptEngine};
pub use types::{PluginError, PluginResult, RouteResponse, Value};
