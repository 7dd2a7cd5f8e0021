//! QuickJS plugin engine.
//!
//! Plugins with a `.js` entry are evaluated as classic scripts. Top-level
//! function declarations are the plugin's exports; the host API is installed
//! as globals before the script runs.

mod runtime;

pub use runtime::JsEngine;
