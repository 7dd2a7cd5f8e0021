//! Core types for the plugin runtime.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for plugin operations.
pub type PluginResult<T> = Result<T, PluginError>;

/// Errors that can occur in the plugin runtime.
#[derive(Debug, Error)]
pub enum PluginError {
    /// No plugin with this id is registered.
    #[error("Plugin not found: {id}")]
    NotFound { id: String },

    /// Manifest missing, unreadable or malformed.
    #[error("Invalid manifest at {path}: {message}")]
    Manifest { path: PathBuf, message: String },

    /// Failed to load plugin source into its engine.
    #[error("Failed to load plugin '{name}': {message}")]
    LoadError { name: String, message: String },

    /// Plugin code failed while running.
    #[error("Plugin '{name}' execution error: {message}")]
    ExecutionError { name: String, message: String },

    /// Plugin was cancelled.
    #[error("Plugin '{name}' was cancelled")]
    Cancelled { name: String },

    /// Plugin timed out.
    #[error("Plugin '{name}' timed out after {timeout_ms}ms")]
    Timeout { name: String, timeout_ms: u64 },

    /// Invalid runtime configuration.
    #[error("Invalid plugin configuration: {message}")]
    ConfigError { message: String },

    /// Operation requires the plugin to be disabled first.
    #[error("Plugin '{id}' is active; disable it first")]
    StillActive { id: String },

    /// Plugin archive could not be extracted.
    #[error("Archive error: {0}")]
    Archive(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Background task failed to complete.
    #[error("Background task failed: {0}")]
    Task(String),
}

impl PluginError {
    /// Whether this error came from the invocation deadline or cancellation.
    pub fn is_interrupt(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Cancelled { .. })
    }
}

impl From<serde_json::Error> for PluginError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<zip::result::ZipError> for PluginError {
    fn from(e: zip::result::ZipError) -> Self {
        Self::Archive(e.to_string())
    }
}

/// A dynamic value passed out of either script engine.
///
/// Deserializes from JSON, which is how the QuickJS adapter hands values
/// across; the Rhai adapter converts `rhai::Dynamic` directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum Value {
    /// Null/undefined/unit value.
    #[default]
    Null,

    /// Boolean value.
    Bool(bool),

    /// Integer value.
    Integer(i64),

    /// Floating point value.
    Float(f64),

    /// String value.
    String(String),

    /// Array/list value.
    Array(Vec<Value>),

    /// Object/map value.
    Object(HashMap<String, Value>),

    /// Binary data.
    Bytes(Vec<u8>),
}

impl Value {
    /// Try to get this value as a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Try to get this value as an object.
    pub fn as_object(&self) -> Option<&HashMap<String, Value>> {
        match self {
            Self::Object(obj) => Some(obj),
            _ => None,
        }
    }

    /// Render this value as hook output.
    ///
    /// Null means the hook produced nothing; scalars become their text form,
    /// containers become JSON.
    pub fn into_hook_output(self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::String(s) => Some(s),
            Self::Bool(b) => Some(b.to_string()),
            Self::Integer(i) => Some(i.to_string()),
            Self::Float(f) => Some(f.to_string()),
            Self::Bytes(b) => Some(String::from_utf8_lossy(&b).into_owned()),
            other @ (Self::Array(_) | Self::Object(_)) => serde_json::to_string(&other).ok(),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(arr: Vec<T>) -> Self {
        Self::Array(arr.into_iter().map(Into::into).collect())
    }
}

impl From<HashMap<String, Value>> for Value {
    fn from(obj: HashMap<String, Value>) -> Self {
        Self::Object(obj)
    }
}

/// What a plugin route handler produced.
///
/// Handlers return loosely typed values; the host renders each shape
/// differently, so the shape is decided once here.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RouteResponse {
    /// A mapping carrying a `template` name; rendered through the theme.
    TemplateView {
        template: String,
        fields: HashMap<String, Value>,
    },

    /// A string, served as pre-rendered HTML.
    RawHtml { html: String },

    /// Anything else, serialized as data.
    Data { value: Value },
}

impl From<Value> for RouteResponse {
    fn from(value: Value) -> Self {
        match value {
            Value::String(html) => Self::RawHtml { html },
            Value::Object(fields) => match fields.get("template").and_then(Value::as_str) {
                Some(template) => Self::TemplateView {
                    template: template.to_string(),
                    fields,
                },
                None => Self::Data {
                    value: Value::Object(fields),
                },
            },
            value => Self::Data { value },
        }
    }
}
