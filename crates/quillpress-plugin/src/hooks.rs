//! Hook names and per-plugin hook tables.
//!
//! A hook is a top-level callable a plugin exports under one of four fixed
//! names. Each takes one string and returns one string; the response hook's
//! return value is ignored.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::Serialize;

use crate::runtime::ScriptEngine;
use crate::types::PluginError;

/// The fixed set of hooks a plugin may export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum HookName {
    /// Filters rendered HTML of a post or page.
    OnContentRender,
    /// Filters Markdown source before rendering.
    OnMarkdown,
    /// Sees the request path; a non-empty result intercepts the request.
    OnRequest,
    /// Observes the final URL and HTML; result ignored.
    OnResponse,
}

impl HookName {
    /// Every hook, in resolution order.
    pub const ALL: [HookName; 4] = [
        Self::OnContentRender,
        Self::OnMarkdown,
        Self::OnRequest,
        Self::OnResponse,
    ];

    /// Exported symbol name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::OnContentRender => "OnContentRender",
            Self::OnMarkdown => "OnMarkdown",
            Self::OnRequest => "OnRequest",
            Self::OnResponse => "OnResponse",
        }
    }
}

impl fmt::Display for HookName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for HookName {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|h| h.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| PluginError::ConfigError {
                message: format!("unknown hook '{s}'"),
            })
    }
}

/// A wrapped hook: one string in, optional string out.
pub type HookFn = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Hooks a loaded plugin exports.
#[derive(Clone, Default)]
pub struct HookTable {
    hooks: HashMap<HookName, HookFn>,
}

impl HookTable {
    /// Resolve every fixed hook the engine exports and wrap it.
    ///
    /// Invocation errors are logged and reported as "no output".
    pub fn resolve(plugin: &str, engine: &Arc<dyn ScriptEngine>) -> Self {
        let mut hooks: HashMap<HookName, HookFn> = HashMap::new();

        for hook in HookName::ALL {
            if !engine.has_export(hook.name()) {
                continue;
            }

            let engine = Arc::clone(engine);
            let plugin = plugin.to_string();
            hooks.insert(
                hook,
                Arc::new(move |input: &str| match engine.invoke(hook.name(), input) {
                    Ok(value) => value.and_then(|v| v.into_hook_output()),
                    Err(e) => {
                        tracing::warn!(plugin = %plugin, hook = %hook, "Hook failed: {e}");
                        None
                    }
                }),
            );
        }

        Self { hooks }
    }

    /// Insert a hook directly.
    pub fn insert(&mut self, hook: HookName, f: HookFn) {
        self.hooks.insert(hook, f);
    }

    pub fn contains(&self, hook: HookName) -> bool {
        self.hooks.contains_key(&hook)
    }

    /// Run a hook. `None` if the hook is absent or produced nothing.
    pub fn call(&self, hook: HookName, input: &str) -> Option<String> {
        self.hooks.get(&hook).and_then(|f| f(input))
    }

    /// Exported hook names, sorted.
    pub fn names(&self) -> Vec<HookName> {
        let mut names: Vec<_> = self.hooks.keys().copied().collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

impl fmt::Debug for HookTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.names()).finish()
    }
}

/// Payload handed to `OnResponse`, serialized as JSON.
#[derive(Debug, Serialize)]
pub struct ResponsePayload<'a> {
    pub url: &'a str,
    pub html: &'a str,
}

impl ResponsePayload<'_> {
    pub fn to_json(&self) -> String {
        // Two string fields cannot fail to serialize.
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hook_names_round_trip() {
        for hook in HookName::ALL {
            assert_eq!(hook.name().parse::<HookName>().unwrap(), hook);
        }
        assert_eq!("onmarkdown".parse::<HookName>().unwrap(), HookName::OnMarkdown);
        assert!("OnSave".parse::<HookName>().is_err());
    }

    #[test]
    fn test_hook_table_call() {
        let mut table = HookTable::default();
        table.insert(HookName::OnMarkdown, Arc::new(|s: &str| Some(s.to_uppercase())));

        assert!(table.contains(HookName::OnMarkdown));
        assert!(!table.contains(HookName::OnRequest));
        assert_eq!(table.call(HookName::OnMarkdown, "abc").as_deref(), Some("ABC"));
        assert_eq!(table.call(HookName::OnRequest, "abc"), None);
        assert_eq!(table.names(), vec![HookName::OnMarkdown]);
    }

    #[test]
    fn test_response_payload() {
        let payload = ResponsePayload { url: "/a", html: "<p>\"x\"</p>" }.to_json();
        let parsed: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(parsed["url"], "/a");
        assert_eq!(parsed["html"], "<p>\"x\"</p>");
    }
}
