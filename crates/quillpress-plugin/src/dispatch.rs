//! Hook application, request interception and route matching.
//!
//! Every operation takes one snapshot up front and works on it with no lock
//! held, so a concurrent reload never splits a single dispatch across two
//! generations.

use crate::hooks::{HookName, ResponsePayload};
use crate::registry::PluginRegistry;
use crate::types::RouteResponse;

impl PluginRegistry {
    /// Chain `content` through `hook` of every active plugin that exports it.
    pub fn apply_filter(&self, hook: HookName, content: &str) -> String {
        let snapshot = self.snapshot();
        let mut content = content.to_string();
        for plugin in snapshot.active() {
            if let Some(output) = plugin.call_hook(hook, &content) {
                content = output;
            }
        }
        content
    }

    /// Offer `url` to every active `OnRequest` hook. The first non-empty
    /// output intercepts the request.
    pub fn apply_request_filter(&self, url: &str) -> Option<String> {
        let snapshot = self.snapshot();
        snapshot.active().find_map(|plugin| {
            let output = plugin.call_hook(HookName::OnRequest, url)?;
            if output.is_empty() {
                return None;
            }
            tracing::debug!(plugin = %plugin.id(), url, "Request intercepted");
            Some(output)
        })
    }

    /// Notify every active `OnResponse` hook of the final page.
    pub fn apply_response_filter(&self, url: &str, html: &str) {
        let snapshot = self.snapshot();
        let payload = ResponsePayload { url, html }.to_json();
        for plugin in snapshot.active() {
            let _ = plugin.call_hook(HookName::OnResponse, &payload);
        }
    }

    /// Find the first active plugin route for `method` and `path` whose
    /// handler runs successfully.
    pub fn match_route(&self, method: &str, path: &str) -> Option<RouteResponse> {
        let snapshot = self.snapshot();
        for plugin in snapshot.active() {
            for route in plugin.routes.iter().filter(|r| r.matches(method, path)) {
                match plugin.invoke_handler(&route.handler, path) {
                    Some(value) => return Some(RouteResponse::from(value)),
                    None => continue,
                }
            }
        }
        None
    }

    /// Paths of non-parameterized GET routes across active plugins.
    pub fn active_routes(&self) -> Vec<String> {
        let snapshot = self.snapshot();
        let mut paths: Vec<String> = snapshot
            .active()
            .flat_map(|plugin| plugin.routes.iter())
            .filter(|route| route.method.eq_ignore_ascii_case("GET") && !route.is_parameterized())
            .map(|route| route.path.clone())
            .collect();
        paths.sort();
        paths.dedup();
        paths
    }
}
