//! QuickJS runtime implementation.

use std::collections::HashMap;

use rquickjs::convert::Coerced;
use rquickjs::function::Rest;
use rquickjs::{CatchResultExt, Context, Ctx, Function, Object, Runtime, Value as JsValue};

use crate::runtime::{HostBindings, Interrupt, InvocationLimits, ScriptEngine};
use crate::types::{PluginError, PluginResult, Value};

/// One plugin evaluated in its own QuickJS runtime.
pub struct JsEngine {
    /// Plugin name, for errors.
    plugin: String,

    /// The plugin's global context.
    context: Context,

    /// Owns the heap `context` lives in.
    _runtime: Runtime,

    /// Deadline/cancellation polled by the interrupt handler.
    interrupt: Interrupt,
}

impl JsEngine {
    /// Create a runtime, install the host API and evaluate `source`.
    pub fn load(source: &str, host: HostBindings, limits: InvocationLimits) -> PluginResult<Self> {
        let plugin = host.plugin().to_string();
        let load_error = |message: String| PluginError::LoadError {
            name: plugin.clone(),
            message,
        };

        let runtime = Runtime::new().map_err(|e| load_error(e.to_string()))?;
        if let Some(bytes) = limits.max_memory {
            runtime.set_memory_limit(bytes);
        }

        let interrupt = Interrupt::new(limits);
        let flag = interrupt.clone();
        runtime.set_interrupt_handler(Some(Box::new(move || flag.triggered())));

        let context = Context::full(&runtime).map_err(|e| load_error(e.to_string()))?;

        {
            let _armed = interrupt.arm();
            context
                .with(|ctx| -> PluginResult<()> {
                    install_host_api(&ctx, &host).map_err(|e| load_error(e.to_string()))?;
                    ctx.eval::<JsValue, _>(source)
                        .catch(&ctx)
                        .map_err(|e| load_error(e.to_string()))?;
                    Ok(())
                })
                .map_err(|e| interrupt.explain(&plugin, e))?;
        }

        Ok(Self {
            plugin,
            context,
            _runtime: runtime,
            interrupt,
        })
    }

    fn execution_error(&self, message: impl ToString) -> PluginError {
        PluginError::ExecutionError {
            name: self.plugin.clone(),
            message: message.to_string(),
        }
    }

    fn call_global<'js>(&self, ctx: &Ctx<'js>, name: &str, arg: &str) -> PluginResult<Option<Value>> {
        let callee: JsValue = ctx.globals().get(name).map_err(|e| self.execution_error(e))?;
        let Some(func) = callee.as_function() else {
            return Ok(None);
        };

        let result: JsValue = func
            .call((arg,))
            .catch(ctx)
            .map_err(|e| self.execution_error(e))?;

        self.to_value(ctx, result).map(Some)
    }

    /// Convert a JS value through `JSON.stringify`.
    fn to_value<'js>(&self, ctx: &Ctx<'js>, value: JsValue<'js>) -> PluginResult<Value> {
        let json = ctx
            .json_stringify(value)
            .catch(ctx)
            .map_err(|e| self.execution_error(e))?;

        match json {
            // undefined, functions and symbols have no JSON form
            None => Ok(Value::Null),
            Some(text) => {
                let text = text.to_string().map_err(|e| self.execution_error(e))?;
                Ok(serde_json::from_str(&text)?)
            }
        }
    }
}

/// Install `registerRoute`, `log`, `getConfig`, `PluginConfig` and `console`.
fn install_host_api(ctx: &Ctx<'_>, host: &HostBindings) -> rquickjs::Result<()> {
    let globals = ctx.globals();

    let bindings = host.clone();
    globals.set(
        "registerRoute",
        Function::new(ctx.clone(), move |method: String, path: String, handler: String| {
            bindings.register_route(&method, &path, &handler);
        })?,
    )?;

    let bindings = host.clone();
    globals.set(
        "log",
        Function::new(ctx.clone(), move |message: Coerced<String>| {
            bindings.log(&message.0);
        })?,
    )?;

    let config: HashMap<String, String> = host
        .config()
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    let snapshot = config.clone();
    globals.set("getConfig", Function::new(ctx.clone(), move || snapshot.clone())?)?;
    globals.set("PluginConfig", config)?;

    let console = Object::new(ctx.clone())?;
    let bindings = host.clone();
    console.set(
        "log",
        Function::new(ctx.clone(), move |args: Rest<Coerced<String>>| {
            let line: Vec<String> = args.0.into_iter().map(|arg| arg.0).collect();
            bindings.log(&line.join(" "));
        })?,
    )?;
    globals.set("console", console)?;

    Ok(())
}

impl ScriptEngine for JsEngine {
    fn name(&self) -> &'static str {
        "quickjs"
    }

    fn has_export(&self, name: &str) -> bool {
        self.context.with(|ctx| {
            ctx.globals()
                .get::<_, JsValue>(name)
                .map(|value| value.is_function())
                .unwrap_or(false)
        })
    }

    fn invoke(&self, name: &str, arg: &str) -> PluginResult<Option<Value>> {
        // One deadline per runtime; arm it under the runtime lock.
        self.context.with(|ctx| {
            let _armed = self.interrupt.arm();
            self.call_global(&ctx, name, arg)
                .map_err(|e| self.interrupt.explain(&self.plugin, e))
        })
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::config::{PluginManifest, ResolvedConfig};

    fn host(config: ResolvedConfig) -> HostBindings {
        let manifest = PluginManifest::parse(r#"{"id": "js-test"}"#, Path::new("plugin.json")).unwrap();
        HostBindings::new(&manifest, config)
    }

    fn limits() -> InvocationLimits {
        InvocationLimits::new(Duration::from_secs(2), CancellationToken::new())
    }

    #[test]
    fn test_load_and_invoke() {
        let engine = JsEngine::load(
            "function OnMarkdown(s) { return s + '!'; }",
            host(ResolvedConfig::default()),
            limits(),
        )
        .unwrap();

        assert!(engine.has_export("OnMarkdown"));
        assert!(!engine.has_export("OnRequest"));
        assert_eq!(
            engine.invoke("OnMarkdown", "hi").unwrap(),
            Some(Value::from("hi!"))
        );
        assert_eq!(engine.invoke("missing", "hi").unwrap(), None);
    }

    #[test]
    fn test_host_api() {
        let config: ResolvedConfig = [("greeting".to_string(), "hello".to_string())]
            .into_iter()
            .collect();
        let bindings = host(config);
        let engine = JsEngine::load(
            r#"
            registerRoute("GET", "/hello", "hello");
            console.log("loading", 1);
            log("loaded");
            function hello(path) {
                return { template: "page", title: getConfig().greeting + " " + path };
            }
            function greeting() { return PluginConfig.greeting; }
            "#,
            bindings.clone(),
            limits(),
        )
        .unwrap();

        let routes = bindings.finish_load();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].path, "/hello");
        assert_eq!(routes[0].handler, "hello");

        let value = engine.invoke("hello", "/hello").unwrap().unwrap();
        let obj = value.as_object().unwrap();
        assert_eq!(obj["template"], Value::from("page"));
        assert_eq!(obj["title"], Value::from("hello /hello"));
        assert_eq!(engine.invoke("greeting", "").unwrap(), Some(Value::from("hello")));
    }

    #[test]
    fn test_syntax_error_fails_load() {
        let result = JsEngine::load("function (", host(ResolvedConfig::default()), limits());
        assert!(matches!(result, Err(PluginError::LoadError { .. })));
    }

    #[test]
    fn test_throwing_handler() {
        let engine = JsEngine::load(
            "function boom(s) { throw new Error('nope'); }",
            host(ResolvedConfig::default()),
            limits(),
        )
        .unwrap();
        let err = engine.invoke("boom", "x").unwrap_err();
        assert!(matches!(err, PluginError::ExecutionError { .. }));
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn test_runaway_handler_times_out() {
        let engine = JsEngine::load(
            "function spin(s) { while (true) {} }",
            host(ResolvedConfig::default()),
            InvocationLimits::new(Duration::from_millis(50), CancellationToken::new()),
        )
        .unwrap();
        let err = engine.invoke("spin", "x").unwrap_err();
        assert!(matches!(err, PluginError::Timeout { .. }));

        // The engine stays usable after an interrupt.
        assert!(engine.has_export("spin"));
    }

    #[test]
    fn test_runaway_top_level_fails_load() {
        let result = JsEngine::load(
            "while (true) {}",
            host(ResolvedConfig::default()),
            InvocationLimits::new(Duration::from_millis(50), CancellationToken::new()),
        );
        assert!(matches!(result, Err(PluginError::Timeout { .. })));
    }
}
