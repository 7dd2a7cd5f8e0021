//! Rhai runtime implementation.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};

use rhai::{AST, CallFnOptions, Dynamic, Engine, FnAccess, Scope};

use crate::runtime::{HostBindings, Interrupt, InvocationLimits, ScriptEngine};
use crate::types::{PluginError, PluginResult, Value};

use super::bindings;

/// One plugin evaluated by its own Rhai engine.
pub struct RhaiEngine {
    /// Plugin name, for errors.
    plugin: String,

    /// Engine carrying this plugin's host API.
    engine: Engine,

    /// Compiled plugin source.
    ast: AST,

    /// Top-level variables left by load-time evaluation.
    scope: Mutex<Scope<'static>>,

    /// Public one-parameter functions defined by the script.
    exports: HashSet<String>,

    /// Deadline/cancellation polled by the progress callback.
    interrupt: Interrupt,
}

impl RhaiEngine {
    /// Compile `source`, run its top-level statements once and record its
    /// exported functions.
    pub fn load(source: &str, host: HostBindings, limits: InvocationLimits) -> PluginResult<Self> {
        let plugin = host.plugin().to_string();
        let load_error = |message: String| PluginError::LoadError {
            name: plugin.clone(),
            message,
        };

        let mut engine = Engine::new();

        // Configure structural limits; time is bounded by the interrupt
        engine.set_max_expr_depths(64, 64);
        engine.set_max_call_levels(64);
        engine.set_max_string_size(8 * 1024 * 1024);
        engine.set_max_array_size(100_000);
        engine.set_max_map_size(100_000);

        let request_timeout = limits.timeout;
        let interrupt = Interrupt::new(limits);
        let flag = interrupt.clone();
        engine.on_progress(move |_ops| flag.triggered().then(|| Dynamic::from("interrupted")));

        bindings::register_std_helpers(&mut engine);
        bindings::register_net_helpers(&mut engine, request_timeout);
        bindings::register_host_api(&mut engine, &host);

        let ast = engine.compile(source).map_err(|e| load_error(e.to_string()))?;

        let mut scope = Scope::new();
        {
            let _armed = interrupt.arm();
            engine
                .run_ast_with_scope(&mut scope, &ast)
                .map_err(|e| interrupt.explain(&plugin, load_error(e.to_string())))?;
        }

        let exports = ast
            .iter_functions()
            .filter(|f| f.access != FnAccess::Private && f.params.len() == 1)
            .map(|f| f.name.to_string())
            .collect();

        Ok(Self {
            plugin,
            engine,
            ast,
            scope: Mutex::new(scope),
            exports,
            interrupt,
        })
    }

    /// Convert a Rhai Dynamic to our Value type.
    fn dynamic_to_value(val: &Dynamic) -> Value {
        if val.is_unit() {
            Value::Null
        } else if val.is_bool() {
            Value::Bool(val.as_bool().unwrap_or(false))
        } else if val.is_int() {
            Value::Integer(val.as_int().unwrap_or(0))
        } else if val.is_float() {
            Value::Float(val.as_float().unwrap_or(0.0))
        } else if val.is_string() {
            Value::String(val.clone().into_string().unwrap_or_default())
        } else if val.is_array() {
            let arr = val.clone().into_array().unwrap_or_default();
            Value::Array(arr.iter().map(Self::dynamic_to_value).collect())
        } else if val.is_blob() {
            Value::Bytes(val.clone().into_blob().unwrap_or_default())
        } else if val.is_map() {
            let map = val.clone().cast::<rhai::Map>();
            let obj: HashMap<String, Value> = map
                .into_iter()
                .map(|(k, v)| (k.to_string(), Self::dynamic_to_value(&v)))
                .collect();
            Value::Object(obj)
        } else {
            Value::String(val.to_string())
        }
    }
}

impl ScriptEngine for RhaiEngine {
    fn name(&self) -> &'static str {
        "rhai"
    }

    fn has_export(&self, name: &str) -> bool {
        self.exports.contains(name)
    }

    fn invoke(&self, name: &str, arg: &str) -> PluginResult<Option<Value>> {
        if !self.exports.contains(name) {
            return Ok(None);
        }

        let mut scope = self.scope.lock().unwrap_or_else(PoisonError::into_inner);
        let _armed = self.interrupt.arm();

        // Top-level statements ran once at load; do not run them again.
        let options = CallFnOptions::new().eval_ast(false).rewind_scope(true);
        let result = self
            .engine
            .call_fn_with_options::<Dynamic>(options, &mut scope, &self.ast, name, (arg.to_string(),))
            .map_err(|e| {
                self.interrupt.explain(
                    &self.plugin,
                    PluginError::ExecutionError {
                        name: self.plugin.clone(),
                        message: e.to_string(),
                    },
                )
            })?;

        Ok(Some(Self::dynamic_to_value(&result)))
    }
}
