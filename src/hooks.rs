//! Hook bus: a priority-ordered, named publish/subscribe registry.
//!
//! Hooks carry both plugin lifecycle events and shared-graph mutation
//! notifications. Handlers for one emission run sequentially, each awaited
//! before the next; a handler failure is caught, reported through the
//! `plugin:error` hook, and never aborts its siblings.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{json, Value};
use tracing::{debug, warn};

/// Hook names pre-registered at startup.
pub const BUILTIN_HOOKS: &[&str] = &[
    "plugin:loaded",
    "plugin:unloaded",
    "plugin:error",
    "graph:node:added",
    "graph:node:updated",
    "graph:node:removed",
    "graph:edge:added",
    "graph:edge:updated",
    "graph:edge:removed",
    "analysis:start",
    "analysis:complete",
    "export:before",
    "export:after",
    "import:before",
    "import:after",
];

/// A hook handler owned by one plugin registration.
#[async_trait]
pub trait HookHandler: Send + Sync {
    async fn call(&self, args: &[Value]) -> anyhow::Result<Value>;
}

struct SyncFnHandler<F>(F);

#[async_trait]
impl<F> HookHandler for SyncFnHandler<F>
where
    F: Fn(&[Value]) -> anyhow::Result<Value> + Send + Sync,
{
    async fn call(&self, args: &[Value]) -> anyhow::Result<Value> {
        (self.0)(args)
    }
}

/// Wrap a synchronous closure as a [`HookHandler`].
pub fn handler_fn<F>(f: F) -> Arc<dyn HookHandler>
where
    F: Fn(&[Value]) -> anyhow::Result<Value> + Send + Sync + 'static,
{
    Arc::new(SyncFnHandler(f))
}

struct Registration {
    plugin: String,
    priority: i32,
    handler: Arc<dyn HookHandler>,
}

/// Thread-safe registry of named hooks with priority-ordered handlers.
#[derive(Default)]
pub struct HookBus {
    hooks: RwLock<HashMap<String, Vec<Registration>>>,
}

impl HookBus {
    /// Create a bus with all built-in hooks pre-registered.
    pub fn new() -> Self {
        let bus = Self::default();
        {
            let mut map = bus.hooks.write();
            for name in BUILTIN_HOOKS {
                map.entry((*name).to_string()).or_default();
            }
        }
        bus
    }

    /// Register a hook name without attaching a handler.
    pub fn ensure_hook(&self, name: &str) {
        self.hooks.write().entry(name.to_string()).or_default();
    }

    /// Register a handler, inserted in descending-priority order. Equal
    /// priorities keep registration order.
    pub fn register(&self, hook: &str, plugin: &str, handler: Arc<dyn HookHandler>, priority: i32) {
        let mut map = self.hooks.write();
        let chain = map.entry(hook.to_string()).or_default();
        let position =
            chain.iter().position(|r| r.priority < priority).unwrap_or(chain.len());
        chain.insert(
            position,
            Registration { plugin: plugin.to_string(), priority, handler },
        );
        debug!(hook, plugin, priority, "registered hook handler");
    }

    /// Remove every handler owned by `plugin` across all hooks. Runs under
    /// a single write lock, so no partial unregistration is observable.
    pub fn unregister_all(&self, plugin: &str) {
        let mut map = self.hooks.write();
        for chain in map.values_mut() {
            chain.retain(|r| r.plugin != plugin);
        }
    }

    /// All registered hook names.
    pub fn hook_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.hooks.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of handlers currently attached to `hook`.
    pub fn handler_count(&self, hook: &str) -> usize {
        self.hooks.read().get(hook).map_or(0, Vec::len)
    }

    /// Invoke each handler of `hook` sequentially, awaiting each before the
    /// next, and collect the successful results in invocation order.
    ///
    /// Emitting an unregistered name yields an empty list. Handler failures
    /// are re-routed as `plugin:error` emissions; failures raised inside
    /// `plugin:error` handlers themselves are only logged.
    pub async fn emit(&self, hook: &str, args: &[Value]) -> Vec<Value> {
        let (results, failures) = self.run_handlers(hook, args).await;

        if hook != "plugin:error" {
            for (plugin, error) in failures {
                let payload =
                    json!({ "plugin": plugin, "error": error, "hook": hook });
                let _ = self.run_handlers("plugin:error", &[payload]).await;
            }
        }

        results
    }

    async fn run_handlers(&self, hook: &str, args: &[Value]) -> (Vec<Value>, Vec<(String, String)>) {
        // Snapshot the chain so handlers may register/unregister hooks
        // without deadlocking the bus.
        let chain: Vec<(String, Arc<dyn HookHandler>)> = {
            let map = self.hooks.read();
            match map.get(hook) {
                Some(regs) => {
                    regs.iter().map(|r| (r.plugin.clone(), Arc::clone(&r.handler))).collect()
                }
                None => return (Vec::new(), Vec::new()),
            }
        };

        let mut results = Vec::new();
        let mut failures = Vec::new();

        for (plugin, handler) in chain {
            match handler.call(args).await {
                Ok(value) => results.push(value),
                Err(e) => {
                    warn!(hook, plugin = %plugin, error = %e, "hook handler failed");
                    failures.push((plugin, e.to_string()));
                }
            }
        }

        (results, failures)
    }
}
