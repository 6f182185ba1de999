//! Sandbox execution environment.
//!
//! Each plugin runs against a [`PluginApi`] built for it at load time: a
//! graph handle, a hook registrar scoped to the plugin's name, a
//! capability-checked utility surface, and its private storage namespace.
//! Those four bindings are the plugin's entire world; nothing else from
//! the host is reachable by construction.
//!
//! Entry modules are produced by an [`EntryLoader`]. The runtime stays
//! engine-agnostic: a host embeds whatever isolation it wants (a WASM
//! engine, a subprocess bridge) behind that trait and the capability
//! checks stay identical. [`NativeEntryLoader`] covers first-party plugins
//! compiled into the host.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::time::timeout;
use tracing::debug;

use crate::capability::{confine_path, resolve_symlinks, CapabilitySet, PermissionKind};
use crate::error::{PluginError, PluginResult};
use crate::graph::GraphStore;
use crate::hooks::{HookBus, HookHandler};
use crate::manifest::PluginManifest;
use crate::storage::PluginStorage;

/// Log level for the plugin logging surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Execution limits for sandboxed entry code.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Wall-clock budget for entry lifecycle callbacks.
    ///
    /// Enforced with a cooperative timeout: a callback that never yields
    /// (a synchronous busy loop) cannot be preempted this way. Hosts that
    /// need hard preemption must supply an [`EntryLoader`] backed by a
    /// fuel-metered engine or a separate process.
    pub load_timeout: Duration,
    /// Timeout applied to each sandboxed `fetch`.
    pub fetch_timeout: Duration,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self { load_timeout: Duration::from_secs(5), fetch_timeout: Duration::from_secs(30) }
    }
}

/// A plugin's entry module: lifecycle callbacks plus the hooks it handles.
///
/// All callbacks default to no-ops, so an entry only implements what it
/// uses.
#[async_trait]
pub trait PluginEntry: Send + Sync {
    async fn on_load(&self, _api: &PluginApi) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_unload(&self, _api: &PluginApi) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_enable(&self, _api: &PluginApi) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_disable(&self, _api: &PluginApi) -> anyhow::Result<()> {
        Ok(())
    }

    /// Hook-name to handler map registered after a successful load.
    fn hooks(&self) -> HashMap<String, Arc<dyn HookHandler>> {
        HashMap::new()
    }
}

/// Produces an entry module instance from a validated manifest.
pub trait EntryLoader: Send + Sync {
    /// Instantiate the entry for `manifest`. `entry_bytes` is the raw
    /// content of the manifest's `main` file, already read and
    /// existence-checked by the runtime.
    fn load(
        &self,
        manifest: &PluginManifest,
        plugin_dir: &Path,
        entry_bytes: &[u8],
    ) -> PluginResult<Box<dyn PluginEntry>>;
}

type EntryFactory = Box<dyn Fn() -> Box<dyn PluginEntry> + Send + Sync>;

/// Loader for first-party entries compiled into the host, keyed by plugin
/// name.
#[derive(Default)]
pub struct NativeEntryLoader {
    factories: RwLock<HashMap<String, EntryFactory>>,
}

impl NativeEntryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, name: &str, factory: F)
    where
        F: Fn() -> Box<dyn PluginEntry> + Send + Sync + 'static,
    {
        self.factories.write().insert(name.to_string(), Box::new(factory));
    }
}

impl EntryLoader for NativeEntryLoader {
    fn load(
        &self,
        manifest: &PluginManifest,
        _plugin_dir: &Path,
        _entry_bytes: &[u8],
    ) -> PluginResult<Box<dyn PluginEntry>> {
        let factories = self.factories.read();
        match factories.get(&manifest.name) {
            Some(factory) => Ok(factory()),
            None => Err(PluginError::Sandbox(format!(
                "no entry registered for plugin '{}'",
                manifest.name
            ))),
        }
    }
}

/// Hook access scoped to one plugin's name.
#[derive(Clone)]
pub struct HookRegistrar {
    bus: Arc<HookBus>,
    plugin: String,
}

impl HookRegistrar {
    pub fn register(&self, hook: &str, handler: Arc<dyn HookHandler>) {
        self.bus.register(hook, &self.plugin, handler, 0);
    }

    pub fn register_with_priority(&self, hook: &str, handler: Arc<dyn HookHandler>, priority: i32) {
        self.bus.register(hook, &self.plugin, handler, priority);
    }

    pub async fn emit(&self, hook: &str, args: &[Value]) -> Vec<Value> {
        self.bus.emit(hook, args).await
    }
}

/// Capability-checked utility surface: logging, network, file I/O.
#[derive(Clone)]
pub struct SandboxUtils {
    plugin: String,
    plugin_dir: PathBuf,
    capabilities: CapabilitySet,
    http: reqwest::Client,
}

impl SandboxUtils {
    /// Route a plugin log line through the host's tracing subscriber.
    pub fn log(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Trace => tracing::trace!(plugin = %self.plugin, "{}", message),
            LogLevel::Debug => tracing::debug!(plugin = %self.plugin, "{}", message),
            LogLevel::Info => tracing::info!(plugin = %self.plugin, "{}", message),
            LogLevel::Warn => tracing::warn!(plugin = %self.plugin, "{}", message),
            LogLevel::Error => tracing::error!(plugin = %self.plugin, "{}", message),
        }
    }

    /// Fetch a URL. Requires a `network` grant for the URL's host.
    pub async fn fetch(&self, url: &str) -> PluginResult<String> {
        let parsed = reqwest::Url::parse(url)
            .map_err(|e| PluginError::Network(format!("invalid url '{url}': {e}")))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| PluginError::Network(format!("url '{url}' has no host")))?;

        self.capabilities.require(&self.plugin, PermissionKind::Network, host)?;

        let response = self
            .http
            .get(parsed)
            .send()
            .await
            .map_err(|e| PluginError::Network(e.to_string()))?;
        response.text().await.map_err(|e| PluginError::Network(e.to_string()))
    }

    /// Read a file. Requires a `read` grant and path confinement.
    pub async fn read_file(&self, path: &str) -> PluginResult<String> {
        self.capabilities.require(&self.plugin, PermissionKind::Read, path)?;
        let resolved = self.resolve_jailed(path)?;
        Ok(tokio::fs::read_to_string(resolved).await?)
    }

    /// Write a file. Requires a `write` grant and path confinement. The
    /// checks run before any filesystem access; denial leaves no trace.
    pub async fn write_file(&self, path: &str, content: &str) -> PluginResult<()> {
        self.capabilities.require(&self.plugin, PermissionKind::Write, path)?;
        let resolved = self.resolve_jailed(path)?;
        if let Some(parent) = resolved.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(tokio::fs::write(resolved, content).await?)
    }

    /// Confine `path` to the plugin's own directory unless a broader
    /// `filesystem` grant covers it.
    ///
    /// Containment is checked twice: lexically (`..` components), then
    /// again after symlink resolution, so a symlink entry inside the
    /// plugin directory cannot point the access outside the jail.
    fn resolve_jailed(&self, path: &str) -> PluginResult<PathBuf> {
        let candidate = Path::new(path);
        if self.capabilities.check(PermissionKind::Filesystem, path) {
            // Relative paths still resolve against the plugin directory,
            // never the host process working directory.
            return Ok(if candidate.is_absolute() {
                candidate.to_path_buf()
            } else {
                self.plugin_dir.join(candidate)
            });
        }

        let confined =
            confine_path(&self.plugin_dir, path).ok_or_else(|| self.denial(path))?;
        let resolved = resolve_symlinks(&confined);
        if resolved.starts_with(&self.plugin_dir) {
            Ok(resolved)
        } else {
            Err(self.denial(path))
        }
    }

    fn denial(&self, path: &str) -> PluginError {
        PluginError::PermissionDenied {
            plugin: self.plugin.clone(),
            permission: format!("filesystem:{path}"),
        }
    }
}

/// The complete binding set handed to an entry module.
#[derive(Clone)]
pub struct PluginApi {
    pub graph: Arc<GraphStore>,
    pub hooks: HookRegistrar,
    pub utils: SandboxUtils,
    pub storage: PluginStorage,
}

/// A loaded entry module together with its execution context.
pub struct SandboxedPlugin {
    pub entry: Box<dyn PluginEntry>,
    pub api: PluginApi,
}

impl std::fmt::Debug for SandboxedPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxedPlugin").finish_non_exhaustive()
    }
}

/// Builds execution contexts and runs entry code under the configured
/// limits.
pub struct Sandbox {
    bus: Arc<HookBus>,
    graph: Arc<GraphStore>,
    storage: Arc<crate::storage::StorageRegistry>,
    loader: Arc<dyn EntryLoader>,
    config: SandboxConfig,
    http: reqwest::Client,
}

impl Sandbox {
    pub fn new(
        bus: Arc<HookBus>,
        graph: Arc<GraphStore>,
        storage: Arc<crate::storage::StorageRegistry>,
        loader: Arc<dyn EntryLoader>,
        config: SandboxConfig,
    ) -> PluginResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.fetch_timeout)
            .user_agent(format!("plugraph/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PluginError::Network(e.to_string()))?;

        Ok(Self { bus, graph, storage, loader, config, http })
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Build the execution context for `manifest` and run its entry.
    ///
    /// Steps: read the entry file, freeze the capability set, assemble the
    /// [`PluginApi`], instantiate the entry, run `on_load` under the
    /// wall-clock budget, then attach the entry's declared hook handlers.
    pub async fn load(
        &self,
        manifest: &PluginManifest,
        plugin_dir: &Path,
    ) -> PluginResult<SandboxedPlugin> {
        let entry_path = manifest.entry_path(plugin_dir);
        let entry_bytes = std::fs::read(&entry_path).map_err(|e| {
            PluginError::Manifest(format!("cannot read entry file '{}': {e}", manifest.main))
        })?;

        let plugin_root = plugin_dir.canonicalize()?;
        let capabilities = CapabilitySet::from_permissions(&manifest.permissions);

        let api = PluginApi {
            graph: Arc::clone(&self.graph),
            hooks: HookRegistrar { bus: Arc::clone(&self.bus), plugin: manifest.name.clone() },
            utils: SandboxUtils {
                plugin: manifest.name.clone(),
                plugin_dir: plugin_root.clone(),
                capabilities,
                http: self.http.clone(),
            },
            storage: PluginStorage::new(Arc::clone(&self.storage), manifest.name.clone()),
        };

        let entry = self.loader.load(manifest, &plugin_root, &entry_bytes)?;

        match timeout(self.config.load_timeout, entry.on_load(&api)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(PluginError::Sandbox(e.to_string())),
            Err(_) => {
                return Err(PluginError::Timeout(
                    manifest.name.clone(),
                    self.config.load_timeout.as_millis() as u64,
                ))
            }
        }

        for hook in &manifest.hooks {
            self.bus.ensure_hook(hook);
        }
        for (hook, handler) in entry.hooks() {
            self.bus.register(&hook, &manifest.name, handler, 0);
        }

        debug!(plugin = %manifest.name, "sandbox context created");
        Ok(SandboxedPlugin { entry, api })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::Permission;
    use crate::storage::StorageRegistry;
    use serde_json::json;
    use tempfile::TempDir;

    struct QuietEntry;

    #[async_trait]
    impl PluginEntry for QuietEntry {}

    struct SlowEntry;

    #[async_trait]
    impl PluginEntry for SlowEntry {
        async fn on_load(&self, _api: &PluginApi) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    struct FailingEntry;

    #[async_trait]
    impl PluginEntry for FailingEntry {
        async fn on_load(&self, _api: &PluginApi) -> anyhow::Result<()> {
            anyhow::bail!("entry refused to start")
        }
    }

    fn manifest(name: &str, permissions: Vec<Permission>) -> PluginManifest {
        PluginManifest {
            name: name.to_string(),
            version: "1.0.0".to_string(),
            description: None,
            author: None,
            main: "entry.wasm".to_string(),
            permissions,
            dependencies: vec![],
            hooks: vec![],
        }
    }

    fn write_entry(dir: &Path) {
        std::fs::write(dir.join("entry.wasm"), b"\0entry").unwrap();
    }

    fn sandbox(loader: Arc<dyn EntryLoader>, config: SandboxConfig) -> Sandbox {
        let bus = Arc::new(HookBus::new());
        let graph = Arc::new(GraphStore::new(Arc::clone(&bus)));
        let storage = Arc::new(StorageRegistry::new());
        Sandbox::new(bus, graph, storage, loader, config).unwrap()
    }

    fn native_loader(name: &str, factory: fn() -> Box<dyn PluginEntry>) -> Arc<dyn EntryLoader> {
        let loader = NativeEntryLoader::new();
        loader.register(name, factory);
        Arc::new(loader)
    }

    fn utils(plugin: &str, dir: &Path, permissions: Vec<Permission>) -> SandboxUtils {
        SandboxUtils {
            plugin: plugin.to_string(),
            plugin_dir: dir.canonicalize().unwrap(),
            capabilities: CapabilitySet::from_permissions(&permissions),
            http: reqwest::Client::new(),
        }
    }

    #[tokio::test]
    async fn test_load_builds_context() {
        let dir = TempDir::new().unwrap();
        write_entry(dir.path());

        let sandbox = sandbox(
            native_loader("quiet", || Box::new(QuietEntry)),
            SandboxConfig::default(),
        );
        let loaded = sandbox.load(&manifest("quiet", vec![]), dir.path()).await.unwrap();

        loaded.api.storage.set("marker", json!(1));
        assert_eq!(loaded.api.storage.get("marker"), Some(json!(1)));
    }

    #[tokio::test]
    async fn test_load_timeout() {
        let dir = TempDir::new().unwrap();
        write_entry(dir.path());

        let config =
            SandboxConfig { load_timeout: Duration::from_millis(50), ..SandboxConfig::default() };
        let sandbox = sandbox(native_loader("slow", || Box::new(SlowEntry)), config);

        let err = sandbox.load(&manifest("slow", vec![]), dir.path()).await.unwrap_err();
        assert!(matches!(err, PluginError::Timeout(_, 50)));
    }

    #[tokio::test]
    async fn test_entry_failure_is_sandbox_error() {
        let dir = TempDir::new().unwrap();
        write_entry(dir.path());

        let sandbox = sandbox(
            native_loader("broken", || Box::new(FailingEntry)),
            SandboxConfig::default(),
        );
        let err = sandbox.load(&manifest("broken", vec![]), dir.path()).await.unwrap_err();
        assert!(matches!(err, PluginError::Sandbox(_)));
    }

    #[tokio::test]
    async fn test_missing_entry_file() {
        let dir = TempDir::new().unwrap();

        let sandbox = sandbox(
            native_loader("quiet", || Box::new(QuietEntry)),
            SandboxConfig::default(),
        );
        let err = sandbox.load(&manifest("quiet", vec![]), dir.path()).await.unwrap_err();
        assert!(matches!(err, PluginError::Manifest(_)));
    }

    #[tokio::test]
    async fn test_write_denied_without_grant_leaves_no_file() {
        let dir = TempDir::new().unwrap();
        let utils = utils("demo", dir.path(), vec![]);

        let err = utils.write_file("notes.txt", "payload").await.unwrap_err();
        assert!(matches!(err, PluginError::PermissionDenied { .. }));
        assert!(!dir.path().join("notes.txt").exists());
    }

    #[tokio::test]
    async fn test_write_and_read_inside_jail() {
        let dir = TempDir::new().unwrap();
        let utils = utils(
            "demo",
            dir.path(),
            vec![
                Permission::new(PermissionKind::Read, "*"),
                Permission::new(PermissionKind::Write, "*"),
            ],
        );

        utils.write_file("data/notes.txt", "hello").await.unwrap();
        assert_eq!(utils.read_file("data/notes.txt").await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_jail_blocks_escape_despite_write_grant() {
        let dir = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        let utils =
            utils("demo", dir.path(), vec![Permission::new(PermissionKind::Write, "*")]);

        let target = outside.path().join("escape.txt");
        let err = utils.write_file(target.to_str().unwrap(), "payload").await.unwrap_err();
        assert!(matches!(err, PluginError::PermissionDenied { .. }));
        assert!(!target.exists());

        let err = utils.write_file("../escape.txt", "payload").await.unwrap_err();
        assert!(matches!(err, PluginError::PermissionDenied { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_jail_blocks_symlink_escape() {
        let dir = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        std::fs::write(outside.path().join("secret.txt"), "confidential").unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();

        let utils = utils(
            "demo",
            dir.path(),
            vec![
                Permission::new(PermissionKind::Read, "*"),
                Permission::new(PermissionKind::Write, "*"),
            ],
        );

        // Lexically inside the jail, physically outside it.
        let err = utils.read_file("link/secret.txt").await.unwrap_err();
        assert!(matches!(err, PluginError::PermissionDenied { .. }));

        let err = utils.write_file("link/planted.txt", "payload").await.unwrap_err();
        assert!(matches!(err, PluginError::PermissionDenied { .. }));
        assert!(!outside.path().join("planted.txt").exists());
    }

    #[tokio::test]
    async fn test_filesystem_grant_lifts_jail() {
        let dir = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        let utils = utils(
            "demo",
            dir.path(),
            vec![
                Permission::new(PermissionKind::Write, "*"),
                Permission::new(PermissionKind::Filesystem, "*"),
            ],
        );

        let target = outside.path().join("allowed.txt");
        utils.write_file(target.to_str().unwrap(), "payload").await.unwrap();
        assert!(target.exists());
    }

    #[tokio::test]
    async fn test_filesystem_grant_keeps_relative_paths_in_plugin_dir() {
        let dir = TempDir::new().unwrap();
        let utils = utils(
            "demo",
            dir.path(),
            vec![
                Permission::new(PermissionKind::Write, "*"),
                Permission::new(PermissionKind::Filesystem, "*"),
            ],
        );

        utils.write_file("notes.txt", "local").await.unwrap();
        assert!(dir.path().join("notes.txt").exists());
    }

    #[tokio::test]
    async fn test_fetch_denied_without_network_grant() {
        let dir = TempDir::new().unwrap();
        let utils = utils("demo", dir.path(), vec![]);

        let err = utils.fetch("https://api.example.com/data").await.unwrap_err();
        assert!(matches!(err, PluginError::PermissionDenied { .. }));
    }

    #[tokio::test]
    async fn test_fetch_scope_is_per_host() {
        let dir = TempDir::new().unwrap();
        let utils = utils(
            "demo",
            dir.path(),
            vec![Permission::new(PermissionKind::Network, "api.example.com")],
        );

        // Denied before any connection is attempted.
        let err = utils.fetch("https://evil.example.com/data").await.unwrap_err();
        assert!(matches!(err, PluginError::PermissionDenied { .. }));
    }

    #[tokio::test]
    async fn test_entry_hooks_registered_after_load() {
        struct HookedEntry;

        #[async_trait]
        impl PluginEntry for HookedEntry {
            fn hooks(&self) -> HashMap<String, Arc<dyn HookHandler>> {
                let mut map: HashMap<String, Arc<dyn HookHandler>> = HashMap::new();
                map.insert(
                    "graph:node:added".to_string(),
                    crate::hooks::handler_fn(|_| Ok(Value::Null)),
                );
                map
            }
        }

        let dir = TempDir::new().unwrap();
        write_entry(dir.path());

        let bus = Arc::new(HookBus::new());
        let graph = Arc::new(GraphStore::new(Arc::clone(&bus)));
        let storage = Arc::new(StorageRegistry::new());
        let loader = NativeEntryLoader::new();
        loader.register("hooked", || Box::new(HookedEntry));
        let sandbox = Sandbox::new(
            Arc::clone(&bus),
            graph,
            storage,
            Arc::new(loader),
            SandboxConfig::default(),
        )
        .unwrap();

        sandbox.load(&manifest("hooked", vec![]), dir.path()).await.unwrap();
        assert_eq!(bus.handler_count("graph:node:added"), 1);
    }
}
