//! Plugin lifecycle manager.
//!
//! Orchestrates install (local path or remote registry), dependency
//! resolution, load/unload, enable/disable, update-checking, and
//! uninstall, delegating code execution to the [`Sandbox`]. Lifecycle
//! operations return a structured [`LifecycleOutcome`] instead of erroring
//! across the host boundary, so callers branch without exception handling.
//!
//! State per plugin: not loaded -> validating -> loaded (active) <->
//! disabled -> unloaded. Validation or sandbox failures during load leave
//! no partial registration: no hooks, no storage.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::json;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::error::{PluginError, PluginResult};
use crate::graph::{GraphEdge, GraphNode, GraphStore};
use crate::hooks::HookBus;
use crate::manifest::{validate_plugin_dir, PluginManifest, ValidationReport, MANIFEST_FILE};
use crate::registry::{RegistryClient, RegistryPlugin, DEFAULT_REGISTRY_URL};
use crate::sandbox::{EntryLoader, PluginApi, PluginEntry, Sandbox, SandboxConfig};
use crate::storage::StorageRegistry;

/// Options for [`PluginManager::install_plugin`].
#[derive(Debug, Clone, Copy, Default)]
pub struct InstallOptions {
    /// Do not recursively install unresolved dependencies.
    pub skip_dependencies: bool,
}

/// Structured result of a lifecycle operation.
#[derive(Debug)]
pub struct LifecycleOutcome {
    pub success: bool,
    pub plugin: Option<String>,
    pub error: Option<String>,
    pub warnings: Vec<String>,
}

impl LifecycleOutcome {
    pub fn ok(plugin: impl Into<String>) -> Self {
        Self { success: true, plugin: Some(plugin.into()), error: None, warnings: Vec::new() }
    }

    pub fn ok_with(plugin: impl Into<String>, warnings: Vec<String>) -> Self {
        Self { success: true, plugin: Some(plugin.into()), error: None, warnings }
    }

    pub fn failure(error: impl std::fmt::Display) -> Self {
        Self { success: false, plugin: None, error: Some(error.to_string()), warnings: Vec::new() }
    }
}

/// Update status for one installed plugin.
#[derive(Debug, Clone)]
pub struct UpdateInfo {
    pub name: String,
    pub installed: String,
    pub latest: Option<String>,
    pub update_available: bool,
}

/// A plugin currently held by the runtime registry.
pub struct LoadedPlugin {
    pub manifest: PluginManifest,
    pub active: bool,
    pub loaded_at: DateTime<Utc>,
    entry: Box<dyn PluginEntry>,
    api: PluginApi,
}

impl LoadedPlugin {
    pub fn name(&self) -> &str {
        &self.manifest.name
    }
}

/// Manages plugin installation, loading, and lifecycle.
pub struct PluginManager {
    plugins_dir: PathBuf,
    plugins: HashMap<String, LoadedPlugin>,
    bus: Arc<HookBus>,
    graph: Arc<GraphStore>,
    storage: Arc<StorageRegistry>,
    sandbox: Sandbox,
    registry: RegistryClient,
}

impl PluginManager {
    /// Create a manager with default limits against the default registry.
    pub fn new(plugins_dir: PathBuf, loader: Arc<dyn EntryLoader>) -> PluginResult<Self> {
        Self::with_config(plugins_dir, loader, SandboxConfig::default(), DEFAULT_REGISTRY_URL)
    }

    pub fn with_config(
        plugins_dir: PathBuf,
        loader: Arc<dyn EntryLoader>,
        config: SandboxConfig,
        registry_url: &str,
    ) -> PluginResult<Self> {
        std::fs::create_dir_all(&plugins_dir)?;

        let bus = Arc::new(HookBus::new());
        let graph = Arc::new(GraphStore::new(Arc::clone(&bus)));
        let storage = Arc::new(StorageRegistry::new());
        let sandbox = Sandbox::new(
            Arc::clone(&bus),
            Arc::clone(&graph),
            Arc::clone(&storage),
            loader,
            config,
        )?;
        let registry = RegistryClient::with_url(registry_url)?;

        Ok(Self {
            plugins_dir,
            plugins: HashMap::new(),
            bus,
            graph,
            storage,
            sandbox,
            registry,
        })
    }

    /// Default managed plugin directory under the platform data dir.
    pub fn default_plugins_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("plugraph")
            .join("plugins")
    }

    pub fn plugins_dir(&self) -> &Path {
        &self.plugins_dir
    }

    pub fn hook_bus(&self) -> Arc<HookBus> {
        Arc::clone(&self.bus)
    }

    pub fn graph(&self) -> Arc<GraphStore> {
        Arc::clone(&self.graph)
    }

    pub fn storage(&self) -> Arc<StorageRegistry> {
        Arc::clone(&self.storage)
    }

    /// Get a loaded plugin by name.
    pub fn get(&self, name: &str) -> Option<&LoadedPlugin> {
        self.plugins.get(name)
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.plugins.contains_key(name)
    }

    pub fn list(&self) -> impl Iterator<Item = &LoadedPlugin> {
        self.plugins.values()
    }

    pub fn count(&self) -> usize {
        self.plugins.len()
    }

    /// Inject the shared graph contents the plugins will operate on.
    pub fn set_graph_data(&self, nodes: Vec<GraphNode>, edges: Vec<GraphEdge>) {
        self.graph.set_data(nodes, edges);
    }

    /// All hook names currently registered on the bus.
    pub fn get_registered_hooks(&self) -> Vec<String> {
        self.bus.hook_names()
    }

    /// Validate a candidate plugin directory without loading it.
    pub fn validate_plugin(
        &self,
        dir: &Path,
        strict: bool,
    ) -> PluginResult<(PluginManifest, ValidationReport)> {
        validate_plugin_dir(dir, &self.loaded_names(), strict)
    }

    /// Search the remote registry.
    pub async fn search_plugins(
        &self,
        query: &str,
        tags: &[String],
    ) -> PluginResult<Vec<RegistryPlugin>> {
        self.registry.search(query, tags).await
    }

    /// Install a plugin from a local directory or, failing that, by exact
    /// name from the registry. Unresolved dependencies are installed
    /// first unless `skip_dependencies` is set; dependency cycles are
    /// rejected rather than recursed.
    pub async fn install_plugin(
        &mut self,
        name_or_path: &str,
        options: InstallOptions,
    ) -> LifecycleOutcome {
        let mut visiting = HashSet::new();
        self.install_inner(name_or_path.to_string(), options, &mut visiting).await
    }

    fn install_inner<'a>(
        &'a mut self,
        source: String,
        options: InstallOptions,
        visiting: &'a mut HashSet<String>,
    ) -> BoxFuture<'a, LifecycleOutcome> {
        async move {
            let mut warnings = Vec::new();

            // Local directories skip the download path entirely; a bare
            // name is first resolved against the managed directory, then
            // against the registry.
            let managed_copy = self.plugins_dir.join(&source);
            let (staging, _stage_guard) = if Path::new(&source).is_dir() {
                (PathBuf::from(&source), None)
            } else if !source.contains(std::path::MAIN_SEPARATOR) && managed_copy.is_dir() {
                (managed_copy, None)
            } else {
                let record = match self.registry.find(&source).await {
                    Ok(Some(record)) => record,
                    Ok(None) => {
                        return LifecycleOutcome::failure(PluginError::NotFound(source))
                    }
                    Err(e) => return LifecycleOutcome::failure(e),
                };
                let staged = match tempfile::tempdir() {
                    Ok(dir) => dir,
                    Err(e) => return LifecycleOutcome::failure(PluginError::Io(e)),
                };
                match self.registry.download(&record, staged.path()).await {
                    Ok(download_warnings) => warnings.extend(download_warnings),
                    Err(e) => return LifecycleOutcome::failure(e),
                }
                (staged.path().to_path_buf(), Some(staged))
            };

            // Lenient here: unresolved dependencies are resolved below by
            // installing them, not reported as fatal.
            let (manifest, report) =
                match validate_plugin_dir(&staging, &self.loaded_names(), false) {
                    Ok(validated) => validated,
                    Err(e) => return LifecycleOutcome::failure(e),
                };
            warnings.extend(report.warnings);

            if self.plugins.contains_key(&manifest.name) {
                return LifecycleOutcome::failure(PluginError::AlreadyInstalled(manifest.name));
            }

            if !visiting.insert(manifest.name.clone()) {
                return LifecycleOutcome::failure(PluginError::Validation(format!(
                    "dependency cycle detected at '{}'",
                    manifest.name
                )));
            }

            if !options.skip_dependencies {
                for dep in manifest.dependencies.clone() {
                    if self.plugins.contains_key(&dep) {
                        continue;
                    }
                    if visiting.contains(&dep) {
                        visiting.remove(&manifest.name);
                        return LifecycleOutcome::failure(PluginError::Validation(format!(
                            "dependency cycle detected between '{}' and '{dep}'",
                            manifest.name
                        )));
                    }
                    let outcome = self.install_inner(dep.clone(), options, visiting).await;
                    if !outcome.success {
                        visiting.remove(&manifest.name);
                        return LifecycleOutcome {
                            success: false,
                            plugin: Some(manifest.name),
                            error: Some(format!(
                                "failed to install dependency '{dep}': {}",
                                outcome.error.unwrap_or_default()
                            )),
                            warnings,
                        };
                    }
                    warnings.extend(outcome.warnings);
                }
            }
            visiting.remove(&manifest.name);

            let dest = self.plugins_dir.join(&manifest.name);
            let already_in_place =
                dest.exists() && staging.canonicalize().ok() == dest.canonicalize().ok();
            if !already_in_place {
                if dest.exists() {
                    if let Err(e) = std::fs::remove_dir_all(&dest) {
                        return LifecycleOutcome::failure(PluginError::Io(e));
                    }
                }
                if let Err(e) = copy_dir(&staging, &dest) {
                    return LifecycleOutcome::failure(e);
                }
            }

            let mut outcome = self.load_plugin(&dest).await;
            warnings.append(&mut outcome.warnings);
            outcome.warnings = dedup_warnings(warnings);
            outcome
        }
        .boxed()
    }

    /// Load a validated plugin directory into the runtime.
    pub async fn load_plugin(&mut self, dir: &Path) -> LifecycleOutcome {
        let (manifest, report) = match validate_plugin_dir(dir, &self.loaded_names(), false) {
            Ok(validated) => validated,
            Err(e) => return LifecycleOutcome::failure(e),
        };

        if self.plugins.contains_key(&manifest.name) {
            return LifecycleOutcome::failure(PluginError::DuplicatePlugin(manifest.name));
        }

        // Fresh namespace per instance: no carryover across reload.
        self.storage.create(&manifest.name);

        match self.sandbox.load(&manifest, dir).await {
            Ok(sandboxed) => {
                let name = manifest.name.clone();
                let version = manifest.version.clone();
                self.plugins.insert(
                    name.clone(),
                    LoadedPlugin {
                        manifest,
                        active: true,
                        loaded_at: Utc::now(),
                        entry: sandboxed.entry,
                        api: sandboxed.api,
                    },
                );
                self.bus
                    .emit("plugin:loaded", &[json!({ "name": name, "version": version })])
                    .await;
                info!(plugin = %name, version = %version, "plugin loaded");
                LifecycleOutcome::ok_with(name, report.warnings)
            }
            Err(e) => {
                // No partial registration for a failed load.
                self.bus.unregister_all(&manifest.name);
                self.storage.remove(&manifest.name);
                warn!(plugin = %manifest.name, error = %e, "plugin load failed");
                LifecycleOutcome::failure(e)
            }
        }
    }

    /// Unload a plugin, clearing its hook registrations and storage.
    pub async fn unload_plugin(&mut self, name: &str) -> LifecycleOutcome {
        let Some(plugin) = self.plugins.remove(name) else {
            return LifecycleOutcome::failure(PluginError::NotFound(name.to_string()));
        };

        if let Err(e) = plugin.entry.on_unload(&plugin.api).await {
            warn!(plugin = name, error = %e, "on_unload callback failed");
        }

        self.bus.unregister_all(name);
        self.storage.remove(name);
        self.bus.emit("plugin:unloaded", &[json!({ "name": name })]).await;
        info!(plugin = name, "plugin unloaded");
        LifecycleOutcome::ok(name)
    }

    /// Activate a plugin. No-op if already enabled.
    pub async fn enable_plugin(&mut self, name: &str) -> LifecycleOutcome {
        let Some(plugin) = self.plugins.get_mut(name) else {
            return LifecycleOutcome::failure(PluginError::NotFound(name.to_string()));
        };
        if plugin.active {
            return LifecycleOutcome::ok(name);
        }

        if let Err(e) = plugin.entry.on_enable(&plugin.api).await {
            return LifecycleOutcome::failure(PluginError::Sandbox(e.to_string()));
        }
        plugin.active = true;
        LifecycleOutcome::ok(name)
    }

    /// Deactivate a plugin. No-op if already disabled. Does not interrupt
    /// code already running.
    pub async fn disable_plugin(&mut self, name: &str) -> LifecycleOutcome {
        let Some(plugin) = self.plugins.get_mut(name) else {
            return LifecycleOutcome::failure(PluginError::NotFound(name.to_string()));
        };
        if !plugin.active {
            return LifecycleOutcome::ok(name);
        }

        if let Err(e) = plugin.entry.on_disable(&plugin.api).await {
            return LifecycleOutcome::failure(PluginError::Sandbox(e.to_string()));
        }
        plugin.active = false;
        LifecycleOutcome::ok(name)
    }

    /// Unload a plugin and remove its managed directory.
    pub async fn uninstall_plugin(&mut self, name: &str) -> LifecycleOutcome {
        let was_loaded = self.plugins.contains_key(name);
        if was_loaded {
            let outcome = self.unload_plugin(name).await;
            if !outcome.success {
                return outcome;
            }
        }

        let dir = self.plugins_dir.join(name);
        if dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                return LifecycleOutcome::failure(PluginError::Io(e));
            }
        } else if !was_loaded {
            return LifecycleOutcome::failure(PluginError::NotFound(name.to_string()));
        }

        info!(plugin = name, "plugin uninstalled");
        LifecycleOutcome::ok(name)
    }

    /// Update a plugin to the registry's latest version.
    ///
    /// The new version is downloaded, checksum-verified, and validated in
    /// a staging directory before the installed one is removed, so a
    /// failed download or bad bundle never leaves the plugin uninstalled.
    pub async fn update_plugin(&mut self, name: &str) -> LifecycleOutcome {
        let installed = match self.plugins.get(name) {
            Some(plugin) => plugin.manifest.clone(),
            None => match PluginManifest::from_dir(&self.plugins_dir.join(name)) {
                Ok(manifest) => manifest,
                Err(_) => {
                    return LifecycleOutcome::failure(PluginError::NotFound(name.to_string()))
                }
            },
        };

        let record = match self.registry.find(name).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                return LifecycleOutcome::failure(PluginError::NotFound(format!(
                    "'{name}' not present in registry"
                )))
            }
            Err(e) => return LifecycleOutcome::failure(e),
        };

        if record.version == installed.version {
            return LifecycleOutcome::ok_with(
                name,
                vec![format!("'{name}' is already at the latest version ({})", record.version)],
            );
        }

        // Stage the new version fully before touching the old one.
        let staged = match tempfile::tempdir() {
            Ok(dir) => dir,
            Err(e) => return LifecycleOutcome::failure(PluginError::Io(e)),
        };
        let mut warnings = match self.registry.download(&record, staged.path()).await {
            Ok(download_warnings) => download_warnings,
            Err(e) => return LifecycleOutcome::failure(e),
        };
        if let Err(e) = validate_plugin_dir(staged.path(), &self.loaded_names(), false) {
            return LifecycleOutcome::failure(e);
        }

        let outcome = self.uninstall_plugin(name).await;
        if !outcome.success {
            return outcome;
        }

        let dest = self.plugins_dir.join(name);
        if let Err(e) = copy_dir(staged.path(), &dest) {
            return LifecycleOutcome::failure(e);
        }

        let mut outcome = self.load_plugin(&dest).await;
        warnings.append(&mut outcome.warnings);
        outcome.warnings = dedup_warnings(warnings);
        outcome
    }

    /// Compare every installed plugin's version against the registry.
    pub async fn check_for_updates(&self) -> PluginResult<Vec<UpdateInfo>> {
        let mut infos = Vec::new();
        for manifest in self.installed_manifests()? {
            let latest = self.registry.find(&manifest.name).await?.map(|r| r.version);
            let update_available =
                latest.as_deref().map_or(false, |v| v != manifest.version);
            infos.push(UpdateInfo {
                name: manifest.name,
                installed: manifest.version,
                latest,
                update_available,
            });
        }
        Ok(infos)
    }

    fn loaded_names(&self) -> HashSet<String> {
        self.plugins.keys().cloned().collect()
    }

    fn installed_manifests(&self) -> PluginResult<Vec<PluginManifest>> {
        let mut manifests = Vec::new();
        for entry in std::fs::read_dir(&self.plugins_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() && path.join(MANIFEST_FILE).exists() {
                manifests.push(PluginManifest::from_dir(&path)?);
            }
        }
        manifests.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(manifests)
    }
}

fn copy_dir(src: &Path, dest: &Path) -> PluginResult<()> {
    for entry in WalkDir::new(src) {
        let entry = entry.map_err(std::io::Error::from)?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| PluginError::Io(std::io::Error::other(e)))?;
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

fn dedup_warnings(warnings: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    warnings.into_iter().filter(|w| seen.insert(w.clone())).collect()
}
