//! # Plugraph
//!
//! A capability-checked plugin runtime for a shared node/edge graph.
//!
//! Plugraph loads third-party plugins into a host application, runs each
//! one inside a restricted execution context, and mediates every
//! effectful operation -- filesystem, network, shared-graph mutation,
//! inter-plugin events -- through an explicit capability check derived
//! from the plugin's manifest.
//!
//! ## Architecture
//!
//! - [`PluginManager`] orchestrates the lifecycle: install (from a local
//!   path or the remote registry), validate, load, enable/disable,
//!   update, uninstall.
//! - The [`Sandbox`](sandbox::Sandbox) builds a [`PluginApi`] per plugin:
//!   a graph handle, a hook registrar, a capability-checked utility
//!   surface, and a private storage namespace. Those bindings are the
//!   plugin's entire world.
//! - The [`HookBus`] carries lifecycle events and graph mutation
//!   notifications between the host and loaded plugins, in deterministic
//!   priority order.
//! - The [`GraphStore`] is the single shared graph; all mutation goes
//!   through its API, never through direct references.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use plugraph::{InstallOptions, NativeEntryLoader, PluginManager};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let loader = Arc::new(NativeEntryLoader::new());
//! let mut manager =
//!     PluginManager::new(PluginManager::default_plugins_dir(), loader)?;
//!
//! let outcome = manager
//!     .install_plugin("./plugins/dep-graph-export", InstallOptions::default())
//!     .await;
//! assert!(outcome.success);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
// Allow common patterns that are intentional in this codebase
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unnecessary_map_or)]
#![allow(clippy::return_self_not_must_use)]

pub mod capability;
pub mod error;
pub mod graph;
pub mod hooks;
pub mod manager;
pub mod manifest;
pub mod registry;
pub mod sandbox;
pub mod storage;

pub use capability::{CapabilitySet, Permission, PermissionKind};
pub use error::{PluginError, PluginResult};
pub use graph::{GraphEdge, GraphNode, GraphStore, NewEdge, NewNode};
pub use hooks::{handler_fn, HookBus, HookHandler, BUILTIN_HOOKS};
pub use manager::{
    InstallOptions, LifecycleOutcome, LoadedPlugin, PluginManager, UpdateInfo,
};
pub use manifest::{
    validate_plugin_dir, PluginDependency, PluginManifest, ValidationReport, MANIFEST_FILE,
};
pub use registry::{RegistryClient, RegistryPlugin, DEFAULT_REGISTRY_URL};
pub use sandbox::{
    EntryLoader, HookRegistrar, LogLevel, NativeEntryLoader, PluginApi, PluginEntry, Sandbox,
    SandboxConfig, SandboxUtils,
};
pub use storage::{PluginStorage, StorageRegistry};
