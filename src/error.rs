//! Plugin runtime error types.

use thiserror::Error;

/// Result type for plugin operations.
pub type PluginResult<T> = Result<T, PluginError>;

/// Errors that can occur during plugin operations.
#[derive(Debug, Error)]
pub enum PluginError {
    /// Invalid or missing plugin manifest.
    #[error("Invalid plugin manifest: {0}")]
    Manifest(String),

    /// Validation failed (unresolved dependency in strict mode, malformed permission).
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Capability check failure at call time.
    #[error("Plugin '{plugin}' requires permission '{permission}' which is not granted")]
    PermissionDenied { plugin: String, permission: String },

    /// Uncaught failure inside plugin code.
    #[error("Plugin execution failed: {0}")]
    Sandbox(String),

    /// Plugin exceeded its wall-clock budget.
    #[error("Plugin '{0}' timed out after {1}ms")]
    Timeout(String, u64),

    /// Name collision on load.
    #[error("Plugin '{0}' is already loaded")]
    DuplicatePlugin(String),

    /// Plugin already present in the managed directory.
    #[error("Plugin '{0}' is already installed")]
    AlreadyInstalled(String),

    /// Plugin not found (locally or in the registry).
    #[error("Plugin not found: {0}")]
    NotFound(String),

    /// Registry search/download failure.
    #[error("Registry error: {0}")]
    Registry(String),

    /// Network failure inside a sandboxed fetch.
    #[error("Network error: {0}")]
    Network(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
