//! Plugin manifest parsing and validation.
//!
//! A plugin manifest is a TOML file (`plugin.toml`) at the plugin
//! directory root describing the plugin's identity, entry point, declared
//! permissions, dependencies, and the hooks it intends to handle.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::capability::Permission;
use crate::error::{PluginError, PluginResult};

/// Plugin manifest file name.
pub const MANIFEST_FILE: &str = "plugin.toml";

/// Declarative metadata for a plugin. Immutable once loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginManifest {
    /// Plugin name (unique identifier among loaded plugins).
    pub name: String,
    /// Plugin version (semver).
    pub version: String,
    /// Plugin description.
    #[serde(default)]
    pub description: Option<String>,
    /// Plugin author.
    #[serde(default)]
    pub author: Option<String>,
    /// Entry-point path, relative to the plugin directory.
    pub main: String,
    /// Declared permissions.
    #[serde(default)]
    pub permissions: Vec<Permission>,
    /// Names of plugins this plugin depends on.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Hook names this plugin declares interest in.
    #[serde(default)]
    pub hooks: Vec<String>,
}

impl PluginManifest {
    /// Parse a manifest from a TOML string.
    pub fn from_toml(content: &str) -> PluginResult<Self> {
        toml::from_str(content).map_err(|e| PluginError::Manifest(e.to_string()))
    }

    /// Read and parse `plugin.toml` from a plugin directory.
    pub fn from_dir(dir: &Path) -> PluginResult<Self> {
        let path = dir.join(MANIFEST_FILE);
        if !path.exists() {
            return Err(PluginError::Manifest(format!(
                "{MANIFEST_FILE} not found in {}",
                dir.display()
            )));
        }
        let content = std::fs::read_to_string(&path)?;
        Self::from_toml(&content)
    }

    /// Serialize to a TOML string.
    pub fn to_toml(&self) -> PluginResult<String> {
        toml::to_string_pretty(self).map_err(|e| PluginError::Manifest(e.to_string()))
    }

    /// Check required fields and their shapes.
    pub fn validate(&self) -> PluginResult<()> {
        if self.name.is_empty() {
            return Err(PluginError::Manifest("Plugin name is required".to_string()));
        }

        if !self.name.chars().all(|c| c.is_alphanumeric() || c == '-' || c == '_') {
            return Err(PluginError::Manifest(
                "Plugin name must contain only alphanumeric characters, hyphens, and underscores"
                    .to_string(),
            ));
        }

        if self.version.is_empty() {
            return Err(PluginError::Manifest("Plugin version is required".to_string()));
        }

        let version_parts: Vec<&str> = self.version.split('.').collect();
        if version_parts.len() < 2 || version_parts.iter().any(|p| p.parse::<u64>().is_err()) {
            return Err(PluginError::Manifest(
                "Version must be in semver format (e.g., 1.0.0)".to_string(),
            ));
        }

        if self.main.is_empty() {
            return Err(PluginError::Manifest("Plugin entry point is required".to_string()));
        }

        Ok(())
    }

    /// Absolute path of the entry file inside `dir`.
    pub fn entry_path(&self, dir: &Path) -> PathBuf {
        dir.join(&self.main)
    }
}

/// A declared dependency cross-checked against the loaded set.
#[derive(Debug, Clone, Serialize)]
pub struct PluginDependency {
    pub name: String,
    pub resolved: bool,
}

/// Outcome of validating a candidate plugin directory.
#[derive(Debug, Default)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub dependencies: Vec<PluginDependency>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Names of declared dependencies not currently loaded.
    pub fn unresolved(&self) -> Vec<&str> {
        self.dependencies.iter().filter(|d| !d.resolved).map(|d| d.name.as_str()).collect()
    }
}

/// Validate a candidate plugin directory before any code runs.
///
/// Hard failures (unreadable manifest, missing required fields, missing
/// entry file) return an error. Policy findings land in the report:
/// unresolved dependencies are errors in strict mode and warnings
/// otherwise, and dangerous permission kinds are always warnings here --
/// hard enforcement happens at call time in the sandbox.
pub fn validate_plugin_dir(
    dir: &Path,
    loaded: &HashSet<String>,
    strict: bool,
) -> PluginResult<(PluginManifest, ValidationReport)> {
    let manifest = PluginManifest::from_dir(dir)?;
    manifest.validate()?;

    let entry = manifest.entry_path(dir);
    if !entry.is_file() {
        return Err(PluginError::Manifest(format!(
            "entry file '{}' does not exist",
            manifest.main
        )));
    }

    let mut report = ValidationReport::default();

    for dep in &manifest.dependencies {
        let resolved = loaded.contains(dep);
        if !resolved {
            let message = format!("required dependency '{dep}' is not loaded");
            if strict {
                report.errors.push(message);
            } else {
                report.warnings.push(message);
            }
        }
        report.dependencies.push(PluginDependency { name: dep.clone(), resolved });
    }

    for permission in &manifest.permissions {
        if permission.kind.is_dangerous() {
            report.warnings.push(format!(
                "plugin requests dangerous permission '{}'",
                permission.key()
            ));
        }
    }

    Ok((manifest, report))
}
