//! Capability model: permission grants and call-time checks.
//!
//! A plugin's manifest declares `(kind, scope)` permission pairs. At load
//! time these are frozen into a [`CapabilitySet`] that every sandboxed I/O
//! operation consults before performing any action. Denial happens before
//! any side effect, never after the fact.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{PluginError, PluginResult};

/// Kind of effectful operation a permission covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionKind {
    /// Read access to plugin-visible files.
    Read,
    /// Write access to plugin-visible files.
    Write,
    /// Outbound network access (scope is a hostname or `*`).
    Network,
    /// Filesystem access beyond the plugin's own directory.
    Filesystem,
    /// Process-level access.
    Process,
}

impl PermissionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Network => "network",
            Self::Filesystem => "filesystem",
            Self::Process => "process",
        }
    }

    /// Kinds that validation surfaces as dangerous. Advisory only; hard
    /// enforcement happens at call time.
    pub fn is_dangerous(&self) -> bool {
        matches!(self, Self::Filesystem | Self::Process)
    }
}

impl std::fmt::Display for PermissionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single declared permission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Permission {
    /// Operation kind.
    #[serde(rename = "type")]
    pub kind: PermissionKind,
    /// Scope string, `"*"` for unrestricted within the kind.
    pub scope: String,
    /// Human-readable reason shown during review.
    #[serde(default)]
    pub description: Option<String>,
}

impl Permission {
    pub fn new(kind: PermissionKind, scope: impl Into<String>) -> Self {
        Self { kind, scope: scope.into(), description: None }
    }

    /// The `"{kind}:{scope}"` form used for membership checks.
    pub fn key(&self) -> String {
        format!("{}:{}", self.kind, self.scope)
    }
}

/// The active permission set of a loaded plugin, constructed once at
/// sandbox build time and immutable afterwards.
#[derive(Debug, Clone, Default)]
pub struct CapabilitySet {
    grants: HashSet<String>,
}

impl CapabilitySet {
    pub fn from_permissions(permissions: &[Permission]) -> Self {
        Self { grants: permissions.iter().map(Permission::key).collect() }
    }

    /// Check a grant by exact or wildcard-scope membership.
    pub fn check(&self, kind: PermissionKind, scope: &str) -> bool {
        self.grants.contains(&format!("{kind}:{scope}"))
            || self.grants.contains(&format!("{kind}:*"))
    }

    /// Like [`check`](Self::check) but produces the denial error.
    pub fn require(&self, plugin: &str, kind: PermissionKind, scope: &str) -> PluginResult<()> {
        if self.check(kind, scope) {
            Ok(())
        } else {
            Err(PluginError::PermissionDenied {
                plugin: plugin.to_string(),
                permission: format!("{kind}:{scope}"),
            })
        }
    }

    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }

    pub fn grants(&self) -> impl Iterator<Item = &str> {
        self.grants.iter().map(String::as_str)
    }
}

/// Resolve `path` against `root` and confine the result to `root`.
///
/// Containment is structural: `..` and `.` components are resolved
/// lexically and the result must share `root`'s component chain. A textual
/// prefix comparison would let `/plugins/foo-evil` pass for a root of
/// `/plugins/foo`; `Path::starts_with` compares whole components, so it
/// does not.
pub fn confine_path(root: &Path, path: &str) -> Option<PathBuf> {
    let candidate = Path::new(path);
    let joined = if candidate.is_absolute() { candidate.to_path_buf() } else { root.join(candidate) };

    let mut resolved = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !resolved.pop() {
                    return None;
                }
            }
            other => resolved.push(other.as_os_str()),
        }
    }

    if resolved.starts_with(root) {
        Some(resolved)
    } else {
        None
    }
}

/// Expand symlinks in `path` by canonicalizing its deepest existing
/// ancestor and reattaching the not-yet-existing remainder.
///
/// Lexical confinement cannot see a symlink inside the jail that points
/// outside it; callers re-check containment on the result, which is
/// canonical for every component that exists on disk.
pub fn resolve_symlinks(path: &Path) -> PathBuf {
    let mut base = path.to_path_buf();
    let mut tail: Vec<std::ffi::OsString> = Vec::new();
    loop {
        match base.canonicalize() {
            Ok(mut canonical) => {
                for part in tail.iter().rev() {
                    canonical.push(part);
                }
                return canonical;
            }
            Err(_) => match base.file_name() {
                Some(name) => {
                    tail.push(name.to_os_string());
                    base.pop();
                }
                None => return path.to_path_buf(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(perms: &[(PermissionKind, &str)]) -> CapabilitySet {
        let permissions: Vec<Permission> =
            perms.iter().map(|(k, s)| Permission::new(*k, *s)).collect();
        CapabilitySet::from_permissions(&permissions)
    }

    #[test]
    fn test_exact_scope_check() {
        let set = caps(&[(PermissionKind::Network, "api.example.com")]);

        assert!(set.check(PermissionKind::Network, "api.example.com"));
        assert!(!set.check(PermissionKind::Network, "evil.example.com"));
        assert!(!set.check(PermissionKind::Read, "api.example.com"));
    }

    #[test]
    fn test_wildcard_scope_check() {
        let set = caps(&[(PermissionKind::Network, "*")]);

        assert!(set.check(PermissionKind::Network, "api.example.com"));
        assert!(set.check(PermissionKind::Network, "anything"));
        assert!(!set.check(PermissionKind::Write, "anything"));
    }

    #[test]
    fn test_require_produces_denial() {
        let set = caps(&[]);
        let err = set.require("demo", PermissionKind::Write, "notes.txt").unwrap_err();
        assert!(matches!(err, PluginError::PermissionDenied { .. }));
    }

    #[test]
    fn test_dangerous_kinds() {
        assert!(PermissionKind::Process.is_dangerous());
        assert!(PermissionKind::Filesystem.is_dangerous());
        assert!(!PermissionKind::Read.is_dangerous());
        assert!(!PermissionKind::Network.is_dangerous());
    }

    #[test]
    fn test_confine_relative_path() {
        let root = Path::new("/plugins/foo");
        assert_eq!(
            confine_path(root, "data/notes.txt"),
            Some(PathBuf::from("/plugins/foo/data/notes.txt"))
        );
    }

    #[test]
    fn test_confine_rejects_traversal() {
        let root = Path::new("/plugins/foo");
        assert_eq!(confine_path(root, "../other/secret"), None);
        assert_eq!(confine_path(root, "a/../../escape"), None);
    }

    #[test]
    fn test_confine_rejects_sibling_prefix() {
        // "/plugins/foo-evil" must not pass for a root of "/plugins/foo".
        let root = Path::new("/plugins/foo");
        assert_eq!(confine_path(root, "/plugins/foo-evil/payload"), None);
        assert!(confine_path(root, "/plugins/foo/payload").is_some());
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_symlinks_follows_links() {
        let outside = tempfile::TempDir::new().unwrap();
        let root = tempfile::TempDir::new().unwrap();
        std::fs::write(outside.path().join("target.txt"), "x").unwrap();
        std::os::unix::fs::symlink(outside.path(), root.path().join("link")).unwrap();

        let real_outside = outside.path().canonicalize().unwrap();
        assert_eq!(
            resolve_symlinks(&root.path().join("link").join("target.txt")),
            real_outside.join("target.txt")
        );

        // A not-yet-existing leaf is reattached below the resolved ancestor.
        assert_eq!(
            resolve_symlinks(&root.path().join("link").join("new.txt")),
            real_outside.join("new.txt")
        );
    }

    #[test]
    fn test_permission_key_form() {
        let perm = Permission::new(PermissionKind::Filesystem, "*");
        assert_eq!(perm.key(), "filesystem:*");
    }
}
