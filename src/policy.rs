//! Filesystem and naming policy consulted during the decision walk.
//! Daemons for filesystem-backed protocols inject a `DaemonPolicy`; the
//! bundled `FsPolicy` implements the chroot and chmod rules the grid portal
//! enforces on user homes. Protocol differences are policy objects, never
//! subclasses.

use std::path::{Component, Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::warn;

use crate::error::{GateError, GateResult};
use crate::gate::principal::Principal;

/// Conservative default: leading alphanumeric, then the characters seen in
/// portal usernames and share ids, bounded length.
static USERNAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_.@+-]{0,127}$").unwrap());

pub fn default_username_validator() -> &'static Regex {
    &USERNAME_RE
}

pub fn valid_username(name: &str, pattern: Option<&Regex>) -> bool {
    pattern.unwrap_or_else(|| default_username_validator()).is_match(name)
}

/// Policy seam the engine consults after credentials have been validated.
pub trait DaemonPolicy: Send + Sync {
    /// Whether the principal may address `requested_path` at all.
    fn validate_path(&self, principal: &Principal, requested_path: &str) -> bool;

    /// Whether a chmod to `mode` is acceptable for a file or directory.
    fn acceptable_mode(&self, mode: u32, is_dir: bool) -> bool;
}

/// Accepts everything; for protocols without a filesystem surface.
pub struct OpenPolicy;

impl DaemonPolicy for OpenPolicy {
    fn validate_path(&self, _principal: &Principal, _requested_path: &str) -> bool {
        true
    }

    fn acceptable_mode(&self, _mode: u32, _is_dir: bool) -> bool {
        true
    }
}

/// Chroot policy over the site user-home root: each principal is confined
/// to `<root>/<username>` plus any shared chroot exceptions (vgrid shares,
/// seafile mounts and the like).
pub struct FsPolicy {
    root: PathBuf,
    chroot_exceptions: Vec<PathBuf>,
}

impl FsPolicy {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            chroot_exceptions: Vec::new(),
        }
    }

    pub fn with_chroot_exceptions(mut self, exceptions: Vec<PathBuf>) -> Self {
        self.chroot_exceptions = exceptions;
        self
    }

    /// Translate a user-supplied path into the real location under the
    /// principal's home, refusing escapes and invisible control files.
    /// Purely lexical: the target may not exist yet (uploads).
    pub fn resolve_fs_path(&self, principal: &Principal, user_path: &str) -> GateResult<PathBuf> {
        if user_path.contains('\0') {
            return Err(GateError::policy("NUL in requested path"));
        }
        let home = self.root.join(&principal.username);
        // Leading slashes must not discard the home prefix.
        let relative = user_path.trim_start_matches('/');
        let joined = home.join(relative);
        let normalized = lexical_normalize(&joined);
        let mut accepted = false;
        for accept_root in std::iter::once(&home).chain(self.chroot_exceptions.iter()) {
            if normalized.starts_with(accept_root) {
                accepted = true;
                break;
            }
        }
        if !accepted {
            return Err(GateError::policy(format!(
                "path escapes chroot: {user_path}"
            )));
        }
        if invisible_path(&normalized, &home) {
            return Err(GateError::policy(format!("invisible path: {user_path}")));
        }
        Ok(normalized)
    }

    /// Strip the chroot prefix again for daemon-facing listings.
    pub fn strip_root(&self, principal: &Principal, path: &Path) -> PathBuf {
        let home = self.root.join(&principal.username);
        for accept_root in std::iter::once(&home).chain(self.chroot_exceptions.iter()) {
            if let Ok(rest) = path.strip_prefix(accept_root) {
                return Path::new("/").join(rest);
            }
        }
        path.to_path_buf()
    }
}

impl DaemonPolicy for FsPolicy {
    fn validate_path(&self, principal: &Principal, requested_path: &str) -> bool {
        match self.resolve_fs_path(principal, requested_path) {
            Ok(_) => true,
            Err(e) => {
                warn!(target: "gridgate::policy", %principal, error = %e,
                      "rejected path");
                false
            }
        }
    }

    fn acceptable_mode(&self, mode: u32, is_dir: bool) -> bool {
        acceptable_chmod(mode, is_dir)
    }
}

/// A chmod is only safe when it keeps the owner in control and never sets
/// special bits. Files must retain user rw, directories user rwx; suid,
/// sgid and sticky are always refused.
pub fn acceptable_chmod(mode: u32, is_dir: bool) -> bool {
    if mode & 0o7000 != 0 {
        return false;
    }
    if is_dir {
        mode & 0o700 == 0o700
    } else {
        mode & 0o600 == 0o600
    }
}

/// Control files (the auth dot-directories among them) stay invisible to
/// the sharing daemons so users can not read or replace their own
/// credential material through a mounted share.
fn invisible_path(path: &Path, home: &Path) -> bool {
    let rest = match path.strip_prefix(home) {
        Ok(rest) => rest,
        Err(_) => return false,
    };
    rest.components().any(|c| match c {
        Component::Normal(part) => part.to_string_lossy().starts_with('.'),
        _ => false,
    })
}

/// Normalize `.` and `..` without touching the filesystem.
fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
