//! The external user/share registry seam.
//! Daemons resolve credentials through the `Registry` trait; the bundled
//! `FileRegistry` reads the per-user auth files the portal maintains under
//! each user home (`.ssh/`, `.davs/`, `.ftps/`). Reads may be slow; the
//! credential cache wraps every call in a bounded timeout.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{GateError, GateResult};
use crate::gate::principal::{Credential, Principal, Protocol};

pub const AUTH_PASSWORDS_FILE: &str = "authpasswords";
pub const AUTH_KEYS_FILE: &str = "authorized_keys";
pub const AUTH_DIGESTS_FILE: &str = "authdigests";

/// Read-only view of the authoritative user/share store.
pub trait Registry: Send + Sync {
    /// All currently valid credential forms for the principal, or `None`
    /// when the registry has no such principal.
    fn resolve(&self, principal: &Principal) -> GateResult<Option<Vec<Credential>>>;

    /// Usernames with any auth material for the protocol; used by full
    /// cache rebuilds at daemon startup.
    fn scan_usernames(&self, protocol: Protocol) -> GateResult<Vec<String>>;
}

/// File-backed registry rooted at the site user-home directory.
pub struct FileRegistry {
    root: PathBuf,
}

impl FileRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn auth_dir(&self, principal: &Principal) -> PathBuf {
        self.root
            .join(&principal.username)
            .join(principal.protocol.auth_dir())
    }

    /// Read one auth file as a list of non-comment, non-blank lines.
    /// A missing file is simply an empty list; users enable auth methods
    /// by creating the corresponding file.
    fn read_auth_lines(path: &Path) -> GateResult<Vec<String>> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(GateError::TransientRegistry {
                    principal: path.display().to_string(),
                    reason: e.to_string(),
                })
            }
        };
        Ok(raw
            .lines()
            .map(|l| l.split('#').next().unwrap_or("").trim())
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }
}

impl Registry for FileRegistry {
    fn resolve(&self, principal: &Principal) -> GateResult<Option<Vec<Credential>>> {
        let dir = self.auth_dir(principal);
        if !dir.is_dir() {
            debug!(target: "gridgate::registry", %principal, "no auth dir");
            return Ok(None);
        }
        let mut creds = Vec::new();
        for line in Self::read_auth_lines(&dir.join(AUTH_PASSWORDS_FILE))? {
            // Only PHC strings are accepted; anything else in the file is a
            // portal bug and must not silently disable the whole account.
            if password_hash::PasswordHash::new(&line).is_ok() {
                creds.push(Credential::PasswordHash(line));
            } else {
                warn!(target: "gridgate::registry", %principal,
                      "skipping malformed password hash line");
            }
        }
        for line in Self::read_auth_lines(&dir.join(AUTH_KEYS_FILE))? {
            if line.split_whitespace().count() >= 2 {
                creds.push(Credential::PublicKey(line));
            } else {
                warn!(target: "gridgate::registry", %principal,
                      "skipping broken public key line");
            }
        }
        for line in Self::read_auth_lines(&dir.join(AUTH_DIGESTS_FILE))? {
            creds.push(Credential::SharedSecret(line));
        }
        if creds.is_empty() {
            return Ok(None);
        }
        debug!(target: "gridgate::registry", %principal, count = creds.len(),
               "resolved credentials");
        Ok(Some(creds))
    }

    fn scan_usernames(&self, protocol: Protocol) -> GateResult<Vec<String>> {
        let mut found = Vec::new();
        for entry in WalkDir::new(&self.root)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(Result::ok)
        {
            if !entry.file_type().is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str() else {
                continue;
            };
            if entry.path().join(protocol.auth_dir()).is_dir() {
                found.push(name.to_string());
            }
        }
        found.sort();
        Ok(found)
    }
}
