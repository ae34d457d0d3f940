use serde::{Deserialize, Serialize};

use argon2::{Argon2, PasswordVerifier};
use password_hash::PasswordHash;

/// Protocols served by the file-sharing daemons. Each one is an independent
/// credential namespace with its own auth directory in the user home.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Sftp,
    Davs,
    Ftps,
}

impl Protocol {
    pub const ALL: [Protocol; 3] = [Protocol::Sftp, Protocol::Davs, Protocol::Ftps];

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Sftp => "sftp",
            Protocol::Davs => "davs",
            Protocol::Ftps => "ftps",
        }
    }

    /// Dot-directory under the user home holding this protocol's auth files.
    pub fn auth_dir(&self) -> &'static str {
        match self {
            Protocol::Sftp => ".ssh",
            Protocol::Davs => ".davs",
            Protocol::Ftps => ".ftps",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A username (or share/resource identifier) bound to the protocol it is
/// authenticating against. The pair is the key for the credential cache,
/// two-factor grants and per-principal session sets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Principal {
    pub username: String,
    pub protocol: Protocol,
}

impl Principal {
    pub fn new(username: impl Into<String>, protocol: Protocol) -> Self {
        Self {
            username: username.into(),
            protocol,
        }
    }
}

impl std::fmt::Display for Principal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.username, self.protocol)
    }
}

/// A stored valid credential form for a principal. Passwords are kept as
/// PHC strings only; the plain secret never enters the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Credential {
    /// Argon2 PHC string.
    PasswordHash(String),
    /// Full public key line as found in the authorized_keys file.
    PublicKey(String),
    /// Shared secret for resource/share logins.
    SharedSecret(String),
}

/// What a daemon actually received on the wire for one attempt.
#[derive(Debug, Clone)]
pub enum PresentedCredential {
    Password(String),
    PublicKey(String),
    SharedSecret(String),
}

impl PresentedCredential {
    /// The raw secret material, used only to derive a guessing signature.
    pub fn secret_material(&self) -> &str {
        match self {
            PresentedCredential::Password(s)
            | PresentedCredential::PublicKey(s)
            | PresentedCredential::SharedSecret(s) => s,
        }
    }

    /// True when `self` matches the stored form. Mismatched kinds never
    /// match, so a password can not be replayed as a shared secret.
    pub fn matches(&self, stored: &Credential) -> bool {
        match (self, stored) {
            (PresentedCredential::Password(plain), Credential::PasswordHash(phc)) => {
                verify_password(phc, plain)
            }
            (PresentedCredential::PublicKey(line), Credential::PublicKey(known)) => {
                key_line_eq(line, known)
            }
            (PresentedCredential::SharedSecret(secret), Credential::SharedSecret(known)) => {
                constant_time_eq(secret.as_bytes(), known.as_bytes())
            }
            _ => false,
        }
    }
}

fn verify_password(phc: &str, password: &str) -> bool {
    if let Ok(parsed) = PasswordHash::new(phc) {
        Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok()
    } else {
        false
    }
}

/// Compare key lines on their type+blob fields so trailing comments and
/// whitespace differences are ignored.
fn key_line_eq(a: &str, b: &str) -> bool {
    let norm = |s: &str| {
        s.split_whitespace()
            .take(2)
            .collect::<Vec<_>>()
            .join(" ")
    };
    let (na, nb) = (norm(a), norm(b));
    !na.is_empty() && na == nb
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
