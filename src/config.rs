//! Site configuration for the access-control core.
//! All tuning lives here and is validated exactly once when the gate is
//! built; request paths never re-check option sanity. Durations are stored
//! as plain seconds so site configs stay hand-editable JSON.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GateError, GateResult};
use crate::gate::principal::Protocol;

/// Thresholds for the four independent rate-limit kinds. Any breached kind
/// denies the attempt; there is no cross-kind precedence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Failed hits tolerated per (address, protocol, username) window.
    #[serde(default = "default_max_user_hits")]
    pub max_user_hits: u32,
    /// Failed hits tolerated per (protocol, username) regardless of address.
    #[serde(default = "default_user_abuse_hits")]
    pub user_abuse_hits: u32,
    /// Failed hits tolerated per (address, protocol) across all usernames.
    #[serde(default = "default_proto_abuse_hits")]
    pub proto_abuse_hits: u32,
    /// Distinct guessed secrets tolerated per secret-signature window.
    #[serde(default = "default_max_secret_hits")]
    pub max_secret_hits: u32,
    /// Fixed window length in seconds, shared by all four kinds unless a
    /// site overrides the per-kind windows below.
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// Per-kind window overrides; unset kinds use `window_secs`.
    #[serde(default)]
    pub user_hits_window_secs: Option<u64>,
    #[serde(default)]
    pub user_abuse_window_secs: Option<u64>,
    #[serde(default)]
    pub proto_abuse_window_secs: Option<u64>,
    #[serde(default)]
    pub secret_window_secs: Option<u64>,
    /// Reset the per-address-per-user counter on a successful login so
    /// legitimate frequent logins are never penalised.
    #[serde(default = "default_true")]
    pub reset_on_success: bool,
    /// Drop buckets untouched for this long (seconds).
    #[serde(default = "default_retention_secs")]
    pub bucket_retention_secs: u64,
}

fn default_max_user_hits() -> u32 {
    10
}
fn default_user_abuse_hits() -> u32 {
    25
}
fn default_proto_abuse_hits() -> u32 {
    25
}
fn default_max_secret_hits() -> u32 {
    10
}
fn default_window_secs() -> u64 {
    120
}
fn default_retention_secs() -> u64 {
    3600
}
fn default_true() -> bool {
    true
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_user_hits: default_max_user_hits(),
            user_abuse_hits: default_user_abuse_hits(),
            proto_abuse_hits: default_proto_abuse_hits(),
            max_secret_hits: default_max_secret_hits(),
            window_secs: default_window_secs(),
            user_hits_window_secs: None,
            user_abuse_window_secs: None,
            proto_abuse_window_secs: None,
            secret_window_secs: None,
            reset_on_success: true,
            bucket_retention_secs: default_retention_secs(),
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn bucket_retention(&self) -> Duration {
        Duration::from_secs(self.bucket_retention_secs)
    }
}

/// Per-protocol knobs. Protocols are independent namespaces, so each gets
/// its own idle timeout and two-factor requirement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    #[serde(default = "default_idle_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default)]
    pub require_twofactor: bool,
}

fn default_idle_secs() -> u64 {
    900
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_secs(),
            require_twofactor: false,
        }
    }
}

impl ProtocolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    #[serde(default)]
    pub rate: RateLimitConfig,
    #[serde(default)]
    pub sftp: ProtocolConfig,
    #[serde(default)]
    pub davs: ProtocolConfig,
    #[serde(default)]
    pub ftps: ProtocolConfig,
    /// Credential cache entries older than this are refreshed on lookup;
    /// zero disables caching so every lookup consults the registry.
    #[serde(default = "default_staleness_secs")]
    pub cache_staleness_secs: u64,
    /// Upper bound on a single registry resolve; beyond it the attempt
    /// fails closed.
    #[serde(default = "default_registry_timeout_secs")]
    pub registry_timeout_secs: u64,
    /// Fixed interval between background expiry sweeps.
    #[serde(default = "default_sweep_secs")]
    pub sweep_interval_secs: u64,
    /// Cap on concurrently open sessions per principal; `None` disables.
    #[serde(default)]
    pub max_sessions_per_principal: Option<usize>,
    /// Override for the default username validator pattern.
    #[serde(default)]
    pub username_pattern: Option<String>,
}

fn default_staleness_secs() -> u64 {
    60
}
fn default_registry_timeout_secs() -> u64 {
    10
}
fn default_sweep_secs() -> u64 {
    60
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            rate: RateLimitConfig::default(),
            sftp: ProtocolConfig::default(),
            davs: ProtocolConfig::default(),
            ftps: ProtocolConfig::default(),
            cache_staleness_secs: default_staleness_secs(),
            registry_timeout_secs: default_registry_timeout_secs(),
            sweep_interval_secs: default_sweep_secs(),
            max_sessions_per_principal: None,
            username_pattern: None,
        }
    }
}

impl GateConfig {
    pub fn from_json_file(path: &Path) -> GateResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| GateError::config(format!("read {}: {e}", path.display())))?;
        let cfg: GateConfig = serde_json::from_str(&raw)
            .map_err(|e| GateError::config(format!("parse {}: {e}", path.display())))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn protocol(&self, proto: Protocol) -> &ProtocolConfig {
        match proto {
            Protocol::Sftp => &self.sftp,
            Protocol::Davs => &self.davs,
            Protocol::Ftps => &self.ftps,
        }
    }

    pub fn cache_staleness(&self) -> Duration {
        Duration::from_secs(self.cache_staleness_secs)
    }

    pub fn registry_timeout(&self) -> Duration {
        Duration::from_secs(self.registry_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Startup-time sanity check. Zero thresholds would deny everything or
    /// let sweeps spin, so they are rejected here rather than surprising a
    /// connection handler later.
    pub fn validate(&self) -> GateResult<()> {
        let r = &self.rate;
        for (name, v) in [
            ("max_user_hits", r.max_user_hits),
            ("user_abuse_hits", r.user_abuse_hits),
            ("proto_abuse_hits", r.proto_abuse_hits),
            ("max_secret_hits", r.max_secret_hits),
        ] {
            if v == 0 {
                return Err(GateError::config(format!("rate.{name} must be positive")));
            }
        }
        for (name, v) in [
            ("rate.window_secs", r.window_secs),
            ("rate.bucket_retention_secs", r.bucket_retention_secs),
            ("registry_timeout_secs", self.registry_timeout_secs),
            ("sweep_interval_secs", self.sweep_interval_secs),
            ("sftp.idle_timeout_secs", self.sftp.idle_timeout_secs),
            ("davs.idle_timeout_secs", self.davs.idle_timeout_secs),
            ("ftps.idle_timeout_secs", self.ftps.idle_timeout_secs),
        ] {
            if v == 0 {
                return Err(GateError::config(format!("{name} must be positive")));
            }
        }
        for (name, v) in [
            ("rate.user_hits_window_secs", r.user_hits_window_secs),
            ("rate.user_abuse_window_secs", r.user_abuse_window_secs),
            ("rate.proto_abuse_window_secs", r.proto_abuse_window_secs),
            ("rate.secret_window_secs", r.secret_window_secs),
        ] {
            if v == Some(0) {
                return Err(GateError::config(format!(
                    "{name} must be positive when set"
                )));
            }
        }
        if let Some(0) = self.max_sessions_per_principal {
            return Err(GateError::config(
                "max_sessions_per_principal must be positive when set",
            ));
        }
        if let Some(pat) = &self.username_pattern {
            regex::Regex::new(pat)
                .map_err(|e| GateError::config(format!("username_pattern: {e}")))?;
        }
        Ok(())
    }
}
