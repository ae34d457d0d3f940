//! Operator smoke test for the access-control core.
//! Builds a gate over a throwaway file registry, walks the rate limiter to
//! its threshold and finishes with one full allow/heartbeat/logout round
//! trip. Useful when tuning site thresholds: run with RUST_LOG=debug to see
//! every decision the gate takes.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use argon2::{Argon2, PasswordHasher};
use password_hash::SaltString;
use tracing::info;

use gridgate::gate::AccessGate;
use gridgate::policy::FsPolicy;
use gridgate::registry::{FileRegistry, AUTH_PASSWORDS_FILE};
use gridgate::{AuthRequest, GateConfig, PresentedCredential, Principal, Protocol};

const TEST_USER: &str = "mylocaluser";
const TEST_PASSWORD: &str = "T3stp4ss";

fn main() -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = match std::env::args().nth(1) {
        Some(path) => GateConfig::from_json_file(std::path::Path::new(&path))
            .with_context(|| format!("loading {path}"))?,
        None => GateConfig::default(),
    };
    // Keep the walk short for interactive runs.
    config.rate.max_user_hits = config.rate.max_user_hits.min(5);

    let root = scratch_registry_root()?;
    seed_user(&root, TEST_USER, TEST_PASSWORD)?;

    let registry = Arc::new(FileRegistry::new(root.clone()));
    let policy = Arc::new(FsPolicy::new(root.clone()));
    let max_hits = config.rate.max_user_hits;
    let gate = AccessGate::new(config, registry, policy)?;
    gate.refresh_all_credentials()?;

    let addr = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 42));
    info!("emulating rate limit with {max_hits} bad passwords");
    for n in 0..max_hits {
        let decision = gate.authenticate(&AuthRequest {
            client_addr: addr,
            username: TEST_USER.into(),
            protocol: Protocol::Davs,
            credential: PresentedCredential::Password(format!("wrong-{n}")),
            requested_path: None,
            requested_mode: None,
        });
        info!(attempt = n + 1, outcome = ?decision.outcome, "bad password");
    }
    let limited = gate.authenticate(&AuthRequest {
        client_addr: addr,
        username: TEST_USER.into(),
        protocol: Protocol::Davs,
        credential: PresentedCredential::Password(TEST_PASSWORD.into()),
        requested_path: None,
        requested_mode: None,
    });
    info!(outcome = ?limited.outcome, "correct password while limited");
    if limited.outcome != gridgate::Outcome::DenyRateLimit {
        bail!("expected a rate-limit denial, got {:?}", limited.outcome);
    }

    // Another address is unaffected; full round trip from there.
    let other = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 43));
    let decision = gate.authenticate(&AuthRequest {
        client_addr: other,
        username: TEST_USER.into(),
        protocol: Protocol::Davs,
        credential: PresentedCredential::Password(TEST_PASSWORD.into()),
        requested_path: Some("welcome.txt".into()),
        requested_mode: Some(0o644),
    });
    info!(outcome = ?decision.outcome, "login from fresh address");
    let Some(token) = decision.session else {
        bail!("expected an allow with session token, got {:?}", decision.outcome);
    };
    if !gate.heartbeat(&token) {
        bail!("heartbeat on live session failed");
    }
    let active = gate.list_active_sessions(Protocol::Davs);
    info!(active = active.len(), "active davs sessions");
    if !gate.logout(&token) {
        bail!("logout failed");
    }
    gate.grant_twofactor(
        Principal::new(TEST_USER, Protocol::Davs),
        Duration::from_secs(60),
    );
    let (buckets, sessions, grants) = gate.sweep_now();
    info!(buckets, sessions, grants, "manual sweep");
    gate.shutdown();

    std::fs::remove_dir_all(&root).ok();
    info!("smoke test passed");
    Ok(())
}

fn scratch_registry_root() -> Result<PathBuf> {
    let root = std::env::temp_dir().join(format!("gridgate-smoke-{}", std::process::id()));
    std::fs::create_dir_all(&root)?;
    Ok(root)
}

fn seed_user(root: &std::path::Path, username: &str, password: &str) -> Result<()> {
    let mut salt_bytes = [0u8; 16];
    getrandom::getrandom(&mut salt_bytes).context("salt")?;
    let salt = SaltString::encode_b64(&salt_bytes).map_err(|e| anyhow::anyhow!(e))?;
    let phc = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!(e))?
        .to_string();
    let auth_dir = root.join(username).join(Protocol::Davs.auth_dir());
    std::fs::create_dir_all(&auth_dir)?;
    std::fs::write(auth_dir.join(AUTH_PASSWORDS_FILE), phc)?;
    Ok(())
}
