//! End-to-end decision-engine tests: the full walk from rate check to
//! session registration, with a counting stub standing in for the slow
//! user/share registry.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use argon2::{Argon2, PasswordHasher};
use password_hash::SaltString;

use gridgate::gate::AccessGate;
use gridgate::gate::Credential;
use gridgate::policy::{FsPolicy, OpenPolicy};
use gridgate::registry::Registry;
use gridgate::{
    AuthRequest, GateConfig, GateResult, Outcome, PresentedCredential, Principal, Protocol,
};

fn phc_for(password: &str) -> String {
    let mut salt_bytes = [0u8; 16];
    getrandom::getrandom(&mut salt_bytes).expect("salt");
    let salt = SaltString::encode_b64(&salt_bytes).expect("salt b64");
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .unwrap()
        .to_string()
}

/// Stub registry that knows one user and counts resolve calls, so tests
/// can prove when the engine did or did not reach for credentials.
struct CountingRegistry {
    username: String,
    credentials: Vec<Credential>,
    resolves: AtomicUsize,
    delay: Duration,
}

impl CountingRegistry {
    fn for_user(username: &str, credentials: Vec<Credential>) -> Arc<Self> {
        Arc::new(Self {
            username: username.to_string(),
            credentials,
            resolves: AtomicUsize::new(0),
            delay: Duration::ZERO,
        })
    }

    fn resolve_count(&self) -> usize {
        self.resolves.load(Ordering::SeqCst)
    }
}

impl Registry for CountingRegistry {
    fn resolve(&self, principal: &Principal) -> GateResult<Option<Vec<Credential>>> {
        self.resolves.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        if principal.username == self.username {
            Ok(Some(self.credentials.clone()))
        } else {
            Ok(None)
        }
    }

    fn scan_usernames(&self, _protocol: Protocol) -> GateResult<Vec<String>> {
        Ok(vec![self.username.clone()])
    }
}

fn base_config() -> GateConfig {
    let mut cfg = GateConfig::default();
    // Long sweep interval: tests drive sweeps explicitly.
    cfg.sweep_interval_secs = 3600;
    cfg
}

fn addr(last: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(10, 7, 0, last))
}

fn password_attempt(user: &str, from: IpAddr, password: &str) -> AuthRequest {
    AuthRequest {
        client_addr: from,
        username: user.into(),
        protocol: Protocol::Davs,
        credential: PresentedCredential::Password(password.into()),
        requested_path: None,
        requested_mode: None,
    }
}

#[test]
fn correct_credentials_allow_with_one_session() -> Result<()> {
    let registry =
        CountingRegistry::for_user("alice", vec![Credential::PasswordHash(phc_for("s3cr3t!"))]);
    let gate = AccessGate::new(base_config(), registry, Arc::new(OpenPolicy))?;

    let decision = gate.authenticate(&password_attempt("alice", addr(1), "s3cr3t!"));
    assert_eq!(decision.outcome, Outcome::Allow);
    let token = decision.session.expect("session token on allow");

    let active = gate.get_active(&Principal::new("alice", Protocol::Davs));
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].token, token);
    gate.shutdown();
    Ok(())
}

#[test]
fn rate_limited_attempts_never_reach_the_registry() -> Result<()> {
    let registry =
        CountingRegistry::for_user("alice", vec![Credential::PasswordHash(phc_for("s3cr3t!"))]);
    let mut cfg = base_config();
    cfg.rate.max_user_hits = 10;
    cfg.rate.user_abuse_hits = 100;
    cfg.rate.proto_abuse_hits = 100;
    cfg.rate.max_secret_hits = 100;
    // Cache disabled: every credential check consults the registry, so the
    // resolve count mirrors how often credentials were actually inspected.
    cfg.cache_staleness_secs = 0;
    let gate = AccessGate::new(cfg, registry.clone(), Arc::new(OpenPolicy))?;

    for n in 0..10 {
        let d = gate.authenticate(&password_attempt("alice", addr(2), &format!("wrong-{n}")));
        assert_eq!(d.outcome, Outcome::DenyCredentials, "attempt {n}");
    }
    let eleventh = gate.authenticate(&password_attempt("alice", addr(2), "wrong-10"));
    assert_eq!(eleventh.outcome, Outcome::DenyRateLimit);
    assert_eq!(
        registry.resolve_count(),
        10,
        "the 11th attempt must not perform a credential lookup"
    );
    gate.shutdown();
    Ok(())
}

#[test]
fn missing_twofactor_grant_denies_without_session() -> Result<()> {
    let registry =
        CountingRegistry::for_user("alice", vec![Credential::PasswordHash(phc_for("s3cr3t!"))]);
    let mut cfg = base_config();
    cfg.davs.require_twofactor = true;
    let gate = AccessGate::new(cfg, registry, Arc::new(OpenPolicy))?;
    let alice = Principal::new("alice", Protocol::Davs);

    let denied = gate.authenticate(&password_attempt("alice", addr(3), "s3cr3t!"));
    assert_eq!(denied.outcome, Outcome::DenyTwofactor);
    assert!(denied.session.is_none());
    assert!(gate.get_active(&alice).is_empty(), "no session on denial");

    // The portal deposits a grant; the same attempt now passes.
    gate.grant_twofactor(alice.clone(), Duration::from_secs(60));
    let allowed = gate.authenticate(&password_attempt("alice", addr(3), "s3cr3t!"));
    assert_eq!(allowed.outcome, Outcome::Allow);
    assert_eq!(gate.get_active(&alice).len(), 1);
    gate.shutdown();
    Ok(())
}

#[test]
fn login_roundtrip_leaves_no_session_and_no_counters() -> Result<()> {
    let registry =
        CountingRegistry::for_user("alice", vec![Credential::PasswordHash(phc_for("s3cr3t!"))]);
    let mut cfg = base_config();
    cfg.rate.max_user_hits = 3;
    cfg.rate.reset_on_success = false;
    let gate = AccessGate::new(cfg, registry, Arc::new(OpenPolicy))?;
    let alice = Principal::new("alice", Protocol::Davs);

    // Two failures, one short of the threshold.
    for n in 0..2 {
        gate.authenticate(&password_attempt("alice", addr(4), &format!("wrong-{n}")));
    }
    // Successful round trip in between.
    let d = gate.authenticate(&password_attempt("alice", addr(4), "s3cr3t!"));
    let token = d.session.expect("allow");
    assert!(gate.logout(&token));
    assert!(gate.get_active(&alice).is_empty());
    assert!(!gate.logout(&token), "second logout is a no-op");

    // The success/close pair must not have added failure counts: exactly
    // one more failure fits before the threshold trips.
    let d = gate.authenticate(&password_attempt("alice", addr(4), "wrong-2"));
    assert_eq!(d.outcome, Outcome::DenyCredentials);
    let d = gate.authenticate(&password_attempt("alice", addr(4), "wrong-3"));
    assert_eq!(d.outcome, Outcome::DenyRateLimit);
    gate.shutdown();
    Ok(())
}

#[test]
fn unknown_principal_is_a_credential_denial() -> Result<()> {
    let registry = CountingRegistry::for_user("alice", vec![]);
    let gate = AccessGate::new(base_config(), registry, Arc::new(OpenPolicy))?;
    let d = gate.authenticate(&password_attempt("mallory", addr(5), "whatever"));
    assert_eq!(d.outcome, Outcome::DenyCredentials);
    gate.shutdown();
    Ok(())
}

#[test]
fn stalled_registry_fails_closed_as_credential_denial() -> Result<()> {
    let registry = Arc::new(CountingRegistry {
        username: "alice".into(),
        credentials: vec![Credential::PasswordHash(phc_for("s3cr3t!"))],
        resolves: AtomicUsize::new(0),
        delay: Duration::from_secs(3),
    });
    let mut cfg = base_config();
    cfg.registry_timeout_secs = 1;
    let gate = AccessGate::new(cfg, registry, Arc::new(OpenPolicy))?;
    let d = gate.authenticate(&password_attempt("alice", addr(6), "s3cr3t!"));
    assert_eq!(d.outcome, Outcome::DenyCredentials);
    gate.shutdown();
    Ok(())
}

#[test]
fn bad_requested_path_is_a_policy_denial() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let registry =
        CountingRegistry::for_user("alice", vec![Credential::PasswordHash(phc_for("s3cr3t!"))]);
    let policy = Arc::new(FsPolicy::new(tmp.path()));
    let gate = AccessGate::new(base_config(), registry, policy)?;

    let mut req = password_attempt("alice", addr(7), "s3cr3t!");
    req.requested_path = Some("../bob/secret".into());
    let d = gate.authenticate(&req);
    assert_eq!(d.outcome, Outcome::DenyPolicy);
    assert!(gate
        .get_active(&Principal::new("alice", Protocol::Davs))
        .is_empty());

    // Same credentials with a sane path go through.
    let mut req = password_attempt("alice", addr(7), "s3cr3t!");
    req.requested_path = Some("data/results.txt".into());
    assert_eq!(gate.authenticate(&req).outcome, Outcome::Allow);
    gate.shutdown();
    Ok(())
}

#[test]
fn unacceptable_creation_mode_is_a_policy_denial() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let registry =
        CountingRegistry::for_user("alice", vec![Credential::PasswordHash(phc_for("s3cr3t!"))]);
    let gate = AccessGate::new(base_config(), registry, Arc::new(FsPolicy::new(tmp.path())))?;

    let mut req = password_attempt("alice", addr(11), "s3cr3t!");
    req.requested_mode = Some(0o4644); // suid
    assert_eq!(gate.authenticate(&req).outcome, Outcome::DenyPolicy);

    let mut req = password_attempt("alice", addr(11), "s3cr3t!");
    req.requested_mode = Some(0o644);
    assert_eq!(gate.authenticate(&req).outcome, Outcome::Allow);
    gate.shutdown();
    Ok(())
}

#[test]
fn malformed_username_is_a_policy_denial() -> Result<()> {
    let registry =
        CountingRegistry::for_user("bad/name", vec![Credential::SharedSecret("tok".into())]);
    let gate = AccessGate::new(base_config(), registry, Arc::new(OpenPolicy))?;
    let req = AuthRequest {
        client_addr: addr(8),
        username: "bad/name".into(),
        protocol: Protocol::Ftps,
        credential: PresentedCredential::SharedSecret("tok".into()),
        requested_path: None,
        requested_mode: None,
    };
    assert_eq!(gate.authenticate(&req).outcome, Outcome::DenyPolicy);
    gate.shutdown();
    Ok(())
}

#[test]
fn session_cap_breach_is_a_policy_denial() -> Result<()> {
    let registry =
        CountingRegistry::for_user("alice", vec![Credential::PasswordHash(phc_for("s3cr3t!"))]);
    let mut cfg = base_config();
    cfg.max_sessions_per_principal = Some(2);
    let gate = AccessGate::new(cfg, registry, Arc::new(OpenPolicy))?;

    for _ in 0..2 {
        let d = gate.authenticate(&password_attempt("alice", addr(9), "s3cr3t!"));
        assert_eq!(d.outcome, Outcome::Allow);
    }
    let third = gate.authenticate(&password_attempt("alice", addr(9), "s3cr3t!"));
    assert_eq!(third.outcome, Outcome::DenyPolicy);
    assert_eq!(
        gate.get_active(&Principal::new("alice", Protocol::Davs)).len(),
        2
    );
    gate.shutdown();
    Ok(())
}

#[test]
fn admin_listing_and_force_expire() -> Result<()> {
    let registry = CountingRegistry::for_user(
        "share-7f3a",
        vec![Credential::SharedSecret("sharetoken".into())],
    );
    let gate = AccessGate::new(base_config(), registry, Arc::new(OpenPolicy))?;
    for n in 0..3 {
        let d = gate.authenticate(&AuthRequest {
            client_addr: addr(10 + n),
            username: "share-7f3a".into(),
            protocol: Protocol::Ftps,
            credential: PresentedCredential::SharedSecret("sharetoken".into()),
            requested_path: None,
            requested_mode: None,
        });
        assert_eq!(d.outcome, Outcome::Allow);
    }
    assert_eq!(gate.list_active_sessions(Protocol::Ftps).len(), 3);
    assert!(gate.list_active_sessions(Protocol::Davs).is_empty());
    assert_eq!(gate.force_expire(Protocol::Ftps), 3);
    assert!(gate.list_active_sessions(Protocol::Ftps).is_empty());
    gate.shutdown();
    Ok(())
}

#[test]
fn heartbeat_keeps_session_alive_across_sweeps() -> Result<()> {
    let registry =
        CountingRegistry::for_user("alice", vec![Credential::PasswordHash(phc_for("s3cr3t!"))]);
    let mut cfg = base_config();
    cfg.davs.idle_timeout_secs = 1;
    let gate = AccessGate::new(cfg, registry, Arc::new(OpenPolicy))?;
    let d = gate.authenticate(&password_attempt("alice", addr(20), "s3cr3t!"));
    let token = d.session.expect("allow");

    std::thread::sleep(Duration::from_millis(600));
    assert!(gate.heartbeat(&token));
    std::thread::sleep(Duration::from_millis(600));
    let (_, closed, _) = gate.sweep_now();
    assert_eq!(closed, 0, "heartbeat moved the idle deadline");

    std::thread::sleep(Duration::from_millis(1100));
    let (_, closed, _) = gate.sweep_now();
    assert_eq!(closed, 1, "idle session removed by sweep");
    assert!(!gate.heartbeat(&token), "expired token no longer beats");
    gate.shutdown();
    Ok(())
}

#[test]
fn pushed_share_credentials_work_without_registry_scan() -> Result<()> {
    let registry = CountingRegistry::for_user("alice", vec![]);
    let gate = AccessGate::new(base_config(), registry.clone(), Arc::new(OpenPolicy))?;
    let share = Principal::new("share-new", Protocol::Davs);
    gate.add_credentials(share.clone(), vec![Credential::SharedSecret("tok".into())]);

    let d = gate.authenticate(&AuthRequest {
        client_addr: addr(30),
        username: "share-new".into(),
        protocol: Protocol::Davs,
        credential: PresentedCredential::SharedSecret("tok".into()),
        requested_path: None,
        requested_mode: None,
    });
    assert_eq!(d.outcome, Outcome::Allow);
    assert_eq!(registry.resolve_count(), 0, "push path avoids the registry");

    assert!(gate.invalidate_credentials(&share));
    gate.shutdown();
    Ok(())
}
