//! The auth decision engine.
//! One `AccessGate` instance backs every protocol daemon of a site. Each
//! authentication attempt walks a fixed order: rate check, credential
//! check, two-factor check, policy check, session registration; the walk
//! stops at the first failure and every denial is still registered with the
//! rate limiter so repeated probing gets throttled whatever its reason.
//! State is explicitly constructed and injectable, never ambient, so tests
//! can run isolated gates side by side.

use std::net::IpAddr;
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::GateConfig;
use crate::error::{GateError, GateResult};
use crate::gate::login_map::LoginMap;
use crate::gate::principal::{Credential, PresentedCredential, Principal, Protocol};
use crate::gate::ratelimit::{secret_signature, RateKey, RateLimiter};
use crate::gate::sessions::{Session, SessionToken, SessionTracker};
use crate::gate::twofactor::TwoFactorGate;
use crate::policy::{valid_username, DaemonPolicy};
use crate::registry::Registry;

/// Terminal outcome of one authentication attempt. Distinguishable on
/// purpose: daemons close rate-limited connections outright, prompt for a
/// second factor on `DenyTwofactor`, and treat `DenyCredentials` as a
/// plain login failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Allow,
    DenyRateLimit,
    DenyCredentials,
    DenyTwofactor,
    DenyPolicy,
}

impl Outcome {
    pub fn allowed(&self) -> bool {
        matches!(self, Outcome::Allow)
    }
}

#[derive(Debug, Clone)]
pub struct Decision {
    pub outcome: Outcome,
    pub session: Option<SessionToken>,
}

impl Decision {
    fn deny(outcome: Outcome) -> Self {
        Self {
            outcome,
            session: None,
        }
    }
}

/// One authentication attempt as a daemon saw it on the wire.
#[derive(Debug, Clone)]
pub struct AuthRequest {
    pub client_addr: IpAddr,
    pub username: String,
    pub protocol: Protocol,
    pub credential: PresentedCredential,
    /// Initial path for filesystem-backed protocols, validated during the
    /// policy step when present.
    pub requested_path: Option<String>,
    /// Creation mode the client asked for on new files, validated against
    /// the policy's chmod rules when present.
    pub requested_mode: Option<u32>,
}

struct Sweeper {
    stop: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

pub struct AccessGate {
    config: GateConfig,
    login_map: LoginMap,
    ratelimit: Arc<RateLimiter>,
    sessions: Arc<SessionTracker>,
    twofactor: Arc<TwoFactorGate>,
    policy: Arc<dyn DaemonPolicy>,
    username_re: Option<Regex>,
    sweeper: Mutex<Option<Sweeper>>,
}

impl AccessGate {
    /// Validate the configuration, wire the components and start the
    /// background sweep task. Configuration problems are fatal here and
    /// can never surface at request time.
    pub fn new(
        config: GateConfig,
        registry: Arc<dyn Registry>,
        policy: Arc<dyn DaemonPolicy>,
    ) -> GateResult<Self> {
        config.validate()?;
        let username_re = match &config.username_pattern {
            Some(pat) => {
                Some(Regex::new(pat).map_err(|e| GateError::config(format!("username_pattern: {e}")))?)
            }
            None => None,
        };
        let ratelimit = Arc::new(RateLimiter::new(config.rate.clone()));
        let sessions = Arc::new(SessionTracker::new(&config));
        let twofactor = Arc::new(TwoFactorGate::new());
        let sweeper = spawn_sweeper(
            config.sweep_interval(),
            ratelimit.clone(),
            sessions.clone(),
            twofactor.clone(),
        )?;
        Ok(Self {
            login_map: LoginMap::new(&config, registry),
            config,
            ratelimit,
            sessions,
            twofactor,
            policy,
            username_re,
            sweeper: Mutex::new(Some(sweeper)),
        })
    }

    /// Stop the sweep task. Idempotent; also runs on drop.
    pub fn shutdown(&self) {
        if let Some(sweeper) = self.sweeper.lock().take() {
            let _ = sweeper.stop.send(());
            let _ = sweeper.handle.join();
            info!(target: "gridgate::engine", "sweeper stopped");
        }
    }

    /// One accept/reject decision per attempt, side effects included.
    pub fn authenticate(&self, req: &AuthRequest) -> Decision {
        let principal = Principal::new(req.username.clone(), req.protocol);
        let sig = secret_signature(req.credential.secret_material());
        let keys = RateKey::for_attempt(req.client_addr, &principal, sig);

        // 1. Rate check, before any credential work: once a client is
        // limited it learns nothing about which usernames exist.
        if let Some(breach) = self.ratelimit.first_breach(&keys) {
            let cause = GateError::RateLimited {
                kind: breach.kind().as_str(),
                key: breach.to_string(),
            };
            warn!(target: "gridgate::engine", %principal, addr = %req.client_addr,
                  error = %cause, "rate limited");
            self.ratelimit.register_hit(&keys, false, sig);
            return Decision::deny(Outcome::DenyRateLimit);
        }

        // 2. Credential check. Registry trouble fails closed.
        let entry = match self.login_map.lookup(&principal) {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                debug!(target: "gridgate::engine", %principal, "unknown principal");
                self.ratelimit.register_hit(&keys, false, sig);
                return Decision::deny(Outcome::DenyCredentials);
            }
            Err(e) => {
                warn!(target: "gridgate::engine", %principal, error = %e,
                      "credential lookup failed, denying");
                self.ratelimit.register_hit(&keys, false, sig);
                return Decision::deny(Outcome::DenyCredentials);
            }
        };
        if !entry.credentials.iter().any(|c| req.credential.matches(c)) {
            let cause = GateError::AuthMismatch(principal.username.clone());
            info!(target: "gridgate::engine", %principal, addr = %req.client_addr,
                  error = %cause, "credential mismatch");
            self.ratelimit.register_hit(&keys, false, sig);
            return Decision::deny(Outcome::DenyCredentials);
        }

        // 3. Two-factor, only where the site requires it for the protocol.
        if self.config.protocol(req.protocol).require_twofactor
            && !self.twofactor.check(&principal)
        {
            info!(target: "gridgate::engine", %principal,
                  "valid credentials but no second-factor grant");
            self.ratelimit.register_hit(&keys, false, sig);
            return Decision::deny(Outcome::DenyTwofactor);
        }

        // 4. Policy: username shape, requested path, session cap.
        if !valid_username(&req.username, self.username_re.as_ref()) {
            warn!(target: "gridgate::engine", %principal, "malformed username");
            self.ratelimit.register_hit(&keys, false, sig);
            return Decision::deny(Outcome::DenyPolicy);
        }
        if let Some(path) = &req.requested_path {
            if !self.policy.validate_path(&principal, path) {
                self.ratelimit.register_hit(&keys, false, sig);
                return Decision::deny(Outcome::DenyPolicy);
            }
        }
        if let Some(mode) = req.requested_mode {
            if !self.policy.acceptable_mode(mode, false) {
                warn!(target: "gridgate::engine", %principal, mode,
                      "unacceptable creation mode");
                self.ratelimit.register_hit(&keys, false, sig);
                return Decision::deny(Outcome::DenyPolicy);
            }
        }

        // 5. Session registration; the cap check runs serialized inside.
        match self.sessions.open_session(principal.clone(), req.client_addr) {
            Ok(session) => {
                self.ratelimit.register_hit(&keys, true, sig);
                info!(target: "gridgate::engine", %principal, addr = %req.client_addr,
                      session = %session.id, "allowed");
                Decision {
                    outcome: Outcome::Allow,
                    session: Some(session.token),
                }
            }
            Err(e) => {
                warn!(target: "gridgate::engine", %principal, error = %e,
                      "session registration refused");
                self.ratelimit.register_hit(&keys, false, sig);
                Decision::deny(Outcome::DenyPolicy)
            }
        }
    }

    pub fn heartbeat(&self, token: &str) -> bool {
        self.sessions.heartbeat(token)
    }

    pub fn logout(&self, token: &str) -> bool {
        self.sessions.close_session(token)
    }

    /// Deposit seam for the portal-side second-factor verifier.
    pub fn grant_twofactor(&self, principal: Principal, ttl: Duration) {
        self.twofactor.grant(principal, ttl);
    }

    pub fn revoke_twofactor(&self, principal: &Principal) -> bool {
        self.twofactor.revoke(principal)
    }

    /// Push credentials for a principal that became valid out of band.
    pub fn add_credentials(&self, principal: Principal, credentials: Vec<Credential>) {
        self.login_map.add(principal, credentials);
    }

    pub fn invalidate_credentials(&self, principal: &Principal) -> bool {
        self.login_map.invalidate(principal)
    }

    /// Full cache rebuild from the registry, for daemon startup.
    pub fn refresh_all_credentials(&self) -> GateResult<usize> {
        self.login_map.refresh_all()
    }

    pub fn list_active_sessions(&self, proto: Protocol) -> Vec<Session> {
        self.sessions.list_active(proto)
    }

    pub fn get_active(&self, principal: &Principal) -> Vec<Session> {
        self.sessions.get_active(principal)
    }

    /// Administrative force-logout of every live session on a protocol.
    pub fn force_expire(&self, proto: Protocol) -> usize {
        let live = self.sessions.list_active(proto);
        let mut closed = 0;
        for session in &live {
            if self.sessions.close_session(&session.token) {
                closed += 1;
            }
        }
        if closed > 0 {
            info!(target: "gridgate::engine", proto = %proto, closed, "force expired");
        }
        closed
    }

    /// One sweep pass over every expiring store; the background task calls
    /// this on its fixed interval.
    pub fn sweep_now(&self) -> (usize, usize, usize) {
        (
            self.ratelimit.expire_old(),
            self.sessions.close_expired(),
            self.twofactor.expire_old(),
        )
    }
}

impl Drop for AccessGate {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Fixed-interval sweep task: runs regardless of request load, stops on the
/// shutdown signal. Bounded blocking instead of polling loops.
fn spawn_sweeper(
    interval: Duration,
    ratelimit: Arc<RateLimiter>,
    sessions: Arc<SessionTracker>,
    twofactor: Arc<TwoFactorGate>,
) -> GateResult<Sweeper> {
    let (stop, rx) = mpsc::channel::<()>();
    let handle = std::thread::Builder::new()
        .name("gridgate-sweep".into())
        .spawn(move || loop {
            match rx.recv_timeout(interval) {
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    let buckets = ratelimit.expire_old();
                    let sessions_closed = sessions.close_expired();
                    let grants = twofactor.expire_old();
                    if buckets + sessions_closed + grants > 0 {
                        debug!(target: "gridgate::engine", buckets, sessions_closed,
                               grants, "sweep pass");
                    }
                }
                Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        })
        .map_err(|e| GateError::config(format!("spawn sweep thread: {e}")))?;
    Ok(Sweeper { stop, handle })
}
