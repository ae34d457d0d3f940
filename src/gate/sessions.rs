//! Registry of currently open authenticated sessions per protocol.
//! All mutations of one principal's session set run under that principal's
//! own mutex, so cap checks and creation can never interleave; readers get
//! cloned snapshots. Tokens are opaque 256-bit values the daemons carry for
//! heartbeat/logout calls.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::GateConfig;
use crate::error::{GateError, GateResult};
use crate::gate::principal::{Principal, Protocol};

pub type SessionToken = String;

fn gen_token() -> GateResult<SessionToken> {
    // 256-bit random token, base64url without padding
    let mut buf = [0u8; 32];
    getrandom::getrandom(&mut buf)
        .map_err(|e| GateError::Internal(format!("session token entropy: {e}")))?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(buf))
}

#[derive(Debug, Clone)]
pub struct Session {
    pub id: Uuid,
    pub token: SessionToken,
    pub principal: Principal,
    pub client_addr: IpAddr,
    pub opened_at: DateTime<Utc>,
    opened: Instant,
    last_activity: Instant,
}

impl Session {
    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    pub fn age(&self) -> Duration {
        self.opened.elapsed()
    }

    fn expired(&self, idle_timeout: Duration, now: Instant) -> bool {
        now.duration_since(self.last_activity) >= idle_timeout
    }
}

pub struct SessionTracker {
    slots: RwLock<HashMap<Principal, Arc<Mutex<Vec<Session>>>>>,
    token_index: RwLock<HashMap<SessionToken, Principal>>,
    idle_timeouts: [Duration; 3],
    max_per_principal: Option<usize>,
}

impl SessionTracker {
    pub fn new(config: &GateConfig) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            token_index: RwLock::new(HashMap::new()),
            idle_timeouts: [
                config.sftp.idle_timeout(),
                config.davs.idle_timeout(),
                config.ftps.idle_timeout(),
            ],
            max_per_principal: config.max_sessions_per_principal,
        }
    }

    fn idle_timeout(&self, proto: Protocol) -> Duration {
        match proto {
            Protocol::Sftp => self.idle_timeouts[0],
            Protocol::Davs => self.idle_timeouts[1],
            Protocol::Ftps => self.idle_timeouts[2],
        }
    }

    fn slot(&self, principal: &Principal) -> Arc<Mutex<Vec<Session>>> {
        if let Some(s) = self.slots.read().get(principal) {
            return s.clone();
        }
        let mut map = self.slots.write();
        map.entry(principal.clone())
            .or_insert_with(|| Arc::new(Mutex::new(Vec::new())))
            .clone()
    }

    /// Create a session for an authenticated principal. Expired sessions in
    /// the same slot are swept first so stale connections never consume the
    /// cap; a breached cap is a policy violation.
    pub fn open_session(&self, principal: Principal, client_addr: IpAddr) -> GateResult<Session> {
        loop {
            let slot = self.slot(&principal);
            let mut sessions = slot.lock();
            // The empty-slot sweep can drop this Arc from the map between
            // fetching and locking it; a push into a detached slot would be
            // invisible to lookups, so re-check membership and retry.
            let mapped = self
                .slots
                .read()
                .get(&principal)
                .is_some_and(|s| Arc::ptr_eq(s, &slot));
            if !mapped {
                continue;
            }
            let now = Instant::now();
            let idle = self.idle_timeout(principal.protocol);
            self.prune_slot(&mut sessions, idle, now);
            if let Some(cap) = self.max_per_principal {
                if sessions.len() >= cap {
                    return Err(GateError::policy(format!(
                        "session cap {cap} reached for {principal}"
                    )));
                }
            }
            let session = Session {
                id: Uuid::new_v4(),
                token: gen_token()?,
                principal: principal.clone(),
                client_addr,
                opened_at: Utc::now(),
                opened: now,
                last_activity: now,
            };
            sessions.push(session.clone());
            self.token_index
                .write()
                .insert(session.token.clone(), principal.clone());
            info!(target: "gridgate::sessions", %principal, %client_addr,
                  session = %session.id, "opened session");
            return Ok(session);
        }
    }

    /// Explicit close from the daemon. Returns false for unknown tokens,
    /// including sessions already removed by an expiry sweep.
    pub fn close_session(&self, token: &str) -> bool {
        let Some(principal) = self.token_index.read().get(token).cloned() else {
            return false;
        };
        let slot = self.slot(&principal);
        let mut sessions = slot.lock();
        let before = sessions.len();
        sessions.retain(|s| s.token != token);
        let removed = sessions.len() < before;
        if removed {
            self.token_index.write().remove(token);
            debug!(target: "gridgate::sessions", %principal, "closed session");
        }
        removed
    }

    /// Refresh last-activity; pushes the idle deadline forward.
    pub fn heartbeat(&self, token: &str) -> bool {
        let Some(principal) = self.token_index.read().get(token).cloned() else {
            return false;
        };
        let slot = self.slot(&principal);
        let mut sessions = slot.lock();
        match sessions.iter_mut().find(|s| s.token == token) {
            Some(s) => {
                s.last_activity = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Snapshot of the principal's live sessions, expired ones excluded.
    pub fn get_active(&self, principal: &Principal) -> Vec<Session> {
        let Some(slot) = self.slots.read().get(principal).cloned() else {
            return Vec::new();
        };
        let now = Instant::now();
        let idle = self.idle_timeout(principal.protocol);
        let active: Vec<Session> = slot
            .lock()
            .iter()
            .filter(|s| !s.expired(idle, now))
            .cloned()
            .collect();
        active
    }

    /// Administrative listing across all principals on one protocol.
    pub fn list_active(&self, proto: Protocol) -> Vec<Session> {
        let slots: Vec<_> = self
            .slots
            .read()
            .iter()
            .filter(|(p, _)| p.protocol == proto)
            .map(|(_, s)| s.clone())
            .collect();
        let now = Instant::now();
        let idle = self.idle_timeout(proto);
        let mut out = Vec::new();
        for slot in slots {
            out.extend(slot.lock().iter().filter(|s| !s.expired(idle, now)).cloned());
        }
        out
    }

    /// Sweep sessions past their idle deadline. Called on the fixed sweep
    /// interval and on demand before capacity-sensitive operations.
    pub fn close_expired(&self) -> usize {
        let slots: Vec<_> = self
            .slots
            .read()
            .iter()
            .map(|(p, s)| (p.clone(), s.clone()))
            .collect();
        let now = Instant::now();
        let mut removed = 0;
        for (principal, slot) in slots {
            let idle = self.idle_timeout(principal.protocol);
            let mut sessions = slot.lock();
            removed += self.prune_slot(&mut sessions, idle, now);
        }
        if removed > 0 {
            info!(target: "gridgate::sessions", removed, "expired idle sessions");
        }
        // Drop empty slots so one-off principals do not accumulate. Busy
        // slots are skipped, not waited on: an opener may hold the slot
        // lock while it re-checks membership against this map.
        self.slots
            .write()
            .retain(|_, s| s.try_lock().map_or(true, |g| !g.is_empty()));
        removed
    }

    pub fn active_count(&self, proto: Protocol) -> usize {
        self.list_active(proto).len()
    }

    fn prune_slot(&self, sessions: &mut Vec<Session>, idle: Duration, now: Instant) -> usize {
        let mut dropped = 0;
        sessions.retain(|s| {
            if s.expired(idle, now) {
                self.token_index.write().remove(&s.token);
                dropped += 1;
                false
            } else {
                true
            }
        });
        dropped
    }
}
