//! Second-factor grant tracking.
//! The challenge itself happens out of band through the portal; a verified
//! challenge deposits a time-bounded grant here. `check` only answers
//! whether a non-expired grant exists right now; an expired grant is
//! indistinguishable from an absent one.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::gate::principal::Principal;

#[derive(Debug, Clone, Copy)]
struct Grant {
    granted_at: Instant,
    expires_at: Instant,
}

impl Grant {
    /// Valid strictly before the expiry instant; at the instant itself the
    /// grant is already gone.
    fn valid_at(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

#[derive(Default)]
pub struct TwoFactorGate {
    grants: RwLock<HashMap<Principal, Grant>>,
}

impl TwoFactorGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deposit a grant after an out-of-band verification. A fresh grant
    /// replaces any older one for the same principal.
    pub fn grant(&self, principal: Principal, ttl: Duration) {
        let now = Instant::now();
        let grant = Grant {
            granted_at: now,
            expires_at: now + ttl,
        };
        info!(target: "gridgate::twofactor", %principal, ttl_secs = ttl.as_secs(),
              "second factor grant deposited");
        self.grants.write().insert(principal, grant);
    }

    pub fn check(&self, principal: &Principal) -> bool {
        let now = Instant::now();
        match self.grants.read().get(principal) {
            Some(g) => g.valid_at(now),
            None => false,
        }
    }

    /// How long the current grant remains valid, if any.
    pub fn remaining(&self, principal: &Principal) -> Option<Duration> {
        let now = Instant::now();
        self.grants
            .read()
            .get(principal)
            .filter(|g| g.valid_at(now))
            .map(|g| g.expires_at - now)
    }

    /// Age of the current valid grant, for audit logging by daemons.
    pub fn granted_ago(&self, principal: &Principal) -> Option<Duration> {
        let now = Instant::now();
        self.grants
            .read()
            .get(principal)
            .filter(|g| g.valid_at(now))
            .map(|g| now - g.granted_at)
    }

    pub fn revoke(&self, principal: &Principal) -> bool {
        self.grants.write().remove(principal).is_some()
    }

    /// Sweep expired grants so the map does not grow with one-off logins.
    pub fn expire_old(&self) -> usize {
        let now = Instant::now();
        let mut grants = self.grants.write();
        let before = grants.len();
        grants.retain(|_, g| g.valid_at(now));
        let dropped = before - grants.len();
        if dropped > 0 {
            debug!(target: "gridgate::twofactor", dropped, "expired grants");
        }
        dropped
    }

    pub fn grant_count(&self) -> usize {
        self.grants.read().len()
    }
}
