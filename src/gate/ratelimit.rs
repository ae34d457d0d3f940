//! Fixed-window rate limiting for authentication attempts.
//! Four independent accounting kinds share one bucket store: per
//! address+user, per user across addresses, per address+protocol, and per
//! guessed-secret signature. Windows are fixed, not sliding: a bucket counts
//! hits since its window start and resets to zero on rollover, which bounds
//! memory and avoids per-hit timestamp lists at the cost of brief bursts
//! around window boundaries.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};
use xxhash_rust::xxh3::xxh3_64;

use crate::config::RateLimitConfig;
use crate::gate::principal::{Principal, Protocol};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateKind {
    UserHits,
    UserAbuse,
    ProtoAbuse,
    SecretGuess,
}

impl RateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateKind::UserHits => "user_hits",
            RateKind::UserAbuse => "user_abuse",
            RateKind::ProtoAbuse => "proto_abuse",
            RateKind::SecretGuess => "secret_guess",
        }
    }
}

/// Bucket key; the variant determines which threshold applies.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RateKey {
    AddrUser {
        addr: IpAddr,
        protocol: Protocol,
        username: String,
    },
    User {
        protocol: Protocol,
        username: String,
    },
    Addr {
        addr: IpAddr,
        protocol: Protocol,
    },
    Secret {
        signature: u64,
    },
}

impl RateKey {
    pub fn kind(&self) -> RateKind {
        match self {
            RateKey::AddrUser { .. } => RateKind::UserHits,
            RateKey::User { .. } => RateKind::UserAbuse,
            RateKey::Addr { .. } => RateKind::ProtoAbuse,
            RateKey::Secret { .. } => RateKind::SecretGuess,
        }
    }

    /// All keys touched by one attempt.
    pub fn for_attempt(addr: IpAddr, principal: &Principal, secret_sig: u64) -> Vec<RateKey> {
        vec![
            RateKey::AddrUser {
                addr,
                protocol: principal.protocol,
                username: principal.username.clone(),
            },
            RateKey::User {
                protocol: principal.protocol,
                username: principal.username.clone(),
            },
            RateKey::Addr {
                addr,
                protocol: principal.protocol,
            },
            RateKey::Secret {
                signature: secret_sig,
            },
        ]
    }
}

impl std::fmt::Display for RateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RateKey::AddrUser {
                addr,
                protocol,
                username,
            } => write!(f, "{addr}/{protocol}/{username}"),
            RateKey::User { protocol, username } => write!(f, "*/{protocol}/{username}"),
            RateKey::Addr { addr, protocol } => write!(f, "{addr}/{protocol}/*"),
            RateKey::Secret { signature } => write!(f, "secret/{signature:016x}"),
        }
    }
}

/// Signature of presented secret material fed into the guessing counter.
/// Only the hash ever enters limiter state, never the secret itself.
pub fn secret_signature(material: &str) -> u64 {
    xxh3_64(material.as_bytes())
}

#[derive(Debug)]
struct Bucket {
    count: u32,
    window_start: Instant,
    last_touch: Instant,
    /// Signatures already counted this window; identical retries of the
    /// same wrong secret count once so stubborn clients are not mistaken
    /// for dictionary attacks.
    seen_secrets: HashSet<u64>,
}

impl Bucket {
    fn new(now: Instant) -> Self {
        Self {
            count: 0,
            window_start: now,
            last_touch: now,
            seen_secrets: HashSet::new(),
        }
    }

    fn roll_if_elapsed(&mut self, now: Instant, window: Duration) {
        if now.duration_since(self.window_start) >= window {
            self.count = 0;
            self.window_start = now;
            self.seen_secrets.clear();
        }
    }

    /// Hits visible in the current window without mutating the bucket.
    fn current_count(&self, now: Instant, window: Duration) -> u32 {
        if now.duration_since(self.window_start) >= window {
            0
        } else {
            self.count
        }
    }
}

pub struct RateLimiter {
    cfg: RateLimitConfig,
    buckets: RwLock<HashMap<RateKey, Arc<Mutex<Bucket>>>>,
}

impl RateLimiter {
    pub fn new(cfg: RateLimitConfig) -> Self {
        Self {
            cfg,
            buckets: RwLock::new(HashMap::new()),
        }
    }

    fn limit_for(&self, kind: RateKind) -> u32 {
        match kind {
            RateKind::UserHits => self.cfg.max_user_hits,
            RateKind::UserAbuse => self.cfg.user_abuse_hits,
            RateKind::ProtoAbuse => self.cfg.proto_abuse_hits,
            RateKind::SecretGuess => self.cfg.max_secret_hits,
        }
    }

    /// Window length for one kind; falls back to the shared window.
    fn window_for(&self, kind: RateKind) -> Duration {
        let secs = match kind {
            RateKind::UserHits => self.cfg.user_hits_window_secs,
            RateKind::UserAbuse => self.cfg.user_abuse_window_secs,
            RateKind::ProtoAbuse => self.cfg.proto_abuse_window_secs,
            RateKind::SecretGuess => self.cfg.secret_window_secs,
        };
        secs.map(Duration::from_secs)
            .unwrap_or_else(|| self.cfg.window())
    }

    /// Pure read: answers from current bucket state, never mutates, so the
    /// check stays cheap enough to run before any credential work.
    pub fn hit_allowed(&self, key: &RateKey) -> bool {
        let now = Instant::now();
        let bucket = {
            let map = self.buckets.read();
            map.get(key).cloned()
        };
        match bucket {
            None => true,
            Some(b) => {
                let b = b.lock();
                b.current_count(now, self.window_for(key.kind())) < self.limit_for(key.kind())
            }
        }
    }

    /// First key (if any) that is already over its threshold.
    pub fn first_breach(&self, keys: &[RateKey]) -> Option<RateKey> {
        keys.iter().find(|k| !self.hit_allowed(k)).cloned()
    }

    /// Record the known outcome of an attempt across all its keys. Failures
    /// increment; successes reset the per-address-per-user bucket when the
    /// site policy asks for it.
    pub fn register_hit(&self, keys: &[RateKey], success: bool, secret_sig: u64) {
        let now = Instant::now();
        for key in keys {
            if success {
                // Successes never create buckets; they only clear an
                // existing per-address-per-user history when configured.
                if self.cfg.reset_on_success && key.kind() == RateKind::UserHits {
                    let existing = self.buckets.read().get(key).cloned();
                    if let Some(bucket) = existing {
                        let mut b = bucket.lock();
                        b.count = 0;
                        b.window_start = now;
                        b.seen_secrets.clear();
                        b.last_touch = now;
                    }
                }
                continue;
            }
            let bucket = self.bucket_for(key, now);
            let mut b = bucket.lock();
            b.last_touch = now;
            b.roll_if_elapsed(now, self.window_for(key.kind()));
            let dedup = matches!(key.kind(), RateKind::UserHits | RateKind::UserAbuse);
            if dedup && !b.seen_secrets.insert(secret_sig) {
                continue;
            }
            b.count += 1;
            if b.count >= self.limit_for(key.kind()) {
                info!(target: "gridgate::ratelimit", key = %key,
                      kind = key.kind().as_str(), hits = b.count,
                      "threshold reached");
            }
        }
    }

    /// Drop buckets untouched for longer than the retention bound; one-off
    /// client addresses must not grow the store forever.
    pub fn expire_old(&self) -> usize {
        let now = Instant::now();
        let retention = self.cfg.bucket_retention();
        let mut map = self.buckets.write();
        let before = map.len();
        map.retain(|_, b| now.duration_since(b.lock().last_touch) < retention);
        let dropped = before - map.len();
        if dropped > 0 {
            debug!(target: "gridgate::ratelimit", dropped, "expired stale buckets");
        }
        dropped
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.read().len()
    }

    fn bucket_for(&self, key: &RateKey, now: Instant) -> Arc<Mutex<Bucket>> {
        if let Some(b) = self.buckets.read().get(key) {
            return b.clone();
        }
        let mut map = self.buckets.write();
        map.entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(Bucket::new(now))))
            .clone()
    }
}
