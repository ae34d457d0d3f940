//! Credential cache (login map).
//! Per-principal cache of the currently valid credential forms, refreshed
//! from the authoritative registry on staleness or explicit notification.
//! Entries are immutable once published: a refresh builds a fresh
//! `Arc<CredentialEntry>` and swaps it in atomically, so readers never see
//! a half-updated entry. Concurrent refreshes for one principal collapse to
//! a single registry read; the registry call itself runs on a helper thread
//! bounded by a timeout so a stalled registry fails closed instead of
//! hanging the connection.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::GateConfig;
use crate::error::{GateError, GateResult};
use crate::gate::principal::{Credential, Principal, Protocol};
use crate::registry::Registry;

#[derive(Debug)]
pub struct CredentialEntry {
    pub principal: Principal,
    pub credentials: Vec<Credential>,
    /// Source-of-truth version marker; strictly increasing per publish.
    pub version: u64,
    refreshed: Instant,
}

impl CredentialEntry {
    pub fn age(&self) -> Duration {
        self.refreshed.elapsed()
    }
}

/// Result of one collapsed refresh, shared with every waiting caller.
enum FlightOutcome {
    Entry(Arc<CredentialEntry>),
    NotFound,
    Failed(String),
}

struct RefreshFlight {
    outcome: Mutex<Option<FlightOutcome>>,
    done: Condvar,
}

pub struct LoginMap {
    registry: Arc<dyn Registry>,
    staleness: Duration,
    registry_timeout: Duration,
    entries: RwLock<HashMap<Principal, Arc<CredentialEntry>>>,
    inflight: Mutex<HashMap<Principal, Arc<RefreshFlight>>>,
    version: AtomicU64,
}

impl LoginMap {
    pub fn new(config: &GateConfig, registry: Arc<dyn Registry>) -> Self {
        Self {
            registry,
            staleness: config.cache_staleness(),
            registry_timeout: config.registry_timeout(),
            entries: RwLock::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            version: AtomicU64::new(0),
        }
    }

    /// Cached entry if fresh, otherwise a transparent refresh.
    pub fn lookup(&self, principal: &Principal) -> GateResult<Option<Arc<CredentialEntry>>> {
        if let Some(entry) = self.entries.read().get(principal) {
            if entry.age() < self.staleness {
                return Ok(Some(entry.clone()));
            }
        }
        self.refresh(principal)
    }

    /// Rebuild the entry from the registry. At most one registry read is in
    /// flight per principal; latecomers block on the flight and observe its
    /// completed outcome.
    pub fn refresh(&self, principal: &Principal) -> GateResult<Option<Arc<CredentialEntry>>> {
        let flight = {
            let mut inflight = self.inflight.lock();
            if let Some(existing) = inflight.get(principal) {
                let flight = existing.clone();
                drop(inflight);
                return self.wait_for_flight(principal, &flight);
            }
            let flight = Arc::new(RefreshFlight {
                outcome: Mutex::new(None),
                done: Condvar::new(),
            });
            inflight.insert(principal.clone(), flight.clone());
            flight
        };

        let result = self.do_refresh(principal);

        let outcome = match &result {
            Ok(Some(entry)) => FlightOutcome::Entry(entry.clone()),
            Ok(None) => FlightOutcome::NotFound,
            Err(e) => FlightOutcome::Failed(e.to_string()),
        };
        {
            let mut slot = flight.outcome.lock();
            *slot = Some(outcome);
        }
        self.inflight.lock().remove(principal);
        flight.done.notify_all();
        result
    }

    /// Direct insertion for a principal that became valid out of band, e.g.
    /// a newly created share; avoids a full registry scan.
    pub fn add(&self, principal: Principal, credentials: Vec<Credential>) {
        let entry = Arc::new(CredentialEntry {
            principal: principal.clone(),
            credentials,
            version: self.next_version(),
            refreshed: Instant::now(),
        });
        info!(target: "gridgate::login_map", %principal, version = entry.version,
              "added credentials");
        self.entries.write().insert(principal, entry);
    }

    pub fn invalidate(&self, principal: &Principal) -> bool {
        self.entries.write().remove(principal).is_some()
    }

    /// Full rebuild from a registry scan: refresh every principal the
    /// registry knows and drop cached entries for principals it no longer
    /// lists. Used at daemon startup and on registry-change notification.
    pub fn refresh_all(&self) -> GateResult<usize> {
        let mut refreshed = 0;
        for proto in Protocol::ALL {
            let names = self.registry.scan_usernames(proto)?;
            let keep: HashSet<&str> = names.iter().map(String::as_str).collect();
            self.entries
                .write()
                .retain(|p, _| p.protocol != proto || keep.contains(p.username.as_str()));
            for name in &names {
                let principal = Principal::new(name.clone(), proto);
                match self.refresh(&principal) {
                    Ok(Some(_)) => refreshed += 1,
                    Ok(None) => {}
                    Err(e) => {
                        warn!(target: "gridgate::login_map", %principal, error = %e,
                              "refresh failed during full scan");
                    }
                }
            }
        }
        info!(target: "gridgate::login_map", refreshed, "full registry scan done");
        Ok(refreshed)
    }

    pub fn cached_count(&self) -> usize {
        self.entries.read().len()
    }

    fn next_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn wait_for_flight(
        &self,
        principal: &Principal,
        flight: &RefreshFlight,
    ) -> GateResult<Option<Arc<CredentialEntry>>> {
        let deadline = self.registry_timeout + Duration::from_secs(1);
        let mut slot = flight.outcome.lock();
        loop {
            match slot.as_ref() {
                Some(FlightOutcome::Entry(entry)) => return Ok(Some(entry.clone())),
                Some(FlightOutcome::NotFound) => return Ok(None),
                Some(FlightOutcome::Failed(reason)) => {
                    return Err(GateError::TransientRegistry {
                        principal: principal.username.clone(),
                        reason: reason.clone(),
                    })
                }
                None => {}
            }
            if flight.done.wait_for(&mut slot, deadline).timed_out() {
                return Err(GateError::registry_timeout(&principal.username, deadline));
            }
        }
    }

    /// The actual registry read, bounded by the configured timeout. The
    /// resolve call runs on a helper thread; if it stalls past the bound we
    /// abandon it (the thread finishes on its own) and fail closed.
    fn do_refresh(&self, principal: &Principal) -> GateResult<Option<Arc<CredentialEntry>>> {
        let (tx, rx) = mpsc::channel();
        let registry = self.registry.clone();
        let wanted = principal.clone();
        std::thread::spawn(move || {
            let _ = tx.send(registry.resolve(&wanted));
        });
        let resolved = match rx.recv_timeout(self.registry_timeout) {
            Ok(result) => result?,
            Err(_) => {
                warn!(target: "gridgate::login_map", %principal,
                      timeout_secs = self.registry_timeout.as_secs(),
                      "registry resolve timed out");
                return Err(GateError::registry_timeout(
                    &principal.username,
                    self.registry_timeout,
                ));
            }
        };
        match resolved {
            Some(credentials) => {
                let entry = Arc::new(CredentialEntry {
                    principal: principal.clone(),
                    credentials,
                    version: self.next_version(),
                    refreshed: Instant::now(),
                });
                debug!(target: "gridgate::login_map", %principal,
                       version = entry.version, "published entry");
                self.entries.write().insert(principal.clone(), entry.clone());
                Ok(Some(entry))
            }
            None => {
                // Registry no longer knows the principal: the cached entry
                // (if any) must go too.
                if self.entries.write().remove(principal).is_some() {
                    info!(target: "gridgate::login_map", %principal,
                          "dropped entry for vanished principal");
                }
                Ok(None)
            }
        }
    }
}
