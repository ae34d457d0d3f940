//! The access-control core: credential cache, rate limiting, session
//! tracking, two-factor gating and the decision engine on top of them.
//! Keep the public surface thin and split implementation across sub-modules.

pub mod engine;
pub mod login_map;
pub mod principal;
pub mod ratelimit;
pub mod sessions;
pub mod twofactor;

pub use engine::{AccessGate, AuthRequest, Decision, Outcome};
pub use login_map::{CredentialEntry, LoginMap};
pub use principal::{Credential, PresentedCredential, Principal, Protocol};
pub use ratelimit::{secret_signature, RateKey, RateKind, RateLimiter};
pub use sessions::{Session, SessionToken, SessionTracker};
pub use twofactor::TwoFactorGate;
