//! gridgate: the access-control decision core behind grid file-sharing
//! daemons (WebDAV/SFTP/FTPS style). Daemons hand every connection attempt
//! to a [`gate::AccessGate`] and get back exactly one decision, either an
//! allow with a session token or a distinguishable denial, while the gate
//! keeps the credential cache, rate buckets, live sessions and two-factor
//! grants consistent behind the scenes.

pub mod config;
pub mod error;
pub mod gate;
pub mod policy;
pub mod registry;

pub use config::{GateConfig, ProtocolConfig, RateLimitConfig};
pub use error::{GateError, GateResult};
pub use gate::{AccessGate, AuthRequest, Decision, Outcome, PresentedCredential, Principal, Protocol};
