//! Session-client contract and HTTP client for the Total Connect Comfort
//! thermostat service.
//!
//! This crate defines the capability set the polling coordinator in
//! `thermolink-core` depends on, and ships the one production backend:
//!
//! - **[`SessionClient`]** — dyn-safe trait with the three operations the
//!   coordinator invokes: `login()`, `discover()`, `refresh_device()`.
//!
//! - **[`Error`] / [`ErrorKind`]** — the failure taxonomy the coordinator
//!   classifies against: `Timeout`, `Connection`, `RateLimited`,
//!   `Authentication`, and the service's distinctive [`Error::EmptyCookie`]
//!   degraded state (success-shaped response, no session cookie — never a
//!   credential failure).
//!
//! - **[`TccSession`]** — reqwest-backed cookie-session client for the TCC
//!   portal. Deliberately narrow: form login, location walk, per-device
//!   data fetch, status→error mapping. Nothing else of the portal protocol
//!   is modeled here.

pub mod error;
pub mod session;
pub mod tcc;

pub use error::{Error, ErrorKind};
pub use session::{DeviceId, SessionClient, SystemMode, ThermostatState};
pub use tcc::TccSession;
