//! Resilient polling coordinator for Total Connect Comfort installations.
//!
//! One [`Coordinator`] owns one authenticated session and the set of
//! devices discovered under it. It polls every device on a fixed
//! interval, absorbs the service's instability (timeouts, transient
//! login rejections, empty-cookie degraded states, rate limiting) and
//! presents consumers with an always-available snapshot per device:
//!
//! - A fetch failure never erases data. The last good state is served
//!   with `stale = true` and a failure count until a fetch succeeds.
//! - Credential re-entry is demanded only when the service explicitly
//!   rejects a login twice in a row with a fresh attempt in between.
//!   Every other failure shape retries quietly.
//! - At most one refresh cycle runs at a time; ticks that land during a
//!   running cycle are skipped, not queued.
//!
//! Consumers read snapshots via [`Coordinator::current_snapshot`] and
//! observe cycle completion through [`Coordinator::subscribe`]; the
//! store's watch channel carries full-collection updates for reactive
//! listeners.

pub mod config;
pub mod coordinator;
pub mod error;
pub(crate) mod gate;
pub mod store;

pub use config::InstallationConfig;
pub use coordinator::{Coordinator, CycleResult, InstallationState};
pub use error::CoreError;
pub use store::{DeviceSnapshot, SnapshotStore};
