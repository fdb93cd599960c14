use std::time::Duration;

use thiserror::Error;

/// Host-facing error type for the coordinator.
///
/// The two setup variants are deliberately distinct so the host can route
/// them differently: [`AuthenticationFailed`](CoreError::AuthenticationFailed)
/// should prompt for credential re-entry, while
/// [`NotReady`](CoreError::NotReady) should be retried on the host's own
/// outer schedule. No transient failure class ever surfaces here — those
/// degrade to cached snapshots inside the refresh cycle.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Credentials were explicitly rejected, surviving one retry.
    /// The only condition that should ever prompt for re-authentication.
    #[error("authentication failed — credentials must be re-entered")]
    AuthenticationFailed,

    /// Setup could not complete for a transient reason. Retry after the
    /// given delay; not a fatal error.
    #[error("not ready — retry in {}s", retry_after.as_secs())]
    NotReady { retry_after: Duration },

    /// Discovery returned an empty device list for the account.
    #[error("no devices discovered for this account")]
    NoDevices,

    /// `start()` called while the coordinator is already running.
    #[error("coordinator is already running")]
    AlreadyRunning,

    /// A manual refresh was requested while a cycle is in flight.
    /// The in-flight cycle's result will arrive via the subscription.
    #[error("a refresh cycle is already in progress")]
    RefreshInProgress,

    /// Session client construction or invocation failure outside the
    /// refresh cycle's classification paths.
    #[error(transparent)]
    Api(#[from] thermolink_api::Error),
}
