use thiserror::Error;

/// Top-level error type for the `thermolink-api` crate.
///
/// Covers every failure mode of the session client: transport faults,
/// throttling, credential rejection, and the service's distinctive
/// "empty cookie" degraded state. `thermolink-core` classifies these via
/// [`Error::kind`] when deciding whether to escalate or serve cached data.
#[derive(Debug, Error)]
pub enum Error {
    // ── Transport ───────────────────────────────────────────────────
    /// The request did not complete within its deadline.
    #[error("request timed out")]
    Timeout,

    /// Connection-level failure (refused, reset, DNS, TLS).
    #[error("connection error: {message}")]
    Connection { message: String },

    // ── Throttling ──────────────────────────────────────────────────
    /// The service rejected the request for sending too many.
    /// Carries the advertised backoff when the response included one.
    #[error("rate limited by the service")]
    RateLimited { retry_after_secs: Option<u64> },

    // ── Authentication ──────────────────────────────────────────────
    /// Explicit credential rejection (wrong password, locked account).
    #[error("authentication rejected: {message}")]
    Authentication { message: String },

    /// Login returned a success-shaped response with an empty or missing
    /// session cookie. The backing site is degraded, not the credentials —
    /// this must never be treated as a credential failure.
    #[error("login returned an empty session cookie (service degraded)")]
    EmptyCookie,

    // ── Data ────────────────────────────────────────────────────────
    /// The service answered with a payload we could not interpret.
    #[error("unexpected API response: {message}")]
    UnexpectedResponse { message: String },

    /// JSON deserialization failed.
    #[error("deserialization error: {message}")]
    Deserialization { message: String },

    /// URL construction error.
    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

/// Coarse classification of an [`Error`], used by the coordinator's
/// per-device outcome handling. `Copy` so it can be stashed as a
/// last-error diagnostic without holding the full error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Timeout,
    Connection,
    RateLimited,
    Authentication,
    EmptyCookie,
    /// Anything that doesn't fit the taxonomy. Fails open: treated as
    /// transient by the coordinator, but logged distinctly.
    Unclassified,
}

impl Error {
    /// Classify this error for the coordinator's outcome handling.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout => ErrorKind::Timeout,
            Self::Connection { .. } => ErrorKind::Connection,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::Authentication { .. } => ErrorKind::Authentication,
            Self::EmptyCookie => ErrorKind::EmptyCookie,
            Self::UnexpectedResponse { .. }
            | Self::Deserialization { .. }
            | Self::InvalidUrl(_) => ErrorKind::Unclassified,
        }
    }

    /// Returns `true` if this error is presumed temporary and should be
    /// resolved by serving cached data, not by escalation.
    ///
    /// Everything except an explicit credential rejection is transient;
    /// unclassified errors fail open.
    pub fn is_transient(&self) -> bool {
        !matches!(self.kind(), ErrorKind::Authentication)
    }

    /// The backoff advertised by a rate-limit response, if any.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_secs } => *retry_after_secs,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for Error {
    /// Map transport-level reqwest failures onto the taxonomy.
    ///
    /// Status-code mapping (401/403/429) is done at the call sites that
    /// still hold the response; by the time an error reaches here it is
    /// infrastructure, not protocol.
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_connect() {
            Self::Connection {
                message: err.to_string(),
            }
        } else if err.is_decode() {
            Self::Deserialization {
                message: err.to_string(),
            }
        } else {
            Self::Connection {
                message: err.to_string(),
            }
        }
    }
}
