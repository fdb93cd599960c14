// ── Login retry gate ──
//
// Wraps session authentication with a bounded timeout, a single
// immediate retry on rejection, and a shared rate-limit window. The gate
// owns all login-failure accounting; everything else reads it.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use thermolink_api::{Error, ErrorKind, SessionClient};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Deadline for a single login call.
pub(crate) const LOGIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Backoff suggested after an infrastructure failure.
pub(crate) const RETRY_BACKOFF: Duration = Duration::from_secs(30);

/// Backoff applied when the service rate-limits us without advertising one.
const DEFAULT_RATE_LIMIT_BACKOFF: Duration = Duration::from_secs(600);

/// Outcome of one authentication attempt through the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Logged in; the session is usable.
    Ready,
    /// Login was deferred or failed transiently. Retry after the delay;
    /// the credentials are not known to be bad.
    RetryLater(Duration),
    /// Credentials were explicitly rejected twice in a row. Only this
    /// outcome should ever force credential re-entry.
    PermanentAuthFailure,
}

pub(crate) struct LoginGate {
    /// While set and in the future, all login attempts are skipped.
    rate_limited_until: Mutex<Option<Instant>>,
    /// Consecutive login rejections; reset on any successful login.
    login_failures: AtomicU32,
}

impl LoginGate {
    pub(crate) fn new() -> Self {
        Self {
            rate_limited_until: Mutex::new(None),
            login_failures: AtomicU32::new(0),
        }
    }

    /// Consecutive login rejections since the last success (diagnostics).
    pub(crate) fn login_failures(&self) -> u32 {
        self.login_failures.load(Ordering::Relaxed)
    }

    /// Record a rate-limit signal observed anywhere in the installation
    /// (login or device refresh). Subsequent login attempts are skipped
    /// until the window elapses.
    pub(crate) fn note_rate_limited(&self, retry_after_secs: Option<u64>) -> Duration {
        let backoff = retry_after_secs.map_or(DEFAULT_RATE_LIMIT_BACKOFF, Duration::from_secs);
        let until = Instant::now() + backoff;
        *self
            .rate_limited_until
            .lock()
            .expect("rate limit lock poisoned") = Some(until);
        warn!(backoff_secs = backoff.as_secs(), "rate limited — deferring logins");
        backoff
    }

    /// Authenticate the session, classifying the result.
    ///
    /// The service is known to reject valid credentials transiently under
    /// load, so a rejection gets exactly one immediate retry. Only an
    /// explicit rejection of the retry becomes
    /// [`AuthOutcome::PermanentAuthFailure`]; a persisting empty cookie
    /// stays [`AuthOutcome::RetryLater`] because a degraded site must not
    /// force credential re-entry.
    pub(crate) async fn authenticate(&self, session: &dyn SessionClient) -> AuthOutcome {
        if let Some(until) = *self
            .rate_limited_until
            .lock()
            .expect("rate limit lock poisoned")
        {
            let now = Instant::now();
            if until > now {
                let remaining = until.saturating_duration_since(now);
                debug!(
                    remaining_secs = remaining.as_secs(),
                    "rate-limit window active — skipping login"
                );
                return AuthOutcome::RetryLater(remaining);
            }
        }

        let first = self.bounded_login(session).await;
        let err = match first {
            Ok(()) => {
                self.record_success();
                return AuthOutcome::Ready;
            }
            Err(err) => err,
        };

        match err.kind() {
            // Infrastructure failures don't count toward auth accounting.
            ErrorKind::Timeout | ErrorKind::Connection | ErrorKind::Unclassified => {
                debug!(error = %err, "login failed transiently");
                AuthOutcome::RetryLater(RETRY_BACKOFF)
            }
            ErrorKind::RateLimited => {
                AuthOutcome::RetryLater(self.note_rate_limited(err.retry_after_secs()))
            }
            ErrorKind::Authentication | ErrorKind::EmptyCookie => {
                self.login_failures.fetch_add(1, Ordering::Relaxed);
                debug!(error = %err, "login rejected — retrying once");
                match self.bounded_login(session).await {
                    Ok(()) => {
                        self.record_success();
                        AuthOutcome::Ready
                    }
                    Err(retry_err) => match retry_err.kind() {
                        ErrorKind::Authentication => {
                            self.login_failures.fetch_add(1, Ordering::Relaxed);
                            warn!("credentials rejected twice — re-authentication required");
                            AuthOutcome::PermanentAuthFailure
                        }
                        ErrorKind::EmptyCookie => {
                            self.login_failures.fetch_add(1, Ordering::Relaxed);
                            warn!("login still returning an empty cookie — site may be down");
                            AuthOutcome::RetryLater(RETRY_BACKOFF)
                        }
                        ErrorKind::RateLimited => AuthOutcome::RetryLater(
                            self.note_rate_limited(retry_err.retry_after_secs()),
                        ),
                        _ => {
                            debug!(error = %retry_err, "login retry failed transiently");
                            AuthOutcome::RetryLater(RETRY_BACKOFF)
                        }
                    },
                }
            }
        }
    }

    async fn bounded_login(&self, session: &dyn SessionClient) -> Result<(), Error> {
        match tokio::time::timeout(LOGIN_TIMEOUT, session.login()).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout),
        }
    }

    fn record_success(&self) {
        self.login_failures.store(0, Ordering::Relaxed);
        *self
            .rate_limited_until
            .lock()
            .expect("rate limit lock poisoned") = None;
        debug!("login successful");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicU32;

    use async_trait::async_trait;
    use thermolink_api::{DeviceId, ThermostatState};

    use super::*;

    /// Scripted session: pops one login result per call, `Ok` when the
    /// script runs dry.
    struct ScriptSession {
        logins: Mutex<VecDeque<Result<(), Error>>>,
        login_calls: AtomicU32,
        login_delay: Option<Duration>,
    }

    impl ScriptSession {
        fn new(logins: Vec<Result<(), Error>>) -> Self {
            Self {
                logins: Mutex::new(logins.into()),
                login_calls: AtomicU32::new(0),
                login_delay: None,
            }
        }

        fn calls(&self) -> u32 {
            self.login_calls.load(Ordering::Relaxed)
        }
    }

    #[async_trait]
    impl SessionClient for ScriptSession {
        async fn login(&self) -> Result<(), Error> {
            self.login_calls.fetch_add(1, Ordering::Relaxed);
            if let Some(delay) = self.login_delay {
                tokio::time::sleep(delay).await;
            }
            self.logins.lock().unwrap().pop_front().unwrap_or(Ok(()))
        }

        async fn discover(&self) -> Result<Vec<(DeviceId, ThermostatState)>, Error> {
            Ok(Vec::new())
        }

        async fn refresh_device(&self, _id: DeviceId) -> Result<ThermostatState, Error> {
            Ok(ThermostatState::default())
        }
    }

    fn auth_err() -> Error {
        Error::Authentication {
            message: "rejected".into(),
        }
    }

    #[tokio::test]
    async fn success_is_ready() {
        let session = ScriptSession::new(vec![]);
        let gate = LoginGate::new();
        assert_eq!(gate.authenticate(&session).await, AuthOutcome::Ready);
        assert_eq!(session.calls(), 1);
        assert_eq!(gate.login_failures(), 0);
    }

    #[tokio::test]
    async fn rejection_then_success_is_ready() {
        let session = ScriptSession::new(vec![Err(auth_err())]);
        let gate = LoginGate::new();
        assert_eq!(gate.authenticate(&session).await, AuthOutcome::Ready);
        assert_eq!(session.calls(), 2);
        assert_eq!(gate.login_failures(), 0);
    }

    #[tokio::test]
    async fn double_rejection_is_permanent() {
        let session = ScriptSession::new(vec![Err(auth_err()), Err(auth_err())]);
        let gate = LoginGate::new();
        assert_eq!(
            gate.authenticate(&session).await,
            AuthOutcome::PermanentAuthFailure
        );
        assert_eq!(session.calls(), 2);
        assert_eq!(gate.login_failures(), 2);
    }

    #[tokio::test]
    async fn persistent_empty_cookie_is_retry_later_not_permanent() {
        let session = ScriptSession::new(vec![Err(Error::EmptyCookie), Err(Error::EmptyCookie)]);
        let gate = LoginGate::new();
        assert!(matches!(
            gate.authenticate(&session).await,
            AuthOutcome::RetryLater(_)
        ));
    }

    #[tokio::test]
    async fn empty_cookie_then_explicit_rejection_is_permanent() {
        let session = ScriptSession::new(vec![Err(Error::EmptyCookie), Err(auth_err())]);
        let gate = LoginGate::new();
        assert_eq!(
            gate.authenticate(&session).await,
            AuthOutcome::PermanentAuthFailure
        );
    }

    #[tokio::test]
    async fn connection_error_is_retry_later_without_retry() {
        let session = ScriptSession::new(vec![Err(Error::Connection {
            message: "refused".into(),
        })]);
        let gate = LoginGate::new();
        assert_eq!(
            gate.authenticate(&session).await,
            AuthOutcome::RetryLater(RETRY_BACKOFF)
        );
        // No immediate retry for infrastructure failures.
        assert_eq!(session.calls(), 1);
        assert_eq!(gate.login_failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_login_times_out_as_retry_later() {
        let mut session = ScriptSession::new(vec![]);
        session.login_delay = Some(Duration::from_secs(120));
        let gate = LoginGate::new();
        assert_eq!(
            gate.authenticate(&session).await,
            AuthOutcome::RetryLater(RETRY_BACKOFF)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_window_skips_logins_until_elapsed() {
        let session = ScriptSession::new(vec![Err(Error::RateLimited {
            retry_after_secs: Some(300),
        })]);
        let gate = LoginGate::new();

        assert!(matches!(
            gate.authenticate(&session).await,
            AuthOutcome::RetryLater(_)
        ));
        assert_eq!(session.calls(), 1);

        // Inside the window: no call reaches the session.
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(matches!(
            gate.authenticate(&session).await,
            AuthOutcome::RetryLater(_)
        ));
        assert_eq!(session.calls(), 1);

        // Window elapsed: logins resume (script is dry, so this succeeds).
        tokio::time::advance(Duration::from_secs(300)).await;
        assert_eq!(gate.authenticate(&session).await, AuthOutcome::Ready);
        assert_eq!(session.calls(), 2);
    }

    #[tokio::test]
    async fn success_clears_rate_limit_window_and_failures() {
        let session = ScriptSession::new(vec![Err(auth_err())]);
        let gate = LoginGate::new();
        gate.note_rate_limited(Some(0));

        assert_eq!(gate.authenticate(&session).await, AuthOutcome::Ready);
        assert_eq!(gate.login_failures(), 0);
        assert!(gate
            .rate_limited_until
            .lock()
            .unwrap()
            .is_none());
    }
}
