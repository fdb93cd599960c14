// ── Refresh coordinator ──
//
// Full lifecycle management for one installation. Authenticates through
// the login gate, seeds the snapshot store from discovery, then drives a
// fixed-interval refresh cycle: concurrent per-device fetch, per-device
// outcome classification, cached-data fallback, and fan-out of the
// merged result to subscribers. At most one cycle runs at a time.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thermolink_api::{
    DeviceId, Error, ErrorKind, SessionClient, TccSession, ThermostatState,
};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::InstallationConfig;
use crate::error::CoreError;
use crate::gate::{AuthOutcome, LoginGate, RETRY_BACKOFF};
use crate::store::{DeviceSnapshot, SnapshotStore};

/// Deadline for the discovery pass at setup.
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(60);

// ── InstallationState ────────────────────────────────────────────

/// Installation lifecycle state observable by consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallationState {
    Disconnected,
    Connecting,
    Connected,
    /// Credentials were rejected after the in-cycle retry. The host
    /// should prompt for re-authentication.
    AuthFailed,
}

// ── CycleResult ──────────────────────────────────────────────────

/// Merged outcome of one refresh cycle, fanned out to subscribers.
///
/// Every known device appears, fresh or cached. `auth_failed` is the
/// only field that escalates: everything else is data, possibly stale.
#[derive(Debug, Clone, Serialize)]
pub struct CycleResult {
    pub snapshots: HashMap<DeviceId, Arc<DeviceSnapshot>>,
    pub auth_failed: bool,
    pub completed_at: DateTime<Utc>,
}

// ── Coordinator ──────────────────────────────────────────────────

/// The polling coordinator for one installation.
///
/// Cheaply cloneable via `Arc`. Consumers read snapshots through the
/// store accessors and observe cycle completion through
/// [`subscribe()`](Self::subscribe); they never block on or retry
/// network calls themselves.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    config: InstallationConfig,
    /// Exclusively owned authenticated session. Never shared across
    /// installations; `login()` replaces its session material in place.
    session: Arc<dyn SessionClient>,
    store: SnapshotStore,
    gate: LoginGate,
    installation_state: watch::Sender<InstallationState>,
    last_cycle: watch::Sender<Option<Arc<CycleResult>>>,
    last_error: std::sync::Mutex<Option<ErrorKind>>,
    /// Set after discovery seeds the store: discovery already delivered a
    /// full refresh, so the next cycle is a no-op that just publishes.
    skip_next_cycle: AtomicBool,
    /// Held for the duration of one cycle. `try_lock` failure means a
    /// cycle is in flight and the caller must skip, not queue.
    cycle_lock: Mutex<()>,
    cancel: CancellationToken,
    /// Child token for the current run — cancelled on stop, replaced on
    /// the next start (avoids permanent cancellation).
    cancel_child: Mutex<CancellationToken>,
    task_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Coordinator {
    /// Create a coordinator over an existing session client. Does NOT
    /// log in — call [`start()`](Self::start).
    pub fn new(config: InstallationConfig, session: Arc<dyn SessionClient>) -> Self {
        let (installation_state, _) = watch::channel(InstallationState::Disconnected);
        let (last_cycle, _) = watch::channel(None);
        let cancel = CancellationToken::new();
        let cancel_child = cancel.child_token();

        Self {
            inner: Arc::new(CoordinatorInner {
                config,
                session,
                store: SnapshotStore::new(),
                gate: LoginGate::new(),
                installation_state,
                last_cycle,
                last_error: std::sync::Mutex::new(None),
                skip_next_cycle: AtomicBool::new(false),
                cycle_lock: Mutex::new(()),
                cancel,
                cancel_child: Mutex::new(cancel_child),
                task_handles: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Create a coordinator with a fresh portal session built from the
    /// configuration's credentials.
    pub fn from_config(config: InstallationConfig) -> Result<Self, CoreError> {
        let session = TccSession::new(config.username.clone(), config.password.clone())?;
        Ok(Self::new(config, Arc::new(session)))
    }

    /// Access the installation configuration.
    pub fn config(&self) -> &InstallationConfig {
        &self.inner.config
    }

    /// Access the snapshot store.
    pub fn store(&self) -> &SnapshotStore {
        &self.inner.store
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Start the installation: authenticate, discover devices, seed the
    /// store, publish the seeded result, and spawn the periodic refresh
    /// task.
    ///
    /// Failure modes are distinct by design:
    /// [`CoreError::NotReady`] is recoverable (retry on the host's outer
    /// schedule); [`CoreError::AuthenticationFailed`] should prompt for
    /// credential re-entry; nothing else escalates.
    pub async fn start(&self) -> Result<(), CoreError> {
        // Holding the handle set for the whole call serializes concurrent
        // starts; a non-empty set means a run is still active (including
        // one that has degraded to `AuthFailed`) until `stop()` drains it.
        let mut handles = self.inner.task_handles.lock().await;
        if !handles.is_empty() {
            return Err(CoreError::AlreadyRunning);
        }
        let _ = self
            .inner
            .installation_state
            .send(InstallationState::Connecting);

        // Fresh child token for this run (supports restart after stop).
        let child = self.inner.cancel.child_token();
        *self.inner.cancel_child.lock().await = child.clone();

        match self.inner.gate.authenticate(&*self.inner.session).await {
            AuthOutcome::Ready => {}
            AuthOutcome::RetryLater(retry_after) => {
                let _ = self
                    .inner
                    .installation_state
                    .send(InstallationState::Disconnected);
                return Err(CoreError::NotReady { retry_after });
            }
            AuthOutcome::PermanentAuthFailure => {
                let _ = self
                    .inner
                    .installation_state
                    .send(InstallationState::Disconnected);
                return Err(CoreError::AuthenticationFailed);
            }
        }

        let devices = match self.discover_bounded().await {
            Ok(devices) => devices,
            Err(err) => {
                let _ = self
                    .inner
                    .installation_state
                    .send(InstallationState::Disconnected);
                return Err(err);
            }
        };

        if devices.is_empty() {
            debug!("no devices found");
            let _ = self
                .inner
                .installation_state
                .send(InstallationState::Disconnected);
            return Err(CoreError::NoDevices);
        }

        info!(devices = devices.len(), "discovery complete — seeding store");
        self.inner.store.apply_discovery(devices);
        self.inner.skip_next_cycle.store(true, Ordering::SeqCst);

        // First cycle runs synchronously; it consumes the skip flag and
        // publishes the seeded snapshots without touching the network.
        {
            let _guard = self.inner.cycle_lock.lock().await;
            self.run_cycle_locked().await;
        }

        handles.push(tokio::spawn(refresh_task(
            self.clone(),
            self.inner.config.poll_interval(),
            child,
        )));

        let _ = self
            .inner
            .installation_state
            .send(InstallationState::Connected);
        info!("installation started");
        Ok(())
    }

    /// Stop the installation: cancel the refresh task and mark the
    /// installation disconnected. Snapshots are retained.
    pub async fn stop(&self) {
        self.inner.cancel_child.lock().await.cancel();

        let mut handles = self.inner.task_handles.lock().await;
        for handle in handles.drain(..) {
            let _ = handle.await;
        }

        let _ = self
            .inner
            .installation_state
            .send(InstallationState::Disconnected);
        debug!("installation stopped");
    }

    /// Run one refresh cycle immediately (user-triggered manual refresh).
    ///
    /// Fails with [`CoreError::RefreshInProgress`] rather than queueing if
    /// a cycle is already running.
    pub async fn force_refresh_now(&self) -> Result<Arc<CycleResult>, CoreError> {
        let Ok(_guard) = self.inner.cycle_lock.try_lock() else {
            return Err(CoreError::RefreshInProgress);
        };
        Ok(self.run_cycle_locked().await)
    }

    // ── Consumer accessors ───────────────────────────────────────

    /// One device's current snapshot (fresh or cached).
    pub fn current_snapshot(&self, id: DeviceId) -> Option<Arc<DeviceSnapshot>> {
        self.inner.store.get(id)
    }

    /// A device is available once it has ever fetched successfully —
    /// stale data keeps it available through transient failures.
    pub fn is_available(&self, id: DeviceId) -> bool {
        self.inner.store.get(id).is_some()
    }

    /// The failure class observed by the most recent cycle, if any.
    pub fn last_error(&self) -> Option<ErrorKind> {
        *self.inner.last_error.lock().expect("last error lock poisoned")
    }

    /// Consecutive login rejections since the last successful login.
    pub fn login_failures(&self) -> u32 {
        self.inner.gate.login_failures()
    }

    /// Subscribe to cycle completion. Receivers get the merged result of
    /// every cycle; dropping the receiver unsubscribes. A slow or dropped
    /// listener never blocks the cycle or other listeners.
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<CycleResult>>> {
        self.inner.last_cycle.subscribe()
    }

    /// Subscribe to installation lifecycle changes.
    pub fn installation_state(&self) -> watch::Receiver<InstallationState> {
        self.inner.installation_state.subscribe()
    }

    // ── Cycle internals ──────────────────────────────────────────

    /// Discovery with a bounded deadline, mapped onto setup error
    /// semantics: auth rejection escalates, everything else is "retry
    /// later".
    async fn discover_bounded(
        &self,
    ) -> Result<Vec<(DeviceId, ThermostatState)>, CoreError> {
        match tokio::time::timeout(DISCOVERY_TIMEOUT, self.inner.session.discover()).await {
            Ok(Ok(devices)) => Ok(devices),
            Ok(Err(err)) => match err.kind() {
                ErrorKind::Authentication => Err(CoreError::AuthenticationFailed),
                ErrorKind::RateLimited => {
                    let backoff = self.inner.gate.note_rate_limited(err.retry_after_secs());
                    Err(CoreError::NotReady {
                        retry_after: backoff,
                    })
                }
                _ => {
                    warn!(error = %err, "discovery failed — not ready");
                    Err(CoreError::NotReady {
                        retry_after: RETRY_BACKOFF,
                    })
                }
            },
            Err(_) => {
                warn!("discovery timed out — not ready");
                Err(CoreError::NotReady {
                    retry_after: RETRY_BACKOFF,
                })
            }
        }
    }

    /// Run one refresh cycle. The caller must hold `cycle_lock`.
    async fn run_cycle_locked(&self) -> Arc<CycleResult> {
        if self.inner.skip_next_cycle.swap(false, Ordering::SeqCst) {
            debug!("discovery already refreshed every device — skipping this cycle");
            let result = self.merged_result(false);
            self.publish(&result);
            return result;
        }

        let ids = self.inner.store.ids();
        let per_call_timeout = self.inner.config.refresh_timeout();

        // Concurrent fan-out: wall-clock cost must not scale with device
        // count. The cycle waits for every outcome before merging.
        let fetches = ids.into_iter().map(|id| {
            let session = Arc::clone(&self.inner.session);
            async move {
                let outcome =
                    match tokio::time::timeout(per_call_timeout, session.refresh_device(id)).await
                    {
                        Ok(result) => result,
                        Err(_) => Err(Error::Timeout),
                    };
                (id, outcome)
            }
        });
        let outcomes = futures_util::future::join_all(fetches).await;

        let mut cycle_error: Option<ErrorKind> = None;
        let mut auth_pending: Vec<DeviceId> = Vec::new();
        let mut auth_failed = false;

        for (id, outcome) in outcomes {
            match outcome {
                Ok(state) => {
                    self.inner.store.upsert(id, state);
                }
                Err(err) => match err.kind() {
                    // Deferred: one re-login attempt is made for the
                    // whole cycle, then each such device retried once.
                    ErrorKind::Authentication => auth_pending.push(id),
                    kind => {
                        self.classify_transient(id, &err, kind);
                        cycle_error = Some(kind);
                    }
                },
            }
        }

        if !auth_pending.is_empty() {
            match self.inner.gate.authenticate(&*self.inner.session).await {
                AuthOutcome::Ready => {
                    for id in auth_pending {
                        let outcome = match tokio::time::timeout(
                            per_call_timeout,
                            self.inner.session.refresh_device(id),
                        )
                        .await
                        {
                            Ok(result) => result,
                            Err(_) => Err(Error::Timeout),
                        };
                        match outcome {
                            Ok(state) => self.inner.store.upsert(id, state),
                            Err(err) if err.kind() == ErrorKind::Authentication => {
                                // Second rejection with a fresh login in
                                // between: the credentials are bad.
                                auth_failed = true;
                                self.inner.store.mark_stale(id);
                            }
                            Err(err) => {
                                let kind = err.kind();
                                self.classify_transient(id, &err, kind);
                                cycle_error = Some(kind);
                            }
                        }
                    }
                }
                AuthOutcome::RetryLater(delay) => {
                    // Login deferred (rate-limit window, degraded site):
                    // these devices fall back to cached data.
                    debug!(
                        retry_secs = delay.as_secs(),
                        "re-login deferred — serving cached data"
                    );
                    for id in auth_pending {
                        self.inner.store.mark_stale(id);
                    }
                    cycle_error = Some(ErrorKind::Authentication);
                }
                AuthOutcome::PermanentAuthFailure => {
                    auth_failed = true;
                    for id in auth_pending {
                        self.inner.store.mark_stale(id);
                    }
                }
            }
        }

        *self.inner.last_error.lock().expect("last error lock poisoned") = if auth_failed {
            Some(ErrorKind::Authentication)
        } else {
            cycle_error
        };

        if auth_failed {
            warn!("authentication failed after in-cycle retry — re-authentication required");
            let _ = self
                .inner
                .installation_state
                .send(InstallationState::AuthFailed);
        }

        let result = self.merged_result(auth_failed);
        self.publish(&result);
        result
    }

    fn classify_transient(&self, id: DeviceId, err: &Error, kind: ErrorKind) {
        if kind == ErrorKind::RateLimited {
            self.inner.gate.note_rate_limited(err.retry_after_secs());
        }
        if kind == ErrorKind::Unclassified {
            // Fail open for unknown error shapes, but keep them loud.
            warn!(device = %id, error = %err, "unclassified refresh error — treating as transient");
        } else {
            warn!(device = %id, error = %err, "transient refresh failure — serving cached data");
        }
        self.inner.store.mark_stale(id);
    }

    fn merged_result(&self, auth_failed: bool) -> Arc<CycleResult> {
        let snapshots = self
            .inner
            .store
            .all()
            .into_iter()
            .map(|snap| (snap.device_id, snap))
            .collect();
        Arc::new(CycleResult {
            snapshots,
            auth_failed,
            completed_at: Utc::now(),
        })
    }

    fn publish(&self, result: &Arc<CycleResult>) {
        self.inner.last_cycle.send_replace(Some(Arc::clone(result)));
    }
}

// ── Background task ──────────────────────────────────────────────

/// Drive the refresh cycle on a fixed interval.
///
/// A tick that fires while a cycle is still running is skipped, not
/// queued: `MissedTickBehavior::Skip` drops ticks the loop slept
/// through, and the `try_lock` covers a concurrent manual refresh.
async fn refresh_task(coordinator: Coordinator, period: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval.tick().await; // consume the immediate first tick

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = interval.tick() => {
                let Ok(_guard) = coordinator.inner.cycle_lock.try_lock() else {
                    debug!("refresh cycle still running — skipping tick");
                    continue;
                };
                let result = coordinator.run_cycle_locked().await;
                if result.auth_failed {
                    warn!("periodic refresh reported authentication failure");
                }
            }
        }
    }
}
