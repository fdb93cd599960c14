// ── Installation configuration ──

use std::time::Duration;

use secrecy::SecretString;

/// Default cadence of the refresh cycle.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;

/// Default per-call deadline for a single device refresh.
pub const DEFAULT_REFRESH_TIMEOUT_SECS: u64 = 30;

/// Default away-mode heat setpoint, °F.
pub const DEFAULT_AWAY_TEMPERATURE_HEAT: f64 = 61.0;

/// Default away-mode cool setpoint, °F.
pub const DEFAULT_AWAY_TEMPERATURE_COOL: f64 = 88.0;

/// Configuration for one installation: one account session managing a
/// set of devices.
///
/// Credentials are used to construct the session client; the away
/// temperatures are carried for consumers (climate entities) that apply
/// them — the coordinator itself never reads them.
#[derive(Debug, Clone)]
pub struct InstallationConfig {
    /// Account username (email address on the portal).
    pub username: String,
    /// Account password. Redacted in `Debug` output.
    pub password: SecretString,
    /// Refresh cycle cadence. Overridable per installation.
    pub poll_interval_secs: u64,
    /// Per-device refresh deadline within a cycle.
    pub refresh_timeout_secs: u64,
    /// Heat setpoint applied by consumers in away mode.
    pub away_temperature_heat: f64,
    /// Cool setpoint applied by consumers in away mode.
    pub away_temperature_cool: f64,
}

impl InstallationConfig {
    /// Build a configuration with default polling and away settings.
    pub fn new(username: impl Into<String>, password: SecretString) -> Self {
        Self {
            username: username.into(),
            password,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            refresh_timeout_secs: DEFAULT_REFRESH_TIMEOUT_SECS,
            away_temperature_heat: DEFAULT_AWAY_TEMPERATURE_HEAT,
            away_temperature_cool: DEFAULT_AWAY_TEMPERATURE_COOL,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.refresh_timeout_secs)
    }
}
