// ── Session client contract ──
//
// The capability set the coordinator depends on: authenticate, discover
// devices, refresh one device. Concrete backends (the bundled TCC HTTP
// client, test fakes) implement this trait; the coordinator never sees
// anything below it.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Opaque, stable identifier for one physical thermostat.
///
/// Immutable for the lifetime of the device; assigned by the remote
/// service at enrollment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub u64);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<u64> for DeviceId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Operating mode reported by the thermostat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemMode {
    EmergencyHeat,
    Heat,
    Off,
    Cool,
    Auto,
}

impl SystemMode {
    /// Decode the service's numeric switch position.
    ///
    /// Positions 4 and 5 both mean auto (schedule-auto vs hold-auto).
    pub fn from_switch_position(pos: u64) -> Option<Self> {
        match pos {
            0 => Some(Self::EmergencyHeat),
            1 => Some(Self::Heat),
            2 => Some(Self::Off),
            3 => Some(Self::Cool),
            4 | 5 => Some(Self::Auto),
            _ => None,
        }
    }
}

/// One device's domain state as fetched from the service.
///
/// The coordinator treats this as an atomic payload: replaced wholesale on
/// a successful fetch, carried over untouched on a failed one. Fields the
/// typed model doesn't cover land in `extra` so diagnostics can still see
/// them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThermostatState {
    /// Display name configured on the service.
    pub name: Option<String>,
    pub indoor_temperature: Option<f64>,
    pub outdoor_temperature: Option<f64>,
    /// Indoor relative humidity, percent.
    pub indoor_humidity: Option<f64>,
    pub heat_setpoint: Option<f64>,
    pub cool_setpoint: Option<f64>,
    pub system_mode: Option<SystemMode>,
    pub fan_running: Option<bool>,
    /// Whether the device was reporting live data at fetch time.
    pub device_live: bool,
    /// Unmodeled fields from the raw payload.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Abstract capability set of an authenticated remote session.
///
/// Implementations own the wire protocol (HTTP, cookies, envelopes) and
/// translate its failures into the [`Error`] taxonomy. All methods take
/// `&self`: re-authentication refreshes internal session material (cookie
/// jar) in place, so in-flight calls on the old material either complete
/// or fail cleanly.
#[async_trait]
pub trait SessionClient: Send + Sync {
    /// Authenticate, establishing or replacing the session material.
    ///
    /// A success-shaped response without usable session material must be
    /// reported as [`Error::EmptyCookie`], never as
    /// [`Error::Authentication`].
    async fn login(&self) -> Result<(), Error>;

    /// Enumerate all devices visible to the account, with a full state
    /// payload for each. Discovery doubles as the initial refresh.
    async fn discover(&self) -> Result<Vec<(DeviceId, ThermostatState)>, Error>;

    /// Fetch fresh state for a single device.
    async fn refresh_device(&self, id: DeviceId) -> Result<ThermostatState, Error>;
}
