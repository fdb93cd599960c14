// ── Total Connect Comfort HTTP session ──
//
// Thin reqwest-backed implementation of `SessionClient` for the TCC
// portal. Owns the cookie-jar session, form login, and the two data
// endpoints (location list, per-device data session). Everything else
// about the portal protocol is out of scope: this module exists to
// invoke those three operations and translate their failures into the
// `Error` taxonomy.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use reqwest::cookie::{CookieStore, Jar};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, trace};
use url::Url;

use crate::error::Error;
use crate::session::{DeviceId, SessionClient, SystemMode, ThermostatState};

/// Production portal root. Note the trailing slash — relative joins
/// depend on it.
pub const DEFAULT_BASE_URL: &str = "https://www.mytotalconnectcomfort.com/portal/";

const LOCATIONS_PATH: &str = "Location/GetLocationListData";
const DEVICE_DATA_PATH: &str = "Device/CheckDataSession/";

/// Cookie-session HTTP client for the TCC portal.
///
/// `login()` establishes the session cookie in the jar; `discover()` and
/// `refresh_device()` ride on it. All methods take `&self` — a re-login
/// replaces the jar contents in place, so concurrent requests either
/// complete on the old cookie or fail with an auth error the caller
/// classifies.
pub struct TccSession {
    http: reqwest::Client,
    base_url: Url,
    username: String,
    password: SecretString,
    cookie_jar: Arc<Jar>,
    /// Device display names captured at discovery. The per-device data
    /// endpoint omits the name, so refreshes re-attach it from here.
    device_names: RwLock<HashMap<DeviceId, String>>,
}

impl TccSession {
    /// Create a session against the production portal.
    pub fn new(username: impl Into<String>, password: SecretString) -> Result<Self, Error> {
        let base_url = Url::parse(DEFAULT_BASE_URL)?;
        Self::with_base_url(base_url, username, password)
    }

    /// Create a session against an arbitrary portal root (tests, proxies).
    pub fn with_base_url(
        base_url: Url,
        username: impl Into<String>,
        password: SecretString,
    ) -> Result<Self, Error> {
        let cookie_jar = Arc::new(Jar::default());
        let http = reqwest::Client::builder()
            .cookie_provider(Arc::clone(&cookie_jar))
            .build()
            .map_err(Error::from)?;

        Ok(Self {
            http,
            base_url,
            username: username.into(),
            password,
            cookie_jar,
            device_names: RwLock::new(HashMap::new()),
        })
    }

    /// The portal root this session talks to.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    // ── Request helpers ──────────────────────────────────────────────

    /// Map throttling and credential-rejection statuses before the caller
    /// touches the body.
    fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, Error> {
        let status = resp.status();

        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(Error::Authentication {
                message: format!("portal rejected the session (HTTP {status})"),
            });
        }

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            return Err(Error::RateLimited { retry_after_secs });
        }

        if !status.is_success() {
            return Err(Error::UnexpectedResponse {
                message: format!("HTTP {status}"),
            });
        }

        Ok(resp)
    }

    /// Whether the jar holds a non-empty session cookie for the portal.
    ///
    /// The portal signals a degraded backend by answering a login with
    /// HTTP 200 and a null/empty cookie; callers turn that into
    /// [`Error::EmptyCookie`].
    fn has_session_cookie(&self) -> bool {
        let Some(header) = self.cookie_jar.cookies(&self.base_url) else {
            return false;
        };
        let Ok(cookies) = header.to_str() else {
            return false;
        };
        cookies.split(';').any(|pair| {
            pair.split_once('=')
                .is_some_and(|(_, value)| !value.trim().is_empty())
        })
    }

    fn remembered_name(&self, id: DeviceId) -> Option<String> {
        self.device_names
            .read()
            .ok()
            .and_then(|names| names.get(&id).cloned())
    }
}

/// First ~200 bytes of a response body for diagnostics, truncated on a
/// char boundary so multi-byte content cannot panic the error path.
fn body_preview(body: &str) -> &str {
    let mut end = body.len().min(200);
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}

#[async_trait::async_trait]
impl SessionClient for TccSession {
    /// Authenticate with the portal's form login.
    ///
    /// Three distinct outcomes beyond plain transport failure:
    /// - explicit rejection (status or "unsuccessful" marker) → `Authentication`
    /// - HTTP success but no usable cookie → `EmptyCookie`
    /// - HTTP success with a session cookie → `Ok`
    async fn login(&self) -> Result<(), Error> {
        debug!("logging in at {}", self.base_url);

        let form = [
            ("UserName", self.username.as_str()),
            ("Password", self.password.expose_secret()),
            ("RememberMe", "false"),
            ("timeOffset", "480"),
        ];

        let resp = self
            .http
            .post(self.base_url.clone())
            .header("X-Requested-With", "XMLHttpRequest")
            .form(&form)
            .send()
            .await
            .map_err(Error::from)?;

        let resp = Self::check_status(resp)?;

        // The portal answers a bad password with HTTP 200 and the login
        // form again. The marker string is stable across portal versions.
        let body = resp.text().await.map_err(Error::from)?;
        if body.contains("Login was unsuccessful") {
            return Err(Error::Authentication {
                message: "incorrect username or password".into(),
            });
        }

        if !self.has_session_cookie() {
            return Err(Error::EmptyCookie);
        }

        debug!("login successful");
        Ok(())
    }

    /// Walk the account's locations and flatten their devices.
    ///
    /// The location list embeds a full state payload per device, so
    /// discovery doubles as the initial refresh.
    async fn discover(&self) -> Result<Vec<(DeviceId, ThermostatState)>, Error> {
        let url = self.base_url.join(LOCATIONS_PATH)?;
        debug!("GET {}", url);

        let resp = self
            .http
            .get(url)
            .query(&[("page", "1"), ("filter", "")])
            .header("X-Requested-With", "XMLHttpRequest")
            .send()
            .await
            .map_err(Error::from)?;

        let resp = Self::check_status(resp)?;
        let body = resp.text().await.map_err(Error::from)?;
        let locations: Vec<LocationEntry> =
            serde_json::from_str(&body).map_err(|e| Error::Deserialization {
                message: format!("{e} (body preview: {:?})", body_preview(&body)),
            })?;

        let mut devices = Vec::new();
        for location in locations {
            trace!(location_id = location.location_id, "walking location");
            for entry in location.devices {
                let id = DeviceId(entry.device_id);
                let mut state = entry
                    .thermostat
                    .map(ThermostatState::from)
                    .unwrap_or_default();
                state.name.clone_from(&entry.name);
                if let Some(name) = entry.name {
                    if let Ok(mut names) = self.device_names.write() {
                        names.insert(id, name);
                    }
                }
                devices.push((id, state));
            }
        }

        debug!(count = devices.len(), "discovered devices");
        Ok(devices)
    }

    /// Fetch fresh state for one device from its data session endpoint.
    async fn refresh_device(&self, id: DeviceId) -> Result<ThermostatState, Error> {
        let url = self.base_url.join(&format!("{DEVICE_DATA_PATH}{id}"))?;
        debug!("GET {}", url);

        let resp = self
            .http
            .get(url)
            .header("X-Requested-With", "XMLHttpRequest")
            .send()
            .await
            .map_err(Error::from)?;

        let resp = Self::check_status(resp)?;
        let body = resp.text().await.map_err(Error::from)?;
        let payload: CheckDataSession =
            serde_json::from_str(&body).map_err(|e| Error::Deserialization {
                message: format!("{e} (body preview: {:?})", body_preview(&body)),
            })?;

        // `success: false` means the data session expired — the portal
        // wants a fresh login, not a retry of this request.
        if !payload.success {
            return Err(Error::Authentication {
                message: format!("data session rejected for device {id}"),
            });
        }

        let mut state = payload
            .latest_data
            .map(ThermostatState::from)
            .unwrap_or_default();
        state.device_live = payload.device_live;
        state.name = self.remembered_name(id);
        Ok(state)
    }
}

// ── Wire payloads ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct LocationEntry {
    #[serde(rename = "LocationID", default)]
    location_id: u64,
    #[serde(rename = "Devices", default)]
    devices: Vec<DeviceEntry>,
}

#[derive(Debug, Deserialize)]
struct DeviceEntry {
    #[serde(rename = "DeviceID")]
    device_id: u64,
    #[serde(rename = "Name")]
    name: Option<String>,
    #[serde(rename = "ThermostatData")]
    thermostat: Option<LatestData>,
}

#[derive(Debug, Deserialize)]
struct CheckDataSession {
    #[serde(default)]
    success: bool,
    #[serde(rename = "deviceLive", default)]
    device_live: bool,
    #[serde(rename = "latestData")]
    latest_data: Option<LatestData>,
}

#[derive(Debug, Default, Deserialize)]
struct LatestData {
    #[serde(rename = "uiData", default)]
    ui_data: UiData,
    #[serde(rename = "fanData")]
    fan_data: Option<FanData>,
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
struct UiData {
    #[serde(rename = "DispTemperature")]
    disp_temperature: Option<f64>,
    #[serde(rename = "OutdoorTemperature")]
    outdoor_temperature: Option<f64>,
    #[serde(rename = "OutdoorTemperatureAvailable")]
    outdoor_temperature_available: Option<bool>,
    #[serde(rename = "IndoorHumidity")]
    indoor_humidity: Option<f64>,
    #[serde(rename = "IndoorHumiditySensorAvailable")]
    indoor_humidity_available: Option<bool>,
    #[serde(rename = "HeatSetpoint")]
    heat_setpoint: Option<f64>,
    #[serde(rename = "CoolSetpoint")]
    cool_setpoint: Option<f64>,
    #[serde(rename = "SystemSwitchPosition")]
    system_switch_position: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct FanData {
    #[serde(rename = "fanIsRunning")]
    fan_is_running: Option<bool>,
}

impl From<LatestData> for ThermostatState {
    fn from(data: LatestData) -> Self {
        let ui = data.ui_data;

        // Availability flags gate the corresponding readings: the portal
        // reports placeholder values when a sensor is absent.
        let outdoor_temperature = match ui.outdoor_temperature_available {
            Some(false) => None,
            _ => ui.outdoor_temperature,
        };
        let indoor_humidity = match ui.indoor_humidity_available {
            Some(false) => None,
            _ => ui.indoor_humidity,
        };

        Self {
            name: None,
            indoor_temperature: ui.disp_temperature,
            outdoor_temperature,
            indoor_humidity,
            heat_setpoint: ui.heat_setpoint,
            cool_setpoint: ui.cool_setpoint,
            system_mode: ui
                .system_switch_position
                .and_then(SystemMode::from_switch_position),
            fan_running: data.fan_data.and_then(|f| f.fan_is_running),
            device_live: false,
            extra: data.extra,
        }
    }
}
