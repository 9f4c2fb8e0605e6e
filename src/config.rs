use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{
    borrow::Cow,
    collections::HashMap,
    net::SocketAddr,
    path::{Path, PathBuf},
};
use thiserror::Error;
use validator::{Validate, ValidationError};

use crate::domain::Action;

const SETTINGS_FILE: &str = "settings.json";
const SECRET_FIELDS: [&str; 1] = ["tibber_token"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid settings: {0}")]
    Invalid(String),
    #[error("failed to load configuration: {0}")]
    Load(#[from] figment::Error),
    #[error("failed to persist settings: {0}")]
    Persist(#[from] std::io::Error),
    #[error("settings (de)serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
}

impl From<validator::ValidationErrors> for ConfigError {
    fn from(errors: validator::ValidationErrors) -> Self {
        ConfigError::Invalid(errors.to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub settings: Settings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub enable_cors: bool,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_shutdown_grace_secs() -> u64 {
    5
}

impl ServerConfig {
    pub fn socket_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(format!("{}:{}", self.host, self.port).parse()?)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            request_timeout_secs: default_request_timeout_secs(),
            enable_cors: false,
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl Config {
    /// Layering: defaults file, then the persisted settings of a previous
    /// run, then `HELIOS__*` environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let base = Figment::new()
            .merge(Serialized::default("server", ServerConfig::default()))
            .merge(Serialized::default("settings", Settings::default()))
            .merge(Toml::file("config/default.toml"));

        let probe: Config = base
            .clone()
            .merge(Env::prefixed("HELIOS__").split("__"))
            .extract()?;

        let mut figment = base;
        if let Some(persisted) = Settings::load_from_disk(&probe.settings.data_dir)? {
            figment = figment.merge(Serialized::default("settings", persisted));
        }
        let cfg: Config = figment
            .merge(Env::prefixed("HELIOS__").split("__"))
            .extract()?;

        cfg.settings.validate()?;
        Ok(cfg)
    }
}

/// Validated settings snapshot shared by the planner, executor and scheduler.
///
/// Instances are never mutated in place once published; updates build a new
/// value through [`ConfigUpdate::apply_to`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_invariants"))]
#[serde(default)]
pub struct Settings {
    // Planning & control cadence
    #[validate(range(min = 60))]
    pub planning_window_seconds: u32,
    #[validate(range(min = 1, max = 48))]
    pub planning_horizon_hours: u32,
    #[validate(range(min = 30))]
    pub recalculation_interval_seconds: u32,
    #[validate(range(min = 1))]
    pub dbus_update_interval_seconds: u32,
    #[validate(range(min = 1))]
    pub telemetry_update_interval_seconds: u32,
    #[validate(range(min = 5))]
    pub counters_update_interval_seconds: u32,
    pub minimum_action_dwell_seconds: u32,
    pub dwell_seconds_charge_from_grid: Option<u32>,
    pub dwell_seconds_discharge_to_load: Option<u32>,
    pub dwell_seconds_export_to_grid: Option<u32>,
    pub dwell_seconds_idle: Option<u32>,
    pub log_level: String,
    pub data_dir: String,

    // Pricing adjustments
    pub price_provider: String,
    #[validate(range(min = 0.0))]
    pub price_hysteresis_eur_per_kwh: f64,
    #[validate(range(min = 0.0))]
    pub buy_price_multiplier: f64,
    pub buy_price_fixed_fee_eur_per_kwh: f64,
    #[validate(range(min = 0.0))]
    pub sell_price_multiplier: f64,
    pub sell_price_fixed_deduction_eur_per_kwh: f64,
    pub grid_sell_enabled: bool,

    // Limits
    pub grid_import_limit_w: Option<u32>,
    pub grid_export_limit_w: Option<u32>,
    #[validate(range(min = 1))]
    pub grid_ramp_w_per_second: Option<u32>,

    // Battery characteristics and policy
    #[validate(range(min = 0.0))]
    pub battery_capacity_kwh: Option<f64>,
    pub battery_charge_limit_w: Option<u32>,
    pub battery_discharge_limit_w: Option<u32>,
    #[validate(range(min = 0.0, max = 100.0))]
    pub battery_roundtrip_efficiency_percent: f64,
    #[validate(range(min = 0.0))]
    pub battery_cycle_cost_eur_per_kwh: f64,
    #[validate(range(min = 0.0, max = 100.0))]
    pub min_soc_percent: f64,
    #[validate(range(min = 0.0, max = 100.0))]
    pub max_soc_percent: f64,
    #[validate(range(min = 0.0, max = 100.0))]
    pub reserve_soc_percent: f64,
    /// Static, manually maintained SoC used by the planner's safety checks.
    #[validate(range(min = 0.0, max = 100.0))]
    pub assumed_current_soc_percent: Option<f64>,

    // Location & providers
    pub location_lat: Option<f64>,
    pub location_lon: Option<f64>,
    pub tibber_token: Option<String>,
    pub tibber_home_id: Option<String>,
    #[validate(range(min = 0.0))]
    pub pv_peak_watts: Option<f64>,
    pub solar_forecast_enabled: bool,
    #[validate(range(min = 0.0))]
    pub base_load_watts: f64,

    // Execution (write) and telemetry (read) backends
    pub executor_backend: String,
    pub telemetry_backend: String,
    pub modbus_address: Option<String>,
    pub modbus_unit_id: u8,

    // Bus reliability parameters
    pub dbus_reassert_attempts: u32,
    pub dbus_write_retries: u32,
    #[validate(range(min = 0.0))]
    pub dbus_write_retry_delay_seconds: f64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            planning_window_seconds: 900,
            planning_horizon_hours: 24,
            recalculation_interval_seconds: 300,
            dbus_update_interval_seconds: 10,
            telemetry_update_interval_seconds: 10,
            counters_update_interval_seconds: 60,
            minimum_action_dwell_seconds: 0,
            dwell_seconds_charge_from_grid: None,
            dwell_seconds_discharge_to_load: None,
            dwell_seconds_export_to_grid: None,
            dwell_seconds_idle: None,
            log_level: "INFO".to_string(),
            data_dir: "/data/helios".to_string(),

            price_provider: "stub".to_string(),
            price_hysteresis_eur_per_kwh: 0.02,
            buy_price_multiplier: 1.0,
            buy_price_fixed_fee_eur_per_kwh: 0.0,
            sell_price_multiplier: 1.0,
            sell_price_fixed_deduction_eur_per_kwh: 0.0,
            grid_sell_enabled: false,

            grid_import_limit_w: None,
            grid_export_limit_w: None,
            grid_ramp_w_per_second: None,

            battery_capacity_kwh: None,
            battery_charge_limit_w: None,
            battery_discharge_limit_w: None,
            battery_roundtrip_efficiency_percent: 90.0,
            battery_cycle_cost_eur_per_kwh: 0.02,
            min_soc_percent: 10.0,
            max_soc_percent: 95.0,
            reserve_soc_percent: 40.0,
            assumed_current_soc_percent: None,

            location_lat: None,
            location_lon: None,
            tibber_token: None,
            tibber_home_id: None,
            pv_peak_watts: Some(4000.0),
            solar_forecast_enabled: false,
            base_load_watts: 0.0,

            executor_backend: "noop".to_string(),
            telemetry_backend: "noop".to_string(),
            modbus_address: None,
            modbus_unit_id: 100,

            dbus_reassert_attempts: 2,
            dbus_write_retries: 2,
            dbus_write_retry_delay_seconds: 0.2,
        }
    }
}

fn invariant_error(code: &'static str, message: impl Into<Cow<'static, str>>) -> ValidationError {
    let mut err = ValidationError::new(code);
    err.message = Some(message.into());
    err
}

/// Setpoints travel as a signed 16-bit register; larger limits cannot be written.
pub const MAX_SETPOINT_LIMIT_W: u32 = i16::MAX as u32;

fn validate_invariants(s: &Settings) -> Result<(), ValidationError> {
    if s.recalculation_interval_seconds > s.planning_window_seconds {
        return Err(invariant_error(
            "recalc_interval",
            "recalculation_interval_seconds must be <= planning_window_seconds",
        ));
    }
    if !(0.0 <= s.min_soc_percent
        && s.min_soc_percent <= s.max_soc_percent
        && s.max_soc_percent <= 100.0)
    {
        return Err(invariant_error(
            "soc_bounds",
            "SoC bounds must satisfy 0 <= min <= max <= 100",
        ));
    }
    if !(s.min_soc_percent <= s.reserve_soc_percent && s.reserve_soc_percent <= s.max_soc_percent) {
        return Err(invariant_error(
            "reserve_soc",
            "reserve_soc_percent must be between min_soc_percent and max_soc_percent",
        ));
    }
    let limits = [
        ("grid_import_limit_w", s.grid_import_limit_w),
        ("grid_export_limit_w", s.grid_export_limit_w),
        ("battery_charge_limit_w", s.battery_charge_limit_w),
        ("battery_discharge_limit_w", s.battery_discharge_limit_w),
    ];
    if let Some((name, _)) = limits
        .iter()
        .find(|(_, limit)| limit.is_some_and(|w| w > MAX_SETPOINT_LIMIT_W))
    {
        return Err(invariant_error(
            "setpoint_range",
            format!("{name} must be <= {MAX_SETPOINT_LIMIT_W} W"),
        ));
    }
    Ok(())
}

impl Settings {
    pub fn validated(self) -> Result<Self, ConfigError> {
        self.validate()?;
        Ok(self)
    }

    pub fn roundtrip_efficiency(&self) -> f64 {
        (self.battery_roundtrip_efficiency_percent / 100.0).clamp(0.0, 1.0)
    }

    /// Per-action dwell overrides; actions without one use the global minimum.
    pub fn per_action_dwell_seconds(&self) -> HashMap<Action, u32> {
        [
            (Action::ChargeFromGrid, self.dwell_seconds_charge_from_grid),
            (Action::DischargeToLoad, self.dwell_seconds_discharge_to_load),
            (Action::ExportToGrid, self.dwell_seconds_export_to_grid),
            (Action::Idle, self.dwell_seconds_idle),
        ]
        .into_iter()
        .filter_map(|(action, secs)| secs.map(|s| (action, s)))
        .collect()
    }

    /// Settings as shown to API clients: secrets replaced by presence flags.
    pub fn to_public_json(&self) -> Value {
        let mut map = self.sanitized_map();
        map.insert(
            "tibber_token_present".to_string(),
            Value::Bool(self.tibber_token.as_deref().is_some_and(|t| !t.is_empty())),
        );
        Value::Object(map)
    }

    fn sanitized_map(&self) -> Map<String, Value> {
        let mut map = match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        for key in SECRET_FIELDS {
            map.remove(key);
        }
        map
    }

    pub fn settings_path(data_dir: impl AsRef<Path>) -> PathBuf {
        data_dir.as_ref().join(SETTINGS_FILE)
    }

    /// Writes a copy without secrets to `<data_dir>/settings.json`.
    pub fn persist_to_disk(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&self.data_dir)?;
        let body = serde_json::to_string_pretty(&Value::Object(self.sanitized_map()))?;
        std::fs::write(Self::settings_path(&self.data_dir), body)?;
        Ok(())
    }

    /// Reads persisted settings, dropping keys this version does not know.
    pub fn load_from_disk(data_dir: impl AsRef<Path>) -> Result<Option<Map<String, Value>>, ConfigError> {
        let path = Self::settings_path(data_dir);
        if !path.exists() {
            return Ok(None);
        }
        let raw: Value = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        let known = match serde_json::to_value(Settings::default()) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        let sanitized = match raw {
            Value::Object(map) => map
                .into_iter()
                .filter(|(k, _)| known.contains_key(k))
                .collect(),
            _ => Map::new(),
        };
        Ok(Some(sanitized))
    }
}

/// Partial settings change. Fields left `None` keep their current value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigUpdate {
    pub planning_window_seconds: Option<u32>,
    pub planning_horizon_hours: Option<u32>,
    pub recalculation_interval_seconds: Option<u32>,
    pub dbus_update_interval_seconds: Option<u32>,
    pub telemetry_update_interval_seconds: Option<u32>,
    pub counters_update_interval_seconds: Option<u32>,
    pub minimum_action_dwell_seconds: Option<u32>,
    pub dwell_seconds_charge_from_grid: Option<u32>,
    pub dwell_seconds_discharge_to_load: Option<u32>,
    pub dwell_seconds_export_to_grid: Option<u32>,
    pub dwell_seconds_idle: Option<u32>,

    pub price_provider: Option<String>,
    pub price_hysteresis_eur_per_kwh: Option<f64>,
    pub buy_price_multiplier: Option<f64>,
    pub buy_price_fixed_fee_eur_per_kwh: Option<f64>,
    pub sell_price_multiplier: Option<f64>,
    pub sell_price_fixed_deduction_eur_per_kwh: Option<f64>,
    pub grid_sell_enabled: Option<bool>,

    pub grid_import_limit_w: Option<u32>,
    pub grid_export_limit_w: Option<u32>,
    pub grid_ramp_w_per_second: Option<u32>,

    pub battery_capacity_kwh: Option<f64>,
    pub battery_charge_limit_w: Option<u32>,
    pub battery_discharge_limit_w: Option<u32>,
    pub battery_roundtrip_efficiency_percent: Option<f64>,
    pub battery_cycle_cost_eur_per_kwh: Option<f64>,
    pub min_soc_percent: Option<f64>,
    pub max_soc_percent: Option<f64>,
    pub reserve_soc_percent: Option<f64>,
    pub assumed_current_soc_percent: Option<f64>,

    pub location_lat: Option<f64>,
    pub location_lon: Option<f64>,
    pub tibber_token: Option<String>,
    pub tibber_home_id: Option<String>,
    pub pv_peak_watts: Option<f64>,
    pub solar_forecast_enabled: Option<bool>,
    pub base_load_watts: Option<f64>,

    pub executor_backend: Option<String>,
    pub telemetry_backend: Option<String>,
    pub modbus_address: Option<String>,
    pub modbus_unit_id: Option<u8>,

    pub dbus_reassert_attempts: Option<u32>,
    pub dbus_write_retries: Option<u32>,
    pub dbus_write_retry_delay_seconds: Option<f64>,
}

impl ConfigUpdate {
    /// Returns a new validated snapshot with the updates applied, or an
    /// error leaving `settings` untouched.
    pub fn apply_to(&self, settings: &Settings) -> Result<Settings, ConfigError> {
        let mut current = match serde_json::to_value(settings)? {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        if let Value::Object(updates) = serde_json::to_value(self)? {
            for (key, value) in updates.into_iter().filter(|(_, v)| !v.is_null()) {
                current.insert(key, value);
            }
        }
        let merged: Settings = serde_json::from_value(Value::Object(current))?;
        merged.validated()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(Settings::default().validated().is_ok());
    }

    #[test]
    fn recalc_interval_must_not_exceed_planning_window() {
        let s = Settings {
            planning_window_seconds: 300,
            recalculation_interval_seconds: 600,
            ..Settings::default()
        };
        let err = s.validated().unwrap_err();
        assert!(err.to_string().contains("recalculation_interval_seconds"));
    }

    #[test]
    fn soc_bounds_and_reserve_are_checked() {
        let inverted = Settings {
            min_soc_percent: 50.0,
            max_soc_percent: 40.0,
            ..Settings::default()
        };
        assert!(inverted.validated().is_err());

        let low_reserve = Settings {
            min_soc_percent: 10.0,
            reserve_soc_percent: 5.0,
            max_soc_percent: 90.0,
            ..Settings::default()
        };
        assert!(low_reserve.validated().is_err());

        let ok = Settings {
            min_soc_percent: 10.0,
            reserve_soc_percent: 40.0,
            max_soc_percent: 90.0,
            ..Settings::default()
        };
        assert_eq!(ok.validated().unwrap().min_soc_percent, 10.0);
    }

    #[test]
    fn field_ranges_are_enforced() {
        let s = Settings {
            planning_window_seconds: 30,
            recalculation_interval_seconds: 30,
            ..Settings::default()
        };
        assert!(s.validated().is_err());
    }

    #[test]
    fn limits_beyond_the_setpoint_register_are_rejected() {
        let at_max = Settings {
            grid_import_limit_w: Some(MAX_SETPOINT_LIMIT_W),
            battery_discharge_limit_w: Some(MAX_SETPOINT_LIMIT_W),
            ..Settings::default()
        };
        assert!(at_max.validated().is_ok());

        let too_large = Settings {
            battery_charge_limit_w: Some(40_000),
            ..Settings::default()
        };
        let err = too_large.validated().unwrap_err();
        assert!(err.to_string().contains("battery_charge_limit_w"), "{err}");
    }

    #[test]
    fn update_applies_atomically_and_validates() {
        let settings = Settings {
            planning_window_seconds: 900,
            recalculation_interval_seconds: 300,
            ..Settings::default()
        };

        let update = ConfigUpdate {
            recalculation_interval_seconds: Some(600),
            ..ConfigUpdate::default()
        };
        let updated = update.apply_to(&settings).unwrap();
        assert_eq!(updated.recalculation_interval_seconds, 600);

        let bad = ConfigUpdate {
            recalculation_interval_seconds: Some(1800),
            ..ConfigUpdate::default()
        };
        assert!(bad.apply_to(&settings).is_err());
        assert_eq!(settings.recalculation_interval_seconds, 300);
    }

    #[test]
    fn public_view_hides_secrets() {
        let s = Settings {
            tibber_token: Some("secret".to_string()),
            ..Settings::default()
        };
        let public = s.to_public_json();
        assert!(public.get("tibber_token").is_none());
        assert_eq!(public["tibber_token_present"], Value::Bool(true));
    }

    #[test]
    fn per_action_dwell_only_lists_overrides() {
        let s = Settings {
            dwell_seconds_export_to_grid: Some(600),
            ..Settings::default()
        };
        let map = s.per_action_dwell_seconds();
        assert_eq!(map.len(), 1);
        assert_eq!(map[&Action::ExportToGrid], 600);
    }

    #[test]
    fn persisted_settings_round_trip_without_secrets() {
        let dir = std::env::temp_dir().join(format!("helios-settings-{}", uuid::Uuid::new_v4()));
        let s = Settings {
            data_dir: dir.to_string_lossy().into_owned(),
            tibber_token: Some("secret".to_string()),
            minimum_action_dwell_seconds: 120,
            ..Settings::default()
        };
        s.persist_to_disk().unwrap();

        let loaded = Settings::load_from_disk(&dir).unwrap().unwrap();
        assert!(!loaded.contains_key("tibber_token"));
        assert_eq!(loaded["minimum_action_dwell_seconds"], Value::from(120));
        let _ = std::fs::remove_dir_all(dir);
    }
}
