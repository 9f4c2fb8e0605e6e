//! # Power Transition and Ramping
//!
//! Bounds how far the grid setpoint may move in a single control tick so a
//! plan boundary does not turn into an instant multi-kilowatt step.

use serde::{Deserialize, Serialize};

use crate::config::Settings;

/// Power ramp configuration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PowerRampConfig {
    /// Maximum rate of change in W/s. `None` disables ramping.
    pub max_ramp_rate_w_per_s: Option<u32>,
    /// Control interval the rate is multiplied by (seconds, at least 1)
    pub tick_seconds: u32,
}

impl PowerRampConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_ramp_rate_w_per_s: settings.grid_ramp_w_per_second,
            tick_seconds: settings.dbus_update_interval_seconds,
        }
    }

    /// Largest allowed change per tick, if ramping is enabled.
    pub fn max_delta_w(&self) -> Option<i64> {
        self.max_ramp_rate_w_per_s
            .map(|rate| i64::from(rate) * i64::from(self.tick_seconds.max(1)))
    }
}

/// Power ramper - remembers the last applied setpoint and limits each step
#[derive(Debug, Clone)]
pub struct PowerRamp {
    config: PowerRampConfig,
    last_applied_w: Option<i32>,
}

impl PowerRamp {
    pub fn new(config: PowerRampConfig) -> Self {
        Self {
            config,
            last_applied_w: None,
        }
    }

    pub fn set_config(&mut self, config: PowerRampConfig) {
        self.config = config;
    }

    pub fn last_applied_w(&self) -> Option<i32> {
        self.last_applied_w
    }

    /// Next value on the way to `target_w`. Without a previous value the
    /// target is returned unchanged.
    pub fn next_setpoint(&self, target_w: i32) -> i32 {
        let (Some(max_delta), Some(last)) = (self.config.max_delta_w(), self.last_applied_w) else {
            return target_w;
        };
        let delta = i64::from(target_w) - i64::from(last);
        if delta.abs() <= max_delta {
            return target_w;
        }
        let stepped = i64::from(last) + max_delta * delta.signum();
        i32::try_from(stepped).unwrap_or(target_w)
    }

    /// Records a value that actually reached the actuator.
    pub fn record_applied(&mut self, applied_w: i32) {
        self.last_applied_w = Some(applied_w);
    }
}
