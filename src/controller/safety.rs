use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::Settings;

/// Which configured limit cut a requested setpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LimitKind {
    GridImport,
    GridExport,
    BatteryCharge,
    BatteryDischarge,
}

/// Emitted when a commanded setpoint exceeded a limit and was reduced.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PowerLimitViolation {
    pub kind: LimitKind,
    pub commanded_w: i32,
    pub limit_w: i32,
}

/// Hard setpoint bounds from settings. `None` means unbounded in that
/// direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetpointLimits {
    pub grid_import_w: Option<i32>,
    pub grid_export_w: Option<i32>,
    pub battery_charge_w: Option<i32>,
    pub battery_discharge_w: Option<i32>,
}

fn watts(limit: Option<u32>) -> Option<i32> {
    limit.map(|w| i32::try_from(w).unwrap_or(i32::MAX))
}

impl SetpointLimits {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            grid_import_w: watts(settings.grid_import_limit_w),
            grid_export_w: watts(settings.grid_export_limit_w),
            battery_charge_w: watts(settings.battery_charge_limit_w),
            battery_discharge_w: watts(settings.battery_discharge_limit_w),
        }
    }

    /// Clamps grid limits first, then battery limits. Positive values are
    /// only bounded by import/charge, negative ones by export/discharge.
    pub fn clamp(&self, requested_w: i32) -> (i32, Vec<PowerLimitViolation>) {
        let mut violations = Vec::new();
        let mut target = requested_w;

        let steps = [
            (LimitKind::GridImport, self.grid_import_w),
            (LimitKind::GridExport, self.grid_export_w),
            (LimitKind::BatteryCharge, self.battery_charge_w),
            (LimitKind::BatteryDischarge, self.battery_discharge_w),
        ];
        for (kind, limit) in steps {
            let Some(limit) = limit else { continue };
            let bounded = match kind {
                LimitKind::GridImport | LimitKind::BatteryCharge if target > limit => limit,
                LimitKind::GridExport | LimitKind::BatteryDischarge if target < -limit => -limit,
                _ => continue,
            };
            violations.push(PowerLimitViolation {
                kind,
                commanded_w: target,
                limit_w: limit,
            });
            target = bounded;
        }

        for v in &violations {
            warn!(
                limit = ?v.kind,
                commanded_w = v.commanded_w,
                limit_w = v.limit_w,
                "setpoint clamped"
            );
        }
        (target, violations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn charge_limit_clamps_large_import() {
        let limits = SetpointLimits {
            battery_charge_w: Some(500),
            ..SetpointLimits::default()
        };
        let (target, violations) = limits.clamp(3000);
        assert_eq!(target, 500);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].kind, LimitKind::BatteryCharge);
    }

    #[test]
    fn grid_limit_applies_before_battery_limit() {
        let limits = SetpointLimits {
            grid_import_w: Some(2000),
            battery_charge_w: Some(1500),
            ..SetpointLimits::default()
        };
        let (target, violations) = limits.clamp(5000);
        assert_eq!(target, 1500);
        assert_eq!(violations[0].kind, LimitKind::GridImport);
        assert_eq!(violations[1].commanded_w, 2000);
    }

    #[rstest]
    #[case(-3000, -1000)]
    #[case(-800, -800)]
    #[case(2500, 2500)]
    #[case(0, 0)]
    fn discharge_limit_only_bounds_export(#[case] requested: i32, #[case] expected: i32) {
        let limits = SetpointLimits {
            battery_discharge_w: Some(1000),
            ..SetpointLimits::default()
        };
        assert_eq!(limits.clamp(requested).0, expected);
    }

    #[test]
    fn unset_limits_pass_through() {
        let (target, violations) = SetpointLimits::default().clamp(-12_000);
        assert_eq!(target, -12_000);
        assert!(violations.is_empty());
    }
}
