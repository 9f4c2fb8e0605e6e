//! Price-driven dispatch planning.
//!
//! The planner slices the configured horizon into windows and makes one
//! greedy threshold decision per window against the median ("pivot") price
//! of the input series. It never looks ahead across windows.

pub mod energy;

use chrono::{DateTime, Duration, DurationRound, Utc};
use itertools::Itertools;
use std::sync::Arc;
use strum::IntoEnumIterator;
use tracing::debug;

use crate::config::Settings;
use crate::domain::{median, nearest, Action, Plan, PlanSlot, PowerPoint, PricePoint};
use energy::{annotate_energy_and_costs, SlotEnergyInputs};

/// Outcome of the per-window decision rule.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub action: Action,
    pub setpoint_w: i32,
    pub reason: String,
}

pub struct Planner {
    settings: Arc<Settings>,
}

impl Planner {
    pub fn new(settings: Arc<Settings>) -> Self {
        Self { settings }
    }

    pub fn buy_price(&self, raw: f64) -> f64 {
        raw * self.settings.buy_price_multiplier + self.settings.buy_price_fixed_fee_eur_per_kwh
    }

    pub fn sell_price(&self, raw: f64) -> f64 {
        raw * self.settings.sell_price_multiplier
            - self.settings.sell_price_fixed_deduction_eur_per_kwh
    }

    /// First slot start: top of the hour when the window divides an hour
    /// evenly, otherwise `now` itself.
    pub fn horizon_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let window = i64::from(self.settings.planning_window_seconds.max(1));
        if 3600 % window == 0 {
            now.duration_trunc(Duration::hours(1)).unwrap_or(now)
        } else {
            now
        }
    }

    pub fn horizon(&self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let start = self.horizon_start(now);
        let end = start + Duration::hours(i64::from(self.settings.planning_horizon_hours));
        (start, end)
    }

    pub fn build_plan(
        &self,
        price_series: &[PricePoint],
        now: DateTime<Utc>,
        solar_forecast: Option<&[PowerPoint]>,
        load_forecast: Option<&[PowerPoint]>,
    ) -> Plan {
        let window = Duration::seconds(i64::from(self.settings.planning_window_seconds.max(1)));
        let (start, end) = self.horizon(now);
        let pivot = median(price_series.iter().map(|p| p.price)).unwrap_or(0.0);

        let mut slots = Vec::new();
        let mut t = start;
        while t < end {
            let slot_end = (t + window).min(end);
            let mid = t + (slot_end - t) / 2;

            let price_mid = nearest(price_series, mid).map_or(pivot, |p| p.price);
            let decision = self.decide_action(price_mid, pivot);

            let solar_w = solar_forecast
                .and_then(|f| nearest(f, mid))
                .map_or(0.0, |p| p.watts);
            let load_w = load_forecast
                .and_then(|f| nearest(f, mid))
                .map_or(0.0, |p| p.watts);

            let mut slot = PlanSlot::new(t, slot_end, decision.action, decision.setpoint_w);
            let (flows, costs) = annotate_energy_and_costs(&SlotEnergyInputs {
                action: decision.action,
                setpoint_w: decision.setpoint_w,
                duration_hours: slot.duration_hours(),
                solar_w,
                load_w,
                buy_price: self.buy_price(price_mid),
                sell_price: self.sell_price(price_mid),
                efficiency: self.settings.roundtrip_efficiency(),
                cycle_cost: self.settings.battery_cycle_cost_eur_per_kwh,
            });
            slot.reason = decision.reason;
            slot.flows = Some(flows);
            slot.costs = Some(costs);
            slots.push(slot);

            t = slot_end;
        }

        let mut plan = Plan::new(now, self.settings.planning_window_seconds, slots);
        plan.summary = Some(summarize(&plan, pivot));
        debug!(
            slots = plan.slots.len(),
            pivot,
            horizon_start = %start,
            "plan built"
        );
        plan
    }

    /// Single-pass threshold rule. `cheap` is checked before `expensive`, so
    /// a price satisfying both charges.
    pub fn decide_action(&self, price_mid: f64, pivot: f64) -> Decision {
        let s = &self.settings;
        let import_limit = s.grid_import_limit_w.map_or(0, to_watts);
        let export_limit = s.grid_export_limit_w.map_or(0, to_watts);
        let charge_limit = s.battery_charge_limit_w.map_or(import_limit, to_watts);
        let discharge_limit = s.battery_discharge_limit_w.map_or(export_limit, to_watts);
        let hysteresis = s.price_hysteresis_eur_per_kwh;

        let buy = self.buy_price(price_mid);
        let sell = self.sell_price(price_mid);
        let cheap = buy <= pivot - hysteresis;
        let expensive = sell >= pivot + hysteresis;
        let soc = s.assumed_current_soc_percent;

        if cheap && import_limit > 0 {
            if let Some(soc) = soc.filter(|soc| *soc >= s.max_soc_percent) {
                return Decision {
                    action: Action::Idle,
                    setpoint_w: 0,
                    reason: format!(
                        "cheap (buy {buy:.4} <= {:.4}) but SoC {soc:.1}% >= max {:.1}%; hold",
                        pivot - hysteresis,
                        s.max_soc_percent
                    ),
                };
            }
            let setpoint_w = import_limit.min(charge_limit);
            return Decision {
                action: Action::ChargeFromGrid,
                setpoint_w,
                reason: format!(
                    "cheap: buy {buy:.4} <= pivot {pivot:.4} - hysteresis {hysteresis:.4}; import {setpoint_w} W"
                ),
            };
        }

        if s.grid_sell_enabled && expensive && export_limit > 0 {
            if let Some(soc) = soc.filter(|soc| *soc <= s.reserve_soc_percent) {
                return Decision {
                    action: Action::Idle,
                    setpoint_w: 0,
                    reason: format!(
                        "expensive (sell {sell:.4} >= {:.4}) but SoC {soc:.1}% <= reserve {:.1}%; hold",
                        pivot + hysteresis,
                        s.reserve_soc_percent
                    ),
                };
            }
            let setpoint_w = -export_limit.min(discharge_limit);
            return Decision {
                action: Action::ExportToGrid,
                setpoint_w,
                reason: format!(
                    "expensive: sell {sell:.4} >= pivot {pivot:.4} + hysteresis {hysteresis:.4}; export {} W",
                    -setpoint_w
                ),
            };
        }

        Decision {
            action: Action::Idle,
            setpoint_w: 0,
            reason: format!(
                "within band: buy {buy:.4}, sell {sell:.4}, pivot {pivot:.4} +/- {hysteresis:.4}"
            ),
        }
    }
}

fn to_watts(w: u32) -> i32 {
    i32::try_from(w).unwrap_or(i32::MAX)
}

fn summarize(plan: &Plan, pivot: f64) -> String {
    let counts = plan.slots.iter().map(|s| s.action).counts();
    let parts = Action::iter()
        .map(|a| format!("{a}={}", counts.get(&a).copied().unwrap_or(0)))
        .join(" ");
    format!("{parts} pivot={pivot:.4}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};
    use proptest::prelude::*;
    use rstest::rstest;

    fn planner(settings: Settings) -> Planner {
        Planner::new(Arc::new(settings))
    }

    fn hourly_prices(from: DateTime<Utc>, hours: i64, f: impl Fn(i64) -> f64) -> Vec<PricePoint> {
        (0..hours)
            .map(|h| PricePoint::new(from + Duration::hours(h), f(h)))
            .collect()
    }

    #[test]
    fn cheap_price_charges_at_import_limit() {
        let p = planner(Settings {
            grid_import_limit_w: Some(1500),
            grid_export_limit_w: Some(2000),
            ..Settings::default()
        });
        let d = p.decide_action(0.10, 0.20);
        assert_eq!(d.action, Action::ChargeFromGrid);
        assert_eq!(d.setpoint_w, 1500);
    }

    #[test]
    fn expensive_price_exports_when_selling_enabled() {
        let p = planner(Settings {
            grid_import_limit_w: Some(1500),
            grid_export_limit_w: Some(2000),
            grid_sell_enabled: true,
            ..Settings::default()
        });
        let d = p.decide_action(0.30, 0.20);
        assert_eq!(d.action, Action::ExportToGrid);
        assert_eq!(d.setpoint_w, -2000);
    }

    #[test]
    fn expensive_price_idles_when_selling_disabled() {
        let p = planner(Settings {
            grid_export_limit_w: Some(2000),
            ..Settings::default()
        });
        let d = p.decide_action(0.30, 0.20);
        assert_eq!(d.action, Action::Idle);
        assert_eq!(d.setpoint_w, 0);
    }

    #[test]
    fn battery_limits_bound_the_setpoint() {
        let p = planner(Settings {
            grid_import_limit_w: Some(3000),
            battery_charge_limit_w: Some(800),
            grid_export_limit_w: Some(3000),
            battery_discharge_limit_w: Some(1200),
            grid_sell_enabled: true,
            ..Settings::default()
        });
        assert_eq!(p.decide_action(0.10, 0.20).setpoint_w, 800);
        assert_eq!(p.decide_action(0.30, 0.20).setpoint_w, -1200);
    }

    #[rstest]
    #[case(0.19)]
    #[case(0.20)]
    #[case(0.21)]
    fn prices_inside_band_idle(#[case] price: f64) {
        let p = planner(Settings {
            grid_import_limit_w: Some(1500),
            grid_export_limit_w: Some(2000),
            grid_sell_enabled: true,
            ..Settings::default()
        });
        let d = p.decide_action(price, 0.20);
        assert_eq!(d.action, Action::Idle);
        assert_eq!(d.setpoint_w, 0);
    }

    #[test]
    fn no_import_limit_means_no_charging() {
        let p = planner(Settings::default());
        assert_eq!(p.decide_action(0.01, 0.20).action, Action::Idle);
    }

    #[test]
    fn full_battery_is_not_overcharged() {
        let p = planner(Settings {
            grid_import_limit_w: Some(1500),
            assumed_current_soc_percent: Some(95.0),
            ..Settings::default()
        });
        let d = p.decide_action(0.10, 0.20);
        assert_eq!(d.action, Action::Idle);
        assert_eq!(d.setpoint_w, 0);
    }

    #[test]
    fn reserve_is_protected_from_export() {
        let p = planner(Settings {
            grid_export_limit_w: Some(2000),
            grid_sell_enabled: true,
            assumed_current_soc_percent: Some(40.0),
            ..Settings::default()
        });
        let d = p.decide_action(0.30, 0.20);
        assert_eq!(d.action, Action::Idle);
        assert_eq!(d.setpoint_w, 0);
    }

    #[test]
    fn fees_shift_buy_and_sell_prices() {
        let p = planner(Settings {
            buy_price_multiplier: 1.2,
            buy_price_fixed_fee_eur_per_kwh: 0.05,
            sell_price_multiplier: 0.9,
            sell_price_fixed_deduction_eur_per_kwh: 0.01,
            ..Settings::default()
        });
        assert!((p.buy_price(0.10) - 0.17).abs() < 1e-9);
        assert!((p.sell_price(0.10) - 0.08).abs() < 1e-9);
    }

    #[test]
    fn six_hour_horizon_with_quarter_hours_yields_aligned_slots() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 10, 37, 12).unwrap();
        let p = planner(Settings {
            grid_import_limit_w: Some(1000),
            planning_window_seconds: 900,
            planning_horizon_hours: 6,
            ..Settings::default()
        });
        let prices = hourly_prices(now, 48, |h| if h < 12 { 0.10 } else { 0.30 });
        let plan = p.build_plan(&prices, now, None, None);

        assert_eq!(plan.slots.len(), 24);
        assert_eq!(plan.planning_window_seconds, 900);
        let first = plan.slots[0].start;
        assert_eq!((first.hour(), first.minute(), first.second()), (10, 0, 0));
        assert_eq!(plan.slots.last().unwrap().end, first + Duration::hours(6));
    }

    #[test]
    fn odd_window_starts_at_now_and_truncates_last_slot() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 10, 37, 12).unwrap();
        let p = planner(Settings {
            planning_window_seconds: 420,
            recalculation_interval_seconds: 300,
            planning_horizon_hours: 1,
            ..Settings::default()
        });
        let plan = p.build_plan(&[], now, None, None);

        assert_eq!(plan.slots[0].start, now);
        // 3600 / 420 = 8.57 -> 9 slots, the last one 240 s long
        assert_eq!(plan.slots.len(), 9);
        let last = plan.slots.last().unwrap();
        assert_eq!(last.end, now + Duration::hours(1));
        assert_eq!((last.end - last.start).num_seconds(), 240);
    }

    #[test]
    fn empty_price_series_yields_idle_plan() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        let p = planner(Settings {
            grid_import_limit_w: Some(1000),
            planning_horizon_hours: 2,
            ..Settings::default()
        });
        let plan = p.build_plan(&[], now, None, None);
        assert!(plan.slots.iter().all(|s| s.action == Action::Idle));
        assert!(plan.summary.as_deref().unwrap().contains("pivot=0.0000"));
    }

    #[test]
    fn plan_follows_cheap_and_expensive_hours() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        let p = planner(Settings {
            grid_import_limit_w: Some(1000),
            grid_export_limit_w: Some(1000),
            grid_sell_enabled: true,
            planning_window_seconds: 3600,
            planning_horizon_hours: 4,
            ..Settings::default()
        });
        let prices = hourly_prices(now, 4, |h| [0.10, 0.10, 0.30, 0.30][h as usize]);
        let plan = p.build_plan(&prices, now, None, None);

        let actions: Vec<Action> = plan.slots.iter().map(|s| s.action).collect();
        assert_eq!(
            actions,
            vec![
                Action::ChargeFromGrid,
                Action::ChargeFromGrid,
                Action::ExportToGrid,
                Action::ExportToGrid
            ]
        );
        let summary = plan.summary.unwrap();
        assert!(summary.contains("CHARGE_FROM_GRID=2"));
        assert!(summary.contains("EXPORT_TO_GRID=2"));
        assert!(summary.contains("pivot=0.2000"));
    }

    #[test]
    fn slots_carry_energy_annotations() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        let p = planner(Settings {
            grid_import_limit_w: Some(2000),
            planning_window_seconds: 3600,
            planning_horizon_hours: 2,
            ..Settings::default()
        });
        let prices = hourly_prices(now, 2, |h| if h == 0 { 0.10 } else { 0.40 });
        let plan = p.build_plan(&prices, now, None, None);

        let charge = &plan.slots[0];
        assert_eq!(charge.action, Action::ChargeFromGrid);
        let flows = charge.flows.unwrap();
        assert!((flows.grid_to_battery - 2.0).abs() < 1e-9);
        assert!((charge.costs.unwrap().grid_cost - 0.2).abs() < 1e-9);
    }

    proptest! {
        #[test]
        fn slots_cover_horizon_without_gaps(
            window in 60u32..=7200,
            horizon_hours in 1u32..=48,
            offset_secs in 0i64..86_400,
        ) {
            let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(offset_secs);
            let p = planner(Settings {
                planning_window_seconds: window,
                recalculation_interval_seconds: 30,
                planning_horizon_hours: horizon_hours,
                ..Settings::default()
            });
            let plan = p.build_plan(&[], now, None, None);
            let (start, end) = p.horizon(now);

            prop_assert_eq!(plan.slots.first().unwrap().start, start);
            prop_assert_eq!(plan.slots.last().unwrap().end, end);
            for pair in plan.slots.windows(2) {
                prop_assert_eq!(pair[0].end, pair[1].start);
                prop_assert!(pair[0].start < pair[0].end);
            }
            let horizon_secs = i64::from(horizon_hours) * 3600;
            let expected = (horizon_secs + i64::from(window) - 1) / i64::from(window);
            prop_assert_eq!(plan.slots.len() as i64, expected);
        }

        #[test]
        fn slot_for_finds_the_containing_slot(
            window in 60u32..=3600,
            probe in 0i64..(6 * 3600),
        ) {
            let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
            let p = planner(Settings {
                planning_window_seconds: window,
                recalculation_interval_seconds: 30,
                planning_horizon_hours: 6,
                ..Settings::default()
            });
            let plan = p.build_plan(&[], now, None, None);
            let (start, end) = p.horizon(now);
            let t = start + Duration::seconds(probe);

            let slot = plan.slot_for(t).unwrap();
            prop_assert!(slot.start <= t && t < slot.end);
            prop_assert!(plan.slot_for(end).is_none());
            prop_assert!(plan.slot_for(start - Duration::seconds(1)).is_none());
        }
    }

    fn rank(action: Action) -> u8 {
        match action {
            Action::ChargeFromGrid => 0,
            Action::Idle | Action::DischargeToLoad => 1,
            Action::ExportToGrid => 2,
        }
    }

    proptest! {
        #[test]
        fn decision_is_monotone_in_price(
            pivot in 0.0f64..0.6,
            hysteresis in 0.0f64..0.1,
            buy_multiplier in 0.5f64..2.0,
            buy_fee in 0.0f64..0.1,
            sell_multiplier in 0.5f64..2.0,
            sell_deduction in 0.0f64..0.1,
            low in -0.2f64..1.0,
            step in 0.0f64..0.5,
        ) {
            let p = planner(Settings {
                grid_import_limit_w: Some(1500),
                grid_export_limit_w: Some(2000),
                grid_sell_enabled: true,
                price_hysteresis_eur_per_kwh: hysteresis,
                buy_price_multiplier: buy_multiplier,
                buy_price_fixed_fee_eur_per_kwh: buy_fee,
                sell_price_multiplier: sell_multiplier,
                sell_price_fixed_deduction_eur_per_kwh: sell_deduction,
                assumed_current_soc_percent: None,
                ..Settings::default()
            });
            let cheaper = p.decide_action(low, pivot);
            let dearer = p.decide_action(low + step, pivot);

            prop_assert!(
                rank(cheaper.action) <= rank(dearer.action),
                "{} at {} but {} at {}",
                cheaper.action,
                low,
                dearer.action,
                low + step
            );
            for d in [&cheaper, &dearer] {
                match d.action {
                    Action::ChargeFromGrid => prop_assert_eq!(d.setpoint_w, 1500),
                    Action::ExportToGrid => prop_assert_eq!(d.setpoint_w, -2000),
                    _ => prop_assert_eq!(d.setpoint_w, 0),
                }
            }
        }
    }
}
