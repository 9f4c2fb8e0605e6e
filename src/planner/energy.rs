//! Heuristic energy and cost apportionment for plan slots.
//!
//! The numbers are for display and export only. Control never reads them.

use crate::domain::{Action, EnergyFlows, SlotCosts};

#[derive(Debug, Clone, Copy)]
pub struct SlotEnergyInputs {
    pub action: Action,
    pub setpoint_w: i32,
    pub duration_hours: f64,
    pub solar_w: f64,
    pub load_w: f64,
    pub buy_price: f64,
    pub sell_price: f64,
    /// Round-trip efficiency as a fraction in `[0, 1]`.
    pub efficiency: f64,
    pub cycle_cost: f64,
}

pub fn annotate_energy_and_costs(input: &SlotEnergyInputs) -> (EnergyFlows, SlotCosts) {
    let hours = input.duration_hours.max(0.0);
    let kwh = f64::from(input.setpoint_w).abs() * hours / 1000.0;
    let solar_kwh = input.solar_w.max(0.0) * hours / 1000.0;
    let load_kwh = input.load_w.max(0.0) * hours / 1000.0;

    let mut flows = EnergyFlows::default();
    let mut costs = SlotCosts::default();

    match input.setpoint_w {
        sp if sp > 0 && input.action == Action::ChargeFromGrid => {
            flows.grid_to_battery = kwh;
            costs.grid_cost = kwh * input.buy_price;
            costs.battery_cost =
                kwh * input.cycle_cost + kwh * (1.0 - input.efficiency) * input.buy_price;
        }
        sp if sp > 0 => {
            flows.solar_to_usage = load_kwh.min(solar_kwh);
            flows.grid_to_usage = (load_kwh - flows.solar_to_usage).min(kwh);
            costs.grid_cost = kwh * input.buy_price;
        }
        sp if sp < 0 => {
            flows.solar_to_grid = solar_kwh.min(kwh);
            flows.battery_to_grid = kwh - flows.solar_to_grid;
            let efficiency = if input.efficiency > 0.0 { input.efficiency } else { 1.0 };
            costs.battery_cost = flows.battery_to_grid / efficiency * input.cycle_cost;
            costs.grid_savings = kwh * input.sell_price;
        }
        _ => {
            flows.solar_to_usage = load_kwh.min(solar_kwh);
            flows.solar_to_battery = solar_kwh - flows.solar_to_usage;
        }
    }

    (clamp_flows(flows), costs)
}

fn clamp_flows(f: EnergyFlows) -> EnergyFlows {
    EnergyFlows {
        solar_to_grid: f.solar_to_grid.max(0.0),
        solar_to_battery: f.solar_to_battery.max(0.0),
        solar_to_usage: f.solar_to_usage.max(0.0),
        battery_to_grid: f.battery_to_grid.max(0.0),
        battery_to_usage: f.battery_to_usage.max(0.0),
        grid_to_usage: f.grid_to_usage.max(0.0),
        grid_to_battery: f.grid_to_battery.max(0.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(action: Action, setpoint_w: i32) -> SlotEnergyInputs {
        SlotEnergyInputs {
            action,
            setpoint_w,
            duration_hours: 0.5,
            solar_w: 0.0,
            load_w: 0.0,
            buy_price: 0.10,
            sell_price: 0.30,
            efficiency: 0.9,
            cycle_cost: 0.02,
        }
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn charging_attributes_everything_to_grid_to_battery() {
        let (flows, costs) = annotate_energy_and_costs(&inputs(Action::ChargeFromGrid, 2000));
        assert!(close(flows.grid_to_battery, 1.0));
        assert!(close(costs.grid_cost, 0.10));
        // 1 kWh * 0.02 + 1 kWh * 0.1 loss * 0.10
        assert!(close(costs.battery_cost, 0.03));
    }

    #[test]
    fn export_uses_solar_before_battery() {
        let mut input = inputs(Action::ExportToGrid, -2000);
        input.solar_w = 800.0;
        let (flows, costs) = annotate_energy_and_costs(&input);
        assert!(close(flows.solar_to_grid, 0.4));
        assert!(close(flows.battery_to_grid, 0.6));
        assert!(close(costs.grid_savings, 0.3));
        assert!(close(costs.battery_cost, 0.6 / 0.9 * 0.02));
        assert_eq!(costs.grid_cost, 0.0);
    }

    #[test]
    fn import_without_charge_covers_load_after_solar() {
        let mut input = inputs(Action::Idle, 1000);
        input.solar_w = 200.0;
        input.load_w = 1500.0;
        let (flows, costs) = annotate_energy_and_costs(&input);
        assert!(close(flows.solar_to_usage, 0.1));
        assert!(close(flows.grid_to_usage, 0.5));
        assert!(close(costs.grid_cost, 0.05));
    }

    #[test]
    fn idle_routes_solar_surplus_to_battery() {
        let mut input = inputs(Action::Idle, 0);
        input.solar_w = 3000.0;
        input.load_w = 1000.0;
        let (flows, costs) = annotate_energy_and_costs(&input);
        assert!(close(flows.solar_to_usage, 0.5));
        assert!(close(flows.solar_to_battery, 1.0));
        assert_eq!(costs, SlotCosts::default());
    }

    #[test]
    fn zero_efficiency_does_not_divide_by_zero() {
        let mut input = inputs(Action::ExportToGrid, -1000);
        input.efficiency = 0.0;
        let (_, costs) = annotate_energy_and_costs(&input);
        assert!(costs.battery_cost.is_finite());
    }
}
