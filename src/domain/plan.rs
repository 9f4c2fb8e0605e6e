use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};
use uuid::Uuid;

/// Dispatch action carried by a plan slot.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    ChargeFromGrid,
    DischargeToLoad,
    ExportToGrid,
    Idle,
}

/// Estimated energy flows for one slot, in kWh. Never negative.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EnergyFlows {
    pub solar_to_grid: f64,
    pub solar_to_battery: f64,
    pub solar_to_usage: f64,
    pub battery_to_grid: f64,
    pub battery_to_usage: f64,
    pub grid_to_usage: f64,
    pub grid_to_battery: f64,
}

/// Estimated money flows for one slot, in currency units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SlotCosts {
    pub grid_cost: f64,
    pub grid_savings: f64,
    /// Degradation plus round-trip loss estimate.
    pub battery_cost: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanSlot {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub action: Action,
    /// Positive imports from the grid, negative exports to it.
    pub target_grid_setpoint_w: i32,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flows: Option<EnergyFlows>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub costs: Option<SlotCosts>,
}

impl PlanSlot {
    pub fn new(
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        action: Action,
        target_grid_setpoint_w: i32,
    ) -> Self {
        Self {
            start,
            end,
            action,
            target_grid_setpoint_w,
            reason: String::new(),
            flows: None,
            costs: None,
        }
    }

    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        t >= self.start && t < self.end
    }

    pub fn duration_hours(&self) -> f64 {
        (self.end - self.start).num_milliseconds() as f64 / 3_600_000.0
    }
}

/// A complete dispatch plan. Built once, then only read; a recalculation
/// replaces the whole value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub planning_window_seconds: u32,
    pub slots: Vec<PlanSlot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl Plan {
    pub fn new(generated_at: DateTime<Utc>, planning_window_seconds: u32, slots: Vec<PlanSlot>) -> Self {
        Self {
            id: Uuid::new_v4(),
            generated_at,
            planning_window_seconds,
            slots,
            summary: None,
        }
    }

    /// Slots are ordered and non-overlapping, so this is a binary search.
    pub fn slot_for(&self, t: DateTime<Utc>) -> Option<&PlanSlot> {
        let idx = self.slots.partition_point(|s| s.end <= t);
        self.slots.get(idx).filter(|s| s.contains(t))
    }

    pub fn valid_from(&self) -> Option<DateTime<Utc>> {
        self.slots.first().map(|s| s.start)
    }

    pub fn valid_until(&self) -> Option<DateTime<Utc>> {
        self.slots.last().map(|s| s.end)
    }

    pub fn next_hours(&self, now: DateTime<Utc>, hours: i64) -> Vec<PlanSlot> {
        let until = now + chrono::Duration::hours(hours);
        self.slots
            .iter()
            .filter(|s| s.end > now && s.start < until)
            .cloned()
            .collect()
    }
}
