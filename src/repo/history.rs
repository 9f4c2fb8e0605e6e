//! In-memory time series of prices, telemetry and energy counters.
//!
//! Every series is bounded; the oldest rows are evicted first.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

use crate::domain::{EnergyCounters, TelemetrySnapshot};

const DEFAULT_PRICE_ROWS: usize = 24 * 14;
const DEFAULT_TELEMETRY_ROWS: usize = 8640;
const DEFAULT_COUNTER_ROWS: usize = 1440;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceRow {
    pub at: DateTime<Utc>,
    pub raw: f64,
    pub buy: f64,
    pub sell: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRow {
    pub at: DateTime<Utc>,
    pub soc_percent: Option<f64>,
    pub load_w: Option<i32>,
    pub solar_w: Option<i32>,
    pub setpoint_w: Option<i32>,
}

impl TelemetryRow {
    pub fn from_snapshot(at: DateTime<Utc>, snapshot: &TelemetrySnapshot) -> Self {
        Self {
            at,
            soc_percent: snapshot.soc_percent,
            load_w: snapshot.load_w,
            solar_w: snapshot.solar_w,
            setpoint_w: snapshot.grid_setpoint_w,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CounterRow {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub counters: EnergyCounters,
}

#[derive(Debug, Clone, Copy)]
pub struct HistoryLimits {
    pub price_rows: usize,
    pub telemetry_rows: usize,
    pub counter_rows: usize,
}

impl Default for HistoryLimits {
    fn default() -> Self {
        Self {
            price_rows: DEFAULT_PRICE_ROWS,
            telemetry_rows: DEFAULT_TELEMETRY_ROWS,
            counter_rows: DEFAULT_COUNTER_ROWS,
        }
    }
}

pub struct HistoryStore {
    limits: HistoryLimits,
    prices: RwLock<BTreeMap<DateTime<Utc>, PriceRow>>,
    telemetry: RwLock<VecDeque<TelemetryRow>>,
    counters: RwLock<VecDeque<CounterRow>>,
}

impl Default for HistoryStore {
    fn default() -> Self {
        Self::new(HistoryLimits::default())
    }
}

fn push_bounded<T>(rows: &mut VecDeque<T>, row: T, limit: usize) {
    rows.push_back(row);
    while rows.len() > limit.max(1) {
        rows.pop_front();
    }
}

fn within(at: DateTime<Utc>, from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> bool {
    from.map_or(true, |f| at >= f) && to.map_or(true, |t| at <= t)
}

impl HistoryStore {
    pub fn new(limits: HistoryLimits) -> Self {
        Self {
            limits,
            prices: RwLock::new(BTreeMap::new()),
            telemetry: RwLock::new(VecDeque::new()),
            counters: RwLock::new(VecDeque::new()),
        }
    }

    /// Inserts or replaces rows by timestamp.
    pub fn upsert_prices(&self, rows: impl IntoIterator<Item = PriceRow>) {
        let mut prices = self.prices.write();
        for row in rows {
            prices.insert(row.at, row);
        }
        while prices.len() > self.limits.price_rows.max(1) {
            prices.pop_first();
        }
    }

    /// Prices with `from <= at <= to`, ascending.
    pub fn prices_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<PriceRow> {
        if from > to {
            return Vec::new();
        }
        self.prices.read().range(from..=to).map(|(_, r)| *r).collect()
    }

    pub fn record_telemetry(&self, row: TelemetryRow) {
        push_bounded(&mut self.telemetry.write(), row, self.limits.telemetry_rows);
    }

    /// Telemetry within the optional bounds, ascending, keeping only the
    /// most recent `limit` rows when given.
    pub fn telemetry(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Vec<TelemetryRow> {
        let rows = self.telemetry.read();
        let matching: Vec<TelemetryRow> = rows
            .iter()
            .filter(|r| within(r.at, from, to))
            .cloned()
            .collect();
        match limit {
            Some(n) if matching.len() > n => matching[matching.len() - n..].to_vec(),
            _ => matching,
        }
    }

    pub fn latest_telemetry(&self) -> Option<TelemetryRow> {
        self.telemetry.read().back().cloned()
    }

    pub fn record_counters(&self, at: DateTime<Utc>, counters: EnergyCounters) {
        push_bounded(
            &mut self.counters.write(),
            CounterRow { at, counters },
            self.limits.counter_rows,
        );
    }

    pub fn counters(&self, from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> Vec<CounterRow> {
        self.counters
            .read()
            .iter()
            .filter(|r| within(r.at, from, to))
            .copied()
            .collect()
    }
}
