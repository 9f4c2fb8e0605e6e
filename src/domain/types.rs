use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Anything positioned on the time axis, so series helpers can work on
/// prices and forecasts alike.
pub trait Timestamped {
    fn at(&self) -> DateTime<Utc>;
}

/// Raw market price at a point in time, currency per kWh.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub at: DateTime<Utc>,
    pub price: f64,
}

impl PricePoint {
    pub fn new(at: DateTime<Utc>, price: f64) -> Self {
        Self { at, price }
    }
}

impl Timestamped for PricePoint {
    fn at(&self) -> DateTime<Utc> {
        self.at
    }
}

/// Forecast power at a point in time (solar production or household load).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PowerPoint {
    pub at: DateTime<Utc>,
    pub watts: f64,
}

impl PowerPoint {
    pub fn new(at: DateTime<Utc>, watts: f64) -> Self {
        Self { at, watts }
    }
}

impl Timestamped for PowerPoint {
    fn at(&self) -> DateTime<Utc> {
        self.at
    }
}

/// Point closest in time to `t`. Ties go to the earlier entry.
pub fn nearest<T: Timestamped>(series: &[T], t: DateTime<Utc>) -> Option<&T> {
    series
        .iter()
        .min_by_key(|p| (p.at() - t).num_milliseconds().unsigned_abs())
}

/// Median of the values, averaging the two middle ones for even lengths.
pub fn median(values: impl IntoIterator<Item = f64>) -> Option<f64> {
    let mut v: Vec<f64> = values.into_iter().filter(|x| !x.is_nan()).collect();
    if v.is_empty() {
        return None;
    }
    v.sort_by(f64::total_cmp);
    let mid = v.len() / 2;
    Some(if v.len() % 2 == 0 {
        (v[mid - 1] + v[mid]) / 2.0
    } else {
        v[mid]
    })
}

/// One live sample from the site. Missing readings stay `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub soc_percent: Option<f64>,
    pub load_w: Option<i32>,
    pub solar_w: Option<i32>,
    pub grid_setpoint_w: Option<i32>,
}

impl TelemetrySnapshot {
    pub fn is_empty(&self) -> bool {
        self.soc_percent.is_none()
            && self.load_w.is_none()
            && self.solar_w.is_none()
            && self.grid_setpoint_w.is_none()
    }
}

/// Cumulative energy counters in kWh as reported by the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EnergyCounters {
    pub grid_import_kwh: f64,
    pub grid_export_kwh: f64,
    pub battery_charged_kwh: f64,
    pub battery_discharged_kwh: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn median_handles_odd_even_and_empty() {
        assert_eq!(median([0.3, 0.1, 0.2]), Some(0.2));
        assert_eq!(median([0.4, 0.1, 0.2, 0.3]), Some(0.25));
        assert_eq!(median(Vec::<f64>::new()), None);
    }

    #[test]
    fn nearest_picks_closest_point() {
        let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let series: Vec<PricePoint> = (0..4)
            .map(|h| PricePoint::new(t0 + Duration::hours(h), h as f64))
            .collect();

        let p = nearest(&series, t0 + Duration::minutes(100)).unwrap();
        assert_eq!(p.price, 2.0);
        // exactly halfway resolves to the earlier point
        let p = nearest(&series, t0 + Duration::minutes(30)).unwrap();
        assert_eq!(p.price, 0.0);
        assert!(nearest::<PricePoint>(&[], t0).is_none());
    }
}
