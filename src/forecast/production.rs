use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, DurationRound, Timelike, Utc};
use std::sync::Arc;

use crate::config::Settings;
use crate::domain::PowerPoint;

#[async_trait]
pub trait ForecastProvider: Send + Sync {
    async fn get_solar_forecast(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<PowerPoint>>;
    async fn get_load_forecast(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<PowerPoint>>;
}

/// Which forecast source the settings ask for.
#[derive(Debug, Clone, PartialEq)]
pub enum ForecastSelection {
    Stub,
    SolarCurve {
        peak_w: f64,
        longitude: f64,
        base_load_w: f64,
    },
}

impl ForecastSelection {
    pub fn from_settings(settings: &Settings) -> Self {
        match (settings.solar_forecast_enabled, settings.pv_peak_watts) {
            (true, Some(peak_w)) if peak_w > 0.0 => ForecastSelection::SolarCurve {
                peak_w,
                longitude: settings.location_lon.unwrap_or(0.0),
                base_load_w: settings.base_load_watts,
            },
            _ => ForecastSelection::Stub,
        }
    }

    pub fn build(&self) -> Arc<dyn ForecastProvider> {
        match *self {
            ForecastSelection::Stub => Arc::new(StubForecastProvider),
            ForecastSelection::SolarCurve {
                peak_w,
                longitude,
                base_load_w,
            } => Arc::new(SolarCurveForecastProvider::new(peak_w, longitude, base_load_w)),
        }
    }
}

/// No forecast data; the planner then assumes zero solar and load.
#[derive(Debug, Default, Clone, Copy)]
pub struct StubForecastProvider;

#[async_trait]
impl ForecastProvider for StubForecastProvider {
    async fn get_solar_forecast(&self, _start: DateTime<Utc>, _end: DateTime<Utc>) -> Result<Vec<PowerPoint>> {
        Ok(Vec::new())
    }

    async fn get_load_forecast(&self, _start: DateTime<Utc>, _end: DateTime<Utc>) -> Result<Vec<PowerPoint>> {
        Ok(Vec::new())
    }
}

/// Clear-sky half-sine between sunrise and sunset, plus a flat base load.
pub struct SolarCurveForecastProvider {
    pub peak_w: f64,
    /// Local solar time, hours
    pub sunrise: f64,
    pub sunset: f64,
    pub cloud_factor: f64,
    /// Hours to add to UTC to get local solar time
    pub solar_offset_hours: f64,
    pub base_load_w: f64,
}

impl SolarCurveForecastProvider {
    pub fn new(peak_w: f64, longitude: f64, base_load_w: f64) -> Self {
        Self {
            peak_w,
            sunrise: 7.0,
            sunset: 19.0,
            cloud_factor: 0.75,
            solar_offset_hours: longitude / 15.0,
            base_load_w,
        }
    }

    fn hours(start: DateTime<Utc>, end: DateTime<Utc>) -> impl Iterator<Item = DateTime<Utc>> {
        let first = start.duration_trunc(Duration::hours(1)).unwrap_or(start);
        (0..)
            .map(move |h| first + Duration::hours(h))
            .take_while(move |t| *t < end)
    }

    pub fn solar_watts_at(&self, t: DateTime<Utc>) -> f64 {
        let utc_hours = f64::from(t.hour()) + f64::from(t.minute()) / 60.0;
        let local = (utc_hours + self.solar_offset_hours).rem_euclid(24.0);
        if local < self.sunrise || local > self.sunset {
            return 0.0;
        }
        let day_len = (self.sunset - self.sunrise).max(0.01);
        let x = (local - self.sunrise) / day_len;
        (std::f64::consts::PI * x).sin().max(0.0) * self.peak_w * self.cloud_factor
    }
}

#[async_trait]
impl ForecastProvider for SolarCurveForecastProvider {
    async fn get_solar_forecast(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<PowerPoint>> {
        Ok(Self::hours(start, end)
            .map(|t| PowerPoint::new(t, self.solar_watts_at(t)))
            .collect())
    }

    async fn get_load_forecast(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<PowerPoint>> {
        Ok(Self::hours(start, end)
            .map(|t| PowerPoint::new(t, self.base_load_w))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[tokio::test]
    async fn curve_peaks_at_solar_noon_and_is_dark_at_night() {
        let provider = SolarCurveForecastProvider::new(4000.0, 0.0, 300.0);
        let day = Utc.with_ymd_and_hms(2025, 6, 21, 0, 0, 0).unwrap();
        let solar = provider
            .get_solar_forecast(day, day + Duration::hours(24))
            .await
            .unwrap();

        assert_eq!(solar.len(), 24);
        assert_eq!(solar[2].watts, 0.0);
        assert!((solar[13].watts - 3000.0).abs() < 1e-6);
        assert!(solar.iter().all(|p| p.watts <= 3000.0 + 1e-6));

        let load = provider.get_load_forecast(day, day + Duration::hours(3)).await.unwrap();
        assert!(load.iter().all(|p| p.watts == 300.0));
    }

    #[test]
    fn longitude_shifts_the_curve() {
        // 15 degrees east is one hour ahead of UTC
        let provider = SolarCurveForecastProvider::new(1000.0, 15.0, 0.0);
        let utc_noon = Utc.with_ymd_and_hms(2025, 6, 21, 12, 0, 0).unwrap();
        assert!((provider.solar_watts_at(utc_noon) - 750.0).abs() < 1e-6);
    }

    #[test]
    fn selection_requires_enabled_and_peak() {
        assert_eq!(ForecastSelection::from_settings(&Settings::default()), ForecastSelection::Stub);
        let enabled = Settings {
            solar_forecast_enabled: true,
            ..Settings::default()
        };
        assert!(matches!(
            ForecastSelection::from_settings(&enabled),
            ForecastSelection::SolarCurve { peak_w, .. } if peak_w == 4000.0
        ));
    }
}
