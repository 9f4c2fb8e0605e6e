use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, DurationRound, Utc};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;
use std::{sync::Arc, time::Duration};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::Settings;
use crate::domain::PricePoint;

pub const TIBBER_API_URL: &str = "https://api.tibber.com/v1-beta/gql";
const TIBBER_CACHE_TTL: Duration = Duration::from_secs(15 * 60);

const TIBBER_QUERY: &str = "{ viewer { homes { id currentSubscription { priceInfo { \
    today { total startsAt } tomorrow { total startsAt } } } } } }";

#[async_trait]
pub trait PriceProvider: Send + Sync {
    /// Raw prices for `[start, end)`, ascending, UTC.
    async fn get_prices(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<PricePoint>>;
}

/// Which price source the settings ask for. Compared structurally to decide
/// whether the cached provider can be kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PriceProviderSelection {
    Stub,
    Tibber {
        token: String,
        home_id: Option<String>,
    },
}

impl PriceProviderSelection {
    /// Tibber without a token falls back to the stub.
    pub fn from_settings(settings: &Settings) -> Self {
        match settings.price_provider.to_ascii_lowercase().as_str() {
            "tibber" => match settings.tibber_token.as_deref().filter(|t| !t.is_empty()) {
                Some(token) => PriceProviderSelection::Tibber {
                    token: token.to_string(),
                    home_id: settings.tibber_home_id.clone(),
                },
                None => {
                    warn!("tibber selected without a token, using stub prices");
                    PriceProviderSelection::Stub
                }
            },
            "stub" => PriceProviderSelection::Stub,
            other => {
                warn!(provider = other, "unknown price provider, using stub prices");
                PriceProviderSelection::Stub
            }
        }
    }

    pub fn build(&self) -> Result<Arc<dyn PriceProvider>> {
        Ok(match self {
            PriceProviderSelection::Stub => Arc::new(StubPriceProvider::default()),
            PriceProviderSelection::Tibber { token, home_id } => Arc::new(
                TibberPriceProvider::new(token.clone(), home_id.clone())?,
            ),
        })
    }
}

/// Hourly sawtooth between `swing_low` and `swing_high`, for development.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StubPriceProvider {
    pub swing_low: f64,
    pub swing_high: f64,
}

impl Default for StubPriceProvider {
    fn default() -> Self {
        Self {
            swing_low: 0.15,
            swing_high: 0.35,
        }
    }
}

#[async_trait]
impl PriceProvider for StubPriceProvider {
    async fn get_prices(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<PricePoint>> {
        let first = start.duration_trunc(ChronoDuration::hours(1)).unwrap_or(start);
        let hours = (end - start).num_hours().max(0);
        let base = (self.swing_high + self.swing_low) / 2.0;
        let amplitude = (self.swing_high - self.swing_low) / 2.0;

        Ok((0..=hours)
            .map(|h| {
                let phase = (h % 24) as f64 / 24.0;
                let price = base + amplitude * (2.0 * phase - 1.0);
                PricePoint::new(
                    first + ChronoDuration::hours(h),
                    (price * 10_000.0).round() / 10_000.0,
                )
            })
            .collect())
    }
}

/// Tibber GraphQL price source. The full today+tomorrow series is cached
/// and sliced per request.
#[derive(Clone)]
pub struct TibberPriceProvider {
    url: String,
    token: String,
    home_id: Option<String>,
    client: reqwest::Client,
    cache: Arc<RwLock<Option<(Instant, Vec<PricePoint>)>>>,
    ttl: Duration,
}

impl TibberPriceProvider {
    pub fn new(token: String, home_id: Option<String>) -> Result<Self> {
        Self::with_endpoint(TIBBER_API_URL.to_string(), token, home_id, TIBBER_CACHE_TTL)
    }

    pub fn with_endpoint(
        url: String,
        token: String,
        home_id: Option<String>,
        ttl: Duration,
    ) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("helios/0.3"));
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .default_headers(headers)
            .build()?;
        Ok(Self {
            url,
            token,
            home_id,
            client,
            cache: Arc::new(RwLock::new(None)),
            ttl,
        })
    }

    async fn fetch(&self) -> Result<Vec<PricePoint>> {
        let resp = self
            .client
            .post(&self.url)
            .bearer_auth(&self.token)
            .json(&serde_json::json!({ "query": TIBBER_QUERY }))
            .send()
            .await
            .context("tibber POST failed")?;
        let status = resp.status();
        let body = resp.text().await.context("tibber read failed")?;
        if !status.is_success() {
            anyhow::bail!("tibber API error: HTTP {status}: {body}");
        }

        let parsed: TibberResponse = serde_json::from_str(&body).context("tibber JSON parse failed")?;
        let homes = parsed.data.map(|d| d.viewer.homes).unwrap_or_default();
        let home = match &self.home_id {
            Some(id) => homes.into_iter().find(|h| h.id.as_deref() == Some(id.as_str())),
            None => homes.into_iter().next(),
        };
        let Some(info) = home
            .and_then(|h| h.current_subscription)
            .and_then(|s| s.price_info)
        else {
            return Ok(Vec::new());
        };

        let mut series: Vec<PricePoint> = info
            .today
            .into_iter()
            .flatten()
            .chain(info.tomorrow.into_iter().flatten())
            .filter_map(|entry| {
                let at = DateTime::parse_from_rfc3339(entry.starts_at.as_deref()?).ok()?;
                Some(PricePoint::new(at.with_timezone(&Utc), entry.total?))
            })
            .collect();
        series.sort_by_key(|p| p.at);
        debug!(points = series.len(), "tibber prices fetched");
        Ok(series)
    }

    async fn series(&self) -> Result<Vec<PricePoint>> {
        {
            let c = self.cache.read().await;
            if let Some((fetched_at, series)) = &*c {
                if fetched_at.elapsed() < self.ttl {
                    return Ok(series.clone());
                }
            }
        }
        let series = self.fetch().await?;
        *self.cache.write().await = Some((Instant::now(), series.clone()));
        Ok(series)
    }
}

#[async_trait]
impl PriceProvider for TibberPriceProvider {
    async fn get_prices(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<PricePoint>> {
        Ok(self
            .series()
            .await?
            .into_iter()
            .filter(|p| start <= p.at && p.at < end)
            .collect())
    }
}

#[derive(Debug, Deserialize)]
struct TibberResponse {
    data: Option<TibberData>,
}

#[derive(Debug, Deserialize)]
struct TibberData {
    viewer: TibberViewer,
}

#[derive(Debug, Deserialize)]
struct TibberViewer {
    #[serde(default)]
    homes: Vec<TibberHome>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TibberHome {
    id: Option<String>,
    current_subscription: Option<TibberSubscription>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TibberSubscription {
    price_info: Option<TibberPriceInfo>,
}

#[derive(Debug, Deserialize)]
struct TibberPriceInfo {
    today: Option<Vec<TibberPrice>>,
    tomorrow: Option<Vec<TibberPrice>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TibberPrice {
    total: Option<f64>,
    starts_at: Option<String>,
}
