use axum::{
    extract::{Query, State},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Instant;

use super::error::ApiError;
use super::response::{success, ApiResponse};
use crate::{
    config::ConfigUpdate,
    controller::{AppState, StatusReport},
    domain::Plan,
    planner::Planner,
    repo::{PriceRow, TelemetryRow},
};

const MAX_HISTORY_ROWS: usize = 10_000;
const DEFAULT_HISTORY_ROWS: usize = 500;

type ApiResult<T> = Result<ApiResponse<T>, ApiError>;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/status", get(get_status))
        .route("/plan", get(get_plan))
        .route("/plan/recalculate", post(recalculate_plan))
        .route("/config", get(get_config).put(update_config))
        .route("/automation/pause", post(pause_automation))
        .route("/automation/resume", post(resume_automation))
        .route("/prices", get(get_prices))
        .route("/telemetry/history", get(get_telemetry_history))
        .with_state(state)
}

pub async fn healthz() -> ApiResponse<Value> {
    success(json!({ "status": "ok" }))
}

pub async fn get_status(State(st): State<AppState>) -> ApiResponse<StatusReport> {
    success(st.status().await)
}

#[derive(Debug, Deserialize)]
pub struct PlanQuery {
    /// Only slots overlapping the next N hours
    pub hours: Option<u32>,
}

pub async fn get_plan(State(st): State<AppState>, Query(q): Query<PlanQuery>) -> ApiResult<Plan> {
    let plan = st
        .current_plan()
        .ok_or_else(|| ApiError::NotFound("Plan not ready".to_string()))?;
    let mut plan = Plan::clone(&plan);
    if let Some(hours) = q.hours {
        plan.slots = plan.next_hours(Utc::now(), i64::from(hours));
    }
    let count = plan.slots.len();
    Ok(success(plan).with_count(count))
}

pub async fn recalculate_plan(State(st): State<AppState>) -> ApiResult<Plan> {
    let started = Instant::now();
    let plan = st
        .recalculate_now()
        .await
        .map_err(|e| ApiError::ServiceUnavailable(format!("{e:#}")))?;
    let count = plan.slots.len();
    Ok(success(Plan::clone(&plan))
        .with_count(count)
        .with_duration(started.elapsed().as_millis() as u64))
}

pub async fn get_config(State(st): State<AppState>) -> ApiResponse<Value> {
    success(st.settings().to_public_json())
}

pub async fn update_config(
    State(st): State<AppState>,
    Json(update): Json<ConfigUpdate>,
) -> ApiResult<Value> {
    let settings = st.apply_settings(&update).await?;
    Ok(success(settings.to_public_json()))
}

#[derive(Debug, Serialize)]
pub struct AutomationState {
    pub automation_paused: bool,
}

pub async fn pause_automation(State(st): State<AppState>) -> ApiResponse<AutomationState> {
    st.set_paused(true);
    success(AutomationState {
        automation_paused: st.is_paused(),
    })
}

pub async fn resume_automation(State(st): State<AppState>) -> ApiResponse<AutomationState> {
    st.set_paused(false);
    success(AutomationState {
        automation_paused: st.is_paused(),
    })
}

/// Range bounds as unix seconds.
#[derive(Debug, Default, Deserialize)]
pub struct RangeQuery {
    pub from: Option<i64>,
    pub to: Option<i64>,
    pub limit: Option<usize>,
}

fn parse_ts(name: &str, secs: Option<i64>) -> Result<Option<DateTime<Utc>>, ApiError> {
    secs.map(|s| {
        DateTime::from_timestamp(s, 0)
            .ok_or_else(|| ApiError::BadRequest(format!("{name} is out of range: {s}")))
    })
    .transpose()
}

fn check_order(from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> Result<(), ApiError> {
    match (from, to) {
        (Some(f), Some(t)) if f > t => Err(ApiError::BadRequest("from must not be after to".to_string())),
        _ => Ok(()),
    }
}

/// Adjusted price history; defaults to the current planning horizon.
pub async fn get_prices(State(st): State<AppState>, Query(q): Query<RangeQuery>) -> ApiResult<Vec<PriceRow>> {
    let (from, to) = (parse_ts("from", q.from)?, parse_ts("to", q.to)?);
    check_order(from, to)?;
    let (horizon_start, horizon_end) = Planner::new(st.settings()).horizon(Utc::now());
    let rows = st
        .history
        .prices_between(from.unwrap_or(horizon_start), to.unwrap_or(horizon_end));
    let count = rows.len();
    Ok(success(rows).with_count(count))
}

pub async fn get_telemetry_history(
    State(st): State<AppState>,
    Query(q): Query<RangeQuery>,
) -> ApiResult<Vec<TelemetryRow>> {
    let (from, to) = (parse_ts("from", q.from)?, parse_ts("to", q.to)?);
    check_order(from, to)?;
    let limit = q.limit.unwrap_or(DEFAULT_HISTORY_ROWS).min(MAX_HISTORY_ROWS);
    let rows = st.history.telemetry(from, to, Some(limit));
    let count = rows.len();
    Ok(success(rows).with_count(count))
}
