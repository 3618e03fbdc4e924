//! HTTP handlers for the usage ledger query surface and the sweep trigger.
//!
//! Query parameters map directly onto the service filters: comma-separated
//! lists decompose into set filters and time bounds are RFC3339. Parse
//! failures are client errors and never reach the services.

use crate::{
    errors::AppError,
    handlers::AppState,
    services::{ledger_service::RecordFilter, run_service::RunFilter},
};
use axum::{
    Json,
    extract::{Path, Query, State},
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

/// Query params accepted by `GET /records` and `GET /records/{uid}`.
#[derive(Debug, Deserialize)]
pub struct RecordsQuery {
    pub uids: Option<String>,
    pub run_ids: Option<String>,
    pub from_period: Option<String>,
    pub to_period: Option<String>,
}

/// Query params accepted by `GET /runs`.
#[derive(Debug, Deserialize)]
pub struct RunsQuery {
    pub ids: Option<String>,
    pub trigger: Option<String>,
    pub from_time: Option<String>,
    pub to_time: Option<String>,
}

/// Query params accepted by `POST /sweeps`.
#[derive(Debug, Deserialize)]
pub struct SweepQuery {
    pub trigger: Option<String>,
}

/// GET `/records` — range query over the ledger, boundaries clipped to the
/// requested window.
pub async fn get_records(
    State(state): State<AppState>,
    Query(q): Query<RecordsQuery>,
) -> Result<impl IntoResponse, AppError> {
    let filter = record_filter(&q)?;
    let records = state.ledger.query_records(&filter).await?;
    Ok(Json(records))
}

/// GET `/records/{uid}` — same query restricted to one bucket.
pub async fn get_bucket_records(
    State(state): State<AppState>,
    Path(uid): Path<String>,
    Query(q): Query<RecordsQuery>,
) -> Result<impl IntoResponse, AppError> {
    let filter = record_filter(&q)?;
    let records = state.ledger.bucket_records(&uid, &filter).await?;
    Ok(Json(records))
}

/// GET `/runs` — query the sweep audit trail.
pub async fn get_runs(
    State(state): State<AppState>,
    Query(q): Query<RunsQuery>,
) -> Result<impl IntoResponse, AppError> {
    let filter = run_filter(&q)?;
    let runs = state.runs.query_runs(&filter).await?;
    Ok(Json(runs))
}

/// GET `/runs/{id}` — fetch one run, 404 when absent.
pub async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let run_id = parse_uuid(&id, "id")?;
    let run = state
        .runs
        .get_run(run_id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("Run `{run_id}` not found")))?;
    Ok(Json(run))
}

/// POST `/sweeps?trigger=` — run one metering sweep over the catalog and
/// return the closed run. Defaults to trigger "manual".
pub async fn post_sweep(
    State(state): State<AppState>,
    Query(q): Query<SweepQuery>,
) -> Result<impl IntoResponse, AppError> {
    use crate::services::meter_service::BucketCatalog;

    let trigger = q.trigger.as_deref().unwrap_or("manual");
    let buckets = state
        .catalog
        .list_buckets()
        .await
        .map_err(|err| AppError::internal(format!("Failed to list buckets: {err}")))?;
    let run = state.meter.sweep(trigger, &buckets).await?;
    Ok(Json(run))
}

fn record_filter(q: &RecordsQuery) -> Result<RecordFilter, AppError> {
    Ok(RecordFilter {
        bucket_uids: q.uids.as_deref().map(split_list),
        run_ids: q
            .run_ids
            .as_deref()
            .map(|raw| parse_uuid_list(raw, "run_ids"))
            .transpose()?,
        from_period: q
            .from_period
            .as_deref()
            .map(|raw| parse_time(raw, "from_period"))
            .transpose()?,
        to_period: q
            .to_period
            .as_deref()
            .map(|raw| parse_time(raw, "to_period"))
            .transpose()?,
    })
}

fn run_filter(q: &RunsQuery) -> Result<RunFilter, AppError> {
    Ok(RunFilter {
        ids: q
            .ids
            .as_deref()
            .map(|raw| parse_uuid_list(raw, "ids"))
            .transpose()?,
        trigger: q.trigger.clone(),
        from_time: q
            .from_time
            .as_deref()
            .map(|raw| parse_time(raw, "from_time"))
            .transpose()?,
        to_time: q
            .to_time
            .as_deref()
            .map(|raw| parse_time(raw, "to_time"))
            .transpose()?,
    })
}

/// Parse an RFC3339 time bound, normalized to UTC.
fn parse_time(raw: &str, param: &str) -> Result<DateTime<Utc>, AppError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|err| {
            AppError::bad_request(format!(
                "Failed to parse query parameter '{param}'. It must be in RFC3339 format ({err})"
            ))
        })
}

fn parse_uuid(raw: &str, param: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw.trim()).map_err(|_| {
        AppError::bad_request(format!(
            "Failed to parse '{raw}' in parameter '{param}' as a UUID"
        ))
    })
}

/// Decompose a comma-separated list, dropping empty segments.
fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_uuid_list(raw: &str, param: &str) -> Result<Vec<Uuid>, AppError> {
    split_list(raw)
        .iter()
        .map(|value| parse_uuid(value, param))
        .collect()
}
