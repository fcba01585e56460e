use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    backup::RecordFilter,
    credentials::CredentialInfo,
    error::{AppError, AppResult},
    models::{SubmissionRecord, SyncStatus},
    scheduler::{JobKind, JobRun},
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct RecordsQuery {
    pub status: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RecordsResponse {
    pub total: usize,
    pub records: Vec<SubmissionRecord>,
}

#[derive(Debug, Deserialize)]
pub struct DeleteRecordsRequest {
    pub request_ids: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct DeleteRecordsResponse {
    pub deleted: usize,
}

pub async fn list_records(
    State(state): State<AppState>,
    Query(query): Query<RecordsQuery>,
) -> AppResult<Json<RecordsResponse>> {
    let sync_status = match query.status.as_deref() {
        None | Some("") => None,
        Some(raw) => Some(raw.parse::<SyncStatus>().map_err(AppError::bad_request)?),
    };
    let records = state
        .orchestrator
        .list_records(RecordFilter { sync_status })
        .await?;
    Ok(Json(RecordsResponse {
        total: records.len(),
        records,
    }))
}

pub async fn get_record(
    State(state): State<AppState>,
    Path(request_id): Path<String>,
) -> AppResult<Json<SubmissionRecord>> {
    state
        .orchestrator
        .get_record(&request_id)
        .await?
        .map(Json)
        .ok_or_else(AppError::not_found)
}

pub async fn delete_records(
    State(state): State<AppState>,
    Json(payload): Json<DeleteRecordsRequest>,
) -> AppResult<Json<DeleteRecordsResponse>> {
    if payload.request_ids.is_empty() {
        return Err(AppError::bad_request("request_ids must not be empty"));
    }
    let deleted = state
        .orchestrator
        .delete_records(payload.request_ids)
        .await?;
    info!(deleted, "backup records deleted");
    Ok(Json(DeleteRecordsResponse { deleted }))
}

pub async fn token_info(State(state): State<AppState>) -> Json<CredentialInfo> {
    Json(state.orchestrator.credential_info().await)
}

pub async fn refresh_token(State(state): State<AppState>) -> AppResult<Json<CredentialInfo>> {
    let info = state.orchestrator.force_refresh().await?;
    info!("credential refreshed on request");
    Ok(Json(info))
}

pub async fn trigger_sync(State(state): State<AppState>) -> (StatusCode, Json<JobRun>) {
    run_job(&state, JobKind::Reconcile).await
}

pub async fn trigger_cleanup(State(state): State<AppState>) -> (StatusCode, Json<JobRun>) {
    run_job(&state, JobKind::Cleanup).await
}

async fn run_job(state: &AppState, kind: JobKind) -> (StatusCode, Json<JobRun>) {
    info!(job = %kind, "manual job trigger");
    let run = state.scheduler.trigger(kind).await;
    let status = match run {
        JobRun::Skipped { .. } => StatusCode::CONFLICT,
        JobRun::Failed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        JobRun::Reconciled { .. } | JobRun::Cleaned { .. } => StatusCode::OK,
    };
    (status, Json(run))
}
