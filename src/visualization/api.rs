// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-thermal-stress project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! JSON API
//!
//! Read routes serve telemetry and status directly from the shared state.
//! Administrative routes are forwarded to the control loop, which applies
//! them between two cycles and answers once done.

use chrono::NaiveDateTime;
use log::debug;
use rocket::http::Status;
use rocket::response::{status, Responder};
use rocket::serde::json::Json;
use rocket::{get, post, Request, State};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::thermal_regulation::daemon::{AdminCommand, AdminError, AdminReply};
use crate::thermal_regulation::ramp::{RampPlanRequest, RampPlanView};
use crate::thermal_regulation::shared_state::ControllerStatus;
use crate::thermal_regulation::telemetry::{self, ArchiveInfo, Sample, StorageError};

use super::request_guard::AdminAccess;
use super::server::ApiState;

/// Error returned by the API, rendered as `{"error": "..."}`
#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Admin(#[from] AdminError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("{0}")]
    Unavailable(String),
}

impl ApiError {
    pub fn status(&self) -> Status {
        match self {
            ApiError::Admin(AdminError::Unauthorized) => Status::Unauthorized,
            ApiError::Admin(AdminError::InvalidPlan(_)) => Status::UnprocessableEntity,
            ApiError::Admin(AdminError::Halted(_)) | ApiError::Admin(AdminError::Unavailable) => {
                Status::ServiceUnavailable
            }
            ApiError::Admin(AdminError::Storage(_)) => Status::InternalServerError,
            ApiError::Storage(StorageError::InvalidArchiveName(_)) => Status::NotFound,
            ApiError::Storage(StorageError::Io { source, .. })
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                Status::NotFound
            }
            ApiError::Storage(_) => Status::InternalServerError,
            ApiError::Unavailable(_) => Status::ServiceUnavailable,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

impl<'r> Responder<'r, 'static> for ApiError {
    fn respond_to(self, req: &'r Request<'_>) -> rocket::response::Result<'static> {
        let status = self.status();
        debug!("API error {}: {}", status, self);
        status::Custom(
            status,
            Json(ErrorBody {
                error: self.to_string(),
            }),
        )
        .respond_to(req)
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// One telemetry sample as served to clients; the key is the map key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleView {
    pub datetime: NaiveDateTime,
    pub target: Vec<f64>,
    pub actual: Vec<Option<f64>>,
}

impl From<Sample> for SampleView {
    fn from(sample: Sample) -> Self {
        Self {
            datetime: sample.datetime,
            target: sample.target,
            actual: sample.actual,
        }
    }
}

fn keyed(samples: Vec<Sample>) -> BTreeMap<u64, SampleView> {
    samples.into_iter().map(|s| (s.key, SampleView::from(s))).collect()
}

/// Newest sample and tank count
#[derive(Debug, Serialize, Deserialize)]
pub struct CurrentView {
    pub tank_count: usize,
    pub key: Option<u64>,
    pub sample: Option<SampleView>,
}

#[derive(Debug, Deserialize)]
pub struct ClockRequest {
    pub datetime: NaiveDateTime,
}

/// Telemetry newer than `since`, at most `max` samples (capped by the
/// configured batch size)
#[get("/data?<since>&<max>")]
pub async fn get_data(
    since: Option<u64>,
    max: Option<usize>,
    state: &State<ApiState>,
) -> Json<BTreeMap<u64, SampleView>> {
    let limit = state.config.telemetry.max_batch;
    let max = max.map_or(limit, |m| m.min(limit));
    let batch = state.telemetry.lock().await.query(since.unwrap_or(0), max);
    Json(keyed(batch.samples))
}

#[get("/current")]
pub async fn get_current(state: &State<ApiState>) -> Json<CurrentView> {
    let latest = state.telemetry.lock().await.latest().cloned();
    Json(CurrentView {
        tank_count: state.config.tank_count(),
        key: latest.as_ref().map(|s| s.key),
        sample: latest.map(SampleView::from),
    })
}

#[get("/status")]
pub async fn get_status(state: &State<ApiState>) -> Json<ControllerStatus> {
    Json(state.status.read().await.clone())
}

#[get("/ramp")]
pub async fn get_ramp(state: &State<ApiState>) -> ApiResult<RampPlanView> {
    let status = state.status.read().await;
    status
        .plan
        .as_deref()
        .map(|plan| Json(RampPlanView::from(plan)))
        .ok_or_else(|| ApiError::Unavailable("no ramp plan loaded yet".to_string()))
}

async fn submit(state: &State<ApiState>, access: AdminAccess, command: AdminCommand) -> ApiResult<AdminReply> {
    Ok(Json(state.handle.submit(command, access.0).await?))
}

#[post("/ramp", format = "json", data = "<request>")]
pub async fn replace_ramp_json(
    access: AdminAccess,
    request: Json<RampPlanRequest>,
    state: &State<ApiState>,
) -> ApiResult<AdminReply> {
    submit(state, access, AdminCommand::ReplacePlan(request.into_inner())).await
}

#[post("/ramp", format = "text", data = "<text>")]
pub async fn replace_ramp_text(
    access: AdminAccess,
    text: String,
    state: &State<ApiState>,
) -> ApiResult<AdminReply> {
    submit(state, access, AdminCommand::ReplacePlanText(text)).await
}

#[post("/ramp/reset")]
pub async fn reset_ramp(access: AdminAccess, state: &State<ApiState>) -> ApiResult<AdminReply> {
    submit(state, access, AdminCommand::ResetPlan).await
}

#[post("/log/roll")]
pub async fn roll_log(access: AdminAccess, state: &State<ApiState>) -> ApiResult<AdminReply> {
    submit(state, access, AdminCommand::RollLog).await
}

// Archive routes work from the configured log path and never take the
// telemetry lock, so a large download cannot delay the control loop's appends.
#[get("/log/archives")]
pub async fn list_archives(state: &State<ApiState>) -> ApiResult<Vec<ArchiveInfo>> {
    Ok(Json(telemetry::archives(&state.config.telemetry.log_path()).await?))
}

#[get("/log/archives/<name>")]
pub async fn get_archive(
    name: &str,
    state: &State<ApiState>,
) -> ApiResult<BTreeMap<u64, SampleView>> {
    let samples = telemetry::read_archive(&state.config.telemetry.log_path(), name).await?;
    Ok(Json(keyed(samples)))
}

#[post("/pause")]
pub async fn pause(access: AdminAccess, state: &State<ApiState>) -> ApiResult<AdminReply> {
    submit(state, access, AdminCommand::Pause).await
}

#[post("/resume")]
pub async fn resume(access: AdminAccess, state: &State<ApiState>) -> ApiResult<AdminReply> {
    submit(state, access, AdminCommand::Resume).await
}

#[post("/clock", format = "json", data = "<request>")]
pub async fn sync_clock(
    access: AdminAccess,
    request: Json<ClockRequest>,
    state: &State<ApiState>,
) -> ApiResult<AdminReply> {
    submit(state, access, AdminCommand::SyncClock(request.datetime)).await
}

#[post("/reboot")]
pub async fn reboot(access: AdminAccess, state: &State<ApiState>) -> ApiResult<AdminReply> {
    submit(state, access, AdminCommand::Reboot).await
}
