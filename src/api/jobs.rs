//! Inspection and control of the jobs registry.

use super::{not_found, ApiResult, AppState};
use axum::extract::{Path, State};
use axum::response::{Json, Response};
use axum::Router;
use serde_json::{json, Value};

pub fn routes() -> Router<AppState> {
	use axum::routing::*;

	Router::new()
		.route("/jobs", get(list_jobs))
		.route("/jobs/:id", get(job_details))
		.route("/jobs/:id/cancel", post(cancel))
		.route("/jobs/:id/pause", post(pause))
		.route("/jobs/:id/resume", post(resume))
		.route("/jobs/:id/resubmit", post(resubmit))
}

async fn list_jobs(State(state): State<AppState>) -> Json<Value> {
	let ids = state
		.jobs
		.list()
		.into_iter()
		.map(|info| info.id)
		.collect::<Vec<_>>();
	Json(json!(ids))
}

async fn job_details(
	State(state): State<AppState>,
	Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
	let info = state
		.jobs
		.job_info(&id)
		.ok_or_else(|| not_found(format!("job {id}")))?;
	Ok(Json(serde_json::to_value(info).unwrap_or(Value::Null)))
}

async fn cancel(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Response> {
	state.jobs.cancel(&id)?;
	Ok(super::empty_ok())
}

async fn pause(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Response> {
	state.jobs.pause(&id)?;
	Ok(super::empty_ok())
}

async fn resume(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Response> {
	state.jobs.resume(&id)?;
	Ok(super::empty_ok())
}

async fn resubmit(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Response> {
	state.jobs.resubmit(&id)?;
	Ok(super::empty_ok())
}
