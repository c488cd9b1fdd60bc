//! The REST surface: resource browsing, admission management and the job
//! submission endpoints.

pub mod jobs;
pub mod modalities;
pub mod resources;

use crate::config::AppConfig;
use crate::context::ServerContext;
use crate::dimse::association::pool::AssociationPools;
use crate::error::ArcError;
use crate::jobs::JobsEngine;
use crate::query_retrieve::QueryRetrieveArchive;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::Router;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
	pub context: ServerContext,
	pub jobs: JobsEngine,
	pub pools: AssociationPools,
	pub queries: Arc<QueryRetrieveArchive>,
	pub config: Arc<AppConfig>,
}

pub fn routes() -> Router<AppState> {
	Router::new()
		.merge(resources::routes())
		.merge(modalities::routes())
		.merge(jobs::routes())
}

/// Error wrapper so handlers can use `?` on [`ArcError`] and still answer
/// with the right status code and a JSON body.
pub struct ApiError(ArcError);

impl From<ArcError> for ApiError {
	fn from(err: ArcError) -> Self {
		Self(err)
	}
}

impl IntoResponse for ApiError {
	fn into_response(self) -> Response {
		let status = self.0.http_status();
		let body = Json(serde_json::json!({
			"HttpStatus": status.as_u16(),
			"Message": self.0.to_string(),
		}));
		(status, body).into_response()
	}
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

pub fn not_found(what: impl Into<String>) -> ApiError {
	ApiError(ArcError::UnknownResource(what.into()))
}

pub fn bad_request(message: impl Into<String>) -> ApiError {
	ApiError(ArcError::BadRequest(message.into()))
}

/// Plain `{}` answer used by synchronous job submissions.
pub fn empty_ok() -> Response {
	(StatusCode::OK, Json(serde_json::json!({}))).into_response()
}
