//! Browsing and management of stored resources.

use super::{bad_request, ApiResult, AppState};
use crate::error::ArcError;
use crate::types::ResourceKind;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::Router;
use serde::Deserialize;
use serde_json::{json, Value};

pub fn routes() -> Router<AppState> {
	use axum::routing::*;

	Router::new()
		.route("/system", get(system))
		.route("/statistics", get(statistics))
		.route("/changes", get(changes))
		.route("/tools/generate-uid", post(generate_uid))
		.route(
			"/patients",
			get(|state: State<AppState>| all_of(state, ResourceKind::Patient)),
		)
		.route(
			"/studies",
			get(|state: State<AppState>| all_of(state, ResourceKind::Study)),
		)
		.route(
			"/series",
			get(|state: State<AppState>| all_of(state, ResourceKind::Series)),
		)
		.route(
			"/instances",
			get(|state: State<AppState>| all_of(state, ResourceKind::Instance))
				.post(upload_instance),
		)
		.route("/instances/:id/file", get(instance_file))
		.route("/instances/:id/tags", get(instance_tags))
		.route("/patients/:id/protected", get(get_protection).put(set_protection))
		.route(
			"/patients/:id",
			get(resource_details).delete(delete_resource),
		)
		.route(
			"/studies/:id",
			get(resource_details).delete(delete_resource),
		)
		.route("/series/:id", get(resource_details).delete(delete_resource))
		.route(
			"/instances/:id",
			get(resource_details).delete(delete_resource),
		)
}

async fn system(State(state): State<AppState>) -> Json<Value> {
	Json(json!({
		"Name": "dicom-arc",
		"Version": env!("CARGO_PKG_VERSION"),
		"DicomAet": state.config.server.aet,
		"DicomPort": state.config.server.dimse.port,
		"HttpPort": state.config.server.http.port,
		"OverwriteInstances": state.config.storage.overwrite_instances,
	}))
}

async fn statistics(State(state): State<AppState>) -> ApiResult<Json<Value>> {
	let statistics = state.context.statistics()?;
	Ok(Json(json!({
		"CountPatients": statistics.patients,
		"CountStudies": statistics.studies,
		"CountSeries": statistics.series,
		"CountInstances": statistics.instances,
		"TotalDiskSize": statistics.total_compressed_size,
		"TotalUncompressedSize": statistics.total_uncompressed_size,
	})))
}

#[derive(Deserialize)]
struct ChangesParams {
	#[serde(default)]
	since: i64,
	#[serde(default = "ChangesParams::default_limit")]
	limit: usize,
}

impl ChangesParams {
	const fn default_limit() -> usize {
		100
	}
}

async fn changes(
	State(state): State<AppState>,
	Query(params): Query<ChangesParams>,
) -> ApiResult<Json<Value>> {
	let (entries, done) = state.context.get_changes(params.since, params.limit)?;
	let last = entries.last().map_or(params.since, |change| change.seq);

	let changes = entries
		.iter()
		.map(|change| {
			json!({
				"Seq": change.seq,
				"ChangeType": format!("{:?}", change.change),
				"ID": change.public_id,
				"ResourceType": change.kind.to_string(),
				"Date": change.date,
			})
		})
		.collect::<Vec<_>>();

	Ok(Json(json!({
		"Changes": changes,
		"Done": done,
		"Last": last,
	})))
}

async fn generate_uid(State(state): State<AppState>) -> ApiResult<String> {
	// Deterministically unique thanks to the monotonic sequence counter.
	let sequence = state.context.increment_anonymization_sequence()?;
	Ok(format!("1.2.826.0.1.3680043.10.1452.{sequence}"))
}

async fn all_of(State(state): State<AppState>, kind: ResourceKind) -> ApiResult<Json<Value>> {
	let ids = state.context.index().read(|t| t.all_public_ids(kind))?;
	Ok(Json(json!(ids)))
}

async fn resource_details(
	State(state): State<AppState>,
	Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
	let details = state.context.index().read(|t| {
		let (internal, kind) = t
			.lookup_resource(&id)?
			.ok_or_else(|| ArcError::UnknownResource(id.clone()))?;

		let main_tags = t
			.main_tags(internal)?
			.into_iter()
			.map(|(tag, value)| {
				(
					format!("{:04x},{:04x}", tag.group(), tag.element()),
					Value::String(value),
				)
			})
			.collect::<serde_json::Map<_, _>>();

		let metadata = t
			.all_metadata(internal)?
			.into_iter()
			.map(|(key, value)| (format!("{key:?}"), Value::String(value)))
			.collect::<serde_json::Map<_, _>>();

		let parent = match t.parent_of(internal)? {
			Some(parent) => Value::String(t.public_id(parent)?),
			None => Value::Null,
		};

		Ok(json!({
			"ID": id,
			"Type": kind.to_string(),
			"MainDicomTags": main_tags,
			"Metadata": metadata,
			"Parent": parent,
			"Children": t.children_public_ids(internal)?,
		}))
	})?;

	Ok(Json(details))
}

async fn delete_resource(
	State(state): State<AppState>,
	Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
	let ancestor = state.context.delete_resource(&id)?;
	let body = match ancestor {
		Some((public_id, kind)) => json!({
			"RemainingAncestor": {
				"ID": public_id,
				"Type": kind.to_string(),
			}
		}),
		None => json!({ "RemainingAncestor": Value::Null }),
	};
	Ok(Json(body))
}

async fn upload_instance(State(state): State<AppState>, body: axum::body::Bytes) -> Response {
	match state.context.store(&body, "HTTP") {
		Ok(outcome) => {
			let status = match outcome.status {
				crate::context::StoreStatus::Success => "Success",
				crate::context::StoreStatus::AlreadyStored => "AlreadyStored",
				crate::context::StoreStatus::FilteredOut => "FilteredOut",
				crate::context::StoreStatus::FullStorage => {
					return super::ApiError::from(ArcError::FullStorage).into_response();
				}
				crate::context::StoreStatus::Failure => {
					return super::ApiError::from(ArcError::BadFileFormat(String::from(
						"not a DICOM file",
					)))
					.into_response();
				}
			};
			Json(json!({
				"ID": outcome.instance_id,
				"Status": status,
			}))
			.into_response()
		}
		Err(err) => super::ApiError::from(err).into_response(),
	}
}

async fn instance_file(
	State(state): State<AppState>,
	Path(id): Path<String>,
) -> ApiResult<Response> {
	let bytes = state.context.read_dicom(&id)?;
	Ok((
		StatusCode::OK,
		[(header::CONTENT_TYPE, "application/dicom")],
		bytes,
	)
		.into_response())
}

/// Full tag listing of an instance, served from the DICOM parse cache.
async fn instance_tags(
	State(state): State<AppState>,
	Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
	use dicom::core::header::Header;
	use dicom::object::mem::InMemElement;

	let accessor = state.context.read_parsed(&id)?;
	let parsed = accessor.lock();

	let mut tags_map = serde_json::Map::new();
	for element in &**parsed {
		let tag = element.header().tag;
		if let Ok(value) = InMemElement::to_str(element) {
			tags_map.insert(
				format!("{:04x},{:04x}", tag.group(), tag.element()),
				Value::String(value.trim_end_matches('\0').to_owned()),
			);
		}
	}

	Ok(Json(Value::Object(tags_map)))
}

async fn get_protection(
	State(state): State<AppState>,
	Path(id): Path<String>,
) -> ApiResult<String> {
	let protected = state.context.is_protected_patient(&id)?;
	Ok(String::from(if protected { "1" } else { "0" }))
}

async fn set_protection(
	State(state): State<AppState>,
	Path(id): Path<String>,
	body: String,
) -> ApiResult<Response> {
	let protected = match body.trim() {
		"1" | "true" => true,
		"0" | "false" => false,
		other => return Err(bad_request(format!("not a boolean: {other}"))),
	};
	state.context.set_patient_protection(&id, protected)?;
	Ok(super::empty_ok())
}
