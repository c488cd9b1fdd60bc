//! Job-submission surface towards remote modalities and peers.

use super::{bad_request, not_found, ApiResult, AppState};
use crate::dimse::control::ControlClient;
use crate::jobs::move_scu::{DicomMoveScuJob, MoveQuery};
use crate::jobs::peer_store::PeerStoreJob;
use crate::jobs::store_scu::DicomModalityStoreJob;
use crate::jobs::{Job, JobStepResult};
use crate::query_retrieve::QueryRetrieveHandler;
use crate::types::{QueryRetrieveLevel, AE, US};
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Json, Response};
use axum::Router;
use dicom::core::Tag;
use dicom::dictionary_std::tags;
use serde::Deserialize;
use serde_json::{json, Value};
use std::str::FromStr;
use std::time::Duration;

pub fn routes() -> Router<AppState> {
	use axum::routing::*;

	Router::new()
		.route("/modalities", get(list_modalities))
		.route("/modalities/:id/echo", post(echo))
		.route("/modalities/:id/query", post(query))
		.route("/modalities/:id/find-worklist", post(find_worklist))
		.route("/modalities/:id/store", post(modality_store))
		.route("/modalities/:id/move", post(modality_move))
		.route("/queries/:id", delete(delete_query))
		.route("/queries/:id/answers", get(query_answers))
		.route("/queries/:id/retrieve", post(retrieve_all))
		.route("/queries/:id/answers/:index/retrieve", post(retrieve_answer))
		.route("/peers/:id/store", post(peer_store))
}

/// Envelope accepted by every job-submission endpoint.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Submission {
	pub resources: Vec<String>,
	pub permissive: bool,
	pub asynchronous: bool,
	pub priority: i32,
	pub local_aet: Option<AE>,
	pub move_originator_aet: Option<AE>,
	#[serde(rename = "MoveOriginatorID")]
	pub move_originator_id: Option<US>,
	pub target_aet: Option<AE>,
}

impl Default for Submission {
	fn default() -> Self {
		Self {
			resources: Vec::new(),
			permissive: false,
			asynchronous: false,
			priority: 0,
			local_aet: None,
			move_originator_aet: None,
			move_originator_id: None,
			target_aet: None,
		}
	}
}

fn control_client(state: &AppState, aet: &str) -> ApiResult<ControlClient> {
	let modality = state
		.config
		.modality(aet)
		.cloned()
		.ok_or_else(|| not_found(format!("modality {aet}")))?;
	let pool = state
		.pools
		.get(aet)
		.cloned()
		.ok_or_else(|| not_found(format!("modality {aet}")))?;
	Ok(ControlClient::new(pool, modality))
}

/// Runs a submitted job either inline (synchronous) or through the engine.
async fn dispatch_job(
	state: &AppState,
	mut job: Box<dyn Job>,
	submission: &Submission,
) -> ApiResult<Response> {
	if submission.asynchronous {
		let id = state.jobs.submit(job, submission.priority);
		return Ok(Json(json!({ "ID": id })).into_response());
	}

	loop {
		match job.step().await {
			JobStepResult::Continue => {}
			JobStepResult::Success => return Ok(super::empty_ok()),
			JobStepResult::Failure(error) => {
				return Err(super::ApiError::from(crate::error::ArcError::Internal(
					error,
				)));
			}
			JobStepResult::Retry(delay) => {
				tokio::time::sleep(delay).await;
			}
		}
	}
}

/// Expands the submitted resource ids (any level) to instance ids.
fn expand_instances(state: &AppState, resources: &[String]) -> ApiResult<Vec<String>> {
	let mut instances = Vec::new();
	for resource in resources {
		instances.extend(state.context.child_instances(resource)?);
	}
	Ok(instances)
}

async fn list_modalities(State(state): State<AppState>) -> Json<Value> {
	let aets = state.pools.aets().collect::<Vec<_>>();
	Json(json!(aets))
}

async fn echo(State(state): State<AppState>, Path(aet): Path<String>) -> ApiResult<Response> {
	let client = control_client(&state, &aet)?;
	if client.echo().await? {
		Ok(super::empty_ok())
	} else {
		Err(bad_request(format!("C-ECHO towards {aet} failed")))
	}
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct QueryRequest {
	#[serde(default = "QueryRequest::default_level")]
	level: String,
	#[serde(default)]
	query: serde_json::Map<String, Value>,
}

impl QueryRequest {
	fn default_level() -> String {
		String::from("STUDY")
	}
}

/// Synchronous C-FIND against a modality; the answers are archived and
/// addressable through `/queries/{id}`.
async fn query(
	State(state): State<AppState>,
	Path(aet): Path<String>,
	Json(request): Json<QueryRequest>,
) -> ApiResult<Json<Value>> {
	let level = QueryRetrieveLevel::parse(&request.level)
		.ok_or_else(|| bad_request(format!("invalid level: {}", request.level)))?;

	let mut fields = Vec::with_capacity(request.query.len());
	for (key, value) in &request.query {
		let tag = parse_tag(key).ok_or_else(|| bad_request(format!("unknown tag: {key}")))?;
		let value = value.as_str().unwrap_or_default();
		fields.push((tag, String::from(value)));
	}

	let client = control_client(&state, &aet)?;
	let answers = client.find(level, &fields).await?;

	let handler = QueryRetrieveHandler {
		remote_aet: aet,
		level,
		query: fields,
		answers,
	};
	let id = state.queries.insert(handler);

	Ok(Json(json!({ "ID": id, "Path": format!("/queries/{id}") })))
}

/// Modality worklist C-FIND. The query is sent as-is and the full answer
/// datasets are returned, since worklist replies may carry non-standard
/// tags.
async fn find_worklist(
	State(state): State<AppState>,
	Path(aet): Path<String>,
	Json(request): Json<QueryRequest>,
) -> ApiResult<Json<Value>> {
	use dicom::core::{DataElement, PrimitiveValue};
	use dicom::object::InMemDicomObject;

	let mut query = InMemDicomObject::new_empty();
	for (key, value) in &request.query {
		let tag = parse_tag(key).ok_or_else(|| bad_request(format!("unknown tag: {key}")))?;
		query.put(DataElement::new(
			tag,
			crate::dimse::control::vr_of(tag),
			PrimitiveValue::from(value.as_str().unwrap_or_default()),
		));
	}

	let client = control_client(&state, &aet)?;
	let answers = client.find_worklist(query).await?;

	let answers = answers
		.iter()
		.map(dataset_to_json)
		.collect::<Vec<_>>();
	Ok(Json(json!(answers)))
}

fn dataset_to_json(dataset: &dicom::object::InMemDicomObject) -> Value {
	use dicom::core::header::Header;
	use dicom::object::mem::InMemElement;

	let mut map = serde_json::Map::new();
	for element in dataset {
		let tag = element.header().tag;
		if let Ok(value) = InMemElement::to_str(element) {
			map.insert(
				format!("{:04x},{:04x}", tag.group(), tag.element()),
				Value::String(value.trim_end_matches('\0').to_owned()),
			);
		}
	}
	Value::Object(map)
}

async fn delete_query(
	State(state): State<AppState>,
	Path(id): Path<String>,
) -> ApiResult<Response> {
	state
		.queries
		.get(&id)
		.ok_or_else(|| not_found(format!("query {id}")))?;
	state.queries.remove(&id);
	Ok(super::empty_ok())
}

async fn query_answers(
	State(state): State<AppState>,
	Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
	let handler = state
		.queries
		.get(&id)
		.ok_or_else(|| not_found(format!("query {id}")))?;
	let indices = (0..handler.answers.len()).collect::<Vec<_>>();
	Ok(Json(json!(indices)))
}

async fn retrieve_all(
	State(state): State<AppState>,
	Path(id): Path<String>,
	Json(submission): Json<Submission>,
) -> ApiResult<Response> {
	retrieve(state, id, None, submission).await
}

async fn retrieve_answer(
	State(state): State<AppState>,
	Path((id, index)): Path<(String, usize)>,
	Json(submission): Json<Submission>,
) -> ApiResult<Response> {
	retrieve(state, id, Some(index), submission).await
}

/// Builds a move job from archived query answers.
async fn retrieve(
	state: AppState,
	id: String,
	index: Option<usize>,
	submission: Submission,
) -> ApiResult<Response> {
	let handler = state
		.queries
		.get(&id)
		.ok_or_else(|| not_found(format!("query {id}")))?;

	let target = submission
		.target_aet
		.clone()
		.or_else(|| submission.local_aet.clone())
		.unwrap_or_else(|| state.config.server.aet.clone());

	let client = control_client(&state, &handler.remote_aet)?;
	let mut job = DicomMoveScuJob::new(client, target);

	let indices: Vec<usize> = match index {
		Some(index) => {
			if index >= handler.answers.len() {
				return Err(not_found(format!("answer {index} of query {id}")));
			}
			vec![index]
		}
		None => (0..handler.answers.len()).collect(),
	};

	for index in indices {
		let identifiers = handler
			.answer_identifiers(index)
			.ok_or_else(|| not_found(format!("answer {index} of query {id}")))?;
		job.add_query(MoveQuery {
			level: handler.level,
			identifiers,
		})
		.map_err(super::ApiError::from)?;
	}

	dispatch_job(&state, Box::new(job), &submission).await
}

/// Bulk C-STORE of local resources towards a modality.
async fn modality_store(
	State(state): State<AppState>,
	Path(aet): Path<String>,
	Json(submission): Json<Submission>,
) -> ApiResult<Response> {
	let modality = state
		.config
		.modality(&aet)
		.cloned()
		.ok_or_else(|| not_found(format!("modality {aet}")))?;
	let pool = state
		.pools
		.get(&aet)
		.cloned()
		.ok_or_else(|| not_found(format!("modality {aet}")))?;

	let timeout = if modality.has_timeout() {
		Duration::from_millis(modality.timeout)
	} else {
		Duration::MAX
	};

	let originator = match (&submission.move_originator_aet, submission.move_originator_id) {
		(Some(aet), Some(message_id)) => Some(crate::dimse::cstore::MoveOriginator {
			aet: aet.clone(),
			message_id,
		}),
		_ => None,
	};

	let mut job = DicomModalityStoreJob::new(
		state.context.clone(),
		pool,
		aet,
		timeout,
		originator,
	);
	job.set_permissive(submission.permissive)
		.map_err(super::ApiError::from)?;

	let instances = expand_instances(&state, &submission.resources)?;
	job.reserve(instances.len()).map_err(super::ApiError::from)?;
	for instance in instances {
		job.add_instance(instance).map_err(super::ApiError::from)?;
	}

	dispatch_job(&state, Box::new(job), &submission).await
}

/// Asks the modality to C-MOVE the given local resources (identified by
/// their UIDs) towards `TargetAet`, defaulting to this server.
async fn modality_move(
	State(state): State<AppState>,
	Path(aet): Path<String>,
	Json(submission): Json<Submission>,
) -> ApiResult<Response> {
	let client = control_client(&state, &aet)?;
	let target = submission
		.target_aet
		.clone()
		.or_else(|| submission.local_aet.clone())
		.unwrap_or_else(|| state.config.server.aet.clone());

	let mut job = DicomMoveScuJob::new(client, target);
	for resource in &submission.resources {
		job.add_query(move_query_of(&state, resource)?)
			.map_err(super::ApiError::from)?;
	}

	dispatch_job(&state, Box::new(job), &submission).await
}

/// Derives the C-MOVE identifiers of a local resource from its stored
/// identifier tags.
fn move_query_of(state: &AppState, public_id: &str) -> ApiResult<MoveQuery> {
	let (kind, identifiers) = state
		.context
		.index()
		.read(|t| {
			let (id, kind) = t.lookup_resource(public_id)?.ok_or_else(|| {
				crate::error::ArcError::UnknownResource(String::from(public_id))
			})?;

			let mut identifiers = Vec::new();
			let mut current = Some(id);
			while let Some(resource) = current {
				let main_tags = t.main_tags(resource)?;
				for tag in [
					tags::PATIENT_ID,
					tags::STUDY_INSTANCE_UID,
					tags::SERIES_INSTANCE_UID,
					tags::SOP_INSTANCE_UID,
				] {
					if let Some(value) = main_tags.get(&tag) {
						if !identifiers.iter().any(|(existing, _)| *existing == tag) {
							identifiers.push((tag, value.clone()));
						}
					}
				}
				current = t.parent_of(resource)?;
			}
			Ok((kind, identifiers))
		})
		.map_err(super::ApiError::from)?;

	Ok(MoveQuery {
		level: QueryRetrieveLevel::from_resource_kind(kind),
		identifiers,
	})
}

/// Uploads local resources to a configured peer server.
async fn peer_store(
	State(state): State<AppState>,
	Path(name): Path<String>,
	Json(submission): Json<Submission>,
) -> ApiResult<Response> {
	let peer = state
		.config
		.peer(&name)
		.cloned()
		.ok_or_else(|| not_found(format!("peer {name}")))?;

	let mut job = PeerStoreJob::new(state.context.clone(), peer);
	job.set_permissive(submission.permissive)
		.map_err(super::ApiError::from)?;

	let instances = expand_instances(&state, &submission.resources)?;
	job.reserve(instances.len()).map_err(super::ApiError::from)?;
	for instance in instances {
		job.add_instance(instance).map_err(super::ApiError::from)?;
	}

	dispatch_job(&state, Box::new(job), &submission).await
}

/// Accepts `GGGG,EEEE` tag keys as well as standard keyword names.
fn parse_tag(key: &str) -> Option<Tag> {
	if let Ok(tag) = Tag::from_str(key) {
		return Some(tag);
	}

	use dicom::core::dictionary::DataDictionary;
	dicom::dictionary_std::StandardDataDictionary
		.by_name(key)
		.map(|entry| entry.tag.inner())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn submission_envelope_defaults() {
		let submission: Submission = serde_json::from_str("{}").unwrap();
		assert!(!submission.permissive);
		assert!(!submission.asynchronous);
		assert_eq!(submission.priority, 0);
		assert!(submission.resources.is_empty());
	}

	#[test]
	fn submission_envelope_fields() {
		let submission: Submission = serde_json::from_str(
			r#"{
				"Resources": ["a", "b"],
				"Permissive": true,
				"Asynchronous": true,
				"Priority": 5,
				"MoveOriginatorAet": "CALLER",
				"MoveOriginatorID": 42
			}"#,
		)
		.unwrap();
		assert_eq!(submission.resources.len(), 2);
		assert!(submission.permissive);
		assert!(submission.asynchronous);
		assert_eq!(submission.priority, 5);
		assert_eq!(submission.move_originator_aet.as_deref(), Some("CALLER"));
		assert_eq!(submission.move_originator_id, Some(42));
	}

	#[test]
	fn tag_keys_parse_both_ways() {
		assert_eq!(parse_tag("0010,0020"), Some(tags::PATIENT_ID));
		assert_eq!(parse_tag("PatientID"), Some(tags::PATIENT_ID));
		assert_eq!(parse_tag("NotATag"), None);
	}
}
