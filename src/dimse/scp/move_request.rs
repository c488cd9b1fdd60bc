//! SCP side of C-MOVE: resolves the requested identifiers against the
//! index and drives C-STORE sub-operations towards the target AET, either
//! inline (synchronous) or through a store job (asynchronous).

use super::ScpState;
use crate::context::ServerContext;
use crate::dimse::association::pool::AssociationPool;
use crate::dimse::association::server::ServerAssociation;
use crate::dimse::cstore::{MoveOriginator, StoreServiceClassUser};
use crate::dimse::{DicomMessage, DicomMessageWriter, COMMAND_FIELD_C_MOVE_RSP, DATA_SET_MISSING};
use crate::error::{ArcError, Result};
use crate::jobs::store_scu::DicomModalityStoreJob;
use crate::jobs::JobsEngine;
use crate::toolkit;
use crate::types::{QueryRetrieveLevel, ResourceKind, UI, US};
use dicom::core::{DataElement, Tag, VR};
use dicom::dicom_value;
use dicom::dictionary_std::{tags, uids};
use dicom::object::mem::InMemElement;
use dicom::object::InMemDicomObject;
use std::time::Duration;
use tracing::{info, warn};

/// C-MOVE-RSP with sub-operation counters.
struct MoveResponse {
	message_id: US,
	status: US,
	remaining: US,
	completed: US,
	failed: US,
	presentation_context_id: Option<u8>,
}

impl From<MoveResponse> for DicomMessage {
	#[rustfmt::skip]
	fn from(response: MoveResponse) -> Self {
        let mut command = InMemDicomObject::command_from_element_iter([
            DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE)),
            DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_C_MOVE_RSP])),
            DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, dicom_value!(U16, [response.message_id])),
            DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_MISSING])),
            DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [response.status])),
            DataElement::new(tags::NUMBER_OF_COMPLETED_SUBOPERATIONS, VR::US, dicom_value!(U16, [response.completed])),
            DataElement::new(tags::NUMBER_OF_FAILED_SUBOPERATIONS, VR::US, dicom_value!(U16, [response.failed])),
        ]);

        if response.status == 0xFF00 {
            command.put_element(DataElement::new(tags::NUMBER_OF_REMAINING_SUBOPERATIONS, VR::US, dicom_value!(U16, [response.remaining])));
        }

        Self {
            command,
            data: None,
            presentation_context_id: response.presentation_context_id,
        }
    }
}

/// Outcome of one iterator step, mirroring the DIMSE sub-operation model:
/// `Failure` marks the end of the iteration.
#[derive(Debug, PartialEq, Eq)]
pub enum MoveIteration {
	Success,
	Failure,
}

/// Eagerly materialized instance list; each step sends one C-STORE over a
/// lazily opened association to the target.
pub struct SynchronousMove {
	context: ServerContext,
	pool: AssociationPool,
	timeout: Duration,
	originator: Option<MoveOriginator>,
	instances: Vec<String>,
	position: usize,
	client: Option<StoreServiceClassUser>,
}

impl SynchronousMove {
	pub fn new(
		context: ServerContext,
		pool: AssociationPool,
		timeout: Duration,
		public_id: &str,
		originator: Option<MoveOriginator>,
	) -> Result<Self> {
		let instances = context.child_instances(public_id)?;
		Ok(Self {
			context,
			pool,
			timeout,
			originator,
			instances,
			position: 0,
			client: None,
		})
	}

	pub fn sub_operation_count(&self) -> usize {
		self.instances.len()
	}

	pub async fn do_next(&mut self) -> Result<MoveIteration> {
		// Strict bound: one step per instance, then the iteration is over.
		if self.position >= self.instances.len() {
			return Ok(MoveIteration::Failure);
		}

		let public_id = self.instances[self.position].clone();
		self.position += 1;

		let bytes = self.context.read_dicom(&public_id)?;
		let file = toolkit::parse_file(&bytes)?;

		let client = self
			.client
			.get_or_insert_with(|| StoreServiceClassUser::new(self.pool.clone(), self.timeout));
		client
			.store(file, self.originator.as_ref())
			.await
			.map_err(|err| {
				warn!("C-MOVE sub-operation for {public_id} failed: {err}");
				ArcError::NetworkProtocol {
					remote: String::from("move target"),
					status: 0xC000,
				}
			})?;

		Ok(MoveIteration::Success)
	}
}

/// Submits one permissive store job covering all instances and reports a
/// single successful sub-operation.
pub struct AsynchronousMove {
	jobs: JobsEngine,
	job: Option<DicomModalityStoreJob>,
	position: usize,
}

impl AsynchronousMove {
	pub fn new(
		context: ServerContext,
		jobs: JobsEngine,
		pool: AssociationPool,
		timeout: Duration,
		remote_aet: &str,
		public_id: &str,
		originator: Option<MoveOriginator>,
	) -> Result<Self> {
		let instances = context.child_instances(public_id)?;

		let mut job = DicomModalityStoreJob::new(
			context,
			pool,
			UI::from(remote_aet),
			timeout,
			originator,
		);
		job.set_permissive(true)?;
		job.reserve(instances.len())?;
		for instance in instances {
			job.add_instance(instance)?;
		}

		Ok(Self {
			jobs,
			job: Some(job),
			position: 0,
		})
	}

	pub fn sub_operation_count(&self) -> usize {
		1
	}

	pub async fn do_next(&mut self) -> Result<MoveIteration> {
		if self.position > 0 {
			return Ok(MoveIteration::Failure);
		}
		self.position = 1;

		let job = self
			.job
			.take()
			.ok_or(ArcError::BadSequenceOfCalls("the move job was already submitted"))?;
		let id = self.jobs.submit(Box::new(job), 0);
		info!("Submitted C-MOVE store job {id}");
		Ok(MoveIteration::Success)
	}
}

pub enum MoveIterator {
	Synchronous(SynchronousMove),
	Asynchronous(AsynchronousMove),
}

impl MoveIterator {
	fn sub_operation_count(&self) -> usize {
		match self {
			Self::Synchronous(iterator) => iterator.sub_operation_count(),
			Self::Asynchronous(iterator) => iterator.sub_operation_count(),
		}
	}

	async fn do_next(&mut self) -> Result<MoveIteration> {
		match self {
			Self::Synchronous(iterator) => iterator.do_next().await,
			Self::Asynchronous(iterator) => iterator.do_next().await,
		}
	}
}

pub async fn handle(
	association: &ServerAssociation,
	message: DicomMessage,
	state: &ScpState,
) -> anyhow::Result<()> {
	let message_id = message.message_id().unwrap_or(0);
	let presentation_context_id = message.presentation_context_id;

	let respond = |status: US, remaining: US, completed: US, failed: US| MoveResponse {
		message_id,
		status,
		remaining,
		completed,
		failed,
		presentation_context_id,
	};

	let mut iterator = match prepare(association, &message, state, message_id) {
		Ok(iterator) => iterator,
		Err((status, err)) => {
			warn!("C-MOVE refused: {err}");
			association
				.write_message(respond(status, 0, 0, 0), presentation_context_id, state.response_timeout())
				.await?;
			return Ok(());
		}
	};

	let total = iterator.sub_operation_count();
	let mut completed: US = 0;
	let mut failed: US = 0;

	for index in 0..total {
		match iterator.do_next().await {
			Ok(MoveIteration::Success) => completed += 1,
			Ok(MoveIteration::Failure) => break,
			Err(err) => {
				warn!("C-MOVE sub-operation failed: {err}");
				failed += 1;
			}
		}

		let remaining = (total - index - 1) as US;
		if remaining > 0 {
			association
				.write_message(
					respond(0xFF00, remaining, completed, failed),
					presentation_context_id,
					state.response_timeout(),
				)
				.await?;
		}
	}

	// Sub-operation failures downgrade the terminal status to a warning.
	let status = if failed == 0 { 0x0000 } else { 0xB000 };
	association
		.write_message(
			respond(status, 0, completed, failed),
			presentation_context_id,
			state.response_timeout(),
		)
		.await?;

	Ok(())
}

/// Resolves the request to a local resource and builds the iterator.
/// Errors carry the DIMSE status to answer with.
fn prepare(
	association: &ServerAssociation,
	message: &DicomMessage,
	state: &ScpState,
	message_id: US,
) -> std::result::Result<MoveIterator, (US, ArcError)> {
	let target_aet = message
		.str_element(tags::MOVE_DESTINATION)
		.filter(|aet| !aet.is_empty())
		.ok_or_else(|| {
			(
				0xC000,
				ArcError::BadRequest(String::from("C-MOVE-RQ without a move destination")),
			)
		})?;

	let data = message.data.as_ref().ok_or_else(|| {
		(
			0xC000,
			ArcError::BadRequest(String::from("C-MOVE-RQ without an identifier data set")),
		)
	})?;

	let public_id = resolve_public_id(&state.context, data)
		.map_err(|err| (0xA900, err))?;

	// The move target must be a configured modality.
	let modality = state
		.config
		.modality(&target_aet)
		.cloned()
		.ok_or_else(|| {
			(
				0xA801,
				ArcError::InexistentItem(format!("unknown move destination {target_aet}")),
			)
		})?;
	let pool = state.pools.get(&target_aet).cloned().ok_or_else(|| {
		(
			0xA801,
			ArcError::InexistentItem(format!("no association pool for {target_aet}")),
		)
	})?;

	let timeout = if modality.has_timeout() {
		Duration::from_millis(modality.timeout)
	} else {
		Duration::MAX
	};

	// A zero message id means the originator does not expect correlation.
	let originator = (message_id != 0).then(|| MoveOriginator {
		aet: String::from(association.calling_aet()),
		message_id,
	});

	let iterator = if state.config.server.synchronous_c_move {
		info!("Sending resource {public_id} to modality \"{target_aet}\" in synchronous mode");
		MoveIterator::Synchronous(
			SynchronousMove::new(
				state.context.clone(),
				pool,
				timeout,
				&public_id,
				originator,
			)
			.map_err(|err| (0xC000, err))?,
		)
	} else {
		info!("Sending resource {public_id} to modality \"{target_aet}\" in asynchronous mode");
		MoveIterator::Asynchronous(
			AsynchronousMove::new(
				state.context.clone(),
				state.jobs.clone(),
				pool,
				timeout,
				&target_aet,
				&public_id,
				originator,
			)
			.map_err(|err| (0xC000, err))?,
		)
	};

	Ok(iterator)
}

/// Resolves the identifiers to a local public id. With a level tag the
/// level's identifier is used directly; without one, the instance, series,
/// study and patient identifiers are tried in that order.
pub fn resolve_public_id(context: &ServerContext, data: &InMemDicomObject) -> Result<String> {
	let level = data
		.get(tags::QUERY_RETRIEVE_LEVEL)
		.map(InMemElement::to_str)
		.and_then(std::result::Result::ok)
		.and_then(|value| QueryRetrieveLevel::parse(value.trim_end_matches('\0')));

	match level {
		Some(level) => lookup_at_level(context, level.resource_kind(), data)?.ok_or_else(|| {
			ArcError::UnknownResource(format!(
				"no unique local resource matches the C-MOVE identifiers at the {level} level"
			))
		}),
		None => {
			// Tolerance path for peers that omit the level tag.
			for kind in [
				ResourceKind::Instance,
				ResourceKind::Series,
				ResourceKind::Study,
				ResourceKind::Patient,
			] {
				if let Some(public_id) = lookup_at_level(context, kind, data)? {
					return Ok(public_id);
				}
			}
			Err(ArcError::BadRequest(String::from(
				"no usable identifier in C-MOVE-RQ",
			)))
		}
	}
}

fn lookup_at_level(
	context: &ServerContext,
	kind: ResourceKind,
	data: &InMemDicomObject,
) -> Result<Option<String>> {
	let tag = identifier_tag_for(kind, data);

	let Some(value) = data
		.get(tag)
		.map(InMemElement::to_str)
		.and_then(std::result::Result::ok)
		.map(|value| value.trim_end_matches('\0').trim().to_owned())
		.filter(|value| !value.is_empty())
	else {
		return Ok(None);
	};

	let mut matches = context.lookup_identifier_exact(kind, tag, &value)?;
	if matches.len() == 1 {
		Ok(Some(matches.remove(0)))
	} else {
		Ok(None)
	}
}

fn identifier_tag_for(kind: ResourceKind, data: &InMemDicomObject) -> Tag {
	match kind {
		ResourceKind::Patient => tags::PATIENT_ID,
		ResourceKind::Study => {
			let has_accession = data
				.get(tags::ACCESSION_NUMBER)
				.map(InMemElement::to_str)
				.and_then(std::result::Result::ok)
				.is_some_and(|value| !value.trim_end_matches('\0').trim().is_empty());
			if has_accession {
				tags::ACCESSION_NUMBER
			} else {
				tags::STUDY_INSTANCE_UID
			}
		}
		ResourceKind::Series => tags::SERIES_INSTANCE_UID,
		ResourceKind::Instance => tags::SOP_INSTANCE_UID,
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::AppConfig;
	use crate::context::tests_support::stored_context;
	use crate::dimse::association::pool::{AssociationManager, Pool};
	use crate::jobs::JobState;
	use dicom::core::PrimitiveValue;
	use std::sync::Arc;

	fn dataset(fields: &[(Tag, &str)]) -> InMemDicomObject {
		let mut data = InMemDicomObject::new_empty();
		for (tag, value) in fields {
			data.put(DataElement::new(
				*tag,
				crate::dimse::control::vr_of(*tag),
				PrimitiveValue::from(*value),
			));
		}
		data
	}

	fn test_pool() -> AssociationPool {
		Pool::new(
			AssociationManager {
				address: "127.0.0.1:11112".parse().unwrap(),
				calling_aet: String::from("DICOM-ARC"),
				called_aet: String::from("TARGET"),
			},
			1,
			Duration::from_millis(100),
			Duration::from_secs(60),
		)
	}

	#[test]
	fn resolves_with_explicit_level() {
		let config = Arc::new(AppConfig::default());
		let context = stored_context(&config);

		let public_id = resolve_public_id(
			&context,
			&dataset(&[
				(tags::QUERY_RETRIEVE_LEVEL, "IMAGE"),
				(tags::SOP_INSTANCE_UID, "1.2.3.4.5"),
			]),
		)
		.unwrap();

		let instances = context.child_instances(&public_id).unwrap();
		assert_eq!(instances, vec![public_id]);
	}

	#[test]
	fn tolerance_path_without_level_tag() {
		let config = Arc::new(AppConfig::default());
		let context = stored_context(&config);

		// Only a study identifier is present: resolution falls through
		// instance and series and lands on the study.
		let study = resolve_public_id(
			&context,
			&dataset(&[(tags::STUDY_INSTANCE_UID, "1.2.3")]),
		)
		.unwrap();
		assert_eq!(context.child_instances(&study).unwrap().len(), 1);

		assert!(matches!(
			resolve_public_id(&context, &dataset(&[])),
			Err(ArcError::BadRequest(_))
		));
	}

	#[test]
	fn unknown_identifier_is_reported() {
		let config = Arc::new(AppConfig::default());
		let context = stored_context(&config);

		assert!(matches!(
			resolve_public_id(
				&context,
				&dataset(&[
					(tags::QUERY_RETRIEVE_LEVEL, "IMAGE"),
					(tags::SOP_INSTANCE_UID, "9.9.9"),
				]),
			),
			Err(ArcError::UnknownResource(_))
		));
	}

	#[tokio::test]
	async fn synchronous_iteration_ends_with_failure() {
		let config = Arc::new(AppConfig::default());
		let context = stored_context(&config);

		// No instances: the very first DoNext reports the end.
		let mut iterator = SynchronousMove {
			context,
			pool: test_pool(),
			timeout: Duration::from_secs(1),
			originator: None,
			instances: Vec::new(),
			position: 0,
			client: None,
		};
		assert_eq!(iterator.do_next().await.unwrap(), MoveIteration::Failure);
	}

	#[tokio::test]
	async fn asynchronous_move_submits_one_job() {
		let config = Arc::new(AppConfig::default());
		let context = stored_context(&config);
		let jobs = JobsEngine::new();

		let public_id = resolve_public_id(
			&context,
			&dataset(&[(tags::STUDY_INSTANCE_UID, "1.2.3")]),
		)
		.unwrap();

		let mut iterator = AsynchronousMove::new(
			context,
			jobs.clone(),
			test_pool(),
			Duration::from_secs(1),
			"TARGET",
			&public_id,
			Some(MoveOriginator {
				aet: String::from("CALLER"),
				message_id: 7,
			}),
		)
		.unwrap();

		assert_eq!(iterator.sub_operation_count(), 1);
		assert_eq!(iterator.do_next().await.unwrap(), MoveIteration::Success);
		// The iteration is one-shot.
		assert_eq!(iterator.do_next().await.unwrap(), MoveIteration::Failure);

		let queued = jobs.list();
		assert_eq!(queued.len(), 1);
		assert_eq!(queued[0].state, JobState::Pending);
	}
}
