//! High-level SCU operations against one remote modality: C-ECHO, C-FIND
//! with query normalization and manufacturer quirks, modality worklist
//! C-FIND, and C-MOVE.

use super::association::pool::{AssociationPool, PoolError, PresentationParameter};
use super::association::{AssociationError, ChannelError};
use super::cecho::EchoServiceClassUser;
use super::cfind::{FindError, FindServiceClassUser, FindServiceClassUserOptions};
use super::cmove::{CompositeMoveRequest, MoveError, MoveServiceClassUser};
use super::{next_message_id, ReadError, WriteError};
use crate::config::{ModalityManufacturer, RemoteModalityConfig};
use crate::error::{ArcError, Result};
use crate::types::{Priority, QueryInformationModel, QueryRetrieveLevel, US};
use dicom::core::dictionary::{DataDictionary, DataDictionaryEntry};
use dicom::core::{DataElement, PrimitiveValue, Tag, VR};
use dicom::dictionary_std::{tags, StandardDataDictionary};
use dicom::object::InMemDicomObject;
use futures::TryStreamExt;
use std::collections::HashSet;
use std::time::Duration;
use tracing::warn;

// Module tags allowed in outgoing queries, cumulative from the patient
// level down (a series query may constrain study and patient tags too).

const PATIENT_MODULE_TAGS: &[Tag] = &[
	tags::PATIENT_NAME,
	tags::PATIENT_ID,
	tags::PATIENT_BIRTH_DATE,
	tags::PATIENT_BIRTH_TIME,
	tags::PATIENT_SEX,
	tags::OTHER_PATIENT_I_DS,
];

const STUDY_MODULE_TAGS: &[Tag] = &[
	tags::STUDY_DATE,
	tags::STUDY_TIME,
	tags::ACCESSION_NUMBER,
	tags::STUDY_ID,
	tags::STUDY_DESCRIPTION,
	tags::STUDY_INSTANCE_UID,
	tags::REFERRING_PHYSICIAN_NAME,
];

const SERIES_MODULE_TAGS: &[Tag] = &[
	tags::MODALITY,
	tags::SERIES_INSTANCE_UID,
	tags::SERIES_NUMBER,
	tags::SERIES_DATE,
	tags::SERIES_TIME,
	tags::SERIES_DESCRIPTION,
	tags::BODY_PART_EXAMINED,
	tags::PROTOCOL_NAME,
	tags::STATION_NAME,
	tags::MANUFACTURER,
	tags::OPERATORS_NAME,
	tags::PERFORMED_PROCEDURE_STEP_DESCRIPTION,
];

const INSTANCE_MODULE_TAGS: &[Tag] = &[
	tags::SOP_INSTANCE_UID,
	tags::SOP_CLASS_UID,
	tags::INSTANCE_NUMBER,
	tags::IMAGE_POSITION_PATIENT,
	tags::IMAGE_ORIENTATION_PATIENT,
	tags::NUMBER_OF_FRAMES,
	tags::IMAGE_COMMENTS,
	tags::ACQUISITION_NUMBER,
];

const PATIENT_RETRIEVE_KEYS: &[Tag] = &[
	tags::NUMBER_OF_PATIENT_RELATED_STUDIES,
	tags::NUMBER_OF_PATIENT_RELATED_SERIES,
	tags::NUMBER_OF_PATIENT_RELATED_INSTANCES,
];

const STUDY_RETRIEVE_KEYS: &[Tag] = &[
	tags::MODALITIES_IN_STUDY,
	tags::NUMBER_OF_STUDY_RELATED_SERIES,
	tags::NUMBER_OF_STUDY_RELATED_INSTANCES,
	tags::SOP_CLASSES_IN_STUDY,
];

const SERIES_RETRIEVE_KEYS: &[Tag] = &[tags::NUMBER_OF_SERIES_RELATED_INSTANCES];

/// Tags accepted in a query at `level`: the union of the module tags from
/// the patient level down to `level`, plus the level's retrieve keys.
fn allowed_tags(level: QueryRetrieveLevel) -> HashSet<Tag> {
	let mut allowed = HashSet::new();
	allowed.insert(tags::SPECIFIC_CHARACTER_SET);
	allowed.extend(PATIENT_MODULE_TAGS);

	if level >= QueryRetrieveLevel::Study {
		allowed.extend(STUDY_MODULE_TAGS);
	}
	if level >= QueryRetrieveLevel::Series {
		allowed.extend(SERIES_MODULE_TAGS);
	}
	if level == QueryRetrieveLevel::Image {
		allowed.extend(INSTANCE_MODULE_TAGS);
	}

	match level {
		QueryRetrieveLevel::Patient => allowed.extend(PATIENT_RETRIEVE_KEYS),
		QueryRetrieveLevel::Study => allowed.extend(STUDY_RETRIEVE_KEYS),
		QueryRetrieveLevel::Series => allowed.extend(SERIES_RETRIEVE_KEYS),
		QueryRetrieveLevel::Image => {}
	}

	allowed
}

/// Identifier keys that must be present at `level`, from the queried level
/// up to the patient root.
fn mandatory_keys(level: QueryRetrieveLevel) -> Vec<Tag> {
	let mut keys = vec![tags::PATIENT_ID];
	if level >= QueryRetrieveLevel::Study {
		keys.push(tags::STUDY_INSTANCE_UID);
		keys.push(tags::ACCESSION_NUMBER);
	}
	if level >= QueryRetrieveLevel::Series {
		keys.push(tags::SERIES_INSTANCE_UID);
	}
	if level == QueryRetrieveLevel::Image {
		keys.push(tags::SOP_INSTANCE_UID);
	}
	keys
}

pub(crate) fn vr_of(tag: Tag) -> VR {
	StandardDataDictionary
		.by_tag(tag)
		.map(|entry| entry.vr().relaxed())
		.unwrap_or(VR::LO)
}

/// Normalizes a raw query for `level`: drops tags that are not allowed,
/// applies the manufacturer's wildcard quirks, and pads the mandatory keys
/// with the manufacturer's universal match value.
pub fn normalize_query(
	query: &[(Tag, String)],
	level: QueryRetrieveLevel,
	manufacturer: ModalityManufacturer,
) -> Vec<(Tag, String)> {
	let allowed = allowed_tags(level);
	let universal = match manufacturer {
		ModalityManufacturer::Ge => "*",
		_ => "",
	};

	let mut normalized: Vec<(Tag, String)> = Vec::with_capacity(query.len() + 5);
	for (tag, value) in query {
		if !allowed.contains(tag) {
			warn!("Tag not allowed for this C-FIND level, will be ignored: {tag}");
			continue;
		}

		let rewritten = match manufacturer {
			ModalityManufacturer::GenericNoUniversalWildcard if value == "*" => String::new(),
			ModalityManufacturer::GenericNoWildcardInDates
				if value == "*" && vr_of(*tag) == VR::DA =>
			{
				String::new()
			}
			_ => value.clone(),
		};
		normalized.push((*tag, rewritten));
	}

	for key in mandatory_keys(level) {
		if !normalized.iter().any(|(tag, _)| *tag == key) {
			normalized.push((key, String::from(universal)));
		}
	}

	normalized
}

fn build_identifier(fields: &[(Tag, String)], level: Option<QueryRetrieveLevel>) -> InMemDicomObject {
	let mut identifier = InMemDicomObject::new_empty();
	for (tag, value) in fields {
		identifier.put(DataElement::new(
			*tag,
			vr_of(*tag),
			PrimitiveValue::from(value.as_str()),
		));
	}
	if let Some(level) = level {
		identifier.put(DataElement::new(
			tags::QUERY_RETRIEVE_LEVEL,
			VR::CS,
			PrimitiveValue::from(level),
		));
	}
	identifier
}

/// SCU operations over the pooled control association of one remote
/// modality.
pub struct ControlClient {
	pool: AssociationPool,
	remote: RemoteModalityConfig,
	timeout: Duration,
}

impl ControlClient {
	pub fn new(pool: AssociationPool, remote: RemoteModalityConfig) -> Self {
		// A configured timeout of zero selects blocking calls.
		let timeout = if remote.has_timeout() {
			Duration::from_millis(remote.timeout)
		} else {
			Duration::MAX
		};

		Self {
			pool,
			remote,
			timeout,
		}
	}

	pub fn remote_aet(&self) -> &str {
		&self.remote.aet
	}

	pub async fn echo(&self) -> Result<bool> {
		let association = self
			.pool
			.get(PresentationParameter::Control)
			.await
			.map_err(|err| self.map_pool_error(err))?;

		EchoServiceClassUser::new(&association)
			.echo(self.timeout)
			.await
			.map_err(|err| {
				warn!("C-ECHO towards {} failed: {err}", self.remote.aet);
				ArcError::NetworkProtocol {
					remote: self.remote.aet.clone(),
					status: 0xC000,
				}
			})
	}

	/// C-FIND at `level` against the Q/R information model. The query is
	/// normalized before it goes on the wire; answers are collected until
	/// the terminal status.
	pub async fn find(
		&self,
		level: QueryRetrieveLevel,
		query: &[(Tag, String)],
	) -> Result<Vec<InMemDicomObject>> {
		let normalized = normalize_query(query, level, self.remote.manufacturer);
		let identifier = build_identifier(&normalized, Some(level));

		let model = match level {
			QueryRetrieveLevel::Patient => QueryInformationModel::Patient,
			_ => QueryInformationModel::Study,
		};

		self.find_internal(model, identifier).await
	}

	/// Modality worklist C-FIND. The query object is sent as-is: worklist
	/// replies routinely carry non-standard tags, so no normalization
	/// applies and the full datasets are returned.
	pub async fn find_worklist(&self, query: InMemDicomObject) -> Result<Vec<InMemDicomObject>> {
		self.find_internal(QueryInformationModel::Worklist, query)
			.await
	}

	async fn find_internal(
		&self,
		model: QueryInformationModel,
		identifier: InMemDicomObject,
	) -> Result<Vec<InMemDicomObject>> {
		let findscu = FindServiceClassUser::new(self.pool.clone(), self.timeout);
		let options = FindServiceClassUserOptions {
			query_information_model: model,
			identifier,
			message_id: next_message_id(),
			priority: Priority::Medium,
		};

		findscu
			.invoke(options)
			.try_collect()
			.await
			.map_err(|err| self.map_find_error(err))
	}

	/// C-MOVE of the resources selected by `identifiers` (typically taken
	/// from a previous find answer) towards `target_aet`.
	pub async fn move_to(
		&self,
		target_aet: &str,
		level: QueryRetrieveLevel,
		identifiers: &[(Tag, String)],
	) -> Result<()> {
		for key in required_move_keys(level) {
			if !identifiers
				.iter()
				.any(|(tag, value)| *tag == key && !value.is_empty())
			{
				return Err(ArcError::BadRequest(format!(
					"C-MOVE at the {level} level requires {key}"
				)));
			}
		}

		let identifier = build_identifier(identifiers, Some(level));
		let movescu = MoveServiceClassUser::new(self.pool.clone(), self.timeout);
		let request = CompositeMoveRequest {
			identifier,
			message_id: next_message_id(),
			priority: Priority::Medium as US,
			destination: String::from(target_aet),
			presentation_context_id: None,
		};

		movescu
			.invoke(request)
			.await
			.map_err(|err| self.map_move_error(err))
	}

	fn map_pool_error(&self, err: PoolError<AssociationError>) -> ArcError {
		match err {
			PoolError::Timeout => ArcError::Timeout(self.remote.aet.clone()),
			other => {
				warn!("Association with {} failed: {other}", self.remote.aet);
				ArcError::NetworkProtocol {
					remote: self.remote.aet.clone(),
					status: 0xC000,
				}
			}
		}
	}

	fn map_find_error(&self, err: FindError) -> ArcError {
		match err {
			FindError::Refused { status } => ArcError::NetworkProtocol {
				remote: self.remote.aet.clone(),
				status,
			},
			FindError::Unavailable => ArcError::NetworkProtocol {
				remote: self.remote.aet.clone(),
				status: 0xA800,
			},
			FindError::Association(err) => self.map_pool_error(err),
			FindError::Read(err) => self.map_read_error(err),
			FindError::Write(err) => self.map_write_error(err),
		}
	}

	fn map_move_error(&self, err: MoveError) -> ArcError {
		match err {
			MoveError::Refused { status } => ArcError::NetworkProtocol {
				remote: self.remote.aet.clone(),
				status,
			},
			MoveError::Cancelled => ArcError::NetworkProtocol {
				remote: self.remote.aet.clone(),
				status: 0xFE00,
			},
			MoveError::Unavailable => ArcError::NetworkProtocol {
				remote: self.remote.aet.clone(),
				status: 0xA800,
			},
			MoveError::Association(err) => self.map_pool_error(err),
			MoveError::Read(err) => self.map_read_error(err),
			MoveError::Write(err) => self.map_write_error(err),
		}
	}

	fn map_read_error(&self, err: ReadError) -> ArcError {
		if matches!(
			err,
			ReadError::Association(AssociationError::Channel(ChannelError::Timeout))
		) {
			ArcError::Timeout(self.remote.aet.clone())
		} else {
			warn!("DIMSE read from {} failed: {err}", self.remote.aet);
			ArcError::NetworkProtocol {
				remote: self.remote.aet.clone(),
				status: 0xC000,
			}
		}
	}

	fn map_write_error(&self, err: WriteError) -> ArcError {
		if matches!(
			err,
			WriteError::Association(AssociationError::Channel(ChannelError::Timeout))
		) {
			ArcError::Timeout(self.remote.aet.clone())
		} else {
			warn!("DIMSE write to {} failed: {err}", self.remote.aet);
			ArcError::NetworkProtocol {
				remote: self.remote.aet.clone(),
				status: 0xC000,
			}
		}
	}
}

/// Identifier keys a C-MOVE request must carry per level.
fn required_move_keys(level: QueryRetrieveLevel) -> Vec<Tag> {
	match level {
		QueryRetrieveLevel::Patient => vec![tags::PATIENT_ID],
		QueryRetrieveLevel::Study => vec![tags::STUDY_INSTANCE_UID],
		QueryRetrieveLevel::Series => {
			vec![tags::STUDY_INSTANCE_UID, tags::SERIES_INSTANCE_UID]
		}
		QueryRetrieveLevel::Image => vec![
			tags::STUDY_INSTANCE_UID,
			tags::SERIES_INSTANCE_UID,
			tags::SOP_INSTANCE_UID,
		],
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn disallowed_tags_are_dropped() {
		let query = vec![
			(tags::PATIENT_ID, String::from("P1")),
			// A series tag is not allowed at the study level.
			(tags::SERIES_INSTANCE_UID, String::from("1.2.3")),
		];
		let normalized = normalize_query(
			&query,
			QueryRetrieveLevel::Study,
			ModalityManufacturer::Generic,
		);
		assert!(!normalized
			.iter()
			.any(|(tag, _)| *tag == tags::SERIES_INSTANCE_UID));
		assert!(normalized.iter().any(|(tag, _)| *tag == tags::PATIENT_ID));
	}

	#[test]
	fn mandatory_keys_are_padded() {
		let normalized = normalize_query(
			&[],
			QueryRetrieveLevel::Study,
			ModalityManufacturer::Generic,
		);
		for key in [
			tags::PATIENT_ID,
			tags::STUDY_INSTANCE_UID,
			tags::ACCESSION_NUMBER,
		] {
			assert!(normalized
				.iter()
				.any(|(tag, value)| *tag == key && value.is_empty()));
		}
	}

	#[test]
	fn ge_uses_star_as_universal_match() {
		let normalized =
			normalize_query(&[], QueryRetrieveLevel::Patient, ModalityManufacturer::Ge);
		assert_eq!(normalized, vec![(tags::PATIENT_ID, String::from("*"))]);
	}

	#[test]
	fn no_universal_wildcard_quirk_blanks_all_stars() {
		let query = vec![
			(tags::PATIENT_ID, String::new()),
			(tags::ACCESSION_NUMBER, String::from("*")),
			(tags::MODALITIES_IN_STUDY, String::from("CT")),
		];
		let normalized = normalize_query(
			&query,
			QueryRetrieveLevel::Study,
			ModalityManufacturer::GenericNoUniversalWildcard,
		);

		let accession = normalized
			.iter()
			.find(|(tag, _)| *tag == tags::ACCESSION_NUMBER)
			.unwrap();
		assert_eq!(accession.1, "");

		let modalities = normalized
			.iter()
			.find(|(tag, _)| *tag == tags::MODALITIES_IN_STUDY)
			.unwrap();
		assert_eq!(modalities.1, "CT");
	}

	#[test]
	fn no_wildcard_in_dates_quirk_only_touches_date_tags() {
		let query = vec![
			(tags::STUDY_DATE, String::from("*")),
			(tags::ACCESSION_NUMBER, String::from("*")),
		];
		let normalized = normalize_query(
			&query,
			QueryRetrieveLevel::Study,
			ModalityManufacturer::GenericNoWildcardInDates,
		);

		let date = normalized
			.iter()
			.find(|(tag, _)| *tag == tags::STUDY_DATE)
			.unwrap();
		assert_eq!(date.1, "");

		let accession = normalized
			.iter()
			.find(|(tag, _)| *tag == tags::ACCESSION_NUMBER)
			.unwrap();
		assert_eq!(accession.1, "*");
	}

	#[test]
	fn move_keys_per_level() {
		assert_eq!(
			required_move_keys(QueryRetrieveLevel::Patient),
			vec![tags::PATIENT_ID]
		);
		assert!(required_move_keys(QueryRetrieveLevel::Image)
			.contains(&tags::SOP_INSTANCE_UID));
	}
}
