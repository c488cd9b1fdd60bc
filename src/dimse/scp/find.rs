//! SCP side of C-FIND: translates inbound queries into index lookups and
//! streams the answers back as pending responses.

use super::ScpState;
use crate::dimse::association::server::ServerAssociation;
use crate::dimse::control::vr_of;
use crate::dimse::{
	DicomMessage, DicomMessageWriter, COMMAND_FIELD_C_FIND_RSP, DATA_SET_EXISTS, DATA_SET_MISSING,
};
use crate::error::{ArcError, Result};
use crate::index::{ConstraintOp, LookupConstraint};
use crate::toolkit;
use crate::types::{QueryRetrieveLevel, UI, US};
use dicom::core::header::Header;
use dicom::core::{DataElement, PrimitiveValue, Tag, VR};
use dicom::dicom_value;
use dicom::dictionary_std::tags;
use dicom::object::mem::InMemElement;
use dicom::object::InMemDicomObject;
use tracing::{debug, warn};

/// C-FIND-RSP
struct FindResponse {
	message_id: US,
	sop_class_uid: UI,
	status: US,
	data: Option<InMemDicomObject>,
	presentation_context_id: Option<u8>,
}

impl From<FindResponse> for DicomMessage {
	#[rustfmt::skip]
	fn from(response: FindResponse) -> Self {
        let data_set_type = if response.data.is_some() { DATA_SET_EXISTS } else { DATA_SET_MISSING };
        let command = InMemDicomObject::command_from_element_iter([
            DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, response.sop_class_uid)),
            DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_C_FIND_RSP])),
            DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, dicom_value!(U16, [response.message_id])),
            DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [data_set_type])),
            DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [response.status])),
        ]);

        Self {
            command,
            data: response.data,
            presentation_context_id: response.presentation_context_id,
        }
    }
}

pub async fn handle(
	association: &ServerAssociation,
	message: DicomMessage,
	state: &ScpState,
) -> anyhow::Result<()> {
	let message_id = message.message_id().unwrap_or(0);
	let sop_class_uid = message
		.str_element(tags::AFFECTED_SOP_CLASS_UID)
		.unwrap_or_default();
	let presentation_context_id = message.presentation_context_id;

	let answers = match message.data.as_ref().ok_or_else(|| {
		ArcError::BadRequest(String::from("C-FIND-RQ without an identifier data set"))
	}) {
		Ok(query) => find_answers(state, query),
		Err(err) => Err(err),
	};

	match answers {
		Ok(answers) => {
			debug!("C-FIND matched {} resources", answers.len());
			for answer in answers {
				let pending = FindResponse {
					message_id,
					sop_class_uid: sop_class_uid.clone(),
					status: 0xFF00,
					data: Some(answer),
					presentation_context_id,
				};
				association
					.write_message(pending, presentation_context_id, state.response_timeout())
					.await?;
			}

			let done = FindResponse {
				message_id,
				sop_class_uid,
				status: 0x0000,
				data: None,
				presentation_context_id,
			};
			association
				.write_message(done, presentation_context_id, state.response_timeout())
				.await?;
		}
		Err(err) => {
			// Errors never cross the DIMSE boundary; they become a failure
			// status.
			warn!("C-FIND failed: {err}");
			let failure = FindResponse {
				message_id,
				sop_class_uid,
				status: 0xA900,
				data: None,
				presentation_context_id,
			};
			association
				.write_message(failure, presentation_context_id, state.response_timeout())
				.await?;
		}
	}

	Ok(())
}

/// Evaluates an inbound C-FIND identifier against the index and builds one
/// answer data set per match.
pub fn find_answers(state: &ScpState, query: &InMemDicomObject) -> Result<Vec<InMemDicomObject>> {
	if let Some(element) = query.get(tags::SPECIFIC_CHARACTER_SET) {
		if matches!(element.vr(), VR::OB | VR::OW | VR::UN) {
			return Err(ArcError::BadRequest(String::from(
				"binary SpecificCharacterSet in C-FIND identifier",
			)));
		}
	}

	let level = query
		.get(tags::QUERY_RETRIEVE_LEVEL)
		.map(InMemElement::to_str)
		.and_then(std::result::Result::ok)
		.and_then(|value| QueryRetrieveLevel::parse(value.trim_end_matches('\0')))
		.ok_or_else(|| {
			ArcError::BadRequest(String::from("C-FIND identifier without a valid level"))
		})?;
	let kind = level.resource_kind();

	let mut constraints = Vec::new();
	let mut requested: Vec<Tag> = Vec::new();

	for element in query {
		let tag = element.header().tag;
		if tag == tags::QUERY_RETRIEVE_LEVEL || tag == tags::SPECIFIC_CHARACTER_SET {
			continue;
		}

		requested.push(tag);

		let Ok(value) = InMemElement::to_str(element) else {
			continue;
		};
		let value = value.trim_end_matches('\0').trim().to_owned();
		if value.is_empty() || value == "*" {
			// Universal match: return key only.
			continue;
		}

		let op = if value.contains('\\') {
			ConstraintOp::List(value.split('\\').map(String::from).collect())
		} else if value.contains('*') || value.contains('?') {
			ConstraintOp::Wildcard(value)
		} else {
			ConstraintOp::Equal(value)
		};

		let is_identifier = toolkit::identifier_tags(kind).contains(&tag);
		let mut constraint = if is_identifier {
			LookupConstraint::identifier(tag, op)
		} else {
			LookupConstraint::main_tag(tag, op)
		};
		// Person names match case-insensitively.
		constraint.case_sensitive = element.vr() != VR::PN;
		constraints.push(constraint);
	}

	let matches = state
		.context
		.index()
		.read(|t| t.apply_lookup(&constraints, kind, 0))?;

	let mut answers = Vec::with_capacity(matches.len());
	for public_id in matches {
		answers.push(build_answer(state, &public_id, level, &requested)?);
	}
	Ok(answers)
}

/// One answer data set: the requested tags filled from the stored main
/// tags of the matched resource and its ancestors.
fn build_answer(
	state: &ScpState,
	public_id: &str,
	level: QueryRetrieveLevel,
	requested: &[Tag],
) -> Result<InMemDicomObject> {
	let stored = state.context.index().read(|t| {
		let (id, _) = t
			.lookup_resource(public_id)?
			.ok_or_else(|| ArcError::UnknownResource(String::from(public_id)))?;

		let mut tags_map = t.main_tags(id)?;
		let mut current = id;
		while let Some(parent) = t.parent_of(current)? {
			for (tag, value) in t.main_tags(parent)? {
				tags_map.entry(tag).or_insert(value);
			}
			current = parent;
		}
		Ok(tags_map)
	})?;

	let mut answer = InMemDicomObject::new_empty();
	answer.put(DataElement::new(
		tags::QUERY_RETRIEVE_LEVEL,
		VR::CS,
		PrimitiveValue::from(level),
	));

	let mut include = requested.to_vec();
	include.extend_from_slice(toolkit::identifier_tags(level.resource_kind()));

	for tag in include {
		if answer.get(tag).is_some() {
			continue;
		}
		if let Some(value) = stored.get(&tag) {
			answer.put(DataElement::new(
				tag,
				vr_of(tag),
				PrimitiveValue::from(value.as_str()),
			));
		}
	}

	Ok(answer)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::AppConfig;
	use crate::context::tests_support::stored_context;
	use crate::dimse::association::pool::AssociationPools;
	use crate::jobs::JobsEngine;
	use std::sync::Arc;

	fn state() -> ScpState {
		let config = Arc::new(AppConfig::default());
		ScpState {
			context: stored_context(&config),
			jobs: JobsEngine::new(),
			pools: AssociationPools::new(&config),
			config,
		}
	}

	fn query(level: &str, fields: &[(Tag, &str)]) -> InMemDicomObject {
		let mut query = InMemDicomObject::new_empty();
		query.put(DataElement::new(
			tags::QUERY_RETRIEVE_LEVEL,
			VR::CS,
			PrimitiveValue::from(level),
		));
		for (tag, value) in fields {
			query.put(DataElement::new(*tag, vr_of(*tag), PrimitiveValue::from(*value)));
		}
		query
	}

	#[test]
	fn study_level_find_matches_on_modality() {
		let state = state();
		let answers = find_answers(
			&state,
			&query(
				"STUDY",
				&[
					(tags::PATIENT_ID, ""),
					(tags::STUDY_INSTANCE_UID, ""),
					(tags::MODALITY, ""),
				],
			),
		)
		.unwrap();
		assert_eq!(answers.len(), 1);

		let study_uid = answers[0]
			.get(tags::STUDY_INSTANCE_UID)
			.map(InMemElement::to_str)
			.and_then(std::result::Result::ok)
			.unwrap();
		assert_eq!(study_uid.trim_end_matches('\0'), "1.2.3");
	}

	#[test]
	fn instance_level_find_by_uid() {
		let state = state();
		let answers = find_answers(
			&state,
			&query("IMAGE", &[(tags::SOP_INSTANCE_UID, "1.2.3.4.5")]),
		)
		.unwrap();
		assert_eq!(answers.len(), 1);
	}

	#[test]
	fn wildcard_find_on_patient_name() {
		let state = state();
		let answers = find_answers(
			&state,
			&query("PATIENT", &[(tags::PATIENT_NAME, "doe^*")]),
		)
		.unwrap();
		// Person-name matching is case-insensitive.
		assert_eq!(answers.len(), 1);
	}

	#[test]
	fn missing_level_is_rejected() {
		let state = state();
		let mut query = InMemDicomObject::new_empty();
		query.put(DataElement::new(
			tags::PATIENT_ID,
			VR::LO,
			PrimitiveValue::from("p"),
		));
		assert!(matches!(
			find_answers(&state, &query),
			Err(ArcError::BadRequest(_))
		));
	}

	#[test]
	fn binary_character_set_is_rejected() {
		let state = state();
		let mut query = InMemDicomObject::new_empty();
		query.put(DataElement::new(
			tags::QUERY_RETRIEVE_LEVEL,
			VR::CS,
			PrimitiveValue::from("STUDY"),
		));
		query.put(DataElement::new(
			tags::SPECIFIC_CHARACTER_SET,
			VR::OB,
			PrimitiveValue::from(vec![1u8, 2, 3]),
		));
		assert!(matches!(
			find_answers(&state, &query),
			Err(ArcError::BadRequest(_))
		));
	}
}
