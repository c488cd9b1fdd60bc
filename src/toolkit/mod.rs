//! Bridging helpers between raw DICOM datasets and the resource index:
//! summary extraction, identifier normalization and public-id hashing.

pub mod hasher;

pub use hasher::ResourceHasher;

use crate::error::{ArcError, Result};
use crate::types::ResourceKind;
use dicom::core::header::Header;
use dicom::core::{Tag, VR};
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;
use std::collections::BTreeMap;

/// Identifier tags per hierarchy level. These drive both public-id hashing
/// and the `DicomIdentifiers` lookup table.
pub const PATIENT_IDENTIFIER_TAGS: &[Tag] = &[tags::PATIENT_ID];
pub const STUDY_IDENTIFIER_TAGS: &[Tag] = &[tags::STUDY_INSTANCE_UID, tags::ACCESSION_NUMBER];
pub const SERIES_IDENTIFIER_TAGS: &[Tag] = &[tags::SERIES_INSTANCE_UID];
pub const INSTANCE_IDENTIFIER_TAGS: &[Tag] = &[tags::SOP_INSTANCE_UID];

/// Curated main-tag set per level, used to answer REST queries without
/// re-parsing the stored blob.
pub const PATIENT_MAIN_TAGS: &[Tag] = &[
	tags::PATIENT_NAME,
	tags::PATIENT_ID,
	tags::PATIENT_BIRTH_DATE,
	tags::PATIENT_SEX,
	tags::OTHER_PATIENT_I_DS,
];

pub const STUDY_MAIN_TAGS: &[Tag] = &[
	tags::STUDY_DATE,
	tags::STUDY_TIME,
	tags::STUDY_ID,
	tags::STUDY_DESCRIPTION,
	tags::ACCESSION_NUMBER,
	tags::STUDY_INSTANCE_UID,
	tags::REFERRING_PHYSICIAN_NAME,
	tags::INSTITUTION_NAME,
	tags::REQUESTED_PROCEDURE_DESCRIPTION,
];

pub const SERIES_MAIN_TAGS: &[Tag] = &[
	tags::SERIES_DATE,
	tags::SERIES_TIME,
	tags::MODALITY,
	tags::MANUFACTURER,
	tags::STATION_NAME,
	tags::SERIES_DESCRIPTION,
	tags::BODY_PART_EXAMINED,
	tags::SERIES_NUMBER,
	tags::SERIES_INSTANCE_UID,
	tags::PROTOCOL_NAME,
	tags::OPERATORS_NAME,
	tags::PERFORMED_PROCEDURE_STEP_DESCRIPTION,
];

pub const INSTANCE_MAIN_TAGS: &[Tag] = &[
	tags::INSTANCE_NUMBER,
	tags::SOP_INSTANCE_UID,
	tags::SOP_CLASS_UID,
	tags::IMAGE_POSITION_PATIENT,
	tags::IMAGE_ORIENTATION_PATIENT,
	tags::NUMBER_OF_FRAMES,
	tags::IMAGE_COMMENTS,
	tags::ACQUISITION_NUMBER,
	tags::IMAGE_INDEX,
];

pub const fn identifier_tags(kind: ResourceKind) -> &'static [Tag] {
	match kind {
		ResourceKind::Patient => PATIENT_IDENTIFIER_TAGS,
		ResourceKind::Study => STUDY_IDENTIFIER_TAGS,
		ResourceKind::Series => SERIES_IDENTIFIER_TAGS,
		ResourceKind::Instance => INSTANCE_IDENTIFIER_TAGS,
	}
}

pub const fn main_tags(kind: ResourceKind) -> &'static [Tag] {
	match kind {
		ResourceKind::Patient => PATIENT_MAIN_TAGS,
		ResourceKind::Study => STUDY_MAIN_TAGS,
		ResourceKind::Series => SERIES_MAIN_TAGS,
		ResourceKind::Instance => INSTANCE_MAIN_TAGS,
	}
}

/// Textual summary of a dataset, restricted to the tags the index persists.
pub type TagSummary = BTreeMap<Tag, String>;

/// Parses a DICOM part-10 buffer, accepting the optional 128-byte preamble.
pub fn parse_file(bytes: &[u8]) -> Result<dicom::object::FileDicomObject<InMemDicomObject>> {
	let stream = if bytes.len() > 132 && &bytes[128..132] == b"DICM" {
		&bytes[128..]
	} else {
		bytes
	};

	dicom::object::from_reader(stream).map_err(|err| ArcError::BadFileFormat(err.to_string()))
}

/// Serializes a parsed instance back to a part-10 buffer.
pub fn write_file(
	file: &dicom::object::FileDicomObject<InMemDicomObject>,
) -> Result<Vec<u8>> {
	let mut buffer = Vec::new();
	file.write_all(&mut buffer)
		.map_err(|err| ArcError::CorruptedFile(err.to_string()))?;
	Ok(buffer)
}

/// Normalization applied to identifier tags before storage and lookup:
/// trim outer spaces, uppercase, strip non-alphanumeric characters except
/// the dot.
pub fn normalize_identifier(value: &str) -> String {
	value
		.trim()
		.chars()
		.filter(|c| c.is_ascii_alphanumeric() || *c == '.')
		.map(|c| c.to_ascii_uppercase())
		.collect()
}

/// Extracts the summary of a dataset: every main tag of every level, so the
/// four resource rows created by admission can be populated from one pass.
///
/// A binary `SpecificCharacterSet` is rejected rather than coerced to the
/// default encoding.
pub fn extract_summary(object: &InMemDicomObject) -> Result<TagSummary> {
	if let Ok(Some(element)) = object.element_opt(tags::SPECIFIC_CHARACTER_SET) {
		if matches!(element.vr(), VR::OB | VR::OW | VR::UN) {
			return Err(ArcError::BadFileFormat(String::from(
				"binary SpecificCharacterSet",
			)));
		}
	}

	let mut summary = TagSummary::new();
	for kind in [
		ResourceKind::Patient,
		ResourceKind::Study,
		ResourceKind::Series,
		ResourceKind::Instance,
	] {
		for tag in main_tags(kind) {
			if let Ok(Some(element)) = object.element_opt(*tag) {
				if let Ok(value) = element.to_str() {
					summary.insert(*tag, value.trim().to_owned());
				}
			}
		}
	}

	// NumberOfSeriesRelatedInstances feeds the expected-instances metadata.
	if let Ok(Some(element)) = object.element_opt(tags::NUMBER_OF_SERIES_RELATED_INSTANCES) {
		if let Ok(value) = element.to_str() {
			summary.insert(tags::NUMBER_OF_SERIES_RELATED_INSTANCES, value.trim().to_owned());
		}
	}

	Ok(summary)
}

/// Renders a summary as the JSON attachment stored next to the DICOM blob.
pub fn summary_to_json(summary: &TagSummary) -> serde_json::Value {
	let map = summary
		.iter()
		.map(|(tag, value)| {
			(
				format!("{:04x},{:04x}", tag.group(), tag.element()),
				serde_json::Value::String(value.clone()),
			)
		})
		.collect::<serde_json::Map<String, serde_json::Value>>();
	serde_json::Value::Object(map)
}

/// The four identifier values admission hashes into public ids. Missing
/// PatientID is tolerated (empty), the three UIDs are mandatory.
pub struct InstanceIdentifiers {
	pub patient_id: String,
	pub study_uid: String,
	pub series_uid: String,
	pub instance_uid: String,
}

impl InstanceIdentifiers {
	pub fn from_summary(summary: &TagSummary) -> Result<Self> {
		let get = |tag: Tag| summary.get(&tag).cloned().unwrap_or_default();
		let require = |tag: Tag, name: &str| -> Result<String> {
			let value = get(tag);
			if value.is_empty() {
				Err(ArcError::BadRequest(format!("missing {name}")))
			} else {
				Ok(value)
			}
		};

		Ok(Self {
			patient_id: get(tags::PATIENT_ID),
			study_uid: require(tags::STUDY_INSTANCE_UID, "StudyInstanceUID")?,
			series_uid: require(tags::SERIES_INSTANCE_UID, "SeriesInstanceUID")?,
			instance_uid: require(tags::SOP_INSTANCE_UID, "SOPInstanceUID")?,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use dicom::core::{DataElement, PrimitiveValue};

	#[test]
	fn normalization() {
		assert_eq!(normalize_identifier("   H\u{e9}^l.LO  %_  "), "HL.LO");
		assert_eq!(
			normalize_identifier("   1.2.840.113619.2.176.2025  "),
			"1.2.840.113619.2.176.2025"
		);
		assert_eq!(normalize_identifier("abc-def"), "ABCDEF");
	}

	#[test]
	fn summary_extraction() {
		let mut object = InMemDicomObject::new_empty();
		object.put(DataElement::new(
			tags::PATIENT_ID,
			VR::LO,
			PrimitiveValue::from("patient-1 "),
		));
		object.put(DataElement::new(
			tags::STUDY_INSTANCE_UID,
			VR::UI,
			PrimitiveValue::from("1.2.3"),
		));
		object.put(DataElement::new(
			tags::MODALITY,
			VR::CS,
			PrimitiveValue::from("CT"),
		));

		let summary = extract_summary(&object).unwrap();
		assert_eq!(summary.get(&tags::PATIENT_ID).unwrap(), "patient-1");
		assert_eq!(summary.get(&tags::STUDY_INSTANCE_UID).unwrap(), "1.2.3");
		assert_eq!(summary.get(&tags::MODALITY).unwrap(), "CT");
		assert!(!summary.contains_key(&tags::SOP_INSTANCE_UID));
	}

	#[test]
	fn binary_character_set_is_rejected() {
		let mut object = InMemDicomObject::new_empty();
		object.put(DataElement::new(
			tags::SPECIFIC_CHARACTER_SET,
			VR::OB,
			PrimitiveValue::from(vec![0u8, 1, 2]),
		));

		assert!(matches!(
			extract_summary(&object),
			Err(ArcError::BadFileFormat(_))
		));
	}

	#[test]
	fn summary_json_uses_group_element_keys() {
		let mut summary = TagSummary::new();
		summary.insert(tags::PATIENT_ID, String::from("P1"));
		let json = summary_to_json(&summary);
		assert_eq!(json["0010,0020"], "P1");
	}
}
