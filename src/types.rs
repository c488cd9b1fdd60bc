use dicom::core::PrimitiveValue;
use dicom::dictionary_std::uids;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// UI (Unique Identifier) value representation.
pub type UI = String;

/// US (Unsigned Short) value representation.
pub type US = u16;

/// AE (Application Entity) value representation.
pub type AE = String;

/// Priority (0000,0700) values for DIMSE operations.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Priority {
	Low = 0x0002,
	Medium = 0x0000,
	High = 0x0001,
}

impl Default for Priority {
	fn default() -> Self {
		Self::Medium
	}
}

/// The four levels of the DICOM resource hierarchy, from root to leaf.
///
/// The discriminants define the hierarchy order and are also the values
/// persisted in the `Resources.kind` column, so they must never change.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
	Patient = 0,
	Study = 1,
	Series = 2,
	Instance = 3,
}

impl ResourceKind {
	pub const fn parent(self) -> Option<Self> {
		match self {
			Self::Patient => None,
			Self::Study => Some(Self::Patient),
			Self::Series => Some(Self::Study),
			Self::Instance => Some(Self::Series),
		}
	}

	pub const fn from_db(value: i64) -> Option<Self> {
		match value {
			0 => Some(Self::Patient),
			1 => Some(Self::Study),
			2 => Some(Self::Series),
			3 => Some(Self::Instance),
			_ => None,
		}
	}
}

impl Display for ResourceKind {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Patient => write!(f, "Patient"),
			Self::Study => write!(f, "Study"),
			Self::Series => write!(f, "Series"),
			Self::Instance => write!(f, "Instance"),
		}
	}
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum QueryInformationModel {
	Study,
	Patient,
	Worklist,
}

impl QueryInformationModel {
	pub const fn as_sop_class(&self) -> &str {
		match self {
			Self::Study => uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND,
			Self::Patient => uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND,
			Self::Worklist => uids::MODALITY_WORKLIST_INFORMATION_MODEL_FIND,
		}
	}
}

/// Query retrieve level as encoded in tag (0008,0052). The derived order
/// follows the hierarchy, so `Study < Series`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum QueryRetrieveLevel {
	Patient,
	Study,
	Series,
	Image,
}

impl QueryRetrieveLevel {
	pub const fn resource_kind(self) -> ResourceKind {
		match self {
			Self::Patient => ResourceKind::Patient,
			Self::Study => ResourceKind::Study,
			Self::Series => ResourceKind::Series,
			Self::Image => ResourceKind::Instance,
		}
	}

	pub const fn from_resource_kind(kind: ResourceKind) -> Self {
		match kind {
			ResourceKind::Patient => Self::Patient,
			ResourceKind::Study => Self::Study,
			ResourceKind::Series => Self::Series,
			ResourceKind::Instance => Self::Image,
		}
	}

	pub fn parse(value: &str) -> Option<Self> {
		match value.trim() {
			"PATIENT" => Some(Self::Patient),
			"STUDY" => Some(Self::Study),
			"SERIES" => Some(Self::Series),
			"IMAGE" | "INSTANCE" => Some(Self::Image),
			_ => None,
		}
	}
}

impl Display for QueryRetrieveLevel {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Patient => write!(f, "PATIENT"),
			Self::Study => write!(f, "STUDY"),
			Self::Series => write!(f, "SERIES"),
			Self::Image => write!(f, "IMAGE"),
		}
	}
}

impl From<QueryRetrieveLevel> for PrimitiveValue {
	fn from(level: QueryRetrieveLevel) -> Self {
		Self::Str(level.to_string())
	}
}

/// Entries of the change log.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
	NewPatient = 0,
	NewStudy = 1,
	NewSeries = 2,
	NewInstance = 3,
	Deleted = 4,
	StablePatient = 5,
	StableStudy = 6,
	StableSeries = 7,
}

impl ChangeKind {
	pub const fn from_db(value: i64) -> Option<Self> {
		match value {
			0 => Some(Self::NewPatient),
			1 => Some(Self::NewStudy),
			2 => Some(Self::NewSeries),
			3 => Some(Self::NewInstance),
			4 => Some(Self::Deleted),
			5 => Some(Self::StablePatient),
			6 => Some(Self::StableStudy),
			7 => Some(Self::StableSeries),
			_ => None,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn resource_kind_hierarchy() {
		assert_eq!(ResourceKind::Patient.parent(), None);
		assert_eq!(ResourceKind::Study.parent(), Some(ResourceKind::Patient));
		assert_eq!(ResourceKind::Series.parent(), Some(ResourceKind::Study));
		assert_eq!(ResourceKind::Instance.parent(), Some(ResourceKind::Series));
	}

	#[test]
	fn query_retrieve_level_roundtrip() {
		for kind in [
			ResourceKind::Patient,
			ResourceKind::Study,
			ResourceKind::Series,
			ResourceKind::Instance,
		] {
			let level = QueryRetrieveLevel::from_resource_kind(kind);
			assert_eq!(level.resource_kind(), kind);
			assert_eq!(QueryRetrieveLevel::parse(&level.to_string()), Some(level));
		}
	}
}
