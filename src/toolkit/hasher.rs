use sha1::{Digest, Sha1};

use super::InstanceIdentifiers;

/// Derives the four public ids of the resources an instance belongs to.
///
/// Each id is the SHA-1 of the identifier values accumulated from the
/// patient level down, so the same (PatientID, StudyInstanceUID,
/// SeriesInstanceUID, SOPInstanceUID) quadruple always maps to the same
/// four ids, and two instances of one series share the series id.
pub struct ResourceHasher<'a> {
	identifiers: &'a InstanceIdentifiers,
}

impl<'a> ResourceHasher<'a> {
	pub const fn new(identifiers: &'a InstanceIdentifiers) -> Self {
		Self { identifiers }
	}

	pub fn patient(&self) -> String {
		hash(&[&self.identifiers.patient_id])
	}

	pub fn study(&self) -> String {
		hash(&[&self.identifiers.patient_id, &self.identifiers.study_uid])
	}

	pub fn series(&self) -> String {
		hash(&[
			&self.identifiers.patient_id,
			&self.identifiers.study_uid,
			&self.identifiers.series_uid,
		])
	}

	pub fn instance(&self) -> String {
		hash(&[
			&self.identifiers.patient_id,
			&self.identifiers.study_uid,
			&self.identifiers.series_uid,
			&self.identifiers.instance_uid,
		])
	}
}

/// 40 hex digits in five dash-separated groups of eight.
fn hash(parts: &[&str]) -> String {
	let mut hasher = Sha1::new();
	for (i, part) in parts.iter().enumerate() {
		if i > 0 {
			hasher.update(b"|");
		}
		hasher.update(part.as_bytes());
	}

	let digest = hasher.finalize();
	let hex = digest
		.iter()
		.map(|byte| format!("{byte:02x}"))
		.collect::<String>();

	hex.as_bytes()
		.chunks(8)
		.map(|chunk| std::str::from_utf8(chunk).expect("hex digits are ASCII"))
		.collect::<Vec<_>>()
		.join("-")
}

#[cfg(test)]
mod tests {
	use super::*;

	fn identifiers() -> InstanceIdentifiers {
		InstanceIdentifiers {
			patient_id: String::from("patient"),
			study_uid: String::from("study"),
			series_uid: String::from("series"),
			instance_uid: String::from("instance"),
		}
	}

	#[test]
	fn deterministic() {
		let ids = identifiers();
		let a = ResourceHasher::new(&ids);
		let b = ResourceHasher::new(&ids);
		assert_eq!(a.patient(), b.patient());
		assert_eq!(a.study(), b.study());
		assert_eq!(a.series(), b.series());
		assert_eq!(a.instance(), b.instance());
	}

	#[test]
	fn format() {
		let ids = identifiers();
		let hasher = ResourceHasher::new(&ids);
		let id = hasher.instance();
		assert_eq!(id.len(), 44);
		let groups = id.split('-').collect::<Vec<_>>();
		assert_eq!(groups.len(), 5);
		assert!(groups
			.iter()
			.all(|g| g.len() == 8 && g.chars().all(|c| c.is_ascii_hexdigit())));
	}

	#[test]
	fn levels_differ() {
		let ids = identifiers();
		let hasher = ResourceHasher::new(&ids);
		let all = [
			hasher.patient(),
			hasher.study(),
			hasher.series(),
			hasher.instance(),
		];
		for i in 0..all.len() {
			for j in 0..all.len() {
				if i != j {
					assert_ne!(all[i], all[j]);
				}
			}
		}
	}

	#[test]
	fn sibling_instances_share_ancestors() {
		let first = identifiers();
		let second = InstanceIdentifiers {
			instance_uid: String::from("other-instance"),
			..identifiers()
		};
		let a = ResourceHasher::new(&first);
		let b = ResourceHasher::new(&second);
		assert_eq!(a.series(), b.series());
		assert_ne!(a.instance(), b.instance());
	}
}
