//! Constraint evaluation for identifier lookups.

use super::Transaction;
use crate::error::Result;
use crate::toolkit::normalize_identifier;
use crate::types::ResourceKind;
use dicom::core::Tag;

/// Comparison applied to one tag value.
#[derive(Debug, Clone)]
pub enum ConstraintOp {
	Equal(String),
	GreaterOrEqual(String),
	SmallerOrEqual(String),
	/// Glob matching with `*` and `?`.
	Wildcard(String),
	/// Value must be one of the listed candidates.
	List(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct LookupConstraint {
	pub tag: Tag,
	pub op: ConstraintOp,
	pub case_sensitive: bool,
	/// Identifier constraints are matched against the normalized
	/// `DicomIdentifiers` table, everything else against `MainDicomTags`.
	pub is_identifier: bool,
}

impl LookupConstraint {
	pub const fn identifier(tag: Tag, op: ConstraintOp) -> Self {
		Self {
			tag,
			op,
			case_sensitive: true,
			is_identifier: true,
		}
	}

	pub const fn main_tag(tag: Tag, op: ConstraintOp) -> Self {
		Self {
			tag,
			op,
			case_sensitive: true,
			is_identifier: false,
		}
	}

	fn matches(&self, stored: &str) -> bool {
		let normalize = |value: &str| -> String {
			let value = if self.is_identifier {
				normalize_identifier(value)
			} else {
				value.trim().to_owned()
			};
			if self.case_sensitive {
				value
			} else {
				value.to_uppercase()
			}
		};

		let stored = normalize(stored);
		match &self.op {
			ConstraintOp::Equal(expected) => stored == normalize(expected),
			ConstraintOp::GreaterOrEqual(bound) => stored >= normalize(bound),
			ConstraintOp::SmallerOrEqual(bound) => stored <= normalize(bound),
			ConstraintOp::Wildcard(pattern) => glob_match(&normalize(pattern), &stored),
			ConstraintOp::List(candidates) => {
				candidates.iter().any(|value| stored == normalize(value))
			}
		}
	}
}

/// Evaluates the conjunction of `constraints` over all resources at `level`.
/// A resource without a value for a constrained tag does not match. `limit`
/// of zero means unbounded.
pub(super) fn apply(
	transaction: &Transaction<'_>,
	constraints: &[LookupConstraint],
	level: ResourceKind,
	limit: usize,
) -> Result<Vec<String>> {
	let mut matches = Vec::new();

	'candidates: for (id, public_id) in transaction.resources_at_level(level)? {
		for constraint in constraints {
			let stored = if constraint.is_identifier {
				transaction.identifier_value(id, constraint.tag)?
			} else {
				transaction.main_tag_value(id, constraint.tag)?
			};

			match stored {
				Some(value) if constraint.matches(&value) => {}
				_ => continue 'candidates,
			}
		}

		matches.push(public_id);
		if limit != 0 && matches.len() >= limit {
			break;
		}
	}

	Ok(matches)
}

/// Glob matching with `*` (any run) and `?` (any single character),
/// iterative with backtracking over the last star.
fn glob_match(pattern: &str, value: &str) -> bool {
	let pattern = pattern.as_bytes();
	let value = value.as_bytes();

	let (mut p, mut v) = (0, 0);
	let mut star: Option<(usize, usize)> = None;

	while v < value.len() {
		if p < pattern.len() && (pattern[p] == b'?' || pattern[p] == value[v]) {
			p += 1;
			v += 1;
		} else if p < pattern.len() && pattern[p] == b'*' {
			star = Some((p, v));
			p += 1;
		} else if let Some((star_p, star_v)) = star {
			p = star_p + 1;
			v = star_v + 1;
			star = Some((star_p, star_v + 1));
		} else {
			return false;
		}
	}

	while p < pattern.len() && pattern[p] == b'*' {
		p += 1;
	}
	p == pattern.len()
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::index::{Index, NullListener};
	use dicom::dictionary_std::tags;

	#[test]
	fn glob_matching() {
		assert!(glob_match("*", ""));
		assert!(glob_match("*", "ANYTHING"));
		assert!(glob_match("CT", "CT"));
		assert!(!glob_match("CT", "MR"));
		assert!(glob_match("1.2.*", "1.2.840.10008"));
		assert!(glob_match("?T", "CT"));
		assert!(!glob_match("?T", "CRT"));
		assert!(glob_match("*.840.*", "1.2.840.10008"));
		assert!(!glob_match("*.840", "1.2.840.10008"));
	}

	fn populate(index: &Index) {
		index
			.write(&NullListener, |t| {
				for (public_id, patient_id, name) in [
					("p0", "HELLO.1", "Mueller^Anna"),
					("p1", "HELLO.2", "Smith^John"),
					("p2", "WORLD.1", "Mueller^Berta"),
				] {
					let id = t.create_resource(public_id, ResourceKind::Patient)?;
					t.set_identifier_tag(id, tags::PATIENT_ID, patient_id)?;
					t.set_main_tag(id, tags::PATIENT_NAME, name)?;
				}
				Ok(())
			})
			.unwrap();
	}

	#[test]
	fn equal_and_wildcard_on_identifiers() {
		let index = Index::in_memory().unwrap();
		populate(&index);

		index
			.read(|t| {
				let found = t.apply_lookup(
					&[LookupConstraint::identifier(
						tags::PATIENT_ID,
						// Normalization uppercases the query side too.
						ConstraintOp::Equal(String::from("  hello.1 ")),
					)],
					ResourceKind::Patient,
					0,
				)?;
				assert_eq!(found, vec![String::from("p0")]);

				let found = t.apply_lookup(
					&[LookupConstraint::identifier(
						tags::PATIENT_ID,
						ConstraintOp::Wildcard(String::from("HELLO.*")),
					)],
					ResourceKind::Patient,
					0,
				)?;
				assert_eq!(found, vec![String::from("p0"), String::from("p1")]);
				Ok(())
			})
			.unwrap();
	}

	#[test]
	fn conjunction_range_and_limit() {
		let index = Index::in_memory().unwrap();
		populate(&index);

		index
			.read(|t| {
				let found = t.apply_lookup(
					&[
						LookupConstraint::identifier(
							tags::PATIENT_ID,
							ConstraintOp::GreaterOrEqual(String::from("HELLO.2")),
						),
						LookupConstraint::identifier(
							tags::PATIENT_ID,
							ConstraintOp::SmallerOrEqual(String::from("WORLD.1")),
						),
					],
					ResourceKind::Patient,
					0,
				)?;
				assert_eq!(found, vec![String::from("p1"), String::from("p2")]);

				let found = t.apply_lookup(
					&[LookupConstraint::identifier(
						tags::PATIENT_ID,
						ConstraintOp::List(vec![
							String::from("HELLO.1"),
							String::from("WORLD.1"),
						]),
					)],
					ResourceKind::Patient,
					1,
				)?;
				assert_eq!(found, vec![String::from("p0")]);
				Ok(())
			})
			.unwrap();
	}

	#[test]
	fn case_insensitive_main_tag() {
		let index = Index::in_memory().unwrap();
		populate(&index);

		index
			.read(|t| {
				let mut constraint = LookupConstraint::main_tag(
					tags::PATIENT_NAME,
					ConstraintOp::Wildcard(String::from("mueller^*")),
				);
				constraint.case_sensitive = false;

				let found = t.apply_lookup(&[constraint], ResourceKind::Patient, 0)?;
				assert_eq!(found, vec![String::from("p0"), String::from("p2")]);
				Ok(())
			})
			.unwrap();
	}
}
