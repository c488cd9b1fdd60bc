//! C-MOVE fan-out towards a remote modality, one query per step.

use super::{Job, JobStepResult, StopReason};
use crate::dimse::control::ControlClient;
use crate::error::{ArcError, Result};
use crate::types::{QueryRetrieveLevel, AE};
use async_trait::async_trait;
use dicom::core::Tag;
use serde_json::{json, Map, Value};
use std::str::FromStr;

pub const JOB_TYPE: &str = "DicomMoveScu";

/// One C-MOVE query: the retrieve level plus the identifier tags taken from
/// a previous find answer.
#[derive(Debug, Clone)]
pub struct MoveQuery {
	pub level: QueryRetrieveLevel,
	pub identifiers: Vec<(Tag, String)>,
}

impl MoveQuery {
	fn to_json(&self) -> Value {
		let mut fields = Map::new();
		for (tag, value) in &self.identifiers {
			fields.insert(
				format!("{:04x},{:04x}", tag.group(), tag.element()),
				Value::String(value.clone()),
			);
		}
		json!({
			"Level": self.level.to_string(),
			"Fields": Value::Object(fields),
		})
	}

	fn from_json(value: &Value) -> Result<Self> {
		let level = value
			.get("Level")
			.and_then(Value::as_str)
			.and_then(QueryRetrieveLevel::parse)
			.ok_or_else(|| ArcError::BadFileFormat(String::from("move query without level")))?;

		let mut identifiers = Vec::new();
		if let Some(fields) = value.get("Fields").and_then(Value::as_object) {
			for (key, field) in fields {
				let tag = Tag::from_str(key).map_err(|_| {
					ArcError::BadFileFormat(format!("malformed tag key: {key}"))
				})?;
				let value = field.as_str().unwrap_or_default();
				identifiers.push((tag, String::from(value)));
			}
		}

		Ok(Self { level, identifiers })
	}
}

/// Drives a sequence of C-MOVE requests against one remote modality. Each
/// step issues one query and waits for its terminal status.
pub struct DicomMoveScuJob {
	client: ControlClient,
	target_aet: AE,
	queries: Vec<MoveQuery>,
	position: usize,
	started: bool,
}

impl DicomMoveScuJob {
	pub fn new(client: ControlClient, target_aet: AE) -> Self {
		Self {
			client,
			target_aet,
			queries: Vec::new(),
			position: 0,
			started: false,
		}
	}

	pub fn add_query(&mut self, query: MoveQuery) -> Result<()> {
		if self.started {
			return Err(ArcError::BadSequenceOfCalls(
				"the query list is frozen once the job started",
			));
		}
		self.queries.push(query);
		Ok(())
	}

	pub fn unserialize(client: ControlClient, payload: &Value) -> Result<Self> {
		let target_aet = payload
			.get("Target")
			.and_then(Value::as_str)
			.ok_or_else(|| ArcError::BadFileFormat(String::from("move job without target")))?;

		let mut job = Self::new(client, AE::from(target_aet));
		if let Some(queries) = payload.get("Queries").and_then(Value::as_array) {
			for query in queries {
				job.queries.push(MoveQuery::from_json(query)?);
			}
		}
		if let Some(position) = payload.get("Position").and_then(Value::as_u64) {
			job.position = (position as usize).min(job.queries.len());
			job.started = job.position > 0;
		}
		Ok(job)
	}
}

#[async_trait]
impl Job for DicomMoveScuJob {
	fn job_type(&self) -> &'static str {
		JOB_TYPE
	}

	async fn step(&mut self) -> JobStepResult {
		self.started = true;

		if self.queries.is_empty() {
			return JobStepResult::Success;
		}
		if self.position >= self.queries.len() {
			return JobStepResult::Failure(String::from("stepping a completed job"));
		}

		let query = self.queries[self.position].clone();
		if let Err(err) = self
			.client
			.move_to(&self.target_aet, query.level, &query.identifiers)
			.await
		{
			return JobStepResult::Failure(err.to_string());
		}

		self.position += 1;
		if self.position == self.queries.len() {
			JobStepResult::Success
		} else {
			JobStepResult::Continue
		}
	}

	fn stop(&mut self, _reason: StopReason) {}

	fn reset(&mut self) -> Result<()> {
		if !self.started {
			return Err(ArcError::BadSequenceOfCalls(
				"cannot reset a job that never started",
			));
		}
		self.position = 0;
		Ok(())
	}

	fn progress(&self) -> f32 {
		if self.queries.is_empty() {
			0.0
		} else {
			self.position as f32 / self.queries.len() as f32
		}
	}

	fn public_content(&self) -> Value {
		json!({
			"Description": format!("C-MOVE towards {}", self.target_aet),
			"Remote": self.client.remote_aet(),
			"QueriesCount": self.queries.len(),
		})
	}

	fn serialize(&self) -> Value {
		json!({
			"Remote": self.client.remote_aet(),
			"Target": self.target_aet,
			"Queries": self.queries.iter().map(MoveQuery::to_json).collect::<Vec<_>>(),
			"Position": self.position,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use dicom::dictionary_std::tags;

	#[test]
	fn query_json_roundtrip() {
		let query = MoveQuery {
			level: QueryRetrieveLevel::Series,
			identifiers: vec![
				(tags::STUDY_INSTANCE_UID, String::from("1.2.3")),
				(tags::SERIES_INSTANCE_UID, String::from("1.2.3.4")),
			],
		};

		let restored = MoveQuery::from_json(&query.to_json()).unwrap();
		assert_eq!(restored.level, QueryRetrieveLevel::Series);
		assert_eq!(restored.identifiers.len(), 2);
		assert!(restored
			.identifiers
			.contains(&(tags::SERIES_INSTANCE_UID, String::from("1.2.3.4"))));
	}
}
