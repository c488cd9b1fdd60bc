//! Reusable base for jobs that iterate a fixed list of instances.

use super::{Job, JobStepResult, StopReason};
use crate::error::{ArcError, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use tracing::warn;

/// Per-instance work hook of a [`SetOfInstancesJob`].
#[async_trait]
pub trait InstanceHandler: Send {
	async fn handle_instance(&mut self, instance: &str) -> Result<()>;

	/// Called when the surrounding job is stopped at a step boundary.
	fn on_stop(&mut self, _reason: StopReason) {}
}

/// Iterates an ordered list of instance public ids, calling the handler on
/// each. In permissive mode a failing instance is recorded and skipped; in
/// strict mode it terminates the job.
///
/// The instance list is frozen once the first step ran: every mutation
/// afterwards is a `BadSequenceOfCalls`.
pub struct SetOfInstancesJob<H> {
	handler: H,
	description: String,
	instances: Vec<String>,
	failed: BTreeSet<String>,
	position: usize,
	permissive: bool,
	started: bool,
}

impl<H: InstanceHandler> SetOfInstancesJob<H> {
	pub fn new(handler: H, description: impl Into<String>) -> Self {
		Self {
			handler,
			description: description.into(),
			instances: Vec::new(),
			failed: BTreeSet::new(),
			position: 0,
			permissive: false,
			started: false,
		}
	}

	fn guard_not_started(&self) -> Result<()> {
		if self.started {
			Err(ArcError::BadSequenceOfCalls(
				"the instance list is frozen once the job started",
			))
		} else {
			Ok(())
		}
	}

	pub fn reserve(&mut self, capacity: usize) -> Result<()> {
		self.guard_not_started()?;
		self.instances.reserve(capacity);
		Ok(())
	}

	pub fn add_instance(&mut self, instance: impl Into<String>) -> Result<()> {
		self.guard_not_started()?;
		self.instances.push(instance.into());
		Ok(())
	}

	pub fn set_permissive(&mut self, permissive: bool) -> Result<()> {
		self.guard_not_started()?;
		self.permissive = permissive;
		Ok(())
	}

	pub fn handler(&self) -> &H {
		&self.handler
	}

	pub fn position(&self) -> usize {
		self.position
	}

	pub fn failed_instances(&self) -> &BTreeSet<String> {
		&self.failed
	}

	pub fn instances(&self) -> &[String] {
		&self.instances
	}

	/// Base state shared by every concrete job family; concrete jobs merge
	/// their own fields into this object.
	pub fn serialize_base(&self) -> Value {
		json!({
			"Description": self.description,
			"Instances": self.instances,
			"FailedInstances": self.failed.iter().collect::<Vec<_>>(),
			"Position": self.position,
			"Permissive": self.permissive,
		})
	}

	/// Restores the cursor state captured by [`Self::serialize_base`].
	pub fn restore_base(&mut self, payload: &Value) {
		if let Some(instances) = payload.get("Instances").and_then(Value::as_array) {
			self.instances = instances
				.iter()
				.filter_map(Value::as_str)
				.map(String::from)
				.collect();
		}
		if let Some(failed) = payload.get("FailedInstances").and_then(Value::as_array) {
			self.failed = failed
				.iter()
				.filter_map(Value::as_str)
				.map(String::from)
				.collect();
		}
		if let Some(position) = payload.get("Position").and_then(Value::as_u64) {
			self.position = (position as usize).min(self.instances.len());
			self.started = self.position > 0;
		}
		if let Some(permissive) = payload.get("Permissive").and_then(Value::as_bool) {
			self.permissive = permissive;
		}
		if let Some(description) = payload.get("Description").and_then(Value::as_str) {
			self.description = String::from(description);
		}
	}

	pub async fn step(&mut self) -> JobStepResult {
		self.started = true;

		if self.instances.is_empty() {
			return JobStepResult::Success;
		}
		// Strict comparison: stepping past the end is a sequence error.
		if self.position >= self.instances.len() {
			return JobStepResult::Failure(String::from("stepping a completed job"));
		}

		let current = self.instances[self.position].clone();
		if let Err(err) = self.handler.handle_instance(&current).await {
			if !self.permissive {
				return JobStepResult::Failure(format!("{current}: {err}"));
			}
			warn!("Skipping instance {current}: {err}");
			self.failed.insert(current);
		}

		self.position += 1;
		if self.position == self.instances.len() {
			JobStepResult::Success
		} else {
			JobStepResult::Continue
		}
	}

	pub fn stop(&mut self, reason: StopReason) {
		self.handler.on_stop(reason);
	}

	/// Rewinds to the first instance. Only valid once the job has started.
	pub fn reset(&mut self) -> Result<()> {
		if !self.started {
			return Err(ArcError::BadSequenceOfCalls(
				"cannot reset a job that never started",
			));
		}
		self.position = 0;
		self.failed.clear();
		Ok(())
	}

	pub fn progress(&self) -> f32 {
		if self.instances.is_empty() {
			0.0
		} else {
			self.position as f32 / self.instances.len() as f32
		}
	}

	pub fn public_content(&self) -> Value {
		json!({
			"Description": self.description,
			"InstancesCount": self.instances.len(),
			"FailedInstancesCount": self.failed.len(),
		})
	}
}

/// Blanket [`Job`] implementation so a bare `SetOfInstancesJob` is already
/// a runnable job; concrete families wrap it to add their own payload.
#[async_trait]
impl<H: InstanceHandler> Job for SetOfInstancesJob<H> {
	fn job_type(&self) -> &'static str {
		"SetOfInstances"
	}

	async fn step(&mut self) -> JobStepResult {
		Self::step(self).await
	}

	fn stop(&mut self, reason: StopReason) {
		Self::stop(self, reason);
	}

	fn reset(&mut self) -> Result<()> {
		Self::reset(self)
	}

	fn progress(&self) -> f32 {
		Self::progress(self)
	}

	fn public_content(&self) -> Value {
		Self::public_content(self)
	}

	fn serialize(&self) -> Value {
		self.serialize_base()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	struct FailOn {
		failing: &'static str,
		handled: Vec<String>,
	}

	#[async_trait]
	impl InstanceHandler for FailOn {
		async fn handle_instance(&mut self, instance: &str) -> Result<()> {
			self.handled.push(String::from(instance));
			if instance == self.failing {
				Err(ArcError::NetworkProtocol {
					remote: String::from("PACS"),
					status: 0xC000,
				})
			} else {
				Ok(())
			}
		}
	}

	fn job(permissive: bool) -> SetOfInstancesJob<FailOn> {
		let mut job = SetOfInstancesJob::new(
			FailOn {
				failing: "i2",
				handled: Vec::new(),
			},
			"test",
		);
		for instance in ["i1", "i2", "i3"] {
			job.add_instance(instance).unwrap();
		}
		job.set_permissive(permissive).unwrap();
		job
	}

	#[tokio::test]
	async fn strict_mode_stops_at_the_failing_instance() {
		let mut job = job(false);

		assert!(matches!(job.step().await, JobStepResult::Continue));
		assert_eq!(job.position(), 1);

		assert!(matches!(job.step().await, JobStepResult::Failure(_)));
		// The failing instance was not skipped over.
		assert_eq!(job.position(), 1);
		assert!(job.failed_instances().is_empty());
	}

	#[tokio::test]
	async fn permissive_mode_records_and_continues() {
		let mut job = job(true);

		assert!(matches!(job.step().await, JobStepResult::Continue));
		assert!(matches!(job.step().await, JobStepResult::Continue));
		assert!(matches!(job.step().await, JobStepResult::Success));

		assert_eq!(job.position(), 3);
		assert_eq!(
			job.failed_instances().iter().collect::<Vec<_>>(),
			vec!["i2"]
		);
	}

	#[tokio::test]
	async fn mutation_after_start_is_rejected() {
		let mut job = job(true);
		let _ = job.step().await;

		assert!(matches!(
			job.add_instance("i4"),
			Err(ArcError::BadSequenceOfCalls(_))
		));
		assert!(matches!(
			job.set_permissive(false),
			Err(ArcError::BadSequenceOfCalls(_))
		));
		assert!(matches!(
			job.reserve(10),
			Err(ArcError::BadSequenceOfCalls(_))
		));
	}

	#[tokio::test]
	async fn reset_requires_a_started_job() {
		let mut job = job(true);
		assert!(job.reset().is_err());

		let _ = job.step().await;
		let _ = job.step().await;
		job.reset().unwrap();
		assert_eq!(job.position(), 0);
		assert!(job.failed_instances().is_empty());
	}

	#[tokio::test]
	async fn serialization_roundtrip_is_a_fixpoint() {
		let mut job = job(true);
		let _ = job.step().await;
		let _ = job.step().await;

		let payload = job.serialize_base();

		let mut restored = SetOfInstancesJob::new(
			FailOn {
				failing: "i2",
				handled: Vec::new(),
			},
			"",
		);
		restored.restore_base(&payload);

		assert_eq!(restored.position(), 2);
		assert_eq!(restored.instances(), job.instances());
		assert_eq!(restored.serialize_base(), payload);
	}

	#[tokio::test]
	async fn empty_job_succeeds_immediately() {
		let mut job = SetOfInstancesJob::new(
			FailOn {
				failing: "",
				handled: Vec::new(),
			},
			"empty",
		);
		assert!(matches!(job.step().await, JobStepResult::Success));
	}

	#[tokio::test]
	async fn progress_tracks_the_cursor() {
		let mut job = job(true);
		assert_eq!(job.progress(), 0.0);
		let _ = job.step().await;
		assert!((job.progress() - 1.0 / 3.0).abs() < f32::EPSILON);
	}
}
