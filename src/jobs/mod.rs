//! The background jobs engine: a priority-ordered registry of cancellable,
//! persistable jobs executed stepwise by a worker pool.

pub mod engine;
pub mod move_scu;
pub mod peer_store;
pub mod set_of_instances;
pub mod store_scu;

pub use engine::{JobFactories, JobsEngine};
pub use set_of_instances::{InstanceHandler, SetOfInstancesJob};

use crate::error::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

/// Outcome of one [`Job::step`] call.
#[derive(Debug)]
pub enum JobStepResult {
	/// More steps remain; the worker may yield to a higher-priority job in
	/// between.
	Continue,
	Success,
	Failure(String),
	/// Transient failure; re-run the job after the delay.
	Retry(Duration),
}

/// Why a job is being stopped before completion.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StopReason {
	Canceled,
	Paused,
	EngineShutdown,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub enum JobState {
	Pending,
	Running,
	Paused,
	Retrying,
	Success,
	Failure,
}

impl JobState {
	pub const fn is_terminal(self) -> bool {
		matches!(self, Self::Success | Self::Failure)
	}

	pub fn parse(value: &str) -> Option<Self> {
		match value {
			"Pending" => Some(Self::Pending),
			"Running" => Some(Self::Running),
			"Paused" => Some(Self::Paused),
			"Retrying" => Some(Self::Retrying),
			"Success" => Some(Self::Success),
			"Failure" => Some(Self::Failure),
			_ => None,
		}
	}
}

/// A unit of background work executed one step at a time.
///
/// `step` must not be interrupted mid-call; cancellation and pausing are
/// observed at step boundaries only. `serialize` must capture enough state
/// for the registered factory to resume the job from its last position
/// after a restart.
#[async_trait]
pub trait Job: Send {
	/// Discriminator used to look up the factory at unserialization.
	fn job_type(&self) -> &'static str;

	async fn step(&mut self) -> JobStepResult;

	/// Called at a step boundary when the job is stopped early.
	fn stop(&mut self, reason: StopReason);

	/// Rewinds the job so it can run again from the start. Only valid once
	/// the job has started.
	fn reset(&mut self) -> Result<()>;

	/// Progress in `[0, 1]`.
	fn progress(&self) -> f32;

	/// User-facing description of the job, exposed over REST.
	fn public_content(&self) -> serde_json::Value;

	/// Full state snapshot for crash recovery.
	fn serialize(&self) -> serde_json::Value;
}

/// Registry view of one job, as served by the REST layer.
#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
	#[serde(rename = "ID")]
	pub id: String,
	#[serde(rename = "Type")]
	pub job_type: String,
	#[serde(rename = "State")]
	pub state: JobState,
	#[serde(rename = "Priority")]
	pub priority: i32,
	#[serde(rename = "Progress")]
	pub progress: f32,
	#[serde(rename = "Content")]
	pub content: serde_json::Value,
	#[serde(rename = "Error", skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
	#[serde(rename = "CreationTime")]
	pub creation_time: String,
}
