//! Worker pool and job registry.
//!
//! Workers pop the highest-priority eligible job (`Pending`, or `Retrying`
//! past its deadline); ties are broken FIFO by admission order. A running
//! job is stepped until a terminal result, a control request (cancel,
//! pause, shutdown), or the exhaustion of its time slice, at which point it
//! is re-queued so higher-priority work can preempt it.

use super::{Job, JobInfo, JobState, JobStepResult, StopReason};
use crate::error::{ArcError, Result};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A job yields back to the scheduler after this much continuous work.
const TIME_SLICE: Duration = Duration::from_millis(500);
/// Poll interval of idle workers, guarding against missed notifications.
const IDLE_POLL: Duration = Duration::from_millis(200);

pub type JobFactory = Box<dyn Fn(&Value) -> Result<Box<dyn Job>> + Send + Sync>;

/// String-keyed factory table dispatching unserialization on the job type.
#[derive(Default)]
pub struct JobFactories(HashMap<&'static str, JobFactory>);

impl JobFactories {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn register(&mut self, job_type: &'static str, factory: JobFactory) {
		self.0.insert(job_type, factory);
	}

	fn create(&self, job_type: &str, payload: &Value) -> Result<Box<dyn Job>> {
		let factory = self.0.get(job_type).ok_or_else(|| {
			ArcError::BadRequest(format!("no factory registered for job type {job_type}"))
		})?;
		factory(payload)
	}
}

struct JobSlot {
	job_type: String,
	priority: i32,
	state: JobState,
	admission: u64,
	retry_at: Option<Instant>,
	progress: f32,
	content: Value,
	snapshot: Value,
	error: Option<String>,
	creation_time: String,
	cancel_requested: bool,
	pause_requested: bool,
	job: Option<Box<dyn Job>>,
}

impl JobSlot {
	fn info(&self, id: &str) -> JobInfo {
		JobInfo {
			id: String::from(id),
			job_type: self.job_type.clone(),
			state: self.state,
			priority: self.priority,
			progress: self.progress,
			content: self.content.clone(),
			error: self.error.clone(),
			creation_time: self.creation_time.clone(),
		}
	}
}

#[derive(Default)]
struct Registry {
	slots: HashMap<String, JobSlot>,
	admission_counter: u64,
}

struct EngineInner {
	registry: Mutex<Registry>,
	notify: Notify,
	shutdown: AtomicBool,
}

#[derive(Clone)]
pub struct JobsEngine {
	inner: Arc<EngineInner>,
}

impl JobsEngine {
	pub fn new() -> Self {
		Self {
			inner: Arc::new(EngineInner {
				registry: Mutex::new(Registry::default()),
				notify: Notify::new(),
				shutdown: AtomicBool::new(false),
			}),
		}
	}

	/// Spawns the worker pool. `workers` must be at least 1.
	pub fn start(&self, workers: usize) {
		let workers = workers.max(1);
		for index in 0..workers {
			let inner = Arc::clone(&self.inner);
			tokio::spawn(worker(inner, index));
		}
		info!("Started jobs engine with {workers} workers");
	}

	pub fn shutdown(&self) {
		self.inner.shutdown.store(true, Ordering::SeqCst);
		self.inner.notify.notify_waiters();
	}

	/// Admits a job. Higher priority runs first.
	pub fn submit(&self, job: Box<dyn Job>, priority: i32) -> String {
		let id = Uuid::new_v4().to_string();
		let mut registry = self.inner.registry.lock().unwrap();
		registry.admission_counter += 1;

		let slot = JobSlot {
			job_type: String::from(job.job_type()),
			priority,
			state: JobState::Pending,
			admission: registry.admission_counter,
			retry_at: None,
			progress: job.progress(),
			content: job.public_content(),
			snapshot: job.serialize(),
			error: None,
			creation_time: chrono::Utc::now()
				.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
			cancel_requested: false,
			pause_requested: false,
			job: Some(job),
		};
		registry.slots.insert(id.clone(), slot);
		drop(registry);

		self.inner.notify.notify_one();
		debug!("Submitted job {id} with priority {priority}");
		id
	}

	pub fn job_info(&self, id: &str) -> Option<JobInfo> {
		let registry = self.inner.registry.lock().unwrap();
		registry.slots.get(id).map(|slot| slot.info(id))
	}

	pub fn list(&self) -> Vec<JobInfo> {
		let registry = self.inner.registry.lock().unwrap();
		let mut jobs = registry
			.slots
			.iter()
			.map(|(id, slot)| slot.info(id))
			.collect::<Vec<_>>();
		jobs.sort_by(|a, b| a.creation_time.cmp(&b.creation_time));
		jobs
	}

	/// Requests cancellation. A queued job fails immediately; a running job
	/// is stopped at its next step boundary.
	pub fn cancel(&self, id: &str) -> Result<()> {
		let mut registry = self.inner.registry.lock().unwrap();
		let slot = registry
			.slots
			.get_mut(id)
			.ok_or_else(|| ArcError::InexistentItem(format!("job {id}")))?;

		match slot.state {
			JobState::Running => slot.cancel_requested = true,
			JobState::Pending | JobState::Retrying | JobState::Paused => {
				if let Some(mut job) = slot.job.take() {
					job.stop(StopReason::Canceled);
				}
				slot.state = JobState::Failure;
				slot.error = Some(String::from("Canceled"));
			}
			JobState::Success | JobState::Failure => {
				return Err(ArcError::BadSequenceOfCalls(
					"cannot cancel a completed job",
				));
			}
		}
		Ok(())
	}

	pub fn pause(&self, id: &str) -> Result<()> {
		let mut registry = self.inner.registry.lock().unwrap();
		let slot = registry
			.slots
			.get_mut(id)
			.ok_or_else(|| ArcError::InexistentItem(format!("job {id}")))?;

		match slot.state {
			JobState::Running => slot.pause_requested = true,
			JobState::Pending | JobState::Retrying => slot.state = JobState::Paused,
			_ => {
				return Err(ArcError::BadSequenceOfCalls(
					"job is not in a pausable state",
				));
			}
		}
		Ok(())
	}

	pub fn resume(&self, id: &str) -> Result<()> {
		let mut registry = self.inner.registry.lock().unwrap();
		let slot = registry
			.slots
			.get_mut(id)
			.ok_or_else(|| ArcError::InexistentItem(format!("job {id}")))?;

		if slot.state != JobState::Paused {
			return Err(ArcError::BadSequenceOfCalls("job is not paused"));
		}
		slot.state = JobState::Pending;
		drop(registry);
		self.inner.notify.notify_one();
		Ok(())
	}

	/// Re-runs a failed job from the beginning.
	pub fn resubmit(&self, id: &str) -> Result<()> {
		let mut registry = self.inner.registry.lock().unwrap();
		let slot = registry
			.slots
			.get_mut(id)
			.ok_or_else(|| ArcError::InexistentItem(format!("job {id}")))?;

		if slot.state != JobState::Failure {
			return Err(ArcError::BadSequenceOfCalls("only failed jobs can be resubmitted"));
		}
		let Some(job) = slot.job.as_mut() else {
			return Err(ArcError::BadSequenceOfCalls("the job state was discarded"));
		};
		job.reset()?;
		slot.state = JobState::Pending;
		slot.error = None;
		slot.progress = 0.0;
		drop(registry);
		self.inner.notify.notify_one();
		Ok(())
	}

	/// Serializes the whole registry for crash recovery. Running jobs are
	/// recorded from their last step-boundary snapshot, as `Pending`.
	pub fn snapshot(&self) -> Value {
		let registry = self.inner.registry.lock().unwrap();
		let jobs = registry
			.slots
			.iter()
			.map(|(id, slot)| {
				let state = match slot.state {
					JobState::Running => JobState::Pending,
					other => other,
				};
				json!({
					"ID": id,
					"Type": slot.job_type,
					"Priority": slot.priority,
					"State": format!("{state:?}"),
					"Error": slot.error,
					"CreationTime": slot.creation_time,
					"Payload": slot.snapshot,
				})
			})
			.collect::<Vec<_>>();

		json!({ "Version": 1, "Jobs": jobs })
	}

	/// Restores a registry snapshot. Unfinished jobs are re-created through
	/// the factory table and queued again; terminal jobs are kept as
	/// history without a runnable payload.
	pub fn restore(&self, snapshot: &Value, factories: &JobFactories) -> Result<usize> {
		let jobs = snapshot
			.get("Jobs")
			.and_then(Value::as_array)
			.ok_or_else(|| ArcError::BadFileFormat(String::from("malformed jobs snapshot")))?;

		let mut restored = 0;
		for entry in jobs {
			let id = entry
				.get("ID")
				.and_then(Value::as_str)
				.ok_or_else(|| ArcError::BadFileFormat(String::from("job entry without ID")))?;
			let job_type = entry
				.get("Type")
				.and_then(Value::as_str)
				.ok_or_else(|| ArcError::BadFileFormat(String::from("job entry without Type")))?;
			let priority = entry
				.get("Priority")
				.and_then(Value::as_i64)
				.unwrap_or(0) as i32;
			let state = entry
				.get("State")
				.and_then(Value::as_str)
				.and_then(JobState::parse)
				.unwrap_or(JobState::Pending);
			let payload = entry.get("Payload").cloned().unwrap_or(Value::Null);

			let job = if state.is_terminal() {
				None
			} else {
				match factories.create(job_type, &payload) {
					Ok(job) => Some(job),
					Err(err) => {
						warn!("Dropping job {id} from snapshot: {err}");
						continue;
					}
				}
			};

			let mut registry = self.inner.registry.lock().unwrap();
			registry.admission_counter += 1;
			let slot = JobSlot {
				job_type: String::from(job_type),
				priority,
				state: if state.is_terminal() { state } else { JobState::Pending },
				admission: registry.admission_counter,
				retry_at: None,
				progress: job.as_ref().map_or(1.0, |job| job.progress()),
				content: job
					.as_ref()
					.map_or(Value::Null, |job| job.public_content()),
				snapshot: payload,
				error: entry
					.get("Error")
					.and_then(Value::as_str)
					.map(String::from),
				creation_time: entry
					.get("CreationTime")
					.and_then(Value::as_str)
					.map_or_else(
						|| {
							chrono::Utc::now()
								.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
						},
						String::from,
					),
				cancel_requested: false,
				pause_requested: false,
				job,
			};
			registry.slots.insert(String::from(id), slot);
			restored += 1;
		}

		self.inner.notify.notify_waiters();
		Ok(restored)
	}
}

impl Default for JobsEngine {
	fn default() -> Self {
		Self::new()
	}
}

/// Picks the best eligible job: highest priority first, FIFO within a
/// priority.
fn pop_next(registry: &mut Registry) -> Option<(String, Box<dyn Job>)> {
	let now = Instant::now();
	let id = registry
		.slots
		.iter()
		.filter(|(_, slot)| match slot.state {
			JobState::Pending => slot.job.is_some(),
			JobState::Retrying => {
				slot.job.is_some() && slot.retry_at.map_or(true, |at| at <= now)
			}
			_ => false,
		})
		.max_by(|(_, a), (_, b)| {
			a.priority
				.cmp(&b.priority)
				.then(b.admission.cmp(&a.admission))
		})
		.map(|(id, _)| id.clone())?;

	let slot = registry.slots.get_mut(&id)?;
	let job = slot.job.take()?;
	slot.state = JobState::Running;
	Some((id, job))
}

async fn worker(inner: Arc<EngineInner>, index: usize) {
	debug!("Worker {index} has started");

	loop {
		if inner.shutdown.load(Ordering::SeqCst) {
			break;
		}

		let next = {
			let mut registry = inner.registry.lock().unwrap();
			pop_next(&mut registry)
		};

		let Some((id, mut job)) = next else {
			tokio::select! {
				() = inner.notify.notified() => {}
				() = tokio::time::sleep(IDLE_POLL) => {}
			}
			continue;
		};

		let slice_started = Instant::now();
		loop {
			// Control requests are honored at step boundaries only.
			let (cancel, pause) = {
				let registry = inner.registry.lock().unwrap();
				registry
					.slots
					.get(&id)
					.map_or((true, false), |slot| {
						(slot.cancel_requested, slot.pause_requested)
					})
			};

			if inner.shutdown.load(Ordering::SeqCst) {
				job.stop(StopReason::EngineShutdown);
				let mut registry = inner.registry.lock().unwrap();
				if let Some(slot) = registry.slots.get_mut(&id) {
					slot.state = JobState::Pending;
					slot.job = Some(job);
				}
				break;
			}

			if cancel {
				job.stop(StopReason::Canceled);
				let mut registry = inner.registry.lock().unwrap();
				if let Some(slot) = registry.slots.get_mut(&id) {
					slot.state = JobState::Failure;
					slot.error = Some(String::from("Canceled"));
					slot.cancel_requested = false;
					slot.snapshot = job.serialize();
				}
				break;
			}

			if pause {
				job.stop(StopReason::Paused);
				let mut registry = inner.registry.lock().unwrap();
				if let Some(slot) = registry.slots.get_mut(&id) {
					slot.state = JobState::Paused;
					slot.pause_requested = false;
					slot.snapshot = job.serialize();
					slot.job = Some(job);
				}
				break;
			}

			let result = job.step().await;

			let mut registry = inner.registry.lock().unwrap();
			let Some(slot) = registry.slots.get_mut(&id) else {
				break;
			};
			slot.progress = job.progress();
			slot.content = job.public_content();
			slot.snapshot = job.serialize();

			match result {
				JobStepResult::Continue => {
					if slice_started.elapsed() >= TIME_SLICE {
						// Yield so a higher-priority job can take over.
						slot.state = JobState::Pending;
						slot.job = Some(job);
						drop(registry);
						inner.notify.notify_one();
						break;
					}
					drop(registry);
				}
				JobStepResult::Success => {
					slot.state = JobState::Success;
					slot.progress = 1.0;
					slot.job = Some(job);
					info!("Job {id} completed successfully");
					break;
				}
				JobStepResult::Failure(error) => {
					slot.state = JobState::Failure;
					warn!("Job {id} failed: {error}");
					slot.error = Some(error);
					slot.job = Some(job);
					break;
				}
				JobStepResult::Retry(delay) => {
					slot.state = JobState::Retrying;
					slot.retry_at = Some(Instant::now() + delay);
					slot.job = Some(job);
					break;
				}
			}
		}
	}

	debug!("Worker {index} has stopped");
}

#[cfg(test)]
mod tests {
	use super::*;
	use async_trait::async_trait;
	use std::sync::atomic::AtomicUsize;

	struct CountingJob {
		steps: usize,
		done: usize,
		log: Arc<Mutex<Vec<&'static str>>>,
		name: &'static str,
		stopped: Arc<AtomicUsize>,
	}

	impl CountingJob {
		fn new(steps: usize, name: &'static str, log: Arc<Mutex<Vec<&'static str>>>) -> Self {
			Self {
				steps,
				done: 0,
				log,
				name,
				stopped: Arc::new(AtomicUsize::new(0)),
			}
		}
	}

	#[async_trait]
	impl Job for CountingJob {
		fn job_type(&self) -> &'static str {
			"Counting"
		}

		async fn step(&mut self) -> JobStepResult {
			self.done += 1;
			self.log.lock().unwrap().push(self.name);
			if self.done >= self.steps {
				JobStepResult::Success
			} else {
				JobStepResult::Continue
			}
		}

		fn stop(&mut self, _reason: StopReason) {
			self.stopped.fetch_add(1, Ordering::SeqCst);
		}

		fn reset(&mut self) -> Result<()> {
			self.done = 0;
			Ok(())
		}

		fn progress(&self) -> f32 {
			self.done as f32 / self.steps as f32
		}

		fn public_content(&self) -> Value {
			json!({"Description": self.name})
		}

		fn serialize(&self) -> Value {
			json!({"Steps": self.steps, "Done": self.done})
		}
	}

	async fn wait_for_state(engine: &JobsEngine, id: &str, state: JobState) {
		for _ in 0..200 {
			if engine.job_info(id).map(|info| info.state) == Some(state) {
				return;
			}
			tokio::time::sleep(Duration::from_millis(10)).await;
		}
		panic!(
			"job {id} never reached {state:?}, last state: {:?}",
			engine.job_info(id).map(|info| info.state)
		);
	}

	#[tokio::test]
	async fn jobs_run_to_success() {
		let engine = JobsEngine::new();
		engine.start(1);

		let log = Arc::new(Mutex::new(Vec::new()));
		let id = engine.submit(Box::new(CountingJob::new(3, "a", Arc::clone(&log))), 0);

		wait_for_state(&engine, &id, JobState::Success).await;
		let info = engine.job_info(&id).unwrap();
		assert_eq!(info.progress, 1.0);
		assert_eq!(log.lock().unwrap().len(), 3);
	}

	#[tokio::test]
	async fn priority_orders_queued_jobs() {
		let engine = JobsEngine::new();
		let log = Arc::new(Mutex::new(Vec::new()));

		// Queue before starting any worker so ordering is deterministic.
		let low = engine.submit(Box::new(CountingJob::new(1, "low", Arc::clone(&log))), 0);
		let high = engine.submit(Box::new(CountingJob::new(1, "high", Arc::clone(&log))), 10);

		engine.start(1);
		wait_for_state(&engine, &low, JobState::Success).await;
		wait_for_state(&engine, &high, JobState::Success).await;

		assert_eq!(log.lock().unwrap().clone(), vec!["high", "low"]);
	}

	#[tokio::test]
	async fn equal_priority_is_fifo() {
		let engine = JobsEngine::new();
		let log = Arc::new(Mutex::new(Vec::new()));

		let first = engine.submit(Box::new(CountingJob::new(1, "first", Arc::clone(&log))), 0);
		let second = engine.submit(Box::new(CountingJob::new(1, "second", Arc::clone(&log))), 0);

		engine.start(1);
		wait_for_state(&engine, &first, JobState::Success).await;
		wait_for_state(&engine, &second, JobState::Success).await;

		assert_eq!(log.lock().unwrap().clone(), vec!["first", "second"]);
	}

	#[tokio::test]
	async fn queued_job_can_be_canceled() {
		let engine = JobsEngine::new();
		let log = Arc::new(Mutex::new(Vec::new()));

		let id = engine.submit(Box::new(CountingJob::new(5, "x", Arc::clone(&log))), 0);
		engine.cancel(&id).unwrap();

		let info = engine.job_info(&id).unwrap();
		assert_eq!(info.state, JobState::Failure);
		assert_eq!(info.error.as_deref(), Some("Canceled"));

		// Canceling a completed job is a sequence error.
		assert!(engine.cancel(&id).is_err());
	}

	#[tokio::test]
	async fn pause_and_resume() {
		let engine = JobsEngine::new();
		let log = Arc::new(Mutex::new(Vec::new()));

		let id = engine.submit(Box::new(CountingJob::new(2, "p", Arc::clone(&log))), 0);
		engine.pause(&id).unwrap();
		assert_eq!(engine.job_info(&id).unwrap().state, JobState::Paused);

		engine.start(1);
		tokio::time::sleep(Duration::from_millis(50)).await;
		// Still paused: workers must not pick it up.
		assert_eq!(engine.job_info(&id).unwrap().state, JobState::Paused);

		engine.resume(&id).unwrap();
		wait_for_state(&engine, &id, JobState::Success).await;
	}

	#[tokio::test]
	async fn snapshot_roundtrip_restores_queued_jobs() {
		let engine = JobsEngine::new();
		let log = Arc::new(Mutex::new(Vec::new()));
		let id = engine.submit(Box::new(CountingJob::new(3, "s", Arc::clone(&log))), 7);

		let snapshot = engine.snapshot();

		let restored_engine = JobsEngine::new();
		let mut factories = JobFactories::new();
		factories.register(
			"Counting",
			Box::new(move |payload| {
				let steps = payload.get("Steps").and_then(Value::as_u64).unwrap_or(1);
				Ok(Box::new(CountingJob::new(
					steps as usize,
					"restored",
					Arc::new(Mutex::new(Vec::new())),
				)))
			}),
		);

		let restored = restored_engine.restore(&snapshot, &factories).unwrap();
		assert_eq!(restored, 1);

		let info = restored_engine.job_info(&id).unwrap();
		assert_eq!(info.state, JobState::Pending);
		assert_eq!(info.priority, 7);

		// Serialize → restore → serialize is a fixpoint on the payload.
		let again = restored_engine.snapshot();
		assert_eq!(
			snapshot["Jobs"][0]["Payload"], again["Jobs"][0]["Payload"],
		);
	}
}
