//! Bulk C-STORE forwarding to a remote modality.

use super::set_of_instances::{InstanceHandler, SetOfInstancesJob};
use super::{Job, JobStepResult, StopReason};
use crate::context::ServerContext;
use crate::dimse::association::pool::AssociationPool;
use crate::dimse::cstore::{MoveOriginator, StoreServiceClassUser};
use crate::error::{ArcError, Result};
use crate::toolkit;
use crate::types::{AE, US};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

pub const JOB_TYPE: &str = "DicomModalityStore";

pub struct StoreInstanceHandler {
	context: ServerContext,
	client: StoreServiceClassUser,
	remote_aet: AE,
	originator: Option<MoveOriginator>,
}

#[async_trait]
impl InstanceHandler for StoreInstanceHandler {
	async fn handle_instance(&mut self, instance: &str) -> Result<()> {
		let bytes = self.context.read_dicom(instance)?;
		let file = toolkit::parse_file(&bytes)?;

		self.client
			.store(file, self.originator.as_ref())
			.await
			.map_err(|err| match err {
				crate::dimse::cstore::StoreError::Refused { status } => {
					ArcError::NetworkProtocol {
						remote: self.remote_aet.clone(),
						status,
					}
				}
				other => {
					tracing::warn!("C-STORE to {} failed: {other}", self.remote_aet);
					ArcError::NetworkProtocol {
						remote: self.remote_aet.clone(),
						status: 0xC000,
					}
				}
			})
	}
}

/// Sends a set of local instances to a remote modality over C-STORE,
/// optionally tagged with the C-MOVE originator that triggered it.
pub struct DicomModalityStoreJob {
	base: SetOfInstancesJob<StoreInstanceHandler>,
}

impl DicomModalityStoreJob {
	pub fn new(
		context: ServerContext,
		pool: AssociationPool,
		remote_aet: AE,
		timeout: Duration,
		originator: Option<MoveOriginator>,
	) -> Self {
		let description = format!("C-STORE to {remote_aet}");
		let handler = StoreInstanceHandler {
			context,
			client: StoreServiceClassUser::new(pool, timeout),
			remote_aet,
			originator,
		};
		Self {
			base: SetOfInstancesJob::new(handler, description),
		}
	}

	pub fn reserve(&mut self, capacity: usize) -> Result<()> {
		self.base.reserve(capacity)
	}

	pub fn add_instance(&mut self, instance: impl Into<String>) -> Result<()> {
		self.base.add_instance(instance)
	}

	pub fn set_permissive(&mut self, permissive: bool) -> Result<()> {
		self.base.set_permissive(permissive)
	}

	/// Rebuilds the job from a registry snapshot payload.
	pub fn unserialize(
		context: ServerContext,
		pool: AssociationPool,
		timeout: Duration,
		payload: &Value,
	) -> Result<Self> {
		let remote_aet = payload
			.get("Remote")
			.and_then(Value::as_str)
			.ok_or_else(|| ArcError::BadFileFormat(String::from("store job without Remote")))?;
		let originator = payload.get("Originator").and_then(|originator| {
			let aet = originator.get("Aet")?.as_str()?;
			let message_id = originator.get("MessageId")?.as_u64()?;
			Some(MoveOriginator {
				aet: AE::from(aet),
				message_id: message_id as US,
			})
		});

		let mut job = Self::new(context, pool, AE::from(remote_aet), timeout, originator);
		job.base.restore_base(payload);
		Ok(job)
	}
}

#[async_trait]
impl Job for DicomModalityStoreJob {
	fn job_type(&self) -> &'static str {
		JOB_TYPE
	}

	async fn step(&mut self) -> JobStepResult {
		self.base.step().await
	}

	fn stop(&mut self, reason: StopReason) {
		self.base.stop(reason);
	}

	fn reset(&mut self) -> Result<()> {
		self.base.reset()
	}

	fn progress(&self) -> f32 {
		self.base.progress()
	}

	fn public_content(&self) -> Value {
		let mut content = self.base.public_content();
		content["Remote"] = json!(self.base.handler().remote_aet);
		content
	}

	fn serialize(&self) -> Value {
		let mut payload = self.base.serialize_base();
		let handler = self.base.handler();
		payload["Remote"] = json!(handler.remote_aet);
		if let Some(originator) = &handler.originator {
			payload["Originator"] = json!({
				"Aet": originator.aet,
				"MessageId": originator.message_id,
			});
		}
		payload
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::AppConfig;
	use crate::dimse::association::pool::{AssociationManager, Pool};
	use crate::index::Index;
	use crate::storage::MemoryStorage;
	use std::sync::Arc;

	fn test_pool() -> AssociationPool {
		let manager = AssociationManager {
			address: "127.0.0.1:11112".parse().unwrap(),
			calling_aet: String::from("DICOM-ARC"),
			called_aet: String::from("REMOTE"),
		};
		Pool::new(
			manager,
			1,
			Duration::from_millis(100),
			Duration::from_secs(60),
		)
	}

	fn test_context() -> ServerContext {
		ServerContext::new(
			Index::in_memory().unwrap(),
			Arc::new(MemoryStorage::new()),
			Arc::new(AppConfig::default()),
		)
	}

	#[test]
	fn serialize_unserialize_is_a_fixpoint() {
		let mut job = DicomModalityStoreJob::new(
			test_context(),
			test_pool(),
			AE::from("REMOTE"),
			Duration::from_secs(30),
			Some(MoveOriginator {
				aet: AE::from("CALLER"),
				message_id: 42,
			}),
		);
		job.add_instance("instance-1").unwrap();
		job.add_instance("instance-2").unwrap();
		job.set_permissive(true).unwrap();

		let payload = job.serialize();

		let restored = DicomModalityStoreJob::unserialize(
			test_context(),
			test_pool(),
			Duration::from_secs(30),
			&payload,
		)
		.unwrap();

		assert_eq!(restored.serialize(), payload);
		assert_eq!(restored.job_type(), JOB_TYPE);
	}
}
