//! Forwarding of stored instances to a remote peer server over HTTP.

use super::set_of_instances::{InstanceHandler, SetOfInstancesJob};
use super::{Job, JobStepResult, StopReason};
use crate::config::PeerConfig;
use crate::context::ServerContext;
use crate::error::{ArcError, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

pub const JOB_TYPE: &str = "PeerStore";

pub struct PeerStoreHandler {
	context: ServerContext,
	client: reqwest::Client,
	peer: PeerConfig,
}

#[async_trait]
impl InstanceHandler for PeerStoreHandler {
	async fn handle_instance(&mut self, instance: &str) -> Result<()> {
		let bytes = self.context.read_dicom(instance)?;

		let url = format!("{}/instances", self.peer.url.trim_end_matches('/'));
		let mut request = self.client.post(&url).body(bytes);
		if let Some(username) = &self.peer.username {
			request = request.basic_auth(username, self.peer.password.as_deref());
		}

		let response = request.send().await.map_err(|err| {
			ArcError::Internal(format!("POST to peer {} failed: {err}", self.peer.name))
		})?;

		if response.status().is_success() {
			Ok(())
		} else {
			Err(ArcError::Internal(format!(
				"peer {} answered {}",
				self.peer.name,
				response.status()
			)))
		}
	}
}

/// Uploads a set of local instances to a configured peer.
pub struct PeerStoreJob {
	base: SetOfInstancesJob<PeerStoreHandler>,
}

impl PeerStoreJob {
	pub fn new(context: ServerContext, peer: PeerConfig) -> Self {
		let description = format!("Store to peer {}", peer.name);
		let handler = PeerStoreHandler {
			context,
			client: reqwest::Client::new(),
			peer,
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

	pub fn unserialize(context: ServerContext, payload: &Value) -> Result<Self> {
		let name = payload
			.get("Peer")
			.and_then(Value::as_str)
			.ok_or_else(|| ArcError::BadFileFormat(String::from("peer job without peer name")))?;
		let peer = context
			.config()
			.peer(name)
			.cloned()
			.ok_or_else(|| ArcError::InexistentItem(format!("peer {name}")))?;

		let mut job = Self::new(context, peer);
		job.base.restore_base(payload);
		Ok(job)
	}
}

#[async_trait]
impl Job for PeerStoreJob {
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
		content["Peer"] = json!(self.base.handler().peer.name);
		content
	}

	fn serialize(&self) -> Value {
		let mut payload = self.base.serialize_base();
		payload["Peer"] = json!(self.base.handler().peer.name);
		payload
	}
}
