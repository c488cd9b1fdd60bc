use crate::config::{AppConfig, RemoteModalityConfig};
use crate::dimse::cecho::EchoServiceClassUser;
use crate::types::UI;
use std::collections::{HashMap, VecDeque};
use std::net::{SocketAddr, ToSocketAddrs};
use std::ops::Deref;

use super::client::{ClientAssociation, ClientAssociationOptions, ProposedContext};
use super::AssociationError;
use dicom::dictionary_std::uids;
use futures::TryFutureExt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum PoolError<T> {
	#[error(transparent)]
	Backend(#[from] T),
	#[error("Timed out")]
	Timeout,
	#[error("Failed to recycle object: {0}")]
	Recycle(String),
}

pub trait Manager: Send + Sync {
	type Object;
	type Error;
	type Parameter: PartialEq;

	fn create(
		&self,
		param: &Self::Parameter,
	) -> impl std::future::Future<Output = Result<Self::Object, PoolError<Self::Error>>> + Send;
	fn recycle(
		&self,
		object: &Self::Object,
	) -> impl std::future::Future<Output = Result<(), String>> + Send;
}

pub struct Pool<M: Manager> {
	inner: Arc<InnerPool<M>>,
}

impl<M: Manager> Pool<M> {
	pub fn new(manager: M, pool_size: usize, timeout: Duration, idle_timeout: Duration) -> Self {
		Self {
			inner: Arc::new(InnerPool {
				manager,
				slots: Mutex::new(VecDeque::new()),
				semaphore: Semaphore::new(pool_size),
				timeout,
				idle_timeout,
			}),
		}
	}

	pub async fn get(&self, parameter: M::Parameter) -> Result<Object<M>, PoolError<M::Error>> {
		let timeout = tokio::time::timeout(self.inner.timeout, async {
			self.inner
				.semaphore
				.acquire()
				.await
				.expect("Semaphore should not be closed")
				.forget();

			let slot: Option<ObjectInner<M>> = {
				let mut slots = self.inner.slots.lock().unwrap();

				// Reap associations that sat idle for too long.
				let idle_timeout = self.inner.idle_timeout;
				slots.retain(|slot| slot.metrics.last_used.elapsed() < idle_timeout);

				let target_slot = slots
					.iter()
					.rposition(|slot| slot.parameter == parameter)
					.and_then(|position| slots.remove(position));

				if let Some(target_slot) = target_slot {
					Some(target_slot)
				} else {
					slots.pop_front();
					None
				}
			};

			let object_inner = if let Some(mut slot) = slot {
				let recycle_result = self.inner.manager.recycle(&slot.object).await;
				if recycle_result.is_ok() {
					slot.metrics.recycle_count += 1;
					slot.metrics.last_used = Instant::now();
					slot
				} else {
					let object = self.inner.manager.create(&parameter).await?;
					let now = Instant::now();
					ObjectInner {
						object,
						parameter,
						metrics: Metrics {
							recycle_count: 0,
							created: now,
							last_used: now,
						},
					}
				}
			} else {
				let object = self.inner.manager.create(&parameter).await?;
				let now = Instant::now();

				ObjectInner {
					object,
					parameter,
					metrics: Metrics {
						recycle_count: 0,
						created: now,
						last_used: now,
					},
				}
			};

			Ok(Object {
				pool: Arc::downgrade(&self.inner),
				inner: Some(object_inner),
			})
		});

		timeout.unwrap_or_else(|_| Err(PoolError::Timeout)).await
	}
}

pub struct Object<M: Manager> {
	pool: Weak<InnerPool<M>>,
	inner: Option<ObjectInner<M>>,
}

impl<M: Manager> Deref for Object<M> {
	type Target = M::Object;

	fn deref(&self) -> &Self::Target {
		&self.inner.as_ref().unwrap().object
	}
}

impl<M: Manager> Drop for Object<M> {
	fn drop(&mut self) {
		if let Some(pool) = self.pool.upgrade() {
			pool.semaphore.add_permits(1);
			if let Some(mut object) = self.inner.take() {
				object.metrics.last_used = Instant::now();
				let mut slots = pool.slots.lock().unwrap();
				slots.push_back(object);
			}
		}
	}
}

impl<M: Manager> Clone for Pool<M> {
	fn clone(&self) -> Self {
		Self {
			inner: Arc::clone(&self.inner),
		}
	}
}

struct InnerPool<M: Manager> {
	manager: M,
	slots: Mutex<VecDeque<ObjectInner<M>>>,
	semaphore: Semaphore,
	timeout: Duration,
	idle_timeout: Duration,
}

struct ObjectInner<M: Manager> {
	object: M::Object,
	parameter: M::Parameter,
	metrics: Metrics,
}

#[derive(Debug)]
pub struct Metrics {
	pub created: Instant,
	pub recycle_count: usize,
	pub last_used: Instant,
}

/// Presentation contexts requested from a pooled association.
#[derive(Debug, Clone)]
pub enum PresentationParameter {
	/// Verification, Patient/Study-Root FIND, Study-Root MOVE and Modality
	/// Worklist FIND, all at once.
	Control,
	/// One storage SOP class with the transfer syntaxes the payload can be
	/// sent in.
	Store {
		sop_class_uid: UI,
		transfer_syntax_uids: Vec<UI>,
	},
}

impl PresentationParameter {
	fn proposed_contexts(&self) -> Vec<ProposedContext> {
		let default_syntaxes = vec![
			UI::from(uids::EXPLICIT_VR_LITTLE_ENDIAN),
			UI::from(uids::IMPLICIT_VR_LITTLE_ENDIAN),
		];

		match self {
			Self::Control => [
				uids::VERIFICATION,
				uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND,
				uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND,
				uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE,
				uids::MODALITY_WORKLIST_INFORMATION_MODEL_FIND,
			]
			.iter()
			.map(|uid| ProposedContext {
				abstract_syntax_uid: UI::from(*uid),
				transfer_syntax_uids: default_syntaxes.clone(),
			})
			.collect(),
			Self::Store {
				sop_class_uid,
				transfer_syntax_uids,
			} => vec![ProposedContext {
				abstract_syntax_uid: sop_class_uid.clone(),
				transfer_syntax_uids: transfer_syntax_uids.clone(),
			}],
		}
	}

}

/// Equality is compatibility: a pooled association negotiated for one
/// parameter serves another if the SOP class matches and the transfer
/// syntaxes overlap.
impl PartialEq for PresentationParameter {
	fn eq(&self, other: &Self) -> bool {
		match (self, other) {
			(Self::Control, Self::Control) => true,
			(
				Self::Store {
					sop_class_uid: a,
					transfer_syntax_uids: a_ts,
				},
				Self::Store {
					sop_class_uid: b,
					transfer_syntax_uids: b_ts,
				},
			) => a == b && a_ts.iter().any(|ts| b_ts.contains(ts)),
			_ => false,
		}
	}
}

pub struct AssociationManager {
	pub address: SocketAddr,
	pub calling_aet: String,
	pub called_aet: String,
}

impl Manager for AssociationManager {
	type Object = ClientAssociation;
	type Error = AssociationError;
	type Parameter = PresentationParameter;

	async fn create(
		&self,
		param: &Self::Parameter,
	) -> Result<Self::Object, PoolError<Self::Error>> {
		let options = ClientAssociationOptions {
			calling_aet: self.calling_aet.clone(),
			called_aet: self.called_aet.clone(),
			presentation_contexts: param.proposed_contexts(),
			address: self.address,
		};

		let association = ClientAssociation::new(options)
			.await
			.map_err(PoolError::Backend);

		if let Ok(association) = &association {
			info!(
				backend_uuid = association.uuid().to_string(),
				called_aet = self.called_aet,
				"Created new client association"
			);
		} else {
			warn!(called_aet = self.called_aet, "Failed to create new client association");
		}

		association
	}

	async fn recycle(&self, association: &Self::Object) -> Result<(), String> {
		// Only control associations negotiate the Verification SOP class;
		// plain store associations are recycled without a ping.
		if association.select_context(uids::VERIFICATION).is_none() {
			return Ok(());
		}

		let successful = EchoServiceClassUser::new(association)
			.echo(Duration::from_secs(5))
			.await
			.map_err(|err| format!("Failed to recycle association: {err}"))?;

		if successful {
			info!(
				backend_uuid = association.uuid().to_string(),
				"Recycled association"
			);
			Ok(())
		} else {
			warn!(
				backend_uuid = association.uuid().to_string(),
				"Recycling failed"
			);
			Err(String::from("C-ECHO returned non-successful status code"))
		}
	}
}

pub type AssociationPool = Pool<AssociationManager>;

/// One association pool per configured remote modality, keyed by AET.
#[derive(Clone)]
pub struct AssociationPools(HashMap<String, AssociationPool>);

const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

impl AssociationPools {
	pub fn new(config: &AppConfig) -> Self {
		let mut pools = HashMap::with_capacity(config.modalities.len());
		for modality in &config.modalities {
			if let Some(pool) = Self::create_pool(&config.server.aet, modality) {
				pools.insert(modality.aet.clone(), pool);
				info!(
					aet = modality.aet,
					pool_size = modality.pool.size,
					"Created new association pool"
				);
			}
		}

		Self(pools)
	}

	fn create_pool(local_aet: &str, modality: &RemoteModalityConfig) -> Option<AssociationPool> {
		let address = (modality.host.as_str(), modality.port)
			.to_socket_addrs()
			.ok()?
			.next()?;

		let manager = AssociationManager {
			calling_aet: String::from(local_aet),
			address,
			called_aet: modality.aet.clone(),
		};

		Some(Pool::new(
			manager,
			modality.pool.size,
			Duration::from_millis(modality.pool.timeout),
			IDLE_TIMEOUT,
		))
	}

	#[inline]
	pub fn get(&self, aet: &str) -> Option<&AssociationPool> {
		self.0.get(aet)
	}

	#[inline]
	pub fn aets(&self) -> impl Iterator<Item = &String> {
		self.0.keys()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn store_parameters_match_on_transfer_syntax_overlap() {
		let a = PresentationParameter::Store {
			sop_class_uid: UI::from(uids::CT_IMAGE_STORAGE),
			transfer_syntax_uids: vec![
				UI::from(uids::EXPLICIT_VR_LITTLE_ENDIAN),
				UI::from(uids::IMPLICIT_VR_LITTLE_ENDIAN),
			],
		};
		let b = PresentationParameter::Store {
			sop_class_uid: UI::from(uids::CT_IMAGE_STORAGE),
			transfer_syntax_uids: vec![UI::from(uids::IMPLICIT_VR_LITTLE_ENDIAN)],
		};
		let c = PresentationParameter::Store {
			sop_class_uid: UI::from(uids::MR_IMAGE_STORAGE),
			transfer_syntax_uids: vec![UI::from(uids::IMPLICIT_VR_LITTLE_ENDIAN)],
		};

		assert!(a == b);
		assert!(a != c);
		assert!(a != PresentationParameter::Control);
		assert!(PresentationParameter::Control == PresentationParameter::Control);
	}

	#[test]
	fn control_proposes_the_five_service_classes() {
		let contexts = PresentationParameter::Control.proposed_contexts();
		assert_eq!(contexts.len(), 5);
		assert!(contexts
			.iter()
			.any(|pctx| pctx.abstract_syntax_uid == uids::VERIFICATION));
		assert!(contexts
			.iter()
			.any(|pctx| pctx.abstract_syntax_uid
				== uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE));
	}
}
