//! Composition root joining the index and the storage area. Every admission
//! and every read of stored instances goes through [`ServerContext`].

pub mod cache;

pub use cache::{CacheAccessor, ParsedDicomCache, ParsedDicomFile};

use crate::config::AppConfig;
use crate::error::{ArcError, Result};
use crate::index::{
	ChangeEntry, GlobalProperty, Index, IndexEvent, IndexListener, MetadataType, Statistics,
	Transaction,
};
use crate::storage::{CompressionKind, FileContentType, FileInfo, StorageArea};
use crate::toolkit::{self, InstanceIdentifiers, ResourceHasher, TagSummary};
use crate::types::{ChangeKind, ResourceKind, AE};
use dicom::dictionary_std::tags;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

const PARSED_CACHE_SIZE: usize = 32;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub enum StoreStatus {
	Success,
	AlreadyStored,
	Failure,
	FilteredOut,
	FullStorage,
}

#[derive(Debug, Clone)]
pub struct StoreOutcome {
	pub status: StoreStatus,
	pub instance_id: Option<String>,
}

/// Applies the committed side effects of index transactions: blob removal
/// (failures are logged, never propagated: a leaked blob is preferable to a
/// dangling row) and change fan-out.
struct ContextListener {
	storage: Arc<dyn StorageArea>,
	cache: Arc<ParsedDicomCache>,
	changes: broadcast::Sender<ChangeEntry>,
}

impl IndexListener for ContextListener {
	fn handle(&self, event: &IndexEvent) -> Result<()> {
		match event {
			IndexEvent::FileDeleted(info) => {
				if let Err(err) = self.storage.remove(&info.uuid, info.content_type) {
					warn!("Failed to remove blob {}: {err}", info.uuid);
				}
			}
			IndexEvent::ResourceDeleted { public_id, kind } => {
				if *kind == ResourceKind::Instance {
					self.cache.invalidate(public_id);
				}
			}
			IndexEvent::Change(change) => {
				// Nobody listening is fine.
				let _ = self.changes.send(change.clone());
			}
			IndexEvent::RemainingAncestor { .. } => {}
		}
		Ok(())
	}
}

struct ContextInner {
	index: Index,
	storage: Arc<dyn StorageArea>,
	cache: Arc<ParsedDicomCache>,
	config: Arc<AppConfig>,
	listener: ContextListener,
	changes: broadcast::Sender<ChangeEntry>,
}

#[derive(Clone)]
pub struct ServerContext {
	inner: Arc<ContextInner>,
}

enum AdmissionOutcome {
	Committed,
	AlreadyStored,
}

impl ServerContext {
	pub fn new(index: Index, storage: Arc<dyn StorageArea>, config: Arc<AppConfig>) -> Self {
		let cache = Arc::new(ParsedDicomCache::new(PARSED_CACHE_SIZE));
		let (changes, _) = broadcast::channel(256);

		let listener = ContextListener {
			storage: Arc::clone(&storage),
			cache: Arc::clone(&cache),
			changes: changes.clone(),
		};

		Self {
			inner: Arc::new(ContextInner {
				index,
				storage,
				cache,
				config,
				listener,
				changes,
			}),
		}
	}

	pub fn index(&self) -> &Index {
		&self.inner.index
	}

	pub fn config(&self) -> &AppConfig {
		&self.inner.config
	}

	pub fn local_aet(&self) -> &AE {
		&self.inner.config.server.aet
	}

	pub fn subscribe_changes(&self) -> broadcast::Receiver<ChangeEntry> {
		self.inner.changes.subscribe()
	}

	// ---- admission ----------------------------------------------------

	/// The admission pipeline. Parses the buffer, hashes the four public
	/// ids, creates the missing hierarchy levels, enforces the storage
	/// quota by recycling patients, persists the blob and its JSON summary,
	/// and commits.
	pub fn store(&self, bytes: &[u8], remote_aet: &str) -> Result<StoreOutcome> {
		let file = match toolkit::parse_file(bytes) {
			Ok(file) => file,
			Err(err) => {
				warn!("Rejecting instance from {remote_aet}: {err}");
				return Ok(StoreOutcome {
					status: StoreStatus::Failure,
					instance_id: None,
				});
			}
		};

		let sop_class_uid = file
			.meta()
			.media_storage_sop_class_uid()
			.trim_end_matches('\0')
			.to_owned();

		let storage_config = &self.inner.config.storage;
		if storage_config
			.reject_sop_classes
			.iter()
			.any(|rejected| rejected == &sop_class_uid)
		{
			info!("Instance filtered out by SOP class policy: {sop_class_uid}");
			return Ok(StoreOutcome {
				status: StoreStatus::FilteredOut,
				instance_id: None,
			});
		}

		let summary = toolkit::extract_summary(&file)?;
		let identifiers = InstanceIdentifiers::from_summary(&summary)?;
		let hasher = ResourceHasher::new(&identifiers);
		let hashes = [
			hasher.patient(),
			hasher.study(),
			hasher.series(),
			hasher.instance(),
		];

		let compression = if storage_config.compression {
			CompressionKind::ZlibWithSize
		} else {
			CompressionKind::None
		};

		let (dicom_info, dicom_blob) =
			FileInfo::encode(FileContentType::Dicom, bytes, compression)?;
		let json = toolkit::summary_to_json(&summary).to_string();
		let (json_info, json_blob) =
			FileInfo::encode(FileContentType::DicomAsJson, json.as_bytes(), compression)?;
		let incoming_size = dicom_info.compressed_size + json_info.compressed_size;

		let transfer_syntax = file
			.meta()
			.transfer_syntax()
			.trim_end_matches('\0')
			.to_owned();
		let overwrite = storage_config.overwrite_instances;

		let admission = self.inner.index.write(&self.inner.listener, |t| {
			self.admit(
				t,
				&hashes,
				&summary,
				incoming_size,
				overwrite,
				&dicom_info,
				&dicom_blob,
				&json_info,
				&json_blob,
				remote_aet,
				&transfer_syntax,
				&sop_class_uid,
			)
		});

		match admission {
			Ok(AdmissionOutcome::Committed) => {
				let instance_id = hashes[3].clone();
				drop(self.inner.cache.insert(&instance_id, file));
				Ok(StoreOutcome {
					status: StoreStatus::Success,
					instance_id: Some(instance_id),
				})
			}
			Ok(AdmissionOutcome::AlreadyStored) => Ok(StoreOutcome {
				status: StoreStatus::AlreadyStored,
				instance_id: Some(hashes[3].clone()),
			}),
			Err(ArcError::FullStorage) => Ok(StoreOutcome {
				status: StoreStatus::FullStorage,
				instance_id: None,
			}),
			Err(err) => Err(err),
		}
	}

	#[allow(clippy::too_many_arguments)]
	fn admit(
		&self,
		t: &mut Transaction<'_>,
		hashes: &[String; 4],
		summary: &TagSummary,
		incoming_size: u64,
		overwrite: bool,
		dicom_info: &FileInfo,
		dicom_blob: &[u8],
		json_info: &FileInfo,
		json_blob: &[u8],
		remote_aet: &str,
		transfer_syntax: &str,
		sop_class_uid: &str,
	) -> Result<AdmissionOutcome> {
		if let Some((existing, kind)) = t.lookup_resource(&hashes[3])? {
			if kind != ResourceKind::Instance {
				return Err(ArcError::Internal(format!(
					"public id collision between an instance and a {kind}"
				)));
			}
			if !overwrite {
				return Ok(AdmissionOutcome::AlreadyStored);
			}
			info!("Overwriting instance {}", hashes[3]);
			t.delete_resource(existing)?;
		}

		let (patient, new_patient) =
			self.ensure_resource(t, &hashes[0], ResourceKind::Patient, None, summary)?;
		let (study, new_study) =
			self.ensure_resource(t, &hashes[1], ResourceKind::Study, Some(patient), summary)?;
		let (series, new_series) =
			self.ensure_resource(t, &hashes[2], ResourceKind::Series, Some(study), summary)?;

		let instance = t.create_resource(&hashes[3], ResourceKind::Instance)?;
		t.attach_child(series, instance)?;
		for tag in toolkit::identifier_tags(ResourceKind::Instance) {
			if let Some(value) = summary.get(tag) {
				t.set_identifier_tag(instance, *tag, value)?;
			}
		}
		for tag in toolkit::main_tags(ResourceKind::Instance) {
			if let Some(value) = summary.get(tag) {
				t.set_main_tag(instance, *tag, value)?;
			}
		}

		// Changes are logged from the instance up to the patient.
		t.log_change(ChangeKind::NewInstance, &hashes[3], ResourceKind::Instance)?;
		if new_series {
			t.log_change(ChangeKind::NewSeries, &hashes[2], ResourceKind::Series)?;
		}
		if new_study {
			t.log_change(ChangeKind::NewStudy, &hashes[1], ResourceKind::Study)?;
		}
		if new_patient {
			t.log_change(ChangeKind::NewPatient, &hashes[0], ResourceKind::Patient)?;
		}

		// Quota enforcement; the patient owning the new instance is never
		// selected.
		loop {
			if !self.recycling_needed(t, incoming_size)? {
				break;
			}
			match t.select_patient_to_recycle(Some(patient))? {
				None => return Err(ArcError::FullStorage),
				Some(victim) => {
					let victim_public = t.public_id(victim)?;
					info!("Recycling patient {victim_public} to reclaim storage");
					t.delete_resource(victim)?;
				}
			}
		}

		self.inner
			.storage
			.create(&dicom_info.uuid, dicom_blob, FileContentType::Dicom)?;
		t.add_attachment(instance, dicom_info)?;
		self.inner
			.storage
			.create(&json_info.uuid, json_blob, FileContentType::DicomAsJson)?;
		t.add_attachment(instance, json_info)?;

		let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
		t.set_metadata(instance, MetadataType::RemoteAet, remote_aet)?;
		t.set_metadata(instance, MetadataType::ReceptionDate, &now)?;
		t.set_metadata(instance, MetadataType::TransferSyntax, transfer_syntax)?;
		t.set_metadata(instance, MetadataType::SopClassUid, sop_class_uid)?;
		if let Some(number) = summary.get(&tags::INSTANCE_NUMBER) {
			if !number.is_empty() {
				t.set_metadata(instance, MetadataType::IndexInSeries, number)?;
			}
		}
		if new_series {
			if let Some(expected) = summary.get(&tags::NUMBER_OF_SERIES_RELATED_INSTANCES) {
				if !expected.is_empty() {
					t.set_metadata(series, MetadataType::ExpectedInstances, expected)?;
				}
			}
		}

		Ok(AdmissionOutcome::Committed)
	}

	/// Looks up or creates one ancestor level, populating its identifier
	/// and main tags on creation.
	fn ensure_resource(
		&self,
		t: &mut Transaction<'_>,
		public_id: &str,
		kind: ResourceKind,
		parent: Option<i64>,
		summary: &TagSummary,
	) -> Result<(i64, bool)> {
		if let Some((id, existing_kind)) = t.lookup_resource(public_id)? {
			if existing_kind != kind {
				return Err(ArcError::Internal(format!(
					"public id collision between a {existing_kind} and a {kind}"
				)));
			}
			return Ok((id, false));
		}

		let id = t.create_resource(public_id, kind)?;
		if let Some(parent) = parent {
			t.attach_child(parent, id)?;
		}
		for tag in toolkit::identifier_tags(kind) {
			if let Some(value) = summary.get(tag) {
				t.set_identifier_tag(id, *tag, value)?;
			}
		}
		for tag in toolkit::main_tags(kind) {
			if let Some(value) = summary.get(tag) {
				t.set_main_tag(id, *tag, value)?;
			}
		}
		Ok((id, true))
	}

	fn recycling_needed(&self, t: &Transaction<'_>, incoming_size: u64) -> Result<bool> {
		let storage_config = &self.inner.config.storage;

		if storage_config.max_size != 0
			&& t.total_compressed_size()? + incoming_size > storage_config.max_size
		{
			return Ok(true);
		}

		if storage_config.max_patient_count != 0
			&& t.count_resources(ResourceKind::Patient)? > storage_config.max_patient_count
		{
			return Ok(true);
		}

		Ok(false)
	}

	// ---- reads --------------------------------------------------------

	/// Raw part-10 bytes of a stored instance.
	pub fn read_dicom(&self, public_id: &str) -> Result<Vec<u8>> {
		let info = self.inner.index.read(|t| {
			let (id, kind) = t
				.lookup_resource(public_id)?
				.ok_or_else(|| ArcError::UnknownResource(public_id.to_owned()))?;
			if kind != ResourceKind::Instance {
				return Err(ArcError::BadRequest(format!(
					"{public_id} is a {kind}, not an instance"
				)));
			}
			t.lookup_attachment(id, FileContentType::Dicom)?
				.ok_or_else(|| ArcError::InexistentItem(format!("DICOM blob of {public_id}")))
		})?;

		let stored = self.inner.storage.read(&info.uuid, info.content_type)?;
		info.decode(&stored)
			.map_err(|err| ArcError::CorruptedFile(err.to_string()))
	}

	/// Parsed view of a stored instance, served from the LRU cache.
	pub fn read_parsed(&self, public_id: &str) -> Result<CacheAccessor> {
		if let Some(accessor) = self.inner.cache.get(public_id) {
			return Ok(accessor);
		}

		let bytes = self.read_dicom(public_id)?;
		let file = toolkit::parse_file(&bytes)?;
		Ok(self.inner.cache.insert(public_id, file))
	}

	pub fn statistics(&self) -> Result<Statistics> {
		self.inner.index.read(|t| t.statistics())
	}

	pub fn get_changes(&self, since: i64, limit: usize) -> Result<(Vec<ChangeEntry>, bool)> {
		self.inner.index.read(|t| t.get_changes(since, limit))
	}

	/// Public ids of all instances at or below the resource.
	pub fn child_instances(&self, public_id: &str) -> Result<Vec<String>> {
		self.inner.index.read(|t| {
			let (id, _) = t
				.lookup_resource(public_id)?
				.ok_or_else(|| ArcError::UnknownResource(public_id.to_owned()))?;
			t.child_instances(id)
		})
	}

	/// Resolves an identifier-tag value to public ids at the given level.
	pub fn lookup_identifier_exact(
		&self,
		level: ResourceKind,
		tag: dicom::core::Tag,
		value: &str,
	) -> Result<Vec<String>> {
		use crate::index::{ConstraintOp, LookupConstraint};
		self.inner.index.read(|t| {
			t.apply_lookup(
				&[LookupConstraint::identifier(
					tag,
					ConstraintOp::Equal(value.to_owned()),
				)],
				level,
				0,
			)
		})
	}

	// ---- deletion & protection ---------------------------------------

	/// Deletes a resource subtree. Returns the nearest surviving ancestor,
	/// if any.
	pub fn delete_resource(&self, public_id: &str) -> Result<Option<(String, ResourceKind)>> {
		self.inner.index.write(&self.inner.listener, |t| {
			let (id, _) = t
				.lookup_resource(public_id)?
				.ok_or_else(|| ArcError::UnknownResource(public_id.to_owned()))?;
			t.delete_resource(id)?;
			Ok(t.last_remaining_ancestor())
		})
	}

	pub fn is_protected_patient(&self, public_id: &str) -> Result<bool> {
		self.inner.index.read(|t| {
			let (id, kind) = t
				.lookup_resource(public_id)?
				.ok_or_else(|| ArcError::UnknownResource(public_id.to_owned()))?;
			if kind != ResourceKind::Patient {
				return Err(ArcError::BadRequest(format!("{public_id} is not a patient")));
			}
			t.is_protected(id)
		})
	}

	pub fn set_patient_protection(&self, public_id: &str, protected: bool) -> Result<()> {
		self.inner.index.write(&self.inner.listener, |t| {
			let (id, kind) = t
				.lookup_resource(public_id)?
				.ok_or_else(|| ArcError::UnknownResource(public_id.to_owned()))?;
			if kind != ResourceKind::Patient {
				return Err(ArcError::BadRequest(format!("{public_id} is not a patient")));
			}
			t.set_protected(id, protected)
		})
	}

	pub fn increment_anonymization_sequence(&self) -> Result<i64> {
		self.inner.index.write(&self.inner.listener, |t| {
			t.increment_global_sequence(GlobalProperty::AnonymizationSequence)
		})
	}
}

/// Helpers shared by unit tests across the crate.
#[cfg(test)]
pub mod tests_support {
	use super::*;
	use crate::index::Index;
	use crate::storage::MemoryStorage;
	use dicom::core::{DataElement, PrimitiveValue, VR};
	use dicom::object::{FileMetaTableBuilder, InMemDicomObject};

	/// Serialized part-10 instance with the given identifier values and a
	/// fixed patient name `Doe^Jane`, modality `OT`.
	pub fn test_instance(patient: &str, study: &str, series: &str, instance: &str) -> Vec<u8> {
		let mut object = InMemDicomObject::new_empty();
		object.put(DataElement::new(
			tags::PATIENT_ID,
			VR::LO,
			PrimitiveValue::from(patient),
		));
		object.put(DataElement::new(
			tags::PATIENT_NAME,
			VR::PN,
			PrimitiveValue::from("Doe^Jane"),
		));
		object.put(DataElement::new(
			tags::STUDY_INSTANCE_UID,
			VR::UI,
			PrimitiveValue::from(study),
		));
		object.put(DataElement::new(
			tags::SERIES_INSTANCE_UID,
			VR::UI,
			PrimitiveValue::from(series),
		));
		object.put(DataElement::new(
			tags::SOP_INSTANCE_UID,
			VR::UI,
			PrimitiveValue::from(instance),
		));
		object.put(DataElement::new(
			tags::SOP_CLASS_UID,
			VR::UI,
			PrimitiveValue::from("1.2.840.10008.5.1.4.1.1.7"),
		));
		object.put(DataElement::new(
			tags::MODALITY,
			VR::CS,
			PrimitiveValue::from("OT"),
		));

		let meta = FileMetaTableBuilder::new()
			.media_storage_sop_class_uid("1.2.840.10008.5.1.4.1.1.7")
			.media_storage_sop_instance_uid(instance)
			.transfer_syntax("1.2.840.10008.1.2.1")
			.build()
			.expect("file meta");
		let file = object.with_exact_meta(meta);

		let mut bytes = Vec::new();
		file.write_all(&mut bytes).expect("serialization");
		bytes
	}

	/// In-memory context pre-loaded with one instance
	/// (`p` / `1.2.3` / `1.2.3.4` / `1.2.3.4.5`).
	pub fn stored_context(config: &Arc<AppConfig>) -> ServerContext {
		let context = ServerContext::new(
			Index::in_memory().unwrap(),
			Arc::new(MemoryStorage::new()),
			Arc::clone(config),
		);
		let bytes = test_instance("p", "1.2.3", "1.2.3.4", "1.2.3.4.5");
		let outcome = context.store(&bytes, "TEST").unwrap();
		assert_eq!(outcome.status, StoreStatus::Success);
		context
	}
}

#[cfg(test)]
mod tests {
	use super::tests_support::test_instance;
	use super::*;
	use crate::config::AppConfig;
	use crate::storage::MemoryStorage;

	fn context(config: AppConfig) -> (ServerContext, Arc<MemoryStorage>) {
		let storage = Arc::new(MemoryStorage::new());
		let context = ServerContext::new(
			Index::in_memory().unwrap(),
			Arc::clone(&storage) as Arc<dyn StorageArea>,
			Arc::new(config),
		);
		(context, storage)
	}

	#[test]
	fn store_creates_the_full_hierarchy() {
		let (context, storage) = context(AppConfig::default());

		let bytes = test_instance("p", "1.2.3", "1.2.3.4", "1.2.3.4.5");
		let outcome = context.store(&bytes, "REMOTE").unwrap();
		assert_eq!(outcome.status, StoreStatus::Success);

		let stats = context.statistics().unwrap();
		assert_eq!(stats.patients, 1);
		assert_eq!(stats.studies, 1);
		assert_eq!(stats.series, 1);
		assert_eq!(stats.instances, 1);
		// DICOM blob + JSON summary.
		assert_eq!(storage.len(), 2);

		// Round-trip: stored bytes are byte-identical.
		let read_back = context
			.read_dicom(&outcome.instance_id.unwrap())
			.unwrap();
		assert_eq!(read_back, bytes);
	}

	#[test]
	fn overwrite_semantics() {
		let mut config = AppConfig::default();
		config.storage.overwrite_instances = false;
		let (context, _) = context(config);

		let bytes = test_instance("p", "1.2.3", "1.2.3.4", "1.2.3.4.5");
		let first = context.store(&bytes, "REMOTE").unwrap();
		assert_eq!(first.status, StoreStatus::Success);

		let second = context.store(&bytes, "REMOTE").unwrap();
		assert_eq!(second.status, StoreStatus::AlreadyStored);
		assert_eq!(second.instance_id, first.instance_id);

		let stats = context.statistics().unwrap();
		assert_eq!(stats.instances, 1);
	}

	#[test]
	fn overwrite_replaces_blobs() {
		let (context, storage) = context(AppConfig::default());

		let bytes = test_instance("p", "1.2.3", "1.2.3.4", "1.2.3.4.5");
		let first = context.store(&bytes, "REMOTE").unwrap();
		assert_eq!(first.status, StoreStatus::Success);

		let second = context.store(&bytes, "REMOTE").unwrap();
		assert_eq!(second.status, StoreStatus::Success);
		assert_eq!(second.instance_id, first.instance_id);

		// Old blobs were removed by the listener after commit.
		assert_eq!(storage.len(), 2);
		let stats = context.statistics().unwrap();
		assert_eq!(stats.instances, 1);
	}

	#[test]
	fn quota_recycles_oldest_patient() {
		let mut config = AppConfig::default();
		config.storage.max_patient_count = 3;
		let (context, _) = context(config);

		for i in 0..5 {
			let bytes = test_instance(
				&format!("patient-{i}"),
				&format!("1.2.{i}"),
				&format!("1.2.{i}.1"),
				&format!("1.2.{i}.1.1"),
			);
			let outcome = context.store(&bytes, "REMOTE").unwrap();
			assert_eq!(outcome.status, StoreStatus::Success);
		}

		let stats = context.statistics().unwrap();
		assert_eq!(stats.patients, 3);

		// The oldest two patients were recycled.
		let hashes = context
			.lookup_identifier_exact(
				ResourceKind::Patient,
				tags::PATIENT_ID,
				"patient-0",
			)
			.unwrap();
		assert!(hashes.is_empty());
	}

	#[test]
	fn protected_patient_is_skipped_by_recycling() {
		let mut config = AppConfig::default();
		config.storage.max_patient_count = 2;
		let (context, _) = context(config);

		let first = test_instance("patient-0", "1.2.0", "1.2.0.1", "1.2.0.1.1");
		context.store(&first, "REMOTE").unwrap();

		let patient_0 = context
			.lookup_identifier_exact(ResourceKind::Patient, tags::PATIENT_ID, "patient-0")
			.unwrap()
			.remove(0);
		context.set_patient_protection(&patient_0, true).unwrap();
		assert!(context.is_protected_patient(&patient_0).unwrap());

		for i in 1..4 {
			let bytes = test_instance(
				&format!("patient-{i}"),
				&format!("1.2.{i}"),
				&format!("1.2.{i}.1"),
				&format!("1.2.{i}.1.1"),
			);
			context.store(&bytes, "REMOTE").unwrap();
		}

		// patient-0 survived every recycling round.
		assert!(context.is_protected_patient(&patient_0).is_ok());
		let stats = context.statistics().unwrap();
		assert_eq!(stats.patients, 2);
	}

	#[test]
	fn full_storage_when_nothing_recyclable() {
		let mut config = AppConfig::default();
		config.storage.max_size = 1;
		let (context, _) = context(config);

		let bytes = test_instance("p", "1.2.3", "1.2.3.4", "1.2.3.4.5");
		let outcome = context.store(&bytes, "REMOTE").unwrap();
		assert_eq!(outcome.status, StoreStatus::FullStorage);

		// Nothing was committed.
		let stats = context.statistics().unwrap();
		assert_eq!(stats.patients, 0);
		assert_eq!(stats.total_compressed_size, 0);
	}

	#[test]
	fn sop_class_filter() {
		let mut config = AppConfig::default();
		config
			.storage
			.reject_sop_classes
			.push(String::from("1.2.840.10008.5.1.4.1.1.7"));
		let (context, storage) = context(config);

		let bytes = test_instance("p", "1.2.3", "1.2.3.4", "1.2.3.4.5");
		let outcome = context.store(&bytes, "REMOTE").unwrap();
		assert_eq!(outcome.status, StoreStatus::FilteredOut);
		assert!(storage.is_empty());
	}

	#[test]
	fn deletion_reports_remaining_ancestor() {
		let (context, storage) = context(AppConfig::default());

		for instance in ["1.2.3.4.5", "1.2.3.4.6"] {
			let bytes = test_instance("p", "1.2.3", "1.2.3.4", instance);
			context.store(&bytes, "REMOTE").unwrap();
		}

		let first = context
			.lookup_identifier_exact(
				ResourceKind::Instance,
				tags::SOP_INSTANCE_UID,
				"1.2.3.4.5",
			)
			.unwrap()
			.remove(0);

		let ancestor = context.delete_resource(&first).unwrap();
		assert_eq!(ancestor.map(|(_, kind)| kind), Some(ResourceKind::Series));
		// The deleted instance's blobs are gone from storage.
		assert_eq!(storage.len(), 2);
	}

	#[test]
	fn compressed_storage_roundtrip() {
		let mut config = AppConfig::default();
		config.storage.compression = true;
		let (context, _) = context(config);

		let bytes = test_instance("p", "1.2.3", "1.2.3.4", "1.2.3.4.5");
		let outcome = context.store(&bytes, "REMOTE").unwrap();
		assert_eq!(outcome.status, StoreStatus::Success);

		let read_back = context.read_dicom(&outcome.instance_id.unwrap()).unwrap();
		assert_eq!(read_back, bytes);

		let stats = context.statistics().unwrap();
		assert!(stats.total_compressed_size < stats.total_uncompressed_size);
	}

	#[test]
	fn parsed_cache_serves_reads() {
		let (context, _) = context(AppConfig::default());

		let bytes = test_instance("p", "1.2.3", "1.2.3.4", "1.2.3.4.5");
		let outcome = context.store(&bytes, "REMOTE").unwrap();
		let id = outcome.instance_id.unwrap();

		let accessor = context.read_parsed(&id).unwrap();
		let uid: String = accessor
			.lock()
			.element(tags::SOP_INSTANCE_UID)
			.unwrap()
			.to_str()
			.unwrap()
			.into_owned();
		assert_eq!(uid.trim_end_matches('\0'), "1.2.3.4.5");
	}
}
