//! Transactional store of the resource hierarchy and everything attached to
//! it: blobs, metadata, DICOM tags, the patient recycling order, the change
//! log and global properties.
//!
//! All access goes through [`Index::read`] or [`Index::write`]. A single
//! process-wide mutex guards the connection; transactions are short and the
//! heavy lifting (blob I/O, networking) happens outside of them. Listener
//! events are queued during a write transaction and dispatched only after
//! the commit succeeded, so a listener can never observe uncommitted state
//! and a failing listener cannot undo a commit.

pub mod lookup;
pub mod schema;

pub use lookup::{ConstraintOp, LookupConstraint};
pub use schema::{GlobalProperty, SCHEMA_VERSION};

use crate::error::{ArcError, Result};
use crate::storage::{CompressionKind, FileContentType, FileInfo};
use crate::toolkit::{self, TagSummary};
use crate::types::{ChangeKind, ResourceKind};
use dicom::core::Tag;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::Path;
use std::sync::Mutex;
use tracing::{error, warn};

/// Typed metadata keys. Persisted values, do not renumber.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum MetadataType {
	RemoteAet = 1,
	ReceptionDate = 2,
	TransferSyntax = 3,
	SopClassUid = 4,
	IndexInSeries = 5,
	ModifiedFrom = 6,
	AnonymizedFrom = 7,
	ExpectedInstances = 8,
}

impl MetadataType {
	pub const fn from_db(value: i64) -> Option<Self> {
		match value {
			1 => Some(Self::RemoteAet),
			2 => Some(Self::ReceptionDate),
			3 => Some(Self::TransferSyntax),
			4 => Some(Self::SopClassUid),
			5 => Some(Self::IndexInSeries),
			6 => Some(Self::ModifiedFrom),
			7 => Some(Self::AnonymizedFrom),
			8 => Some(Self::ExpectedInstances),
			_ => None,
		}
	}
}

#[derive(Debug, Clone, Serialize)]
pub struct ChangeEntry {
	pub seq: i64,
	pub change: ChangeKind,
	pub public_id: String,
	pub kind: ResourceKind,
	pub date: String,
}

/// Events emitted by a committed write transaction, in commit order.
#[derive(Debug)]
pub enum IndexEvent {
	ResourceDeleted {
		public_id: String,
		kind: ResourceKind,
	},
	FileDeleted(FileInfo),
	RemainingAncestor {
		public_id: String,
		kind: ResourceKind,
	},
	Change(ChangeEntry),
}

/// Sink for [`IndexEvent`]s. A failing handler is logged and ignored: blob
/// leaks are acceptable, dangling rows are not.
pub trait IndexListener: Send + Sync {
	fn handle(&self, event: &IndexEvent) -> Result<()>;
}

/// Listener that drops every event; used by maintenance paths and tests
/// that do not care about side effects.
pub struct NullListener;

impl IndexListener for NullListener {
	fn handle(&self, _event: &IndexEvent) -> Result<()> {
		Ok(())
	}
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Statistics {
	pub patients: u64,
	pub studies: u64,
	pub series: u64,
	pub instances: u64,
	pub total_compressed_size: u64,
	pub total_uncompressed_size: u64,
}

pub struct Index {
	conn: Mutex<Connection>,
}

impl Index {
	pub fn open(path: &Path, allow_upgrade: bool) -> Result<Self> {
		Self::with_connection(Connection::open(path)?, allow_upgrade)
	}

	pub fn in_memory() -> Result<Self> {
		Self::with_connection(Connection::open_in_memory()?, false)
	}

	fn with_connection(conn: Connection, allow_upgrade: bool) -> Result<Self> {
		schema::prepare(&conn, allow_upgrade)?;
		Ok(Self {
			conn: Mutex::new(conn),
		})
	}

	/// Read-only transaction. Writes made by the closure are rolled back.
	pub fn read<T>(&self, f: impl FnOnce(&mut Transaction<'_>) -> Result<T>) -> Result<T> {
		let mut guard = self.conn.lock().unwrap();
		let txn = guard.transaction()?;
		let mut transaction = Transaction {
			txn,
			events: Vec::new(),
		};
		f(&mut transaction)
		// The rusqlite transaction rolls back on drop.
	}

	/// Read-write transaction. On success the transaction is committed and
	/// the queued events are handed to `listener`.
	pub fn write<T>(
		&self,
		listener: &dyn IndexListener,
		f: impl FnOnce(&mut Transaction<'_>) -> Result<T>,
	) -> Result<T> {
		let (value, events) = self.write_committed(f)?;

		for event in &events {
			if let Err(err) = listener.handle(event) {
				error!("Index listener failed on {event:?}: {err}");
			}
		}

		Ok(value)
	}

	/// Runs `f` inside a committed transaction, releasing the connection
	/// lock before returning the value and the queued events.
	fn write_committed<T>(
		&self,
		f: impl FnOnce(&mut Transaction<'_>) -> Result<T>,
	) -> Result<(T, Vec<IndexEvent>)> {
		let mut guard = self.conn.lock().unwrap();
		let txn = guard.transaction()?;
		let mut transaction = Transaction {
			txn,
			events: Vec::new(),
		};

		let value = f(&mut transaction)?;
		let events = std::mem::take(&mut transaction.events);
		transaction.txn.commit()?;

		Ok((value, events))
	}
}

pub struct Transaction<'c> {
	txn: rusqlite::Transaction<'c>,
	events: Vec<IndexEvent>,
}

impl Transaction<'_> {
	// ---- resources ----------------------------------------------------

	pub fn create_resource(&mut self, public_id: &str, kind: ResourceKind) -> Result<i64> {
		self.txn.execute(
			"INSERT INTO Resources(resourceType, publicId, parentId) VALUES(?1, ?2, NULL)",
			params![kind as i64, public_id],
		)?;
		let id = self.txn.last_insert_rowid();

		if kind == ResourceKind::Patient {
			self.txn.execute(
				"INSERT INTO PatientRecyclingOrder(patientId) VALUES(?1)",
				params![id],
			)?;
		}

		Ok(id)
	}

	/// Sets `child`'s parent. The kinds must be adjacent hierarchy levels.
	pub fn attach_child(&mut self, parent: i64, child: i64) -> Result<()> {
		let parent_kind = self.kind_of(parent)?;
		let child_kind = self.kind_of(child)?;

		if child_kind.parent() != Some(parent_kind) {
			return Err(ArcError::ParameterOutOfRange(format!(
				"cannot attach a {child_kind} to a {parent_kind}"
			)));
		}

		self.txn.execute(
			"UPDATE Resources SET parentId = ?1 WHERE internalId = ?2",
			params![parent, child],
		)?;
		Ok(())
	}

	pub fn lookup_resource(&self, public_id: &str) -> Result<Option<(i64, ResourceKind)>> {
		let row = self
			.txn
			.query_row(
				"SELECT internalId, resourceType FROM Resources WHERE publicId = ?1",
				params![public_id],
				|row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
			)
			.optional()?;

		match row {
			None => Ok(None),
			Some((id, kind)) => {
				let kind = ResourceKind::from_db(kind)
					.ok_or_else(|| ArcError::Internal(format!("corrupted kind for {public_id}")))?;
				Ok(Some((id, kind)))
			}
		}
	}

	pub fn public_id(&self, id: i64) -> Result<String> {
		self.txn
			.query_row(
				"SELECT publicId FROM Resources WHERE internalId = ?1",
				params![id],
				|row| row.get(0),
			)
			.optional()?
			.ok_or_else(|| ArcError::InexistentItem(format!("resource #{id}")))
	}

	pub fn kind_of(&self, id: i64) -> Result<ResourceKind> {
		let value: Option<i64> = self
			.txn
			.query_row(
				"SELECT resourceType FROM Resources WHERE internalId = ?1",
				params![id],
				|row| row.get(0),
			)
			.optional()?;

		value
			.and_then(ResourceKind::from_db)
			.ok_or_else(|| ArcError::InexistentItem(format!("resource #{id}")))
	}

	pub fn parent_of(&self, id: i64) -> Result<Option<i64>> {
		let parent: Option<Option<i64>> = self
			.txn
			.query_row(
				"SELECT parentId FROM Resources WHERE internalId = ?1",
				params![id],
				|row| row.get(0),
			)
			.optional()?;

		match parent {
			None => Err(ArcError::InexistentItem(format!("resource #{id}"))),
			Some(parent) => Ok(parent),
		}
	}

	pub fn children_of(&self, id: i64) -> Result<Vec<i64>> {
		let mut statement = self
			.txn
			.prepare("SELECT internalId FROM Resources WHERE parentId = ?1 ORDER BY internalId")?;
		let ids = statement
			.query_map(params![id], |row| row.get(0))?
			.collect::<rusqlite::Result<Vec<i64>>>()?;
		Ok(ids)
	}

	pub fn children_public_ids(&self, id: i64) -> Result<Vec<String>> {
		let mut statement = self
			.txn
			.prepare("SELECT publicId FROM Resources WHERE parentId = ?1 ORDER BY internalId")?;
		let ids = statement
			.query_map(params![id], |row| row.get(0))?
			.collect::<rusqlite::Result<Vec<String>>>()?;
		Ok(ids)
	}

	pub fn all_public_ids(&self, kind: ResourceKind) -> Result<Vec<String>> {
		let mut statement = self.txn.prepare(
			"SELECT publicId FROM Resources WHERE resourceType = ?1 ORDER BY internalId",
		)?;
		let ids = statement
			.query_map(params![kind as i64], |row| row.get(0))?
			.collect::<rusqlite::Result<Vec<String>>>()?;
		Ok(ids)
	}

	pub fn count_resources(&self, kind: ResourceKind) -> Result<u64> {
		let count: i64 = self.txn.query_row(
			"SELECT COUNT(*) FROM Resources WHERE resourceType = ?1",
			params![kind as i64],
			|row| row.get(0),
		)?;
		Ok(count as u64)
	}

	/// Public ids of every instance at or below `id`.
	pub fn child_instances(&self, id: i64) -> Result<Vec<String>> {
		let mut instances = Vec::new();
		let mut stack = vec![id];
		while let Some(current) = stack.pop() {
			if self.kind_of(current)? == ResourceKind::Instance {
				instances.push(self.public_id(current)?);
			} else {
				stack.extend(self.children_of(current)?);
			}
		}
		instances.sort();
		Ok(instances)
	}

	/// Deletes the subtree rooted at `id`, pruning every ancestor that
	/// becomes childless on the way. Emits `FileDeleted` for each removed
	/// attachment, `ResourceDeleted` and a `Deleted` change per removed
	/// resource (children before parents), and `RemainingAncestor` for the
	/// nearest surviving ancestor if one exists.
	pub fn delete_resource(&mut self, id: i64) -> Result<()> {
		// Walk up to the topmost ancestor that only exists because of this
		// subtree.
		let mut root = id;
		loop {
			match self.parent_of(root)? {
				Some(parent) if self.child_count(parent)? == 1 => root = parent,
				_ => break,
			}
		}

		let ancestor = self.parent_of(root)?;
		let ordered = self.collect_post_order(root)?;

		let mut events = Vec::new();
		let mut changes = Vec::new();
		for &resource in &ordered {
			for info in self.attachments_of(resource)? {
				events.push(IndexEvent::FileDeleted(info));
			}
			let public_id = self.public_id(resource)?;
			let kind = self.kind_of(resource)?;
			events.push(IndexEvent::ResourceDeleted {
				public_id: public_id.clone(),
				kind,
			});
			changes.push((public_id, kind));
		}

		self.txn.execute(
			"DELETE FROM Resources WHERE internalId = ?1",
			params![root],
		)?;

		self.events.append(&mut events);
		for (public_id, kind) in changes {
			self.log_change(ChangeKind::Deleted, &public_id, kind)?;
		}

		if let Some(ancestor) = ancestor {
			let public_id = self.public_id(ancestor)?;
			let kind = self.kind_of(ancestor)?;
			self.events
				.push(IndexEvent::RemainingAncestor { public_id, kind });
		}

		Ok(())
	}

	/// Remaining-ancestor information queued by a previous
	/// [`Transaction::delete_resource`] call in this transaction, if any.
	pub fn last_remaining_ancestor(&self) -> Option<(String, ResourceKind)> {
		self.events.iter().rev().find_map(|event| match event {
			IndexEvent::RemainingAncestor { public_id, kind } => {
				Some((public_id.clone(), *kind))
			}
			_ => None,
		})
	}

	fn child_count(&self, id: i64) -> Result<u64> {
		let count: i64 = self.txn.query_row(
			"SELECT COUNT(*) FROM Resources WHERE parentId = ?1",
			params![id],
			|row| row.get(0),
		)?;
		Ok(count as u64)
	}

	fn collect_post_order(&self, root: i64) -> Result<Vec<i64>> {
		let mut ordered = Vec::new();
		let mut stack = vec![(root, false)];
		while let Some((node, expanded)) = stack.pop() {
			if expanded {
				ordered.push(node);
			} else {
				stack.push((node, true));
				for child in self.children_of(node)? {
					stack.push((child, false));
				}
			}
		}
		Ok(ordered)
	}

	// ---- attachments --------------------------------------------------

	pub fn add_attachment(&mut self, id: i64, info: &FileInfo) -> Result<()> {
		self.txn.execute(
			"INSERT INTO AttachedFiles(id, fileType, uuid, compressedSize, uncompressedSize, \
			 compressionType, uncompressedMD5, compressedMD5) \
			 VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
			params![
				id,
				info.content_type.to_db(),
				info.uuid,
				info.compressed_size as i64,
				info.uncompressed_size as i64,
				info.compression.to_db(),
				info.uncompressed_md5,
				info.compressed_md5,
			],
		)?;
		Ok(())
	}

	pub fn lookup_attachment(
		&self,
		id: i64,
		content_type: FileContentType,
	) -> Result<Option<FileInfo>> {
		let mut statement = self.txn.prepare(
			"SELECT uuid, compressedSize, uncompressedSize, compressionType, \
			 uncompressedMD5, compressedMD5 FROM AttachedFiles WHERE id = ?1 AND fileType = ?2",
		)?;

		let info = statement
			.query_row(params![id, content_type.to_db()], |row| {
				Ok((
					row.get::<_, String>(0)?,
					row.get::<_, i64>(1)?,
					row.get::<_, i64>(2)?,
					row.get::<_, i64>(3)?,
					row.get::<_, String>(4)?,
					row.get::<_, String>(5)?,
				))
			})
			.optional()?;

		match info {
			None => Ok(None),
			Some((uuid, compressed, uncompressed, compression, md5, compressed_md5)) => {
				let compression = CompressionKind::from_db(compression).ok_or_else(|| {
					ArcError::Internal(format!("corrupted compression kind for blob {uuid}"))
				})?;
				Ok(Some(FileInfo {
					uuid,
					content_type,
					uncompressed_size: uncompressed as u64,
					compressed_size: compressed as u64,
					uncompressed_md5: md5,
					compressed_md5,
					compression,
				}))
			}
		}
	}

	pub fn delete_attachment(&mut self, id: i64, content_type: FileContentType) -> Result<()> {
		if let Some(info) = self.lookup_attachment(id, content_type)? {
			self.txn.execute(
				"DELETE FROM AttachedFiles WHERE id = ?1 AND fileType = ?2",
				params![id, content_type.to_db()],
			)?;
			self.events.push(IndexEvent::FileDeleted(info));
		}
		Ok(())
	}

	fn attachments_of(&self, id: i64) -> Result<Vec<FileInfo>> {
		let mut statement = self
			.txn
			.prepare("SELECT fileType FROM AttachedFiles WHERE id = ?1 ORDER BY fileType")?;
		let types = statement
			.query_map(params![id], |row| row.get::<_, i64>(0))?
			.collect::<rusqlite::Result<Vec<i64>>>()?;

		let mut infos = Vec::with_capacity(types.len());
		for file_type in types {
			let content_type = FileContentType::from_db(file_type).ok_or_else(|| {
				ArcError::Internal(format!("corrupted attachment type {file_type}"))
			})?;
			if let Some(info) = self.lookup_attachment(id, content_type)? {
				infos.push(info);
			}
		}
		Ok(infos)
	}

	// ---- metadata -----------------------------------------------------

	pub fn set_metadata(&mut self, id: i64, metadata: MetadataType, value: &str) -> Result<()> {
		self.txn.execute(
			"INSERT OR REPLACE INTO Metadata(id, type, value) VALUES(?1, ?2, ?3)",
			params![id, metadata as i64, value],
		)?;
		Ok(())
	}

	pub fn delete_metadata(&mut self, id: i64, metadata: MetadataType) -> Result<()> {
		self.txn.execute(
			"DELETE FROM Metadata WHERE id = ?1 AND type = ?2",
			params![id, metadata as i64],
		)?;
		Ok(())
	}

	pub fn lookup_metadata(&self, id: i64, metadata: MetadataType) -> Result<Option<String>> {
		Ok(self
			.txn
			.query_row(
				"SELECT value FROM Metadata WHERE id = ?1 AND type = ?2",
				params![id, metadata as i64],
				|row| row.get(0),
			)
			.optional()?)
	}

	pub fn all_metadata(&self, id: i64) -> Result<Vec<(MetadataType, String)>> {
		let mut statement = self
			.txn
			.prepare("SELECT type, value FROM Metadata WHERE id = ?1 ORDER BY type")?;
		let rows = statement
			.query_map(params![id], |row| {
				Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
			})?
			.collect::<rusqlite::Result<Vec<_>>>()?;

		Ok(rows
			.into_iter()
			.filter_map(|(key, value)| MetadataType::from_db(key).map(|key| (key, value)))
			.collect())
	}

	// ---- DICOM tags ---------------------------------------------------

	/// Stores an identifier tag after normalization (§ identifier lookup).
	pub fn set_identifier_tag(&mut self, id: i64, tag: Tag, value: &str) -> Result<()> {
		self.txn.execute(
			"INSERT OR REPLACE INTO DicomIdentifiers(id, tagGroup, tagElement, value) \
			 VALUES(?1, ?2, ?3, ?4)",
			params![
				id,
				tag.group() as i64,
				tag.element() as i64,
				toolkit::normalize_identifier(value)
			],
		)?;
		Ok(())
	}

	pub fn set_main_tag(&mut self, id: i64, tag: Tag, value: &str) -> Result<()> {
		self.txn.execute(
			"INSERT OR REPLACE INTO MainDicomTags(id, tagGroup, tagElement, value) \
			 VALUES(?1, ?2, ?3, ?4)",
			params![id, tag.group() as i64, tag.element() as i64, value],
		)?;
		Ok(())
	}

	pub fn main_tags(&self, id: i64) -> Result<TagSummary> {
		let mut statement = self
			.txn
			.prepare("SELECT tagGroup, tagElement, value FROM MainDicomTags WHERE id = ?1")?;
		let rows = statement
			.query_map(params![id], |row| {
				Ok((
					row.get::<_, i64>(0)?,
					row.get::<_, i64>(1)?,
					row.get::<_, String>(2)?,
				))
			})?
			.collect::<rusqlite::Result<Vec<_>>>()?;

		Ok(rows
			.into_iter()
			.map(|(group, element, value)| (Tag(group as u16, element as u16), value))
			.collect())
	}

	// ---- protection & recycling --------------------------------------

	pub fn is_protected(&self, patient: i64) -> Result<bool> {
		let count: i64 = self.txn.query_row(
			"SELECT COUNT(*) FROM PatientRecyclingOrder WHERE patientId = ?1",
			params![patient],
			|row| row.get(0),
		)?;
		Ok(count == 0)
	}

	/// Toggles patient protection. Idempotent; un-protecting appends to the
	/// tail of the recycling order.
	pub fn set_protected(&mut self, patient: i64, protected: bool) -> Result<()> {
		if self.kind_of(patient)? != ResourceKind::Patient {
			return Err(ArcError::ParameterOutOfRange(String::from(
				"protection only applies to patients",
			)));
		}

		if protected {
			self.txn.execute(
				"DELETE FROM PatientRecyclingOrder WHERE patientId = ?1",
				params![patient],
			)?;
		} else if self.is_protected(patient)? {
			self.txn.execute(
				"INSERT INTO PatientRecyclingOrder(patientId) VALUES(?1)",
				params![patient],
			)?;
		}
		Ok(())
	}

	/// Head of the recycling order, skipping `exclude` if provided.
	pub fn select_patient_to_recycle(&self, exclude: Option<i64>) -> Result<Option<i64>> {
		let query = "SELECT patientId FROM PatientRecyclingOrder \
		             WHERE ?1 IS NULL OR patientId != ?1 ORDER BY seq LIMIT 1";
		Ok(self
			.txn
			.query_row(query, params![exclude], |row| row.get(0))
			.optional()?)
	}

	// ---- change log ---------------------------------------------------

	pub fn log_change(
		&mut self,
		change: ChangeKind,
		public_id: &str,
		kind: ResourceKind,
	) -> Result<()> {
		let date = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
		self.txn.execute(
			"INSERT INTO Changes(changeType, publicId, resourceType, date) VALUES(?1, ?2, ?3, ?4)",
			params![change as i64, public_id, kind as i64, date],
		)?;

		let entry = ChangeEntry {
			seq: self.txn.last_insert_rowid(),
			change,
			public_id: public_id.to_owned(),
			kind,
			date,
		};
		self.events.push(IndexEvent::Change(entry));
		Ok(())
	}

	/// Batch read of the change log. Returns the entries after `since` and
	/// whether the log end was reached.
	pub fn get_changes(&self, since: i64, limit: usize) -> Result<(Vec<ChangeEntry>, bool)> {
		let mut statement = self.txn.prepare(
			"SELECT seq, changeType, publicId, resourceType, date FROM Changes \
			 WHERE seq > ?1 ORDER BY seq LIMIT ?2",
		)?;
		let rows = statement
			.query_map(params![since, (limit + 1) as i64], |row| {
				Ok((
					row.get::<_, i64>(0)?,
					row.get::<_, i64>(1)?,
					row.get::<_, String>(2)?,
					row.get::<_, i64>(3)?,
					row.get::<_, String>(4)?,
				))
			})?
			.collect::<rusqlite::Result<Vec<_>>>()?;

		let done = rows.len() <= limit;
		let entries = rows
			.into_iter()
			.take(limit)
			.filter_map(|(seq, change, public_id, kind, date)| {
				match (ChangeKind::from_db(change), ResourceKind::from_db(kind)) {
					(Some(change), Some(kind)) => Some(ChangeEntry {
						seq,
						change,
						public_id,
						kind,
						date,
					}),
					_ => {
						warn!("Skipping corrupted change log entry #{seq}");
						None
					}
				}
			})
			.collect();

		Ok((entries, done))
	}

	// ---- global properties & statistics -------------------------------

	pub fn get_global_property(&self, property: GlobalProperty) -> Result<Option<String>> {
		Ok(self
			.txn
			.query_row(
				"SELECT value FROM GlobalProperties WHERE property = ?1",
				params![property as i64],
				|row| row.get(0),
			)
			.optional()?)
	}

	pub fn set_global_property(&mut self, property: GlobalProperty, value: &str) -> Result<()> {
		self.txn.execute(
			"INSERT OR REPLACE INTO GlobalProperties(property, value) VALUES(?1, ?2)",
			params![property as i64, value],
		)?;
		Ok(())
	}

	/// Atomically increments a monotonic counter stored as a global
	/// property, returning the new value. The counter starts at 1.
	pub fn increment_global_sequence(&mut self, property: GlobalProperty) -> Result<i64> {
		let current = self
			.get_global_property(property)?
			.and_then(|value| value.parse::<i64>().ok())
			.unwrap_or(0);
		let next = current + 1;
		self.set_global_property(property, &next.to_string())?;
		Ok(next)
	}

	pub fn total_compressed_size(&self) -> Result<u64> {
		let total: i64 = self.txn.query_row(
			"SELECT COALESCE(SUM(compressedSize), 0) FROM AttachedFiles",
			[],
			|row| row.get(0),
		)?;
		Ok(total as u64)
	}

	pub fn total_uncompressed_size(&self) -> Result<u64> {
		let total: i64 = self.txn.query_row(
			"SELECT COALESCE(SUM(uncompressedSize), 0) FROM AttachedFiles",
			[],
			|row| row.get(0),
		)?;
		Ok(total as u64)
	}

	pub fn statistics(&self) -> Result<Statistics> {
		Ok(Statistics {
			patients: self.count_resources(ResourceKind::Patient)?,
			studies: self.count_resources(ResourceKind::Study)?,
			series: self.count_resources(ResourceKind::Series)?,
			instances: self.count_resources(ResourceKind::Instance)?,
			total_compressed_size: self.total_compressed_size()?,
			total_uncompressed_size: self.total_uncompressed_size()?,
		})
	}

	// ---- identifier lookup --------------------------------------------

	/// Evaluates a conjunction of constraints at `level`. `limit` of zero
	/// means unbounded.
	pub fn apply_lookup(
		&self,
		constraints: &[LookupConstraint],
		level: ResourceKind,
		limit: usize,
	) -> Result<Vec<String>> {
		lookup::apply(self, constraints, level, limit)
	}

	pub(crate) fn identifier_value(&self, id: i64, tag: Tag) -> Result<Option<String>> {
		Ok(self
			.txn
			.query_row(
				"SELECT value FROM DicomIdentifiers WHERE id = ?1 AND tagGroup = ?2 AND tagElement = ?3",
				params![id, tag.group() as i64, tag.element() as i64],
				|row| row.get(0),
			)
			.optional()?)
	}

	pub(crate) fn main_tag_value(&self, id: i64, tag: Tag) -> Result<Option<String>> {
		Ok(self
			.txn
			.query_row(
				"SELECT value FROM MainDicomTags WHERE id = ?1 AND tagGroup = ?2 AND tagElement = ?3",
				params![id, tag.group() as i64, tag.element() as i64],
				|row| row.get(0),
			)
			.optional()?)
	}

	pub(crate) fn resources_at_level(&self, level: ResourceKind) -> Result<Vec<(i64, String)>> {
		let mut statement = self.txn.prepare(
			"SELECT internalId, publicId FROM Resources WHERE resourceType = ?1 ORDER BY internalId",
		)?;
		let rows = statement
			.query_map(params![level as i64], |row| {
				Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
			})?
			.collect::<rusqlite::Result<Vec<_>>>()?;
		Ok(rows)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::Mutex as StdMutex;

	#[derive(Default)]
	struct RecordingListener {
		deleted_files: StdMutex<Vec<String>>,
		deleted_resources: StdMutex<Vec<String>>,
		remaining: StdMutex<Option<(String, ResourceKind)>>,
		changes: StdMutex<Vec<ChangeEntry>>,
	}

	impl IndexListener for RecordingListener {
		fn handle(&self, event: &IndexEvent) -> Result<()> {
			match event {
				IndexEvent::FileDeleted(info) => {
					self.deleted_files.lock().unwrap().push(info.uuid.clone());
				}
				IndexEvent::ResourceDeleted { public_id, .. } => {
					self.deleted_resources
						.lock()
						.unwrap()
						.push(public_id.clone());
				}
				IndexEvent::RemainingAncestor { public_id, kind } => {
					*self.remaining.lock().unwrap() = Some((public_id.clone(), *kind));
				}
				IndexEvent::Change(entry) => {
					self.changes.lock().unwrap().push(entry.clone());
				}
			}
			Ok(())
		}
	}

	fn file(uuid: &str, size: u64) -> FileInfo {
		FileInfo {
			uuid: String::from(uuid),
			content_type: FileContentType::Dicom,
			uncompressed_size: size,
			compressed_size: size,
			uncompressed_md5: String::from("md5"),
			compressed_md5: String::from("md5"),
			compression: CompressionKind::None,
		}
	}

	/// a:Patient{b:Study{c:Series{d,e}, g:Series}, f:Study{h:Series}}
	fn build_tree(index: &Index, listener: &dyn IndexListener) -> Vec<i64> {
		index
			.write(listener, |t| {
				let a = t.create_resource("a", ResourceKind::Patient)?;
				let b = t.create_resource("b", ResourceKind::Study)?;
				let c = t.create_resource("c", ResourceKind::Series)?;
				let d = t.create_resource("d", ResourceKind::Instance)?;
				let e = t.create_resource("e", ResourceKind::Instance)?;
				let f = t.create_resource("f", ResourceKind::Study)?;
				let g = t.create_resource("g", ResourceKind::Series)?;
				let h = t.create_resource("h", ResourceKind::Series)?;
				t.attach_child(a, b)?;
				t.attach_child(b, c)?;
				t.attach_child(c, d)?;
				t.attach_child(c, e)?;
				t.attach_child(b, g)?;
				t.attach_child(a, f)?;
				t.attach_child(f, h)?;
				Ok(vec![a, b, c, d, e, f, g, h])
			})
			.unwrap()
	}

	#[test]
	fn remaining_ancestor_walks_upward() {
		let index = Index::in_memory().unwrap();
		let listener = RecordingListener::default();
		let ids = build_tree(&index, &listener);

		// d has the sibling e: the series survives.
		index.write(&listener, |t| t.delete_resource(ids[3])).unwrap();
		assert_eq!(
			listener.remaining.lock().unwrap().clone(),
			Some((String::from("c"), ResourceKind::Series))
		);

		// e was the last instance of c: c is pruned, b survives through g.
		index.write(&listener, |t| t.delete_resource(ids[4])).unwrap();
		assert_eq!(
			listener.remaining.lock().unwrap().clone(),
			Some((String::from("b"), ResourceKind::Study))
		);
		assert!(index
			.read(|t| t.lookup_resource("c"))
			.unwrap()
			.is_none());

		// h was the only series of f: f is pruned, the patient survives.
		index.write(&listener, |t| t.delete_resource(ids[7])).unwrap();
		assert_eq!(
			listener.remaining.lock().unwrap().clone(),
			Some((String::from("a"), ResourceKind::Patient))
		);

		// g is the last resource below a: everything is pruned, no ancestor.
		*listener.remaining.lock().unwrap() = None;
		index.write(&listener, |t| t.delete_resource(ids[6])).unwrap();
		assert_eq!(listener.remaining.lock().unwrap().clone(), None);
		assert!(index.read(|t| t.lookup_resource("a")).unwrap().is_none());
	}

	#[test]
	fn deletion_emits_files_and_resources_post_order() {
		let index = Index::in_memory().unwrap();
		let listener = RecordingListener::default();
		let ids = build_tree(&index, &listener);

		index
			.write(&listener, |t| {
				t.add_attachment(ids[4], &file("blob-e", 42))?;
				t.add_attachment(ids[3], &file("blob-d", 21))
			})
			.unwrap();

		index.write(&listener, |t| t.delete_resource(ids[0])).unwrap();

		let files = listener.deleted_files.lock().unwrap().clone();
		assert_eq!(files.len(), 2);
		assert!(files.contains(&String::from("blob-d")));
		assert!(files.contains(&String::from("blob-e")));

		let resources = listener.deleted_resources.lock().unwrap().clone();
		assert_eq!(resources.len(), 8);
		// Children precede their parents.
		let position =
			|name: &str| resources.iter().position(|r| r == name).unwrap();
		assert!(position("d") < position("c"));
		assert!(position("e") < position("c"));
		assert!(position("c") < position("b"));
		assert!(position("b") < position("a"));
		assert!(position("h") < position("f"));

		let stats = index.read(|t| t.statistics()).unwrap();
		assert_eq!(stats.patients, 0);
		assert_eq!(stats.total_compressed_size, 0);
	}

	#[test]
	fn recycling_order_is_fifo_and_respects_protection() {
		let index = Index::in_memory().unwrap();
		let listener = NullListener;

		let patients = index
			.write(&listener, |t| {
				(0..5)
					.map(|i| t.create_resource(&format!("patient-{i}"), ResourceKind::Patient))
					.collect::<Result<Vec<i64>>>()
			})
			.unwrap();

		index
			.write(&listener, |t| {
				assert_eq!(t.select_patient_to_recycle(None)?, Some(patients[0]));
				assert_eq!(
					t.select_patient_to_recycle(Some(patients[0]))?,
					Some(patients[1])
				);

				// Protecting removes from the queue, idempotently.
				t.set_protected(patients[0], true)?;
				t.set_protected(patients[0], true)?;
				assert!(t.is_protected(patients[0])?);
				assert_eq!(t.select_patient_to_recycle(None)?, Some(patients[1]));

				// Un-protecting re-appends at the tail.
				t.set_protected(patients[0], false)?;
				assert!(!t.is_protected(patients[0])?);
				assert_eq!(t.select_patient_to_recycle(None)?, Some(patients[1]));
				Ok(())
			})
			.unwrap();

		// Deleting patients pops them from the order through the cascade.
		for expected in [patients[1], patients[2]] {
			index
				.write(&listener, |t| {
					let head = t.select_patient_to_recycle(None)?.unwrap();
					assert_eq!(head, expected);
					t.delete_resource(head)
				})
				.unwrap();
		}
		index
			.write(&listener, |t| {
				assert_eq!(t.select_patient_to_recycle(None)?, Some(patients[3]));
				Ok(())
			})
			.unwrap();
	}

	#[test]
	fn change_log_is_monotone_and_gap_free() {
		let index = Index::in_memory().unwrap();
		let listener = RecordingListener::default();

		index
			.write(&listener, |t| {
				for i in 0..10 {
					let id = format!("res-{i}");
					t.create_resource(&id, ResourceKind::Patient)?;
					t.log_change(ChangeKind::NewPatient, &id, ResourceKind::Patient)?;
				}
				Ok(())
			})
			.unwrap();

		let (first, done) = index.read(|t| t.get_changes(0, 4)).unwrap();
		assert_eq!(first.len(), 4);
		assert!(!done);

		let (rest, done) = index
			.read(|t| t.get_changes(first.last().unwrap().seq, 100))
			.unwrap();
		assert_eq!(rest.len(), 6);
		assert!(done);

		let seqs = first
			.iter()
			.chain(rest.iter())
			.map(|c| c.seq)
			.collect::<Vec<_>>();
		for window in seqs.windows(2) {
			assert_eq!(window[1], window[0] + 1);
		}

		// Events fired in commit order.
		assert_eq!(listener.changes.lock().unwrap().len(), 10);
	}

	#[test]
	fn transaction_rolls_back_on_error() {
		let index = Index::in_memory().unwrap();
		let listener = RecordingListener::default();

		let result: Result<()> = index.write(&listener, |t| {
			t.create_resource("p", ResourceKind::Patient)?;
			t.log_change(ChangeKind::NewPatient, "p", ResourceKind::Patient)?;
			Err(ArcError::BadRequest(String::from("boom")))
		});
		assert!(result.is_err());

		assert!(index.read(|t| t.lookup_resource("p")).unwrap().is_none());
		// No event may escape a rolled-back transaction.
		assert!(listener.changes.lock().unwrap().is_empty());
	}

	#[test]
	fn metadata_and_attachments_roundtrip() {
		let index = Index::in_memory().unwrap();
		let listener = RecordingListener::default();

		let id = index
			.write(&listener, |t| {
				let id = t.create_resource("i", ResourceKind::Patient)?;
				t.set_metadata(id, MetadataType::RemoteAet, "PINNACLE")?;
				t.set_metadata(id, MetadataType::ModifiedFrom, "TUTU")?;
				t.add_attachment(id, &file("blob", 42))?;
				Ok(id)
			})
			.unwrap();

		index
			.read(|t| {
				assert_eq!(
					t.lookup_metadata(id, MetadataType::RemoteAet)?,
					Some(String::from("PINNACLE"))
				);
				assert_eq!(t.all_metadata(id)?.len(), 2);

				let info = t.lookup_attachment(id, FileContentType::Dicom)?.unwrap();
				assert_eq!(info.uuid, "blob");
				assert_eq!(info.compressed_size, 42);
				Ok(())
			})
			.unwrap();

		index
			.write(&listener, |t| {
				t.delete_metadata(id, MetadataType::ModifiedFrom)?;
				t.delete_attachment(id, FileContentType::Dicom)
			})
			.unwrap();

		assert_eq!(
			listener.deleted_files.lock().unwrap().clone(),
			vec![String::from("blob")]
		);
		index
			.read(|t| {
				assert_eq!(t.all_metadata(id)?.len(), 1);
				assert!(t.lookup_attachment(id, FileContentType::Dicom)?.is_none());
				Ok(())
			})
			.unwrap();
	}

	#[test]
	fn global_sequence_increments() {
		let index = Index::in_memory().unwrap();
		let listener = NullListener;

		for expected in 1..=3 {
			let value = index
				.write(&listener, |t| {
					t.increment_global_sequence(GlobalProperty::AnonymizationSequence)
				})
				.unwrap();
			assert_eq!(value, expected);
		}
	}

	#[test]
	fn statistics_track_attachment_sizes() {
		let index = Index::in_memory().unwrap();
		let listener = NullListener;

		index
			.write(&listener, |t| {
				let a = t.create_resource("p1", ResourceKind::Patient)?;
				let b = t.create_resource("p2", ResourceKind::Patient)?;
				t.add_attachment(a, &file("u1", 10))?;
				t.add_attachment(
					b,
					&FileInfo {
						uuid: String::from("u2"),
						content_type: FileContentType::DicomAsJson,
						uncompressed_size: 42,
						compressed_size: 21,
						uncompressed_md5: String::from("md5"),
						compressed_md5: String::from("other"),
						compression: CompressionKind::ZlibWithSize,
					},
				)?;
				Ok(())
			})
			.unwrap();

		let stats = index.read(|t| t.statistics()).unwrap();
		assert_eq!(stats.patients, 2);
		assert_eq!(stats.total_compressed_size, 31);
		assert_eq!(stats.total_uncompressed_size, 52);
	}

	#[test]
	fn attach_child_validates_levels() {
		let index = Index::in_memory().unwrap();
		let listener = NullListener;

		index
			.write(&listener, |t| {
				let patient = t.create_resource("p", ResourceKind::Patient)?;
				let instance = t.create_resource("i", ResourceKind::Instance)?;
				assert!(matches!(
					t.attach_child(patient, instance),
					Err(ArcError::ParameterOutOfRange(_))
				));
				Ok(())
			})
			.unwrap();
	}
}
