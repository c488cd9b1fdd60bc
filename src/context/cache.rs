//! Count-bounded LRU cache of parsed DICOM instances.
//!
//! Two locking levels: a short map mutex for lookup, insertion and
//! eviction, and one mutex per entry held while a caller works with the
//! parsed object. Busy entries (refcount > 0) are never evicted.

use dicom::object::{FileDicomObject, InMemDicomObject};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

pub type ParsedDicomFile = FileDicomObject<InMemDicomObject>;

struct CacheEntry {
	object: Mutex<ParsedDicomFile>,
	refcount: AtomicUsize,
}

/// Shared handle on one cache entry. Holding the accessor pins the entry;
/// [`CacheAccessor::lock`] serializes concurrent readers of one instance.
pub struct CacheAccessor {
	entry: Arc<CacheEntry>,
}

impl CacheAccessor {
	pub fn lock(&self) -> MutexGuard<'_, ParsedDicomFile> {
		self.entry.object.lock().unwrap()
	}
}

impl Drop for CacheAccessor {
	fn drop(&mut self) {
		self.entry.refcount.fetch_sub(1, Ordering::SeqCst);
	}
}

struct CacheInner {
	entries: HashMap<String, Arc<CacheEntry>>,
	recency: VecDeque<String>,
}

pub struct ParsedDicomCache {
	inner: Mutex<CacheInner>,
	capacity: usize,
}

impl ParsedDicomCache {
	pub fn new(capacity: usize) -> Self {
		assert!(capacity > 0);
		Self {
			inner: Mutex::new(CacheInner {
				entries: HashMap::with_capacity(capacity),
				recency: VecDeque::with_capacity(capacity),
			}),
			capacity,
		}
	}

	pub fn get(&self, public_id: &str) -> Option<CacheAccessor> {
		let mut inner = self.inner.lock().unwrap();
		let entry = Arc::clone(inner.entries.get(public_id)?);
		entry.refcount.fetch_add(1, Ordering::SeqCst);
		Self::touch(&mut inner, public_id);
		Some(CacheAccessor { entry })
	}

	/// Inserts (or replaces) an entry and returns an accessor to it. May
	/// evict the least recently used idle entry.
	pub fn insert(&self, public_id: &str, object: ParsedDicomFile) -> CacheAccessor {
		let entry = Arc::new(CacheEntry {
			object: Mutex::new(object),
			refcount: AtomicUsize::new(1),
		});

		let mut inner = self.inner.lock().unwrap();
		inner
			.entries
			.insert(public_id.to_owned(), Arc::clone(&entry));
		Self::touch(&mut inner, public_id);

		while inner.entries.len() > self.capacity {
			if !Self::evict_one(&mut inner) {
				break;
			}
		}

		CacheAccessor { entry }
	}

	pub fn invalidate(&self, public_id: &str) {
		let mut inner = self.inner.lock().unwrap();
		inner.entries.remove(public_id);
		inner.recency.retain(|id| id != public_id);
	}

	pub fn len(&self) -> usize {
		self.inner.lock().unwrap().entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	fn touch(inner: &mut CacheInner, public_id: &str) {
		inner.recency.retain(|id| id != public_id);
		inner.recency.push_back(public_id.to_owned());
	}

	/// Removes the least recently used entry whose refcount is zero.
	fn evict_one(inner: &mut CacheInner) -> bool {
		let victim = inner.recency.iter().position(|id| {
			inner
				.entries
				.get(id)
				.is_some_and(|entry| entry.refcount.load(Ordering::SeqCst) == 0)
		});

		match victim {
			Some(position) => {
				let id = inner.recency.remove(position).expect("position is valid");
				inner.entries.remove(&id);
				true
			}
			None => false,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use dicom::object::FileMetaTableBuilder;

	fn parsed(sop_instance_uid: &str) -> ParsedDicomFile {
		let meta = FileMetaTableBuilder::new()
			.media_storage_sop_class_uid("1.2.840.10008.5.1.4.1.1.7")
			.media_storage_sop_instance_uid(sop_instance_uid)
			.transfer_syntax("1.2.840.10008.1.2.1")
			.build()
			.expect("file meta");
		FileDicomObject::new_empty_with_meta(meta)
	}

	#[test]
	fn evicts_by_recency() {
		let cache = ParsedDicomCache::new(2);
		drop(cache.insert("a", parsed("1")));
		drop(cache.insert("b", parsed("2")));
		assert!(cache.get("a").is_some());

		// "b" is now the least recently used entry.
		drop(cache.insert("c", parsed("3")));
		assert_eq!(cache.len(), 2);
		assert!(cache.get("b").is_none());
		assert!(cache.get("a").is_some());
		assert!(cache.get("c").is_some());
	}

	#[test]
	fn busy_entries_survive_eviction() {
		let cache = ParsedDicomCache::new(1);
		let pinned = cache.insert("a", parsed("1"));

		// Over capacity, but "a" is pinned and cannot be evicted.
		drop(cache.insert("b", parsed("2")));
		assert!(cache.get("a").is_some());
		assert_eq!(cache.len(), 2);

		drop(pinned);
		drop(cache.insert("c", parsed("3")));
		assert_eq!(cache.len(), 1);
		assert!(cache.get("a").is_none());
		assert!(cache.get("c").is_some());
	}

	#[test]
	fn invalidate_removes_entry() {
		let cache = ParsedDicomCache::new(4);
		drop(cache.insert("a", parsed("1")));
		cache.invalidate("a");
		assert!(cache.get("a").is_none());
		assert!(cache.is_empty());
	}
}
