//! Bounded archive of outstanding remote query handles.
//!
//! A synchronous C-FIND against a modality registers its answers here; the
//! returned opaque id addresses the handler for later retrieve operations.
//! The archive is an LRU: inserting into a full archive evicts the least
//! recently used handler.

use crate::types::{QueryRetrieveLevel, AE};
use dicom::core::Tag;
use dicom::object::mem::InMemElement;
use dicom::object::InMemDicomObject;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

const HANDLE_LENGTH: usize = 16;

/// Answers of one C-FIND against a remote modality, kept so the client can
/// retrieve (C-MOVE) individual answers later.
pub struct QueryRetrieveHandler {
	pub remote_aet: AE,
	pub level: QueryRetrieveLevel,
	pub query: Vec<(Tag, String)>,
	pub answers: Vec<InMemDicomObject>,
}

impl QueryRetrieveHandler {
	/// Identifier fields of one answer, restricted to non-empty textual
	/// values, ready to seed a C-MOVE request.
	pub fn answer_identifiers(&self, index: usize) -> Option<Vec<(Tag, String)>> {
		let answer = self.answers.get(index)?;
		let mut identifiers = Vec::new();
		for element in answer {
			if let Ok(value) = InMemElement::to_str(element) {
				let value = value.trim_end_matches('\0').trim();
				if !value.is_empty() {
					identifiers.push((element.header().tag, String::from(value)));
				}
			}
		}
		Some(identifiers)
	}
}

struct ArchiveInner {
	handlers: HashMap<String, Arc<QueryRetrieveHandler>>,
	recency: VecDeque<String>,
}

pub struct QueryRetrieveArchive {
	inner: Mutex<ArchiveInner>,
	capacity: usize,
}

impl QueryRetrieveArchive {
	pub fn new(capacity: usize) -> Self {
		assert!(capacity > 0);
		Self {
			inner: Mutex::new(ArchiveInner {
				handlers: HashMap::with_capacity(capacity),
				recency: VecDeque::with_capacity(capacity),
			}),
			capacity,
		}
	}

	/// Registers a handler and returns its opaque id.
	pub fn insert(&self, handler: QueryRetrieveHandler) -> String {
		let id: String = rand::thread_rng()
			.sample_iter(&Alphanumeric)
			.take(HANDLE_LENGTH)
			.map(char::from)
			.collect();

		let mut inner = self.inner.lock().unwrap();
		inner.handlers.insert(id.clone(), Arc::new(handler));
		inner.recency.push_back(id.clone());

		while inner.handlers.len() > self.capacity {
			if let Some(victim) = inner.recency.pop_front() {
				inner.handlers.remove(&victim);
			}
		}

		id
	}

	/// Fetches a handler and marks it most recently used.
	pub fn get(&self, id: &str) -> Option<Arc<QueryRetrieveHandler>> {
		let mut inner = self.inner.lock().unwrap();
		let handler = Arc::clone(inner.handlers.get(id)?);

		inner.recency.retain(|existing| existing != id);
		inner.recency.push_back(String::from(id));
		Some(handler)
	}

	pub fn remove(&self, id: &str) {
		let mut inner = self.inner.lock().unwrap();
		inner.handlers.remove(id);
		inner.recency.retain(|existing| existing != id);
	}

	pub fn len(&self) -> usize {
		self.inner.lock().unwrap().handlers.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn handler(aet: &str) -> QueryRetrieveHandler {
		QueryRetrieveHandler {
			remote_aet: AE::from(aet),
			level: QueryRetrieveLevel::Study,
			query: Vec::new(),
			answers: Vec::new(),
		}
	}

	#[test]
	fn insert_and_get() {
		let archive = QueryRetrieveArchive::new(4);
		let id = archive.insert(handler("PACS"));
		assert_eq!(id.len(), HANDLE_LENGTH);

		let found = archive.get(&id).unwrap();
		assert_eq!(found.remote_aet, "PACS");
		assert!(archive.get("unknown").is_none());
	}

	#[test]
	fn eviction_is_least_recently_used() {
		let archive = QueryRetrieveArchive::new(2);
		let first = archive.insert(handler("A"));
		let second = archive.insert(handler("B"));

		// Touch the oldest so the other becomes the eviction candidate.
		archive.get(&first).unwrap();

		let third = archive.insert(handler("C"));
		assert_eq!(archive.len(), 2);
		assert!(archive.get(&second).is_none());
		assert!(archive.get(&first).is_some());
		assert!(archive.get(&third).is_some());
	}

	#[test]
	fn remove_discards_the_handler() {
		let archive = QueryRetrieveArchive::new(2);
		let id = archive.insert(handler("A"));
		archive.remove(&id);
		assert!(archive.is_empty());
		assert!(archive.get(&id).is_none());
	}
}
