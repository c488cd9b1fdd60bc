//! Content-addressed blob storage. The index only ever references blobs by
//! uuid; everything else (sizes, digests, compression) travels in
//! [`FileInfo`] rows.

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{Error, ErrorKind, Read, Write};
use std::path::PathBuf;
use std::sync::Mutex;
use uuid::Uuid;

/// Attachment content types. The range `[1024, 65535]` is reserved for
/// user-defined attachments.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileContentType {
	Dicom,
	DicomAsJson,
	User(u16),
}

impl FileContentType {
	pub const USER_RANGE_START: u16 = 1024;

	pub const fn to_db(self) -> i64 {
		match self {
			Self::Dicom => 1,
			Self::DicomAsJson => 2,
			Self::User(value) => value as i64,
		}
	}

	pub const fn from_db(value: i64) -> Option<Self> {
		match value {
			1 => Some(Self::Dicom),
			2 => Some(Self::DicomAsJson),
			1024..=65535 => Some(Self::User(value as u16)),
			_ => None,
		}
	}
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompressionKind {
	None,
	/// zlib stream prefixed with the uncompressed length as 8 bytes
	/// little-endian.
	ZlibWithSize,
}

impl CompressionKind {
	pub const fn to_db(self) -> i64 {
		match self {
			Self::None => 1,
			Self::ZlibWithSize => 2,
		}
	}

	pub const fn from_db(value: i64) -> Option<Self> {
		match value {
			1 => Some(Self::None),
			2 => Some(Self::ZlibWithSize),
			_ => None,
		}
	}
}

/// Descriptor of one attachment blob, as persisted in `AttachedFiles`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
	pub uuid: String,
	pub content_type: FileContentType,
	pub uncompressed_size: u64,
	pub compressed_size: u64,
	pub uncompressed_md5: String,
	pub compressed_md5: String,
	pub compression: CompressionKind,
}

impl FileInfo {
	/// Encodes `data` for storage under a fresh uuid, computing both digests.
	/// Returns the descriptor together with the bytes to hand to the storage
	/// area.
	pub fn encode(
		content_type: FileContentType,
		data: &[u8],
		compression: CompressionKind,
	) -> std::io::Result<(Self, Vec<u8>)> {
		let stored = match compression {
			CompressionKind::None => data.to_vec(),
			CompressionKind::ZlibWithSize => compress_with_size(data)?,
		};

		let info = Self {
			uuid: Uuid::new_v4().to_string(),
			content_type,
			uncompressed_size: data.len() as u64,
			compressed_size: stored.len() as u64,
			uncompressed_md5: md5_hex(data),
			compressed_md5: md5_hex(&stored),
			compression,
		};

		Ok((info, stored))
	}

	/// Reverses [`FileInfo::encode`], verifying the stored digest first.
	pub fn decode(&self, stored: &[u8]) -> std::io::Result<Vec<u8>> {
		if md5_hex(stored) != self.compressed_md5 {
			return Err(Error::new(
				ErrorKind::InvalidData,
				format!("digest mismatch for blob {}", self.uuid),
			));
		}

		match self.compression {
			CompressionKind::None => Ok(stored.to_vec()),
			CompressionKind::ZlibWithSize => decompress_with_size(stored),
		}
	}
}

fn md5_hex(data: &[u8]) -> String {
	let digest = Md5::digest(data);
	digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

fn compress_with_size(data: &[u8]) -> std::io::Result<Vec<u8>> {
	let mut output = Vec::with_capacity(8 + data.len() / 2);
	output.extend_from_slice(&(data.len() as u64).to_le_bytes());

	let mut encoder = ZlibEncoder::new(output, Compression::default());
	encoder.write_all(data)?;
	encoder.finish()
}

fn decompress_with_size(stored: &[u8]) -> std::io::Result<Vec<u8>> {
	if stored.len() < 8 {
		return Err(Error::new(
			ErrorKind::InvalidData,
			"zlib-with-size blob shorter than its header",
		));
	}

	let expected = u64::from_le_bytes(stored[..8].try_into().expect("checked length"));
	let mut decoder = ZlibDecoder::new(&stored[8..]);
	let mut output = Vec::with_capacity(expected as usize);
	decoder.read_to_end(&mut output)?;

	if output.len() as u64 != expected {
		return Err(Error::new(
			ErrorKind::InvalidData,
			"zlib-with-size length header does not match stream",
		));
	}

	Ok(output)
}

/// Blob store keyed by uuid. The content type is a hint only; the uuid alone
/// locates the blob.
pub trait StorageArea: Send + Sync {
	fn create(&self, uuid: &str, data: &[u8], content_type: FileContentType)
		-> std::io::Result<()>;
	fn read(&self, uuid: &str, content_type: FileContentType) -> std::io::Result<Vec<u8>>;
	fn remove(&self, uuid: &str, content_type: FileContentType) -> std::io::Result<()>;
}

/// Filesystem store sharding blobs over two directory levels so no single
/// directory grows unbounded.
pub struct FilesystemStorage {
	root: PathBuf,
}

impl FilesystemStorage {
	pub fn new(root: impl Into<PathBuf>) -> Self {
		Self { root: root.into() }
	}

	fn path_of(&self, uuid: &str) -> std::io::Result<PathBuf> {
		if uuid.len() < 4 {
			return Err(Error::new(
				ErrorKind::InvalidInput,
				format!("malformed blob uuid: {uuid}"),
			));
		}
		Ok(self.root.join(&uuid[0..2]).join(&uuid[2..4]).join(uuid))
	}
}

impl StorageArea for FilesystemStorage {
	fn create(
		&self,
		uuid: &str,
		data: &[u8],
		_content_type: FileContentType,
	) -> std::io::Result<()> {
		let path = self.path_of(uuid)?;
		if let Some(parent) = path.parent() {
			std::fs::create_dir_all(parent)?;
		}
		std::fs::write(path, data)
	}

	fn read(&self, uuid: &str, _content_type: FileContentType) -> std::io::Result<Vec<u8>> {
		std::fs::read(self.path_of(uuid)?)
	}

	fn remove(&self, uuid: &str, _content_type: FileContentType) -> std::io::Result<()> {
		let path = self.path_of(uuid)?;
		match std::fs::remove_file(path) {
			Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
			other => other,
		}
	}
}

/// In-memory store for tests.
#[derive(Default)]
pub struct MemoryStorage {
	blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn len(&self) -> usize {
		self.blobs.lock().unwrap().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

impl StorageArea for MemoryStorage {
	fn create(
		&self,
		uuid: &str,
		data: &[u8],
		_content_type: FileContentType,
	) -> std::io::Result<()> {
		self.blobs
			.lock()
			.unwrap()
			.insert(uuid.to_owned(), data.to_vec());
		Ok(())
	}

	fn read(&self, uuid: &str, _content_type: FileContentType) -> std::io::Result<Vec<u8>> {
		self.blobs
			.lock()
			.unwrap()
			.get(uuid)
			.cloned()
			.ok_or_else(|| Error::new(ErrorKind::NotFound, format!("no blob {uuid}")))
	}

	fn remove(&self, uuid: &str, _content_type: FileContentType) -> std::io::Result<()> {
		self.blobs.lock().unwrap().remove(uuid);
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn zlib_with_size_roundtrip() {
		let data = b"DICM test payload with some repetition repetition repetition";
		let (info, stored) = FileInfo::encode(
			FileContentType::Dicom,
			data,
			CompressionKind::ZlibWithSize,
		)
		.unwrap();

		assert_eq!(info.uncompressed_size, data.len() as u64);
		assert_eq!(info.compressed_size, stored.len() as u64);
		assert_eq!(
			u64::from_le_bytes(stored[..8].try_into().unwrap()),
			data.len() as u64
		);

		let decoded = info.decode(&stored).unwrap();
		assert_eq!(decoded, data);
	}

	#[test]
	fn digest_mismatch_is_detected() {
		let (info, mut stored) =
			FileInfo::encode(FileContentType::Dicom, b"payload", CompressionKind::None).unwrap();
		stored[0] ^= 0xFF;
		assert!(info.decode(&stored).is_err());
	}

	#[test]
	fn filesystem_roundtrip() {
		let dir = tempfile::tempdir().unwrap();
		let storage = FilesystemStorage::new(dir.path());

		let uuid = Uuid::new_v4().to_string();
		storage
			.create(&uuid, b"bytes", FileContentType::Dicom)
			.unwrap();
		assert_eq!(storage.read(&uuid, FileContentType::Dicom).unwrap(), b"bytes");

		storage.remove(&uuid, FileContentType::Dicom).unwrap();
		assert!(storage.read(&uuid, FileContentType::Dicom).is_err());
		// A second removal is a no-op.
		storage.remove(&uuid, FileContentType::Dicom).unwrap();
	}

	#[test]
	fn content_type_db_roundtrip() {
		for ct in [
			FileContentType::Dicom,
			FileContentType::DicomAsJson,
			FileContentType::User(2048),
		] {
			assert_eq!(FileContentType::from_db(ct.to_db()), Some(ct));
		}
		assert_eq!(FileContentType::from_db(500), None);
	}
}
