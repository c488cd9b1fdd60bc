use crate::types::{AE, US};
use axum::http::StatusCode;
use thiserror::Error;

/// Process-wide error taxonomy. Module-local errors (association, pool,
/// read/write) stay in their modules and are folded into this type at the
/// service boundaries.
#[derive(Debug, Error)]
pub enum ArcError {
	#[error("Bad request: {0}")]
	BadRequest(String),

	#[error("Parameter out of range: {0}")]
	ParameterOutOfRange(String),

	#[error("Unknown resource: {0}")]
	UnknownResource(String),

	#[error("Inexistent item: {0}")]
	InexistentItem(String),

	#[error("Bad sequence of calls: {0}")]
	BadSequenceOfCalls(&'static str),

	#[error("Trying to set a tag that is already present: {0}")]
	AlreadyExistingTag(String),

	#[error("DIMSE error from {remote}: status 0x{status:04X}")]
	NetworkProtocol { remote: AE, status: US },

	#[error("Timeout while communicating with {0}")]
	Timeout(AE),

	#[error("The storage quota is exhausted and no patient can be recycled")]
	FullStorage,

	#[error("Bad file format: {0}")]
	BadFileFormat(String),

	#[error("Corrupted file: {0}")]
	CorruptedFile(String),

	#[error("Database error: {0}")]
	Database(#[from] rusqlite::Error),

	#[error("Incompatible database schema version: found {found}, expected {expected}")]
	IncompatibleDatabaseVersion { found: i64, expected: i64 },

	#[error("Not implemented: {0}")]
	NotImplemented(&'static str),

	#[error("Storage area I/O failure: {0}")]
	StorageArea(#[from] std::io::Error),

	#[error("Internal error: {0}")]
	Internal(String),
}

impl ArcError {
	/// HTTP status the REST layer answers with when this error escapes a
	/// handler.
	pub const fn http_status(&self) -> StatusCode {
		match self {
			Self::BadRequest(_) | Self::ParameterOutOfRange(_) => StatusCode::BAD_REQUEST,
			Self::UnknownResource(_) | Self::InexistentItem(_) => StatusCode::NOT_FOUND,
			Self::NetworkProtocol { .. } => StatusCode::UNPROCESSABLE_ENTITY,
			Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
			Self::FullStorage => StatusCode::INSUFFICIENT_STORAGE,
			Self::BadFileFormat(_) | Self::CorruptedFile(_) => StatusCode::BAD_REQUEST,
			Self::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
			_ => StatusCode::INTERNAL_SERVER_ERROR,
		}
	}
}

pub type Result<T> = std::result::Result<T, ArcError>;

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn http_mapping() {
		assert_eq!(
			ArcError::UnknownResource(String::from("x")).http_status(),
			StatusCode::NOT_FOUND
		);
		assert_eq!(
			ArcError::NetworkProtocol {
				remote: AE::from("PACS"),
				status: 0xA700,
			}
			.http_status(),
			StatusCode::UNPROCESSABLE_ENTITY
		);
		assert_eq!(ArcError::FullStorage.http_status(), StatusCode::INSUFFICIENT_STORAGE);
	}

	#[test]
	fn network_protocol_message_embeds_hex_status() {
		let err = ArcError::NetworkProtocol {
			remote: AE::from("REMOTE"),
			status: 0xC001,
		};
		assert_eq!(err.to_string(), "DIMSE error from REMOTE: status 0xC001");
	}
}
