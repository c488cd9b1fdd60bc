//! SQLite schema of the resource index.

use crate::error::{ArcError, Result};
use rusqlite::Connection;

/// Schema version expected by this build. Older databases are migrated when
/// the caller allows it, newer databases are refused.
pub const SCHEMA_VERSION: i64 = 2;

/// Integer keys of the `GlobalProperties` table. Persisted values, do not
/// renumber.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum GlobalProperty {
	DatabaseSchemaVersion = 1,
	FlushSleep = 2,
	AnonymizationSequence = 3,
	JobsRegistry = 4,
}

const SCHEMA_SQL: &str = r#"
CREATE TABLE GlobalProperties(
	property INTEGER PRIMARY KEY,
	value TEXT NOT NULL
);

CREATE TABLE Resources(
	internalId INTEGER PRIMARY KEY AUTOINCREMENT,
	resourceType INTEGER NOT NULL,
	publicId TEXT NOT NULL UNIQUE,
	parentId INTEGER REFERENCES Resources(internalId) ON DELETE CASCADE
);
CREATE INDEX ResourceParent ON Resources(parentId);
CREATE INDEX ResourceKind ON Resources(resourceType);

CREATE TABLE MainDicomTags(
	id INTEGER NOT NULL REFERENCES Resources(internalId) ON DELETE CASCADE,
	tagGroup INTEGER NOT NULL,
	tagElement INTEGER NOT NULL,
	value TEXT,
	PRIMARY KEY(id, tagGroup, tagElement)
);

CREATE TABLE DicomIdentifiers(
	id INTEGER NOT NULL REFERENCES Resources(internalId) ON DELETE CASCADE,
	tagGroup INTEGER NOT NULL,
	tagElement INTEGER NOT NULL,
	value TEXT,
	PRIMARY KEY(id, tagGroup, tagElement)
);

CREATE TABLE Metadata(
	id INTEGER NOT NULL REFERENCES Resources(internalId) ON DELETE CASCADE,
	type INTEGER NOT NULL,
	value TEXT NOT NULL,
	PRIMARY KEY(id, type)
);

CREATE TABLE AttachedFiles(
	id INTEGER NOT NULL REFERENCES Resources(internalId) ON DELETE CASCADE,
	fileType INTEGER NOT NULL,
	uuid TEXT NOT NULL,
	compressedSize INTEGER NOT NULL,
	uncompressedSize INTEGER NOT NULL,
	compressionType INTEGER NOT NULL,
	uncompressedMD5 TEXT NOT NULL,
	compressedMD5 TEXT NOT NULL,
	PRIMARY KEY(id, fileType)
);

CREATE TABLE Changes(
	seq INTEGER PRIMARY KEY AUTOINCREMENT,
	changeType INTEGER NOT NULL,
	publicId TEXT NOT NULL,
	resourceType INTEGER NOT NULL,
	date TEXT NOT NULL
);

CREATE TABLE PatientRecyclingOrder(
	seq INTEGER PRIMARY KEY AUTOINCREMENT,
	patientId INTEGER NOT NULL UNIQUE REFERENCES Resources(internalId) ON DELETE CASCADE
);
"#;

// Added in schema version 2: lookup over identifier values was a full table
// scan before.
const MIGRATE_V1_TO_V2_SQL: &str = r#"
CREATE INDEX IF NOT EXISTS DicomIdentifiersValue
	ON DicomIdentifiers(tagGroup, tagElement, value);
"#;

fn stored_version(conn: &Connection) -> Result<Option<i64>> {
	let mut statement = conn.prepare(
		"SELECT value FROM GlobalProperties WHERE property = ?1",
	)?;
	let mut rows = statement.query([GlobalProperty::DatabaseSchemaVersion as i64])?;
	match rows.next()? {
		None => Ok(None),
		Some(row) => {
			let value: String = row.get(0)?;
			value
				.parse::<i64>()
				.map(Some)
				.map_err(|_| ArcError::Internal(format!("malformed schema version: {value}")))
		}
	}
}

fn set_version(conn: &Connection, version: i64) -> Result<()> {
	conn.execute(
		"INSERT OR REPLACE INTO GlobalProperties(property, value) VALUES(?1, ?2)",
		rusqlite::params![GlobalProperty::DatabaseSchemaVersion as i64, version.to_string()],
	)?;
	Ok(())
}

/// Creates a fresh schema or brings an existing database up to
/// [`SCHEMA_VERSION`]. Startup fails on a database newer than this build, or
/// older when `allow_upgrade` is false.
pub fn prepare(conn: &Connection, allow_upgrade: bool) -> Result<()> {
	conn.execute_batch("PRAGMA foreign_keys = ON;")?;

	let is_fresh: i64 = conn.query_row(
		"SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'Resources'",
		[],
		|row| row.get(0),
	)?;

	if is_fresh == 0 {
		conn.execute_batch(SCHEMA_SQL)?;
		conn.execute_batch(MIGRATE_V1_TO_V2_SQL)?;
		set_version(conn, SCHEMA_VERSION)?;
		return Ok(());
	}

	let found = stored_version(conn)?.ok_or_else(|| {
		ArcError::Internal(String::from("existing database without a schema version"))
	})?;

	if found > SCHEMA_VERSION {
		return Err(ArcError::IncompatibleDatabaseVersion {
			found,
			expected: SCHEMA_VERSION,
		});
	}

	if found < SCHEMA_VERSION {
		if !allow_upgrade {
			return Err(ArcError::IncompatibleDatabaseVersion {
				found,
				expected: SCHEMA_VERSION,
			});
		}

		if found < 2 {
			conn.execute_batch(MIGRATE_V1_TO_V2_SQL)?;
		}

		set_version(conn, SCHEMA_VERSION)?;
	}

	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn fresh_database_gets_current_version() {
		let conn = Connection::open_in_memory().unwrap();
		prepare(&conn, false).unwrap();
		assert_eq!(stored_version(&conn).unwrap(), Some(SCHEMA_VERSION));
	}

	#[test]
	fn newer_database_is_refused() {
		let conn = Connection::open_in_memory().unwrap();
		prepare(&conn, false).unwrap();
		set_version(&conn, SCHEMA_VERSION + 1).unwrap();
		assert!(matches!(
			prepare(&conn, true),
			Err(ArcError::IncompatibleDatabaseVersion { .. })
		));
	}

	#[test]
	fn upgrade_is_gated() {
		let conn = Connection::open_in_memory().unwrap();
		prepare(&conn, false).unwrap();
		set_version(&conn, 1).unwrap();

		assert!(matches!(
			prepare(&conn, false),
			Err(ArcError::IncompatibleDatabaseVersion { found: 1, .. })
		));
		prepare(&conn, true).unwrap();
		assert_eq!(stored_version(&conn).unwrap(), Some(SCHEMA_VERSION));
	}
}
