//! Domain model for integrity-chained database backups.
//!
//! Every completed backup is recorded as a [`Block`] whose hash covers its own
//! fields and the hash of its predecessor. A [`Chain`] is the ordered,
//! append-only list of those blocks; [`Chain::verify`] recomputes every hash
//! and link to detect tampering.

use std::path::PathBuf;

mod block;
mod chain;
mod digest;
mod naming;
mod outcome;

pub use block::{Block, BlockInput, Metadata};
pub use chain::{Chain, ChainStatus};
pub use digest::{canonical_json, canonical_metadata, sha256_file, sha256_hex, sha256_reader};
pub use naming::{
    archive_file_name, format_run_stamp, parse_archive_timestamp, ARCHIVE_EXTENSION,
    ARCHIVE_PREFIX,
};
pub use outcome::{
    BackupResult, IssueKind, LatestBackupCheck, RestoreResult, VerificationIssue,
    VerificationResult,
};

/// `previous_hash` of block 0. No genesis block is ever materialized.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Default classification tag for blocks written by a backup run.
pub const DEFAULT_DATA_TYPE: &str = "full_backup";

/// Metadata keys written by the backup orchestrator.
pub mod metadata_keys {
    pub const TABLES_COUNT: &str = "tables_count";
    pub const TOTAL_ROWS: &str = "total_rows";
    pub const SOURCE_SIZE: &str = "db_size";
    pub const ARCHIVE_SIZE: &str = "archive_size";
    pub const TABLE_EXPORTS: &str = "table_exports";
    pub const RUN_TIMESTAMP: &str = "backup_timestamp";
}

#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("chain store is corrupt: {0}")]
    ChainCorrupt(String),
    #[error("export failed: {0}")]
    ExportFailed(String),
    #[error("archive failed: {0}")]
    ArchiveFailed(String),
    #[error("hash mismatch for {reference}: expected {expected}, got {actual}")]
    HashMismatch {
        reference: String,
        expected: String,
        actual: String,
    },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("archive placement failed: {0}")]
    PlacementFailed(String),
    #[error("database error: {0}")]
    Database(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("timestamp error: {0}")]
    Timestamp(String),
}

impl BackupError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }
}

pub type Result<T, E = BackupError> = std::result::Result<T, E>;
