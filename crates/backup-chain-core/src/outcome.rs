use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    HashMismatch,
    LinkBroken,
    NumberMismatch,
    TimestampRegression,
    UnparsableTimestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VerificationIssue {
    pub block_number: u64,
    pub kind: IssueKind,
    pub message: String,
}

impl VerificationIssue {
    #[must_use]
    pub fn new(block_number: u64, kind: IssueKind, message: String) -> Self {
        Self { block_number, kind, message }
    }
}

/// Outcome of a whole-chain verification pass.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VerificationResult {
    pub is_valid: bool,
    pub blocks_checked: usize,
    pub total_archive_bytes: u64,
    pub errors: Vec<VerificationIssue>,
    pub warnings: Vec<VerificationIssue>,
}

/// Chain verification plus the on-disk check of the most recent archive.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LatestBackupCheck {
    pub chain: VerificationResult,
    pub block_number: Option<u64>,
    pub data_reference: Option<String>,
    pub file_exists: bool,
    pub hash_matches: bool,
}

impl LatestBackupCheck {
    /// True when the chain is valid and its newest archive is present and intact.
    /// An empty chain is reported as unhealthy: there is nothing to restore from.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.chain.is_valid && self.block_number.is_some() && self.file_exists && self.hash_matches
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackupResult {
    pub success: bool,
    pub block_number: Option<u64>,
    pub data_hash: Option<String>,
    pub archive_path: Option<String>,
    pub archive_size: u64,
    pub tables_count: usize,
    pub total_rows: u64,
    pub duration_secs: f64,
    pub warnings: Vec<String>,
    pub error: Option<String>,
}

impl BackupResult {
    #[must_use]
    pub fn failure(duration_secs: f64, error: String) -> Self {
        Self {
            success: false,
            block_number: None,
            data_hash: None,
            archive_path: None,
            archive_size: 0,
            tables_count: 0,
            total_rows: 0,
            duration_secs,
            warnings: Vec::new(),
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RestoreResult {
    pub success: bool,
    pub archive: String,
    /// `Some(true)` when the archive hash matched its chain block, `Some(false)`
    /// when the archive is unknown to the chain, `None` when verification was skipped.
    pub hash_verified: Option<bool>,
    pub tables_restored: usize,
    pub total_rows: u64,
    pub duration_secs: f64,
    pub warnings: Vec<String>,
    pub error: Option<String>,
}

impl RestoreResult {
    #[must_use]
    pub fn failure(archive: String, duration_secs: f64, error: String, warnings: Vec<String>) -> Self {
        Self {
            success: false,
            archive,
            hash_verified: None,
            tables_restored: 0,
            total_rows: 0,
            duration_secs,
            warnings,
            error: Some(error),
        }
    }
}
