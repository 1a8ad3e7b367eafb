//! Read-only checks behind the verification tool: per-block archive checks,
//! archive listings cross-referenced with the chain, and ad-hoc file checks.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use backup_chain_core::{
    parse_archive_timestamp, sha256_file, BackupError, Block, VerificationResult,
};
use serde::Serialize;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::archive::inspect;
use crate::chain_store::ChainManager;
use crate::config::BackupConfig;
use crate::retention::RetentionManager;

/// Result of checking one block's archive.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BlockCheck {
    pub block_number: u64,
    pub data_reference: String,
    pub file_exists: bool,
    /// `None` when the file is missing.
    pub hash_matches: Option<bool>,
    /// `None` when the file is missing or its hash already failed.
    pub content_ok: Option<bool>,
    /// Missing archive of an older block whose timestamp is already outside
    /// the retention window.
    pub pruned: bool,
    pub problem: Option<String>,
}

impl BlockCheck {
    #[must_use]
    pub fn is_failure(&self) -> bool {
        self.problem.is_some() && !self.pruned
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FullVerification {
    pub chain: VerificationResult,
    pub blocks: Vec<BlockCheck>,
    pub failures: usize,
    pub pruned: usize,
    pub healthy: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ArchiveListing {
    pub file_name: String,
    pub timestamp: String,
    pub size_bytes: u64,
    pub size_mb: f64,
    /// Chain block referencing this archive, if any.
    pub block_number: Option<u64>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FileCheck {
    pub path: PathBuf,
    pub actual_hash: String,
    pub block_number: Option<u64>,
    pub expected_hash: Option<String>,
    pub hash_matches: bool,
}

impl FileCheck {
    #[must_use]
    pub fn in_chain(&self) -> bool {
        self.block_number.is_some()
    }
}

pub struct ChainInspector {
    chain: ChainManager,
    retention: RetentionManager,
    backups_dir: PathBuf,
}

impl ChainInspector {
    #[must_use]
    pub fn new(config: &BackupConfig) -> Self {
        Self {
            chain: ChainManager::new(config.chain_path(), &config.owner, &config.purpose),
            retention: RetentionManager::new(config.backups_dir(), config.retention_days),
            backups_dir: config.backups_dir(),
        }
    }

    /// # Errors
    /// Returns the chain load error.
    pub fn verify_all(&self) -> Result<FullVerification, BackupError> {
        self.verify_all_at(OffsetDateTime::now_utc())
    }

    /// Chain verification plus, for every block, file presence, content hash
    /// and archive layout. A missing archive is reported as pruned when it is
    /// not the newest block and retention would already have deleted it at
    /// `now`; any other missing archive is a failure.
    ///
    /// # Errors
    /// Returns the chain load error.
    pub fn verify_all_at(&self, now: OffsetDateTime) -> Result<FullVerification, BackupError> {
        let chain = self.chain.load()?;
        let verification = self.chain.verify(&chain);
        let latest_number = chain.latest().map(|block| block.block_number);

        let blocks = chain
            .blocks
            .iter()
            .map(|block| {
                let path = self.backups_dir.join(&block.data_reference);
                let mut check = BlockCheck {
                    block_number: block.block_number,
                    data_reference: block.data_reference.clone(),
                    file_exists: path.is_file(),
                    hash_matches: None,
                    content_ok: None,
                    pruned: false,
                    problem: None,
                };

                if !check.file_exists {
                    let is_latest = Some(block.block_number) == latest_number;
                    check.pruned = !is_latest && self.outside_window(block, now);
                    check.problem = Some(if check.pruned {
                        "archive no longer on disk".to_string()
                    } else if is_latest {
                        "latest archive is missing".to_string()
                    } else {
                        "archive missing inside retention window".to_string()
                    });
                    return check;
                }

                let hash_matches = self.chain.verify_file(&chain, &path, block.block_number);
                check.hash_matches = Some(hash_matches);
                if !hash_matches {
                    check.problem = Some("content hash does not match chain".to_string());
                    return check;
                }

                match inspect(&path) {
                    Ok(contents) if contents.has_full_dump && contents.has_metadata => {
                        check.content_ok = Some(true);
                    }
                    Ok(_) => {
                        check.content_ok = Some(false);
                        check.problem = Some("archive lacks full dump or metadata".to_string());
                    }
                    Err(err) => {
                        check.content_ok = Some(false);
                        check.problem = Some(err.to_string());
                    }
                }
                check
            })
            .collect::<Vec<_>>();

        let failures = blocks.iter().filter(|check| check.is_failure()).count();
        let pruned = blocks.iter().filter(|check| check.pruned).count();
        for check in blocks.iter().filter(|check| check.is_failure()) {
            warn!(block_number = check.block_number, problem = ?check.problem, "block check failed");
        }

        Ok(FullVerification {
            healthy: verification.is_valid && failures == 0,
            chain: verification,
            blocks,
            failures,
            pruned,
        })
    }

    /// Archive name stamp first, block timestamp as fallback. A block with
    /// neither is never treated as pruned.
    fn outside_window(&self, block: &Block, now: OffsetDateTime) -> bool {
        parse_archive_timestamp(&block.data_reference)
            .or_else(|| OffsetDateTime::parse(&block.timestamp, &Rfc3339).ok())
            .is_some_and(|stamped| self.retention.is_expired_at(stamped, now))
    }

    /// Archives on disk, oldest first, each tagged with the block that
    /// references it.
    ///
    /// # Errors
    /// Returns the chain load or directory listing error.
    pub fn list_archives(&self) -> Result<Vec<ArchiveListing>, BackupError> {
        let chain = self.chain.load()?;
        let by_reference = chain
            .blocks
            .iter()
            .map(|block| (block.data_reference.as_str(), block.block_number))
            .collect::<HashMap<_, _>>();

        let mut listing = Vec::new();
        for backup in self.retention.get_backup_list()?.into_iter().rev() {
            let timestamp = backup
                .timestamp
                .format(&Rfc3339)
                .map_err(|err| BackupError::Timestamp(err.to_string()))?;
            listing.push(ArchiveListing {
                block_number: by_reference.get(backup.file_name.as_str()).copied(),
                file_name: backup.file_name,
                timestamp,
                size_bytes: backup.size_bytes,
                size_mb: backup.size_mb,
            });
        }
        debug!(archives = listing.len(), "archives listed");
        Ok(listing)
    }

    /// Hash `path` and compare it to the block that references its file name.
    ///
    /// # Errors
    /// Returns [`BackupError::NotFound`] for a missing file, or the chain/read error.
    pub fn check_file(&self, path: &Path) -> Result<FileCheck, BackupError> {
        if !path.is_file() {
            return Err(BackupError::NotFound(format!("file {}", path.display())));
        }
        let chain = self.chain.load()?;
        let actual_hash = sha256_file(path)?;
        let block = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| chain.find_by_reference(name));

        Ok(FileCheck {
            path: path.to_path_buf(),
            hash_matches: block.is_some_and(|block| block.data_hash == actual_hash),
            block_number: block.map(|block| block.block_number),
            expected_hash: block.map(|block| block.data_hash.clone()),
            actual_hash,
        })
    }
}
