use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use backup_chain_core::{sha256_file, BackupError, Chain, RestoreResult};
use backup_chain_store_sqlite::{
    is_plain_identifier, remove_database_files, Row, SourceDatabase, FULL_DUMP_FILE, TABLES_DIR,
};
use serde::Serialize;
use tempfile::TempDir;
use tracing::{error, info, warn};

use crate::archive::extract_archive;
use crate::chain_store::ChainManager;
use crate::config::BackupConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FullRestoreOptions {
    pub verify_hash: bool,
    pub drop_existing: bool,
}

impl Default for FullRestoreOptions {
    fn default() -> Self {
        Self { verify_hash: true, drop_existing: false }
    }
}

/// Outcome of checking an archive against the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashCheck {
    Verified { block_number: u64 },
    /// No block references this file name. Restoring is still allowed.
    NotInChain,
}

/// A chained backup and whether its archive is still on disk.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AvailableBackup {
    pub block_number: u64,
    pub data_reference: String,
    pub timestamp: String,
    pub data_hash: String,
    pub archive_size: Option<u64>,
    pub path: PathBuf,
    pub file_exists: bool,
}

pub struct RestoreService {
    config: BackupConfig,
    chain: ChainManager,
}

impl RestoreService {
    /// # Errors
    /// Returns [`BackupError::Config`] when the config does not validate.
    pub fn new(config: BackupConfig) -> Result<Self, BackupError> {
        config.validate()?;
        let chain = ChainManager::new(config.chain_path(), &config.owner, &config.purpose);
        Ok(Self { config, chain })
    }

    /// Replace the configured database with the full dump inside `archive`.
    #[must_use]
    pub fn full_restore(&self, archive: &Path, options: FullRestoreOptions) -> RestoreResult {
        let clock = Instant::now();
        let mut warnings = Vec::new();
        info!(archive = %archive.display(), verify_hash = options.verify_hash, drop_existing = options.drop_existing, "full restore started");

        match self.full_restore_inner(archive, options, &mut warnings) {
            Ok((hash_verified, tables_restored, total_rows)) => {
                let duration_secs = clock.elapsed().as_secs_f64();
                info!(tables = tables_restored, rows = total_rows, duration_secs, "full restore completed");
                RestoreResult {
                    success: true,
                    archive: archive.display().to_string(),
                    hash_verified,
                    tables_restored,
                    total_rows,
                    duration_secs,
                    warnings,
                    error: None,
                }
            }
            Err(err) => {
                error!(archive = %archive.display(), error = %err, "full restore failed");
                RestoreResult::failure(
                    archive.display().to_string(),
                    clock.elapsed().as_secs_f64(),
                    err.to_string(),
                    warnings,
                )
            }
        }
    }

    fn full_restore_inner(
        &self,
        archive: &Path,
        options: FullRestoreOptions,
        warnings: &mut Vec<String>,
    ) -> Result<(Option<bool>, usize, u64), BackupError> {
        require_archive(archive)?;

        let hash_verified = if options.verify_hash {
            Some(self.verify_or_warn(archive, warnings)?)
        } else {
            None
        };

        let work_dir = self.extract_to_work_dir(archive)?;
        let dump_path = work_dir.path().join(FULL_DUMP_FILE);
        if !dump_path.is_file() {
            return Err(BackupError::NotFound(format!(
                "{FULL_DUMP_FILE} in archive {}",
                archive.display()
            )));
        }

        let target = &self.config.database;
        if options.drop_existing {
            warn!(database = %target.display(), "dropping existing database before restore");
            remove_database_files(target).map_err(|err| BackupError::Database(format!("{err:#}")))?;
        }
        if let Some(parent) = target.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| BackupError::io(parent, err))?;
        }

        let mut db =
            SourceDatabase::open(target).map_err(|err| BackupError::Database(format!("{err:#}")))?;
        db.restore_from_dump(&dump_path)
            .map_err(|err| BackupError::Database(format!("{err:#}")))?;
        let stats = db.get_stats().map_err(|err| BackupError::Database(format!("{err:#}")))?;

        close_work_dir(work_dir, warnings);
        Ok((hash_verified, stats.tables_count, stats.total_rows))
    }

    /// Reload the listed tables (default: every critical table) from the
    /// archive's JSON exports. A table that fails is reported as a warning and
    /// the rest still restore.
    #[must_use]
    pub fn restore_critical_tables(&self, archive: &Path, tables: Option<&[String]>) -> RestoreResult {
        let clock = Instant::now();
        let mut warnings = Vec::new();
        let tables = tables.unwrap_or(&self.config.critical_tables);
        info!(archive = %archive.display(), tables = tables.len(), "critical table restore started");

        match self.restore_tables_inner(archive, tables, &mut warnings) {
            Ok((tables_restored, total_rows)) => {
                let duration_secs = clock.elapsed().as_secs_f64();
                info!(
                    tables = tables_restored,
                    rows = total_rows,
                    warnings = warnings.len(),
                    duration_secs,
                    "critical table restore completed"
                );
                RestoreResult {
                    success: true,
                    archive: archive.display().to_string(),
                    hash_verified: None,
                    tables_restored,
                    total_rows,
                    duration_secs,
                    warnings,
                    error: None,
                }
            }
            Err(err) => {
                error!(archive = %archive.display(), error = %err, "critical table restore failed");
                RestoreResult::failure(
                    archive.display().to_string(),
                    clock.elapsed().as_secs_f64(),
                    err.to_string(),
                    warnings,
                )
            }
        }
    }

    fn restore_tables_inner(
        &self,
        archive: &Path,
        tables: &[String],
        warnings: &mut Vec<String>,
    ) -> Result<(usize, u64), BackupError> {
        require_archive(archive)?;
        let work_dir = self.extract_to_work_dir(archive)?;
        let mut db = SourceDatabase::open_existing(&self.config.database)
            .map_err(|err| BackupError::Database(format!("{err:#}")))?;

        let mut tables_restored = 0;
        let mut total_rows = 0_u64;
        for table in tables {
            match restore_one_table(&mut db, work_dir.path(), table) {
                Ok(rows) => {
                    info!(table = %table, rows, "table restored");
                    tables_restored += 1;
                    total_rows += rows as u64;
                }
                Err(err) => {
                    warn!(table = %table, error = %format!("{err:#}"), "table restore failed");
                    warnings.push(format!("{table}: {err:#}"));
                }
            }
        }

        close_work_dir(work_dir, warnings);
        Ok((tables_restored, total_rows))
    }

    /// Every chained backup, oldest first, flagging archives no longer on disk.
    ///
    /// # Errors
    /// Returns the chain load error.
    pub fn list_available_backups(&self) -> Result<Vec<AvailableBackup>, BackupError> {
        let chain = self.chain.load()?;
        let backups_dir = self.config.backups_dir();
        Ok(chain
            .blocks
            .iter()
            .map(|block| {
                let path = backups_dir.join(&block.data_reference);
                AvailableBackup {
                    block_number: block.block_number,
                    data_reference: block.data_reference.clone(),
                    timestamp: block.timestamp.clone(),
                    data_hash: block.data_hash.clone(),
                    archive_size: block.archive_size(),
                    file_exists: path.is_file(),
                    path,
                }
            })
            .collect())
    }

    /// Match `archive` to its chain block by file name and compare hashes.
    ///
    /// # Errors
    /// Returns [`BackupError::HashMismatch`] when a block exists and the
    /// hashes differ, or the chain/file read error.
    pub fn check_archive_hash(&self, archive: &Path) -> Result<HashCheck, BackupError> {
        let chain = self.chain.load()?;
        check_against_chain(&chain, archive)
    }

    fn verify_or_warn(&self, archive: &Path, warnings: &mut Vec<String>) -> Result<bool, BackupError> {
        match self.check_archive_hash(archive)? {
            HashCheck::Verified { block_number } => {
                info!(archive = %archive.display(), block_number, "archive hash verified");
                Ok(true)
            }
            HashCheck::NotInChain => {
                let message = format!("archive {} is not in the chain; hash not verified", archive.display());
                warn!("{message}");
                warnings.push(message);
                Ok(false)
            }
        }
    }

    fn extract_to_work_dir(&self, archive: &Path) -> Result<TempDir, BackupError> {
        let temp_root = &self.config.temp_root;
        fs::create_dir_all(temp_root).map_err(|err| BackupError::io(temp_root, err))?;
        let work_dir = tempfile::Builder::new()
            .prefix("restore_")
            .tempdir_in(temp_root)
            .map_err(|err| BackupError::io(temp_root, err))?;
        extract_archive(archive, work_dir.path())?;
        Ok(work_dir)
    }
}

fn check_against_chain(chain: &Chain, archive: &Path) -> Result<HashCheck, BackupError> {
    let file_name = archive
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| BackupError::NotFound(format!("file name of {}", archive.display())))?;
    let Some(block) = chain.find_by_reference(file_name) else {
        return Ok(HashCheck::NotInChain);
    };

    let actual = sha256_file(archive)?;
    if actual != block.data_hash {
        return Err(BackupError::HashMismatch {
            reference: file_name.to_string(),
            expected: block.data_hash.clone(),
            actual,
        });
    }
    Ok(HashCheck::Verified { block_number: block.block_number })
}

fn require_archive(archive: &Path) -> Result<(), BackupError> {
    if archive.is_file() {
        Ok(())
    } else {
        Err(BackupError::NotFound(format!("archive {}", archive.display())))
    }
}

fn restore_one_table(db: &mut SourceDatabase, extracted: &Path, table: &str) -> anyhow::Result<usize> {
    if !is_plain_identifier(table) {
        anyhow::bail!("invalid table name");
    }
    let path = extracted.join(TABLES_DIR).join(format!("{table}.json"));
    if !path.is_file() {
        anyhow::bail!("no JSON export in archive");
    }
    let rows: Vec<Row> = serde_json::from_slice(&fs::read(&path)?)?;
    db.replace_table_rows(table, &rows)
}

fn close_work_dir(work_dir: TempDir, warnings: &mut Vec<String>) {
    let path = work_dir.path().to_path_buf();
    if let Err(err) = work_dir.close() {
        warn!(path = %path.display(), error = %err, "failed to remove restore working directory");
        warnings.push(format!("working directory not removed: {}", path.display()));
    }
}
