use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use backup_chain_core::{
    archive_file_name, format_run_stamp, metadata_keys, sha256_file, BackupError, BackupResult,
    Block, BlockInput, ChainStatus, LatestBackupCheck, Metadata,
};
use backup_chain_store_sqlite::{AuditEntry, DatabaseStats, SourceDatabase, TableExportInfo};
use serde::Serialize;
use serde_json::json;
use tempfile::TempDir;
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

use crate::archive::create_archive;
use crate::chain_store::ChainManager;
use crate::config::BackupConfig;
use crate::retention::{RetentionManager, StorageUsage};

const AUDIT_COMPONENT: &str = "backup_orchestrator";
const EXPORT_SUBDIR: &str = "export";

/// What an extra export step gets to see of a finished run. The per-run
/// working directory is already gone by the time extras run.
#[derive(Debug, Clone, Copy)]
pub struct ExtraExportContext<'a> {
    pub config: &'a BackupConfig,
    pub block: &'a Block,
    pub archive_path: &'a Path,
    pub stats: &'a DatabaseStats,
    pub table_exports: &'a BTreeMap<String, TableExportInfo>,
    pub started_at: OffsetDateTime,
}

/// A best-effort step run after a successful backup. An error becomes a
/// warning on the [`BackupResult`]; it never fails the run.
pub trait ExtraExport {
    fn name(&self) -> &str;

    /// # Errors
    /// Any error; the orchestrator records it as a warning.
    fn run(&self, ctx: &ExtraExportContext<'_>) -> anyhow::Result<()>;
}

/// Writes `exports/summary_<stamp>.md` describing the run.
#[derive(Debug, Default, Clone, Copy)]
pub struct SummaryExport;

impl SummaryExport {
    /// # Errors
    /// Returns [`std::fmt::Error`] if writing into the buffer fails.
    pub fn render(ctx: &ExtraExportContext<'_>) -> Result<String, std::fmt::Error> {
        let block = ctx.block;
        let mut out = String::new();
        writeln!(out, "# Backup summary: block {}\n", block.block_number)?;
        writeln!(out, "- Archive: `{}`", block.data_reference)?;
        writeln!(out, "- Content hash: `{}`", block.data_hash)?;
        writeln!(out, "- Block hash: `{}`", block.block_hash)?;
        writeln!(out, "- Previous hash: `{}`", block.previous_hash)?;
        writeln!(out, "- Sealed at: {}", block.timestamp)?;
        if let Some(size) = block.archive_size() {
            writeln!(out, "- Archive size: {size} bytes")?;
        }
        writeln!(
            out,
            "- Tables: {}, rows: {}, source size: {} bytes\n",
            ctx.stats.tables_count, ctx.stats.total_rows, ctx.stats.db_size
        )?;

        writeln!(out, "## Row counts\n")?;
        writeln!(out, "| Table | Rows | JSON export |")?;
        writeln!(out, "|---|---:|---|")?;
        for (table, rows) in &ctx.stats.row_counts_by_table {
            let exported = ctx
                .table_exports
                .get(table)
                .map_or_else(|| "-".to_string(), |info| format!("`{}`", info.path));
            let rows = if *rows < 0 { "unreadable".to_string() } else { rows.to_string() };
            writeln!(out, "| {table} | {rows} | {exported} |")?;
        }
        Ok(out)
    }
}

impl ExtraExport for SummaryExport {
    fn name(&self) -> &str {
        "summary"
    }

    fn run(&self, ctx: &ExtraExportContext<'_>) -> anyhow::Result<()> {
        let dir = ctx.config.exports_dir();
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("summary_{}.md", format_run_stamp(ctx.started_at)?));
        fs::write(&path, Self::render(ctx)?)?;
        debug!(path = %path.display(), "summary export written");
        Ok(())
    }
}

/// Chain health plus what is on disk.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BackupStatus {
    pub chain: ChainStatus,
    pub chain_valid: bool,
    pub chain_errors: usize,
    pub chain_warnings: usize,
    pub storage: StorageUsage,
}

/// Everything produced by the integrity-critical part of a run.
struct CompletedRun {
    block: Block,
    archive_path: PathBuf,
    archive_size: u64,
    stats: DatabaseStats,
    table_exports: BTreeMap<String, TableExportInfo>,
    warnings: Vec<String>,
}

/// Drives one end-to-end backup: export, archive, hash, chain, place,
/// clean up, retention, extras.
pub struct BackupOrchestrator {
    config: BackupConfig,
    chain: ChainManager,
    retention: RetentionManager,
    extras: Vec<Box<dyn ExtraExport>>,
}

impl BackupOrchestrator {
    /// Builds the orchestrator, registering [`SummaryExport`] when the config
    /// asks for it.
    ///
    /// # Errors
    /// Returns [`BackupError::Config`] when the config does not validate.
    pub fn new(config: BackupConfig) -> Result<Self, BackupError> {
        config.validate()?;
        let chain = ChainManager::new(config.chain_path(), &config.owner, &config.purpose);
        let retention = RetentionManager::new(config.backups_dir(), config.retention_days);
        let mut orchestrator = Self { config, chain, retention, extras: Vec::new() };
        if orchestrator.config.summary_export {
            orchestrator.extras.push(Box::new(SummaryExport));
        }
        Ok(orchestrator)
    }

    #[must_use]
    pub fn with_extra(mut self, extra: Box<dyn ExtraExport>) -> Self {
        self.extras.push(extra);
        self
    }

    #[must_use]
    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    #[must_use]
    pub fn chain_manager(&self) -> &ChainManager {
        &self.chain
    }

    #[must_use]
    pub fn retention(&self) -> &RetentionManager {
        &self.retention
    }

    /// # Errors
    /// Returns [`BackupError::Io`] naming the first directory that could not be created.
    pub fn ensure_directories(&self) -> Result<(), BackupError> {
        for dir in [
            self.config.root.clone(),
            self.config.backups_dir(),
            self.config.logs_dir(),
            self.config.temp_root.clone(),
        ] {
            fs::create_dir_all(&dir).map_err(|err| BackupError::io(&dir, err))?;
        }
        Ok(())
    }

    #[must_use]
    pub fn run(&self) -> BackupResult {
        self.run_at(OffsetDateTime::now_utc())
    }

    /// One backup run clocked at `started_at`: the archive name, the block
    /// timestamp and the retention cutoff all derive from it.
    #[must_use]
    pub fn run_at(&self, started_at: OffsetDateTime) -> BackupResult {
        let clock = Instant::now();
        info!(database = %self.config.database.display(), "backup run started");

        match self.execute(started_at) {
            Ok(mut completed) => {
                let extra_warnings = self.run_extras(&completed, started_at);
                completed.warnings.extend(extra_warnings);

                let duration_secs = clock.elapsed().as_secs_f64();
                let result = BackupResult {
                    success: true,
                    block_number: Some(completed.block.block_number),
                    data_hash: Some(completed.block.data_hash.clone()),
                    archive_path: Some(completed.archive_path.display().to_string()),
                    archive_size: completed.archive_size,
                    tables_count: completed.stats.tables_count,
                    total_rows: completed.stats.total_rows,
                    duration_secs,
                    warnings: completed.warnings,
                    error: None,
                };
                info!(
                    block_number = completed.block.block_number,
                    archive = %completed.block.data_reference,
                    bytes = completed.archive_size,
                    duration_secs,
                    "backup run completed"
                );
                self.record_audit(
                    "INFO",
                    "backup completed",
                    json!({
                        "block_number": completed.block.block_number,
                        "archive": completed.block.data_reference,
                        "data_hash": completed.block.data_hash,
                        "archive_size": completed.archive_size,
                        "duration_secs": duration_secs,
                    }),
                );
                result
            }
            Err(err) => {
                let duration_secs = clock.elapsed().as_secs_f64();
                error!(error = %err, duration_secs, "backup run failed");
                self.record_audit(
                    "ERROR",
                    "backup failed",
                    json!({ "error": err.to_string(), "duration_secs": duration_secs }),
                );
                BackupResult::failure(duration_secs, err.to_string())
            }
        }
    }

    fn execute(&self, started_at: OffsetDateTime) -> Result<CompletedRun, BackupError> {
        self.ensure_directories()?;

        let stamp = format_run_stamp(started_at)?;
        let file_name = archive_file_name(started_at)?;
        let work_dir = self.create_work_dir(&stamp)?;
        let export_dir = work_dir.path().join(EXPORT_SUBDIR);

        let source = SourceDatabase::open_existing(&self.config.database)
            .map_err(|err| BackupError::ExportFailed(format!("{err:#}")))?;
        let export = source
            .create_full_backup(Some(&export_dir), &self.config.critical_tables)
            .map_err(|err| BackupError::ExportFailed(format!("{err:#}")))?;
        drop(source);

        let mut warnings = Vec::new();
        for table in &self.config.critical_tables {
            if !export.table_exports.contains_key(table) {
                warnings.push(format!("critical table {table} was not exported"));
            }
        }

        let candidate = work_dir.path().join(&file_name);
        let archive_size = create_archive(&export_dir, &candidate)?;
        let data_hash = sha256_file(&candidate)?;
        debug!(archive = %file_name, data_hash = %data_hash, "archive hashed");

        let mut metadata = Metadata::new();
        metadata.insert(metadata_keys::TABLES_COUNT.to_string(), json!(export.stats.tables_count));
        metadata.insert(metadata_keys::TOTAL_ROWS.to_string(), json!(export.stats.total_rows));
        metadata.insert(metadata_keys::SOURCE_SIZE.to_string(), json!(export.stats.db_size));
        metadata.insert(metadata_keys::ARCHIVE_SIZE.to_string(), json!(archive_size));
        metadata.insert(metadata_keys::TABLE_EXPORTS.to_string(), json!(export.table_exports.len()));
        metadata.insert(metadata_keys::RUN_TIMESTAMP.to_string(), json!(stamp));

        let final_path = self.config.backups_dir().join(&file_name);
        if final_path.exists() {
            return Err(BackupError::PlacementFailed(format!(
                "archive already exists: {}",
                final_path.display()
            )));
        }

        let mut chain = self.chain.load()?;
        let block = self.chain.append(
            &mut chain,
            BlockInput {
                data_hash,
                data_type: self.config.data_type.clone(),
                data_reference: file_name,
                metadata,
            },
            started_at,
        )?;

        place_archive(&candidate, &final_path)?;

        let work_path = work_dir.path().to_path_buf();
        if let Err(err) = work_dir.close() {
            warn!(path = %work_path.display(), error = %err, "failed to remove working directory");
            warnings.push(format!("working directory not removed: {}", work_path.display()));
        }

        let deleted = self.retention.cleanup_old_backups_at(started_at)?;
        debug!(deleted, "retention applied");

        Ok(CompletedRun {
            block,
            archive_path: final_path,
            archive_size,
            stats: export.stats,
            table_exports: export.table_exports,
            warnings,
        })
    }

    /// `temp_root/backup_<stamp>/`, removed on drop. A leftover directory from
    /// an interrupted run with the same stamp is cleared first.
    fn create_work_dir(&self, stamp: &str) -> Result<TempDir, BackupError> {
        let name = format!("backup_{stamp}");
        let stale = self.config.temp_root.join(&name);
        if stale.exists() {
            warn!(path = %stale.display(), "removing stale working directory");
            fs::remove_dir_all(&stale).map_err(|err| BackupError::io(&stale, err))?;
        }
        tempfile::Builder::new()
            .prefix(&name)
            .rand_bytes(0)
            .tempdir_in(&self.config.temp_root)
            .map_err(|err| BackupError::io(&stale, err))
    }

    fn run_extras(&self, completed: &CompletedRun, started_at: OffsetDateTime) -> Vec<String> {
        let ctx = ExtraExportContext {
            config: &self.config,
            block: &completed.block,
            archive_path: &completed.archive_path,
            stats: &completed.stats,
            table_exports: &completed.table_exports,
            started_at,
        };

        let mut warnings = Vec::new();
        for extra in &self.extras {
            if let Err(err) = extra.run(&ctx) {
                warn!(extra = extra.name(), error = %format!("{err:#}"), "extra export failed");
                warnings.push(format!("extra export {} failed: {err:#}", extra.name()));
            }
        }
        warnings
    }

    fn record_audit(&self, level: &str, message: &str, details: serde_json::Value) {
        let Some(table) = self.config.audit_table.as_deref() else {
            return;
        };
        let entry = AuditEntry {
            level: level.to_string(),
            component: AUDIT_COMPONENT.to_string(),
            message: message.to_string(),
            details,
        };
        let outcome = SourceDatabase::open_existing(&self.config.database)
            .and_then(|db| db.record_audit(table, &entry));
        match outcome {
            Ok(true) => debug!(table, "audit entry recorded"),
            Ok(false) => debug!(table, "audit table missing, entry skipped"),
            Err(err) => warn!(table, error = %format!("{err:#}"), "audit entry not recorded"),
        }
    }

    /// Chain verification plus presence and hash of the newest archive. A
    /// block whose file never landed reports `file_exists = false`.
    ///
    /// # Errors
    /// Returns the chain load error.
    pub fn verify_latest_backup(&self) -> Result<LatestBackupCheck, BackupError> {
        let chain = self.chain.load()?;
        let verification = self.chain.verify(&chain);

        let Some(latest) = chain.latest() else {
            return Ok(LatestBackupCheck {
                chain: verification,
                block_number: None,
                data_reference: None,
                file_exists: false,
                hash_matches: false,
            });
        };

        let path = self.config.backups_dir().join(&latest.data_reference);
        let file_exists = path.is_file();
        let hash_matches = file_exists && self.chain.verify_file(&chain, &path, latest.block_number);
        if !file_exists {
            warn!(archive = %latest.data_reference, "latest chained archive is missing");
        } else if !hash_matches {
            warn!(archive = %latest.data_reference, "latest archive does not match its chain hash");
        }

        Ok(LatestBackupCheck {
            chain: verification,
            block_number: Some(latest.block_number),
            data_reference: Some(latest.data_reference.clone()),
            file_exists,
            hash_matches,
        })
    }

    /// # Errors
    /// Returns the chain load or directory listing error.
    pub fn get_backup_status(&self) -> Result<BackupStatus, BackupError> {
        let chain = self.chain.load()?;
        let verification = self.chain.verify(&chain);
        Ok(BackupStatus {
            chain: chain.status(),
            chain_valid: verification.is_valid,
            chain_errors: verification.errors.len(),
            chain_warnings: verification.warnings.len(),
            storage: self.retention.get_storage_usage()?,
        })
    }
}

/// Move the archive into the backup directory, copying when a rename cannot
/// cross filesystems.
fn place_archive(candidate: &Path, final_path: &Path) -> Result<(), BackupError> {
    if let Err(rename_err) = fs::rename(candidate, final_path) {
        debug!(error = %rename_err, "rename failed, copying archive instead");
        if let Err(copy_err) = fs::copy(candidate, final_path) {
            let _ = fs::remove_file(final_path);
            return Err(BackupError::PlacementFailed(format!(
                "could not move {} to {}: {copy_err}",
                candidate.display(),
                final_path.display()
            )));
        }
        let _ = fs::remove_file(candidate);
    }

    if !final_path.is_file() {
        return Err(BackupError::PlacementFailed(format!(
            "archive not present after move: {}",
            final_path.display()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use anyhow::{anyhow, Result};
    use backup_chain_core::GENESIS_HASH;
    use time::macros::datetime;
    use time::Duration;

    use super::*;
    use crate::test_support::Sandbox;

    struct FailingExtra;

    impl ExtraExport for FailingExtra {
        fn name(&self) -> &str {
            "failing"
        }

        fn run(&self, _ctx: &ExtraExportContext<'_>) -> anyhow::Result<()> {
            Err(anyhow!("disk full"))
        }
    }

    struct CountingExtra(Rc<Cell<u32>>);

    impl ExtraExport for CountingExtra {
        fn name(&self) -> &str {
            "counting"
        }

        fn run(&self, _ctx: &ExtraExportContext<'_>) -> anyhow::Result<()> {
            self.0.set(self.0.get() + 1);
            Ok(())
        }
    }

    #[test]
    fn end_to_end_backup_verify_and_tamper() -> Result<()> {
        let sandbox = Sandbox::new()?;
        let orchestrator = BackupOrchestrator::new(sandbox.config())?;
        let first_at = datetime!(2025-01-01 03:00 UTC);

        let first = orchestrator.run_at(first_at);
        assert!(first.success, "first run failed: {:?}", first.error);
        assert_eq!(first.block_number, Some(0));
        assert!(first.total_rows > 0);
        assert_eq!(orchestrator.retention().get_backup_list()?.len(), 1);

        let check = orchestrator.verify_latest_backup()?;
        assert!(check.chain.is_valid);
        assert!(check.file_exists);
        assert!(check.hash_matches);
        assert!(check.is_healthy());

        let second = orchestrator.run_at(first_at + Duration::hours(1));
        assert!(second.success, "second run failed: {:?}", second.error);
        assert_eq!(second.block_number, Some(1));

        let chain = orchestrator.chain_manager().load()?;
        assert_eq!(chain.blocks[0].previous_hash, GENESIS_HASH);
        assert_eq!(chain.blocks[1].previous_hash, chain.blocks[0].block_hash);

        let chain_path = sandbox.config().chain_path();
        let mut raw: serde_json::Value = serde_json::from_slice(&fs::read(&chain_path)?)?;
        raw["blocks"][0]["data_hash"] = json!("f".repeat(64));
        fs::write(&chain_path, serde_json::to_vec_pretty(&raw)?)?;

        let check = orchestrator.verify_latest_backup()?;
        assert!(!check.chain.is_valid);
        assert_eq!(check.chain.errors.len(), 1);
        assert_eq!(check.chain.errors[0].block_number, 0);
        Ok(())
    }

    #[test]
    fn run_leaves_no_working_directory_and_writes_summary() -> Result<()> {
        let sandbox = Sandbox::new()?;
        let config = sandbox.config();
        let orchestrator = BackupOrchestrator::new(config.clone())?;
        let at = datetime!(2025-02-10 12:30:45 UTC);

        let result = orchestrator.run_at(at);
        assert!(result.success, "{:?}", result.error);
        assert_eq!(fs::read_dir(&config.temp_root)?.count(), 0);

        let summary = fs::read_to_string(config.exports_dir().join("summary_20250210_123045.md"))?;
        assert!(summary.contains("block 0"));
        assert!(summary.contains("backup_20250210_123045.zip"));
        assert!(summary.contains("| agents | 3 | `tables/agents.json` |"));

        let status = orchestrator.get_backup_status()?;
        assert!(status.chain_valid);
        assert_eq!(status.chain.length, 1);
        assert_eq!(status.storage.count, 1);
        assert_eq!(status.storage.retention_days, config.retention_days);
        Ok(())
    }

    #[test]
    fn extra_export_failures_become_warnings() -> Result<()> {
        let sandbox = Sandbox::new()?;
        let calls = Rc::new(Cell::new(0));
        let orchestrator = BackupOrchestrator::new(sandbox.config())?
            .with_extra(Box::new(FailingExtra))
            .with_extra(Box::new(CountingExtra(Rc::clone(&calls))));

        let result = orchestrator.run_at(datetime!(2025-01-01 03:00 UTC));
        assert!(result.success);
        assert_eq!(calls.get(), 1);
        assert!(result.warnings.iter().any(|warning| warning.contains("disk full")));
        Ok(())
    }

    #[test]
    fn missing_source_fails_without_touching_the_chain() -> Result<()> {
        let sandbox = Sandbox::new()?;
        let mut config = sandbox.config();
        config.database = sandbox.path().join("absent.sqlite3");
        let orchestrator = BackupOrchestrator::new(config.clone())?;

        let result = orchestrator.run_at(datetime!(2025-01-01 03:00 UTC));
        assert!(!result.success);
        assert!(result.error.as_deref().is_some_and(|err| err.contains("export failed")));
        assert!(!config.chain_path().exists());
        assert_eq!(fs::read_dir(config.backups_dir())?.count(), 0);
        assert_eq!(fs::read_dir(&config.temp_root)?.count(), 0);
        Ok(())
    }

    #[test]
    fn archive_name_collision_fails_before_append() -> Result<()> {
        let sandbox = Sandbox::new()?;
        let orchestrator = BackupOrchestrator::new(sandbox.config())?;
        let at = datetime!(2025-01-01 03:00 UTC);

        assert!(orchestrator.run_at(at).success);
        let again = orchestrator.run_at(at);
        assert!(!again.success);
        assert!(again.error.as_deref().is_some_and(|err| err.contains("already exists")));
        assert_eq!(orchestrator.chain_manager().load()?.len(), 1);
        Ok(())
    }

    #[test]
    fn dangling_block_reports_missing_file() -> Result<()> {
        let sandbox = Sandbox::new()?;
        let config = sandbox.config();
        let orchestrator = BackupOrchestrator::new(config.clone())?;
        assert!(orchestrator.run_at(datetime!(2025-01-01 03:00 UTC)).success);

        fs::remove_file(config.backups_dir().join("backup_20250101_030000.zip"))?;
        let check = orchestrator.verify_latest_backup()?;
        assert!(check.chain.is_valid);
        assert_eq!(check.block_number, Some(0));
        assert!(!check.file_exists);
        assert!(!check.hash_matches);
        assert!(!check.is_healthy());
        Ok(())
    }

    #[test]
    fn successful_run_is_audited() -> Result<()> {
        let sandbox = Sandbox::new()?;
        let orchestrator = BackupOrchestrator::new(sandbox.config())?;
        assert!(orchestrator.run_at(datetime!(2025-01-01 03:00 UTC)).success);

        let conn = rusqlite::Connection::open(sandbox.database())?;
        let message: String = conn.query_row(
            "SELECT message FROM system_logs WHERE component = ?1 ORDER BY id DESC LIMIT 1",
            [AUDIT_COMPONENT],
            |row| row.get(0),
        )?;
        assert_eq!(message, "backup completed");
        Ok(())
    }
}
