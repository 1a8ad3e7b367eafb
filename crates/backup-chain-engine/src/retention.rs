use std::fs;
use std::path::{Path, PathBuf};

use backup_chain_core::{parse_archive_timestamp, BackupError, ARCHIVE_PREFIX};
use serde::Serialize;
use time::format_description::well_known::Rfc3339;
use time::{Duration, OffsetDateTime};
use tracing::{debug, info, warn};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BackupFileInfo {
    pub path: PathBuf,
    pub file_name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub size_bytes: u64,
    pub size_mb: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StorageUsage {
    pub count: usize,
    pub total_bytes: u64,
    pub total_mb: f64,
    pub oldest: Option<String>,
    pub newest: Option<String>,
    pub retention_days: u32,
}

/// Rolling retention window over the archive directory. Only files are
/// pruned; chain blocks are never touched.
#[derive(Debug, Clone)]
pub struct RetentionManager {
    backups_dir: PathBuf,
    retention_days: u32,
}

impl RetentionManager {
    #[must_use]
    pub fn new(backups_dir: PathBuf, retention_days: u32) -> Self {
        Self { backups_dir, retention_days }
    }

    #[must_use]
    pub fn backups_dir(&self) -> &Path {
        &self.backups_dir
    }

    #[must_use]
    pub fn retention_days(&self) -> u32 {
        self.retention_days
    }

    /// Archives with a parsable name, newest first. A missing directory is an
    /// empty list.
    ///
    /// # Errors
    /// Returns [`BackupError::Io`] when the directory cannot be listed.
    pub fn get_backup_list(&self) -> Result<Vec<BackupFileInfo>, BackupError> {
        let mut list = Vec::new();
        for path in self.archive_paths()? {
            let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            let Some(timestamp) = parse_archive_timestamp(file_name) else {
                debug!(file = %file_name, "skipping archive with unparsable name");
                continue;
            };
            let size_bytes = fs::metadata(&path).map_err(|err| BackupError::io(&path, err))?.len();
            list.push(BackupFileInfo {
                file_name: file_name.to_string(),
                path,
                timestamp,
                size_bytes,
                size_mb: to_mb(size_bytes),
            });
        }
        list.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| b.file_name.cmp(&a.file_name)));
        Ok(list)
    }

    /// # Errors
    /// Returns [`BackupError::Io`] when the directory cannot be listed.
    pub fn get_backups_to_delete(&self) -> Result<Vec<BackupFileInfo>, BackupError> {
        self.get_backups_to_delete_at(OffsetDateTime::now_utc())
    }

    /// Dry run of [`Self::cleanup_old_backups_at`].
    ///
    /// # Errors
    /// Returns [`BackupError::Io`] when the directory cannot be listed.
    pub fn get_backups_to_delete_at(
        &self,
        now: OffsetDateTime,
    ) -> Result<Vec<BackupFileInfo>, BackupError> {
        Ok(self
            .get_backup_list()?
            .into_iter()
            .filter(|backup| self.is_expired_at(backup.timestamp, now))
            .collect())
    }

    /// # Errors
    /// Returns [`BackupError::Io`] when the directory cannot be listed.
    pub fn cleanup_old_backups(&self) -> Result<usize, BackupError> {
        self.cleanup_old_backups_at(OffsetDateTime::now_utc())
    }

    /// Delete every archive whose embedded timestamp is older than
    /// `now - retention_days`. Files with unparsable names are kept. A file
    /// that fails to delete is logged and skipped.
    ///
    /// # Errors
    /// Returns [`BackupError::Io`] when the directory cannot be listed.
    pub fn cleanup_old_backups_at(&self, now: OffsetDateTime) -> Result<usize, BackupError> {
        let mut deleted = 0;
        for backup in self.get_backups_to_delete_at(now)? {
            match fs::remove_file(&backup.path) {
                Ok(()) => {
                    info!(file = %backup.file_name, "deleted archive outside retention window");
                    deleted += 1;
                }
                Err(err) => {
                    warn!(file = %backup.file_name, error = %err, "failed to delete old archive");
                }
            }
        }
        if deleted > 0 {
            info!(deleted, retention_days = self.retention_days, "retention cleanup finished");
        }
        Ok(deleted)
    }

    /// # Errors
    /// Returns [`BackupError::Io`] when the directory cannot be listed.
    pub fn get_storage_usage(&self) -> Result<StorageUsage, BackupError> {
        let list = self.get_backup_list()?;
        let total_bytes = list.iter().map(|backup| backup.size_bytes).sum();
        Ok(StorageUsage {
            count: list.len(),
            total_bytes,
            total_mb: to_mb(total_bytes),
            oldest: list.last().map(|backup| format_time(backup.timestamp)).transpose()?,
            newest: list.first().map(|backup| format_time(backup.timestamp)).transpose()?,
            retention_days: self.retention_days,
        })
    }

    /// Whether an archive stamped `timestamp` falls outside the window at `now`.
    #[must_use]
    pub fn is_expired_at(&self, timestamp: OffsetDateTime, now: OffsetDateTime) -> bool {
        timestamp < now - Duration::days(i64::from(self.retention_days))
    }

    fn archive_paths(&self) -> Result<Vec<PathBuf>, BackupError> {
        if !self.backups_dir.is_dir() {
            return Ok(Vec::new());
        }
        let entries =
            fs::read_dir(&self.backups_dir).map_err(|err| BackupError::io(&self.backups_dir, err))?;

        let mut paths = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| BackupError::io(&self.backups_dir, err))?;
            let path = entry.path();
            let is_candidate = path.is_file()
                && path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with(ARCHIVE_PREFIX));
            if is_candidate {
                paths.push(path);
            }
        }
        Ok(paths)
    }
}

#[allow(clippy::cast_precision_loss)]
fn to_mb(bytes: u64) -> f64 {
    bytes as f64 / BYTES_PER_MB
}

fn format_time(at: OffsetDateTime) -> Result<String, BackupError> {
    at.format(&Rfc3339).map_err(|err| BackupError::Timestamp(err.to_string()))
}
