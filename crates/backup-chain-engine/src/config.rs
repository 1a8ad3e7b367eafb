use std::fs;
use std::path::{Path, PathBuf};

use backup_chain_core::{BackupError, DEFAULT_DATA_TYPE};
use backup_chain_store_sqlite::is_plain_identifier;
use serde::{Deserialize, Serialize};

pub const CHAIN_FILE: &str = "chain.json";
pub const BACKUPS_DIR: &str = "backups";
pub const LOGS_DIR: &str = "logs";
pub const EXPORTS_DIR: &str = "exports";

pub const DEFAULT_RETENTION_DAYS: u32 = 30;
pub const DEFAULT_CRITICAL_TABLES: [&str; 5] =
    ["agents", "memories", "conversations", "messages", "system_logs"];

/// Settings for backup runs, verification and restore.
///
/// Every field has a default, so a YAML file only needs the keys it changes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BackupConfig {
    /// Holds `chain.json`, `backups/`, `logs/` and `exports/`.
    pub root: PathBuf,
    /// Source database for backups and target database for restores.
    pub database: PathBuf,
    /// Parent of the per-run working directories.
    pub temp_root: PathBuf,
    pub retention_days: u32,
    pub critical_tables: Vec<String>,
    pub data_type: String,
    pub owner: String,
    pub purpose: String,
    /// Operational log table for run outcomes; `None` disables audit rows.
    pub audit_table: Option<String>,
    /// Write a Markdown summary next to each backup.
    pub summary_export: bool,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./backup_root"),
            database: PathBuf::from("./data.sqlite3"),
            temp_root: std::env::temp_dir().join("backup-chain"),
            retention_days: DEFAULT_RETENTION_DAYS,
            critical_tables: DEFAULT_CRITICAL_TABLES.iter().map(ToString::to_string).collect(),
            data_type: DEFAULT_DATA_TYPE.to_string(),
            owner: "backup-chain".to_string(),
            purpose: "integrity-verified database backups".to_string(),
            audit_table: Some("system_logs".to_string()),
            summary_export: true,
        }
    }
}

impl BackupConfig {
    /// Load a YAML config file; absent keys keep their defaults.
    ///
    /// # Errors
    /// Returns [`BackupError::Config`] when the file cannot be read or parsed.
    pub fn from_yaml_file(path: &Path) -> Result<Self, BackupError> {
        let body = fs::read_to_string(path).map_err(|err| {
            BackupError::Config(format!("failed to read config {}: {err}", path.display()))
        })?;
        serde_yaml::from_str(&body).map_err(|err| {
            BackupError::Config(format!("failed to parse config {}: {err}", path.display()))
        })
    }

    /// # Errors
    /// Returns [`BackupError::Config`] describing the first invalid setting.
    pub fn validate(&self) -> Result<(), BackupError> {
        if self.retention_days == 0 {
            return Err(BackupError::Config("retention_days must be at least 1".to_string()));
        }
        if self.data_type.trim().is_empty() {
            return Err(BackupError::Config("data_type must be non-empty".to_string()));
        }
        if let Some(bad) = self.critical_tables.iter().find(|name| !is_plain_identifier(name)) {
            return Err(BackupError::Config(format!("invalid critical table name: {bad:?}")));
        }
        if let Some(table) = self.audit_table.as_deref() {
            if !is_plain_identifier(table) {
                return Err(BackupError::Config(format!("invalid audit table name: {table:?}")));
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn chain_path(&self) -> PathBuf {
        self.root.join(CHAIN_FILE)
    }

    #[must_use]
    pub fn backups_dir(&self) -> PathBuf {
        self.root.join(BACKUPS_DIR)
    }

    #[must_use]
    pub fn logs_dir(&self) -> PathBuf {
        self.root.join(LOGS_DIR)
    }

    #[must_use]
    pub fn exports_dir(&self) -> PathBuf {
        self.root.join(EXPORTS_DIR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_yaml_keeps_defaults() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("backup.yaml");
        fs::write(
            &path,
            "root: /srv/backups\nretention_days: 7\ncritical_tables: [agents]\naudit_table: null\n",
        )?;

        let config = BackupConfig::from_yaml_file(&path)?;
        assert_eq!(config.root, PathBuf::from("/srv/backups"));
        assert_eq!(config.retention_days, 7);
        assert_eq!(config.critical_tables, vec!["agents".to_string()]);
        assert_eq!(config.audit_table, None);
        assert_eq!(config.data_type, DEFAULT_DATA_TYPE);
        assert_eq!(config.chain_path(), PathBuf::from("/srv/backups/chain.json"));
        config.validate()?;
        Ok(())
    }

    #[test]
    fn validation_rejects_bad_settings() {
        let config = BackupConfig { retention_days: 0, ..BackupConfig::default() };
        assert!(matches!(config.validate(), Err(BackupError::Config(_))));

        let config = BackupConfig {
            critical_tables: vec!["agents; DROP TABLE x".to_string()],
            ..BackupConfig::default()
        };
        assert!(matches!(config.validate(), Err(BackupError::Config(_))));

        assert!(BackupConfig::default().validate().is_ok());
    }

    #[test]
    fn unreadable_file_is_a_config_error() {
        let result = BackupConfig::from_yaml_file(Path::new("/nonexistent/backup.yaml"));
        assert!(matches!(result, Err(BackupError::Config(_))));
    }
}
