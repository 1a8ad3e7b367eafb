//! Shared plumbing for the `bchain-*` binaries: config layering, logging setup
//! and JSON output.

use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Mutex;

use anyhow::{Context, Result};
use backup_chain_engine::BackupConfig;
use clap::Args;
use serde::Serialize;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_LOG_FILTER: &str = "info";

/// Flags every binary accepts. Each one overrides the matching key of the
/// YAML config file.
#[derive(Debug, Clone, Default, Args)]
pub struct CommonArgs {
    /// YAML config file.
    #[arg(long, env = "BCHAIN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Backup root holding `chain.json`, `backups/` and `logs/`.
    #[arg(long, env = "BCHAIN_ROOT")]
    pub root: Option<PathBuf>,

    /// `SQLite` database to back up or restore into.
    #[arg(long = "db", env = "BCHAIN_DATABASE")]
    pub database: Option<PathBuf>,

    #[arg(long, env = "BCHAIN_TEMP_ROOT")]
    pub temp_root: Option<PathBuf>,

    #[arg(long)]
    pub retention_days: Option<u32>,
}

impl CommonArgs {
    /// Defaults, then the config file, then flags and environment.
    ///
    /// # Errors
    /// Returns an error when the config file cannot be loaded or the result
    /// does not validate.
    pub fn load_config(&self) -> Result<BackupConfig> {
        let mut config = match &self.config {
            Some(path) => BackupConfig::from_yaml_file(path)?,
            None => BackupConfig::default(),
        };
        if let Some(root) = &self.root {
            config.root.clone_from(root);
        }
        if let Some(database) = &self.database {
            config.database.clone_from(database);
        }
        if let Some(temp_root) = &self.temp_root {
            config.temp_root.clone_from(temp_root);
        }
        if let Some(days) = self.retention_days {
            config.retention_days = days;
        }
        config.validate()?;
        Ok(config)
    }
}

/// Human-readable logs on stderr, plus `<root>/logs/<binary>.log` when the log
/// directory is writable. `RUST_LOG` overrides the default `info` filter.
///
/// # Errors
/// Returns an error when a global subscriber is already installed.
pub fn init_logging(binary: &str, config: &BackupConfig) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let logs_dir = config.logs_dir();
    let file_layer = fs::create_dir_all(&logs_dir)
        .and_then(|()| {
            OpenOptions::new().create(true).append(true).open(logs_dir.join(format!("{binary}.log")))
        })
        .ok()
        .map(|file| fmt::layer().with_ansi(false).with_target(false).with_writer(Mutex::new(file)));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(file_layer)
        .try_init()
        .context("failed to install tracing subscriber")?;
    Ok(())
}

/// Pretty JSON on stdout.
///
/// # Errors
/// Returns an error when the value cannot be serialized.
pub fn emit_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// 0 when healthy, 1 otherwise.
#[must_use]
pub fn exit_code(healthy: bool) -> ExitCode {
    if healthy {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_config_file() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("backup.yaml");
        fs::write(&path, "root: /from/file\nretention_days: 14\n")?;

        let args = CommonArgs {
            config: Some(path),
            database: Some(PathBuf::from("/from/flag.sqlite3")),
            retention_days: Some(3),
            ..CommonArgs::default()
        };
        let config = args.load_config()?;
        assert_eq!(config.root, PathBuf::from("/from/file"));
        assert_eq!(config.database, PathBuf::from("/from/flag.sqlite3"));
        assert_eq!(config.retention_days, 3);
        Ok(())
    }

    #[test]
    fn zero_retention_is_rejected() {
        let args = CommonArgs { retention_days: Some(0), ..CommonArgs::default() };
        assert!(args.load_config().is_err());
    }
}
