//! Backup runs, verification and restore on top of the chain model in
//! `backup-chain-core` and the `SQLite` binding in `backup-chain-store-sqlite`.

pub mod archive;
pub mod chain_store;
pub mod config;
pub mod inspection;
pub mod orchestrator;
pub mod restore;
pub mod retention;

#[cfg(test)]
mod test_support;

pub use archive::{create_archive, extract_archive, inspect, ArchiveContents};
pub use chain_store::ChainManager;
pub use config::BackupConfig;
pub use inspection::{ArchiveListing, BlockCheck, ChainInspector, FileCheck, FullVerification};
pub use orchestrator::{
    BackupOrchestrator, BackupStatus, ExtraExport, ExtraExportContext, SummaryExport,
};
pub use restore::{AvailableBackup, FullRestoreOptions, HashCheck, RestoreService};
pub use retention::{BackupFileInfo, RetentionManager, StorageUsage};
