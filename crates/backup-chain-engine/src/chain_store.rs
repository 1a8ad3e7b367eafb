use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use backup_chain_core::{
    sha256_file, BackupError, Block, BlockInput, Chain, ChainStatus, VerificationResult,
};
use tempfile::NamedTempFile;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

/// Owns the on-disk chain file. The chain itself is passed in and out of each
/// call; nothing is cached between calls.
#[derive(Debug, Clone)]
pub struct ChainManager {
    path: PathBuf,
    owner: String,
    purpose: String,
}

impl ChainManager {
    #[must_use]
    pub fn new(path: PathBuf, owner: &str, purpose: &str) -> Self {
        Self { path, owner: owner.to_string(), purpose: purpose.to_string() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the chain file, or start an empty chain when none exists yet.
    ///
    /// # Errors
    /// Returns [`BackupError::Io`] when the file cannot be read and
    /// [`BackupError::ChainCorrupt`] when it does not parse as a chain.
    pub fn load(&self) -> Result<Chain, BackupError> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "no chain file yet, starting empty chain");
            return Chain::new(&self.owner, &self.purpose, OffsetDateTime::now_utc());
        }

        let bytes = fs::read(&self.path).map_err(|err| BackupError::io(&self.path, err))?;
        serde_json::from_slice(&bytes)
            .map_err(|err| BackupError::ChainCorrupt(format!("{}: {err}", self.path.display())))
    }

    /// Write the whole chain. The new content lands in a sibling temp file
    /// first and is renamed over the chain file, so readers never see a torn write.
    ///
    /// # Errors
    /// Returns [`BackupError::Io`] when the directory, temp file or rename fails.
    pub fn save(&self, chain: &Chain) -> Result<(), BackupError> {
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent).map_err(|err| BackupError::io(&parent, err))?;

        let body = serde_json::to_vec_pretty(chain)
            .map_err(|err| BackupError::ChainCorrupt(format!("failed to serialize chain: {err}")))?;

        let mut staged = NamedTempFile::new_in(&parent).map_err(|err| BackupError::io(&parent, err))?;
        staged.write_all(&body).map_err(|err| BackupError::io(staged.path(), err))?;
        staged.as_file().sync_all().map_err(|err| BackupError::io(staged.path(), err))?;
        staged.persist(&self.path).map_err(|err| BackupError::io(&self.path, err.error))?;
        Ok(())
    }

    /// Seal a block onto `chain` and persist immediately.
    ///
    /// If the save fails the block is removed again, so the caller's chain
    /// still matches what is on disk.
    ///
    /// # Errors
    /// Returns the timestamp or save error; `chain` is unchanged in that case.
    pub fn append(
        &self,
        chain: &mut Chain,
        input: BlockInput,
        now: OffsetDateTime,
    ) -> Result<Block, BackupError> {
        let previous_len = chain.len();
        let block = chain.append(input, now)?.clone();

        if let Err(err) = self.save(chain) {
            chain.truncate(previous_len);
            warn!(block_number = block.block_number, error = %err, "chain save failed, append rolled back");
            return Err(err);
        }

        info!(
            block_number = block.block_number,
            data_reference = %block.data_reference,
            block_hash = %block.block_hash,
            "appended block to chain"
        );
        Ok(block)
    }

    #[must_use]
    pub fn verify(&self, chain: &Chain) -> VerificationResult {
        chain.verify()
    }

    /// True when `path` exists and hashes to the named block's `data_hash`.
    #[must_use]
    pub fn verify_file(&self, chain: &Chain, path: &Path, block_number: u64) -> bool {
        let Some(block) = chain.get_block(block_number) else {
            return false;
        };
        if !path.is_file() {
            return false;
        }
        match sha256_file(path) {
            Ok(actual) => actual == block.data_hash,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "could not hash archive");
                false
            }
        }
    }

    /// # Errors
    /// Returns the load error.
    pub fn get_block(&self, block_number: u64) -> Result<Option<Block>, BackupError> {
        Ok(self.load()?.get_block(block_number).cloned())
    }

    /// # Errors
    /// Returns the load error.
    pub fn get_latest(&self) -> Result<Option<Block>, BackupError> {
        Ok(self.load()?.latest().cloned())
    }

    /// # Errors
    /// Returns the load error.
    pub fn status(&self) -> Result<ChainStatus, BackupError> {
        Ok(self.load()?.status())
    }
}

#[cfg(test)]
mod tests {
    use backup_chain_core::{sha256_hex, Metadata, GENESIS_HASH};
    use serde_json::json;
    use tempfile::TempDir;
    use time::macros::datetime;
    use time::Duration;

    use super::*;

    fn input(reference: &str, data_hash: String) -> BlockInput {
        let mut metadata = Metadata::new();
        metadata.insert("archive_size".to_string(), json!(10));
        BlockInput {
            data_hash,
            data_type: "full_backup".to_string(),
            data_reference: reference.to_string(),
            metadata,
        }
    }

    #[test]
    fn missing_file_loads_as_empty_chain() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let manager = ChainManager::new(dir.path().join("chain.json"), "ops", "tests");
        let chain = manager.load()?;
        assert!(chain.is_empty());
        assert_eq!(chain.owner, "ops");
        assert!(!manager.path().exists());
        Ok(())
    }

    #[test]
    fn unparsable_file_is_chain_corrupt() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("chain.json");
        fs::write(&path, b"{\"chain_id\": 12")?;
        let manager = ChainManager::new(path, "ops", "tests");
        assert!(matches!(manager.load(), Err(BackupError::ChainCorrupt(_))));
        Ok(())
    }

    #[test]
    fn append_persists_and_reloads_identically() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let manager = ChainManager::new(dir.path().join("nested/chain.json"), "ops", "tests");
        let start = datetime!(2025-01-01 03:00 UTC);

        let mut chain = manager.load()?;
        let first = manager.append(&mut chain, input("a.zip", sha256_hex(b"a")), start)?;
        let second =
            manager.append(&mut chain, input("b.zip", sha256_hex(b"b")), start + Duration::days(1))?;

        assert_eq!(first.block_number, 0);
        assert_eq!(first.previous_hash, GENESIS_HASH);
        assert_eq!(second.previous_hash, first.block_hash);

        let reloaded = manager.load()?;
        assert_eq!(reloaded, chain);
        assert!(manager.verify(&reloaded).is_valid);
        assert_eq!(manager.get_latest()?.map(|block| block.block_number), Some(1));
        assert_eq!(manager.status()?.length, 2);
        Ok(())
    }

    #[test]
    fn failed_save_rolls_back_the_append() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, b"file in the way")?;
        let manager = ChainManager::new(blocker.join("chain.json"), "ops", "tests");

        let mut chain = manager.load()?;
        let result = manager.append(&mut chain, input("a.zip", sha256_hex(b"a")), OffsetDateTime::now_utc());
        assert!(matches!(result, Err(BackupError::Io { .. })));
        assert!(chain.is_empty());
        Ok(())
    }

    #[test]
    fn verify_file_detects_single_byte_change() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let archive = dir.path().join("backup_20250101_030000.zip");
        fs::write(&archive, b"archive bytes")?;

        let manager = ChainManager::new(dir.path().join("chain.json"), "ops", "tests");
        let mut chain = manager.load()?;
        manager.append(
            &mut chain,
            input("backup_20250101_030000.zip", sha256_file(&archive)?),
            OffsetDateTime::now_utc(),
        )?;

        assert!(manager.verify_file(&chain, &archive, 0));
        assert!(!manager.verify_file(&chain, &archive, 1));
        assert!(!manager.verify_file(&chain, &dir.path().join("missing.zip"), 0));

        fs::write(&archive, b"archive byteZ")?;
        assert!(!manager.verify_file(&chain, &archive, 0));
        Ok(())
    }
}
