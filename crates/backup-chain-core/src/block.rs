use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::digest::{canonical_metadata, sha256_hex};
use crate::metadata_keys;

/// Open key/value map attached to a block. Keys are kept sorted so the map
/// serializes identically wherever it is hashed.
pub type Metadata = BTreeMap<String, Value>;

/// One immutable record per completed backup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Block {
    pub block_number: u64,
    pub timestamp: String,
    pub previous_hash: String,
    pub data_hash: String,
    pub data_type: String,
    pub data_reference: String,
    #[serde(default)]
    pub metadata: Metadata,
    pub nonce: u64,
    pub block_hash: String,
}

/// Caller-supplied part of a new block; the chain fills in position, time and hashes.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockInput {
    pub data_hash: String,
    pub data_type: String,
    pub data_reference: String,
    pub metadata: Metadata,
}

impl Block {
    /// Hash over every field except `block_hash` itself.
    #[must_use]
    pub fn compute_hash(&self) -> String {
        let mut material = String::new();
        material.push_str(&self.block_number.to_string());
        material.push_str(&self.timestamp);
        material.push_str(&self.previous_hash);
        material.push_str(&self.data_hash);
        material.push_str(&self.data_type);
        material.push_str(&self.data_reference);
        material.push_str(&canonical_metadata(&self.metadata));
        material.push_str(&self.nonce.to_string());
        sha256_hex(material.as_bytes())
    }

    #[must_use]
    pub fn has_valid_hash(&self) -> bool {
        self.compute_hash() == self.block_hash
    }

    /// Archive size recorded by the backup run, when present.
    #[must_use]
    pub fn archive_size(&self) -> Option<u64> {
        self.metadata.get(metadata_keys::ARCHIVE_SIZE).and_then(Value::as_u64)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::GENESIS_HASH;

    fn fixture() -> Block {
        let mut metadata = Metadata::new();
        metadata.insert(metadata_keys::ARCHIVE_SIZE.to_string(), json!(2048));
        metadata.insert(metadata_keys::TABLES_COUNT.to_string(), json!(4));
        let mut block = Block {
            block_number: 0,
            timestamp: "2025-01-01T03:00:00Z".to_string(),
            previous_hash: GENESIS_HASH.to_string(),
            data_hash: "ab".repeat(32),
            data_type: "full_backup".to_string(),
            data_reference: "backup_20250101_030000.zip".to_string(),
            metadata,
            nonce: 1_735_700_400_000_000_000,
            block_hash: String::new(),
        };
        block.block_hash = block.compute_hash();
        block
    }

    #[test]
    fn hash_is_deterministic_and_covers_each_field() {
        let block = fixture();
        assert!(block.has_valid_hash());
        assert_eq!(block.compute_hash(), fixture().compute_hash());

        let mut changed = block.clone();
        changed.data_reference = "backup_20250101_030001.zip".to_string();
        assert_ne!(changed.compute_hash(), block.block_hash);

        let mut changed = block.clone();
        changed.nonce += 1;
        assert_ne!(changed.compute_hash(), block.block_hash);

        let mut changed = block.clone();
        changed.metadata.insert("extra".to_string(), json!("x"));
        assert_ne!(changed.compute_hash(), block.block_hash);
    }

    #[test]
    fn archive_size_reads_metadata() {
        assert_eq!(fixture().archive_size(), Some(2048));
        let mut block = fixture();
        block.metadata.clear();
        assert_eq!(block.archive_size(), None);
    }
}
