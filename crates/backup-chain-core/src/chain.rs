use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use ulid::Ulid;

use crate::outcome::{IssueKind, VerificationIssue, VerificationResult};
use crate::{BackupError, Block, BlockInput, GENESIS_HASH};

/// Ordered, append-only sequence of backup blocks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chain {
    pub chain_id: String,
    pub created_at: String,
    pub owner: String,
    pub purpose: String,
    #[serde(default)]
    pub blocks: Vec<Block>,
}

/// Summary of a chain for status displays.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChainStatus {
    pub chain_id: String,
    pub owner: String,
    pub purpose: String,
    pub created_at: String,
    pub length: usize,
    pub latest_block_number: Option<u64>,
    pub latest_backup_file: Option<String>,
    pub latest_backup_time: Option<String>,
}

impl Chain {
    /// Create an empty chain. Block 0 will be the first real backup.
    ///
    /// # Errors
    /// Returns [`BackupError::Timestamp`] when `now` cannot be rendered as RFC 3339.
    pub fn new(owner: &str, purpose: &str, now: OffsetDateTime) -> Result<Self, BackupError> {
        Ok(Self {
            chain_id: Ulid::new().to_string(),
            created_at: rfc3339(now)?,
            owner: owner.to_string(),
            purpose: purpose.to_string(),
            blocks: Vec::new(),
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    #[must_use]
    pub fn get_block(&self, block_number: u64) -> Option<&Block> {
        usize::try_from(block_number).ok().and_then(|index| self.blocks.get(index))
    }

    #[must_use]
    pub fn latest(&self) -> Option<&Block> {
        self.blocks.last()
    }

    /// Most recent block whose `data_reference` names the given archive file.
    #[must_use]
    pub fn find_by_reference(&self, file_name: &str) -> Option<&Block> {
        self.blocks.iter().rev().find(|block| block.data_reference == file_name)
    }

    /// Seal a new block after the current tip and push it.
    ///
    /// The block timestamp never goes backwards: if `now` is earlier than the
    /// tip's timestamp (clock skew), the tip's timestamp is reused.
    ///
    /// # Errors
    /// Returns [`BackupError::Timestamp`] when `now` is before the Unix epoch or
    /// cannot be formatted.
    pub fn append(&mut self, input: BlockInput, now: OffsetDateTime) -> Result<&Block, BackupError> {
        let previous_hash = self
            .latest()
            .map_or_else(|| GENESIS_HASH.to_string(), |block| block.block_hash.clone());

        let stamped_at = match self.latest().and_then(|block| parse_rfc3339(&block.timestamp)) {
            Some(tip_time) if tip_time > now => tip_time,
            _ => now,
        };
        let nonce = u64::try_from(now.unix_timestamp_nanos())
            .map_err(|_| BackupError::Timestamp(format!("clock is before the Unix epoch: {now}")))?;

        let mut block = Block {
            block_number: self.blocks.len() as u64,
            timestamp: rfc3339(stamped_at)?,
            previous_hash,
            data_hash: input.data_hash,
            data_type: input.data_type,
            data_reference: input.data_reference,
            metadata: input.metadata,
            nonce,
            block_hash: String::new(),
        };
        block.block_hash = block.compute_hash();
        self.blocks.push(block);

        self.blocks
            .last()
            .ok_or_else(|| BackupError::ChainCorrupt("appended block vanished".to_string()))
    }

    /// Drop every block at or after `len`. Used to undo an append whose save failed.
    pub fn truncate(&mut self, len: usize) {
        self.blocks.truncate(len);
    }

    /// Recompute every block hash and predecessor link.
    ///
    /// Hash and link mismatches are errors and invalidate the chain; numbering
    /// gaps and timestamp regressions are warnings only.
    #[must_use]
    pub fn verify(&self) -> VerificationResult {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        let mut total_archive_bytes = 0_u64;
        let mut previous_time: Option<OffsetDateTime> = None;

        for (index, block) in self.blocks.iter().enumerate() {
            let position = index as u64;

            if !block.has_valid_hash() {
                errors.push(VerificationIssue::new(
                    position,
                    IssueKind::HashMismatch,
                    format!("hash mismatch at block {index}"),
                ));
            }

            let expected_previous = match index.checked_sub(1).and_then(|prev| self.blocks.get(prev)) {
                Some(prior) => prior.block_hash.as_str(),
                None => GENESIS_HASH,
            };
            if block.previous_hash != expected_previous {
                errors.push(VerificationIssue::new(
                    position,
                    IssueKind::LinkBroken,
                    format!("chain link broken at block {index}"),
                ));
            }

            if block.block_number != position {
                warnings.push(VerificationIssue::new(
                    position,
                    IssueKind::NumberMismatch,
                    format!(
                        "block number mismatch at index {index}: recorded {}",
                        block.block_number
                    ),
                ));
            }

            match parse_rfc3339(&block.timestamp) {
                Some(current) => {
                    if previous_time.is_some_and(|prior| current < prior) {
                        warnings.push(VerificationIssue::new(
                            position,
                            IssueKind::TimestampRegression,
                            format!("timestamp goes backwards at block {index}"),
                        ));
                    }
                    previous_time = Some(current);
                }
                None => warnings.push(VerificationIssue::new(
                    position,
                    IssueKind::UnparsableTimestamp,
                    format!("unparsable timestamp at block {index}: {}", block.timestamp),
                )),
            }

            total_archive_bytes =
                total_archive_bytes.saturating_add(block.archive_size().unwrap_or(0));
        }

        VerificationResult {
            is_valid: errors.is_empty(),
            blocks_checked: self.blocks.len(),
            total_archive_bytes,
            errors,
            warnings,
        }
    }

    #[must_use]
    pub fn status(&self) -> ChainStatus {
        let latest = self.latest();
        ChainStatus {
            chain_id: self.chain_id.clone(),
            owner: self.owner.clone(),
            purpose: self.purpose.clone(),
            created_at: self.created_at.clone(),
            length: self.blocks.len(),
            latest_block_number: latest.map(|block| block.block_number),
            latest_backup_file: latest.map(|block| block.data_reference.clone()),
            latest_backup_time: latest.map(|block| block.timestamp.clone()),
        }
    }
}

fn rfc3339(value: OffsetDateTime) -> Result<String, BackupError> {
    value.format(&Rfc3339).map_err(|err| BackupError::Timestamp(err.to_string()))
}

fn parse_rfc3339(value: &str) -> Option<OffsetDateTime> {
    OffsetDateTime::parse(value, &Rfc3339).ok()
}
