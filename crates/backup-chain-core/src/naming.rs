//! Archive file names embed the run timestamp: `backup_<YYYYMMDD_HHMMSS>.<ext>`.
//! Retention relies on parsing it back, so both directions live here.

use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};

use crate::BackupError;

pub const ARCHIVE_PREFIX: &str = "backup_";
pub const ARCHIVE_EXTENSION: &str = "zip";

const RUN_STAMP_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year][month][day]_[hour][minute][second]");
const RUN_STAMP_LEN: usize = 15;

/// `YYYYMMDD_HHMMSS` in UTC.
///
/// # Errors
/// Returns [`BackupError::Timestamp`] when the value cannot be formatted.
pub fn format_run_stamp(at: OffsetDateTime) -> Result<String, BackupError> {
    at.to_offset(time::UtcOffset::UTC)
        .format(RUN_STAMP_FORMAT)
        .map_err(|err| BackupError::Timestamp(err.to_string()))
}

/// # Errors
/// Returns [`BackupError::Timestamp`] when the value cannot be formatted.
pub fn archive_file_name(at: OffsetDateTime) -> Result<String, BackupError> {
    Ok(format!("{ARCHIVE_PREFIX}{}.{ARCHIVE_EXTENSION}", format_run_stamp(at)?))
}

/// Timestamp embedded in an archive file name, or `None` when the name does
/// not follow the `backup_<YYYYMMDD_HHMMSS>.<ext>` pattern.
#[must_use]
pub fn parse_archive_timestamp(file_name: &str) -> Option<OffsetDateTime> {
    let rest = file_name.strip_prefix(ARCHIVE_PREFIX)?;
    let stamp = rest.get(..RUN_STAMP_LEN)?;
    let extension = rest.get(RUN_STAMP_LEN..)?.strip_prefix('.')?;
    if extension.is_empty() {
        return None;
    }
    PrimitiveDateTime::parse(stamp, RUN_STAMP_FORMAT).ok().map(PrimitiveDateTime::assume_utc)
}
