use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};

use backup_chain_core::BackupError;
use backup_chain_store_sqlite::{FULL_DUMP_FILE, METADATA_FILE, TABLES_DIR};
use serde::Serialize;
use tracing::{debug, info};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// Entry listing of an archive, without extracting it.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ArchiveContents {
    pub entries: Vec<String>,
    pub has_full_dump: bool,
    pub has_metadata: bool,
    /// Table names with a `tables/<name>.json` entry.
    pub table_files: Vec<String>,
}

/// Compress every file under `source_dir` into a deflated ZIP at `output`.
/// Entry names are relative to `source_dir` with `/` separators.
///
/// # Errors
/// Returns [`BackupError::ArchiveFailed`] when the source is missing, the output
/// sits inside the source tree, or any read/write fails. A partial output file
/// is removed.
pub fn create_archive(source_dir: &Path, output: &Path) -> Result<u64, BackupError> {
    if !source_dir.is_dir() {
        return Err(BackupError::ArchiveFailed(format!(
            "source directory does not exist: {}",
            source_dir.display()
        )));
    }
    if output.starts_with(source_dir) {
        return Err(BackupError::ArchiveFailed(format!(
            "archive {} would be written inside its own source {}",
            output.display(),
            source_dir.display()
        )));
    }

    match write_archive(source_dir, output) {
        Ok(entries) => {
            let size = fs::metadata(output).map_err(|err| BackupError::io(output, err))?.len();
            info!(archive = %output.display(), entries, bytes = size, "archive created");
            Ok(size)
        }
        Err(err) => {
            let _ = fs::remove_file(output);
            Err(BackupError::ArchiveFailed(format!("{}: {err}", output.display())))
        }
    }
}

fn write_archive(source_dir: &Path, output: &Path) -> anyhow::Result<usize> {
    let file = File::create(output)?;
    let mut zip = ZipWriter::new(BufWriter::new(file));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    let mut entries = 0;
    let walker = WalkDir::new(source_dir).sort_by_file_name().into_iter();
    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(source_dir)?;
        let name = entry_name(relative);
        let large = entry.metadata()?.len() >= u64::from(u32::MAX);
        zip.start_file(name.as_str(), options.large_file(large))?;
        let mut reader = BufReader::new(File::open(entry.path())?);
        io::copy(&mut reader, &mut zip)?;
        debug!(entry = %name, "archived file");
        entries += 1;
    }

    let mut writer = zip.finish()?;
    io::Write::flush(&mut writer)?;
    Ok(entries)
}

fn entry_name(relative: &Path) -> String {
    relative
        .components()
        .map(|part| part.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Unpack `archive` into `dest`. Entries whose names would escape `dest` are
/// rejected.
///
/// # Errors
/// Returns [`BackupError::ArchiveFailed`] for unreadable archives or unsafe
/// entry names and [`BackupError::Io`] for filesystem failures.
pub fn extract_archive(archive: &Path, dest: &Path) -> Result<Vec<PathBuf>, BackupError> {
    let mut zip = open_archive(archive)?;
    fs::create_dir_all(dest).map_err(|err| BackupError::io(dest, err))?;

    let mut written = Vec::with_capacity(zip.len());
    for index in 0..zip.len() {
        let mut entry = zip
            .by_index(index)
            .map_err(|err| BackupError::ArchiveFailed(format!("{}: {err}", archive.display())))?;
        let Some(relative) = entry.enclosed_name() else {
            return Err(BackupError::ArchiveFailed(format!(
                "unsafe entry name in {}: {}",
                archive.display(),
                entry.name()
            )));
        };
        let target = dest.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&target).map_err(|err| BackupError::io(&target, err))?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|err| BackupError::io(parent, err))?;
        }
        let mut out = File::create(&target).map_err(|err| BackupError::io(&target, err))?;
        io::copy(&mut entry, &mut out).map_err(|err| BackupError::io(&target, err))?;
        written.push(target);
    }

    debug!(archive = %archive.display(), files = written.len(), "archive extracted");
    Ok(written)
}

/// List an archive's entries and classify the well-known ones.
///
/// # Errors
/// Returns [`BackupError::ArchiveFailed`] when the file is not a readable ZIP.
pub fn inspect(archive: &Path) -> Result<ArchiveContents, BackupError> {
    let zip = open_archive(archive)?;
    let mut entries = zip.file_names().map(str::to_string).collect::<Vec<_>>();
    entries.sort();

    let table_prefix = format!("{TABLES_DIR}/");
    let mut table_files = entries
        .iter()
        .filter_map(|name| name.strip_prefix(&table_prefix))
        .filter_map(|rest| rest.strip_suffix(".json"))
        .filter(|table| !table.is_empty() && !table.contains('/'))
        .map(str::to_string)
        .collect::<Vec<_>>();
    table_files.sort();

    Ok(ArchiveContents {
        has_full_dump: entries.iter().any(|name| name == FULL_DUMP_FILE),
        has_metadata: entries.iter().any(|name| name == METADATA_FILE),
        table_files,
        entries,
    })
}

fn open_archive(archive: &Path) -> Result<ZipArchive<BufReader<File>>, BackupError> {
    if !archive.is_file() {
        return Err(BackupError::NotFound(format!("archive {}", archive.display())));
    }
    let file = File::open(archive).map_err(|err| BackupError::io(archive, err))?;
    ZipArchive::new(BufReader::new(file))
        .map_err(|err| BackupError::ArchiveFailed(format!("{}: {err}", archive.display())))
}
