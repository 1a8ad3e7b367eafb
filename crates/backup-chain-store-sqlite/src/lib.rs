use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params, params_from_iter, Connection, DatabaseName, OpenFlags};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

pub const FULL_DUMP_FILE: &str = "full_dump.sqlite3";
pub const METADATA_FILE: &str = "metadata.json";
pub const TABLES_DIR: &str = "tables";

const EXPORT_STAMP_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year][month][day]_[hour][minute][second]");

/// One exported row: column name to JSON-coerced value, in column order.
pub type Row = Map<String, Value>;

/// Handle on the source (or restore target) `SQLite` database.
pub struct SourceDatabase {
    conn: Connection,
    path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DatabaseStats {
    pub tables_count: usize,
    pub total_rows: u64,
    pub db_size: u64,
    /// `-1` marks a table whose row count could not be read.
    pub row_counts_by_table: BTreeMap<String, i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableExportInfo {
    pub table: String,
    pub path: String,
    pub rows: usize,
    pub bytes: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportMetadata {
    pub exported_at: String,
    pub source_database: String,
    pub dump_file: String,
    pub stats: DatabaseStats,
    pub critical_tables: Vec<String>,
    pub table_exports: BTreeMap<String, TableExportInfo>,
}

/// Every artifact produced by [`SourceDatabase::create_full_backup`].
#[derive(Debug, Clone)]
pub struct FullBackupExport {
    pub dir: PathBuf,
    pub dump_path: PathBuf,
    pub table_exports: BTreeMap<String, TableExportInfo>,
    pub metadata: ExportMetadata,
    pub stats: DatabaseStats,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEntry {
    pub level: String,
    pub component: String,
    pub message: String,
    pub details: Value,
}

impl SourceDatabase {
    /// Open (creating if needed) a database file.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or configured.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;
        Self::configure(conn, path)
    }

    /// Open a database that must already exist; used for the backup source.
    ///
    /// # Errors
    /// Returns an error when the file is missing or cannot be opened.
    pub fn open_existing(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(anyhow!("source database does not exist: {}", path.display()));
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;
        Self::configure(conn, path)
    }

    fn configure(conn: Connection, path: &Path) -> Result<Self> {
        conn.execute_batch("PRAGMA busy_timeout = 5000;")
            .context("failed to configure sqlite pragmas")?;
        Ok(Self { conn, path: path.to_path_buf() })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All user tables in the schema, sorted by name.
    ///
    /// # Errors
    /// Returns an error when `sqlite_master` cannot be read.
    pub fn list_tables(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT name FROM sqlite_master
                 WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
                 ORDER BY name ASC",
            )
            .context("failed to prepare table listing")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut tables = Vec::new();
        for row in rows {
            tables.push(row?);
        }
        Ok(tables)
    }

    /// # Errors
    /// Returns an error when `sqlite_master` cannot be queried.
    pub fn table_exists(&self, table: &str) -> Result<bool> {
        table_exists(&self.conn, table)
    }

    /// # Errors
    /// Returns an error when the table cannot be counted.
    pub fn count_rows(&self, table: &str) -> Result<i64> {
        self.conn
            .query_row(&format!("SELECT COUNT(*) FROM {}", quote_identifier(table)), [], |row| {
                row.get::<_, i64>(0)
            })
            .with_context(|| format!("failed to count rows in {table}"))
    }

    /// Table and row counts across the whole schema plus the database size.
    /// A table whose count fails is recorded as `-1` and skipped in the total.
    ///
    /// # Errors
    /// Returns an error when the table list or page statistics cannot be read.
    pub fn get_stats(&self) -> Result<DatabaseStats> {
        let tables = self.list_tables()?;
        let mut row_counts_by_table = BTreeMap::new();
        let mut total_rows = 0_u64;

        for table in &tables {
            match self.count_rows(table) {
                Ok(count) => {
                    total_rows += u64::try_from(count).unwrap_or(0);
                    row_counts_by_table.insert(table.clone(), count);
                }
                Err(err) => {
                    warn!(table = %table, error = %format!("{err:#}"), "row count failed");
                    row_counts_by_table.insert(table.clone(), -1);
                }
            }
        }

        Ok(DatabaseStats {
            tables_count: tables.len(),
            total_rows,
            db_size: self.database_size()?,
            row_counts_by_table,
        })
    }

    fn database_size(&self) -> Result<u64> {
        let page_count: i64 = self
            .conn
            .query_row("PRAGMA page_count", [], |row| row.get(0))
            .context("failed to read PRAGMA page_count")?;
        let page_size: i64 = self
            .conn
            .query_row("PRAGMA page_size", [], |row| row.get(0))
            .context("failed to read PRAGMA page_size")?;
        Ok(u64::try_from(page_count.saturating_mul(page_size)).unwrap_or(0))
    }

    /// Write a complete copy of the database into `dir` using the online backup API.
    ///
    /// # Errors
    /// Returns an error when the directory cannot be created or the backup fails.
    pub fn export_full_dump(&self, dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create export directory {}", dir.display()))?;
        let dump_path = dir.join(FULL_DUMP_FILE);

        self.conn
            .backup(DatabaseName::Main, &dump_path, None)
            .with_context(|| format!("failed to create sqlite backup at {}", dump_path.display()))?;

        info!(dump = %dump_path.display(), "full database dump written");
        Ok(dump_path)
    }

    /// Export each allow-listed table as a JSON array under `dir/tables/`.
    ///
    /// Missing tables and per-table failures are logged and skipped; only a
    /// failure to create the output directory is fatal.
    ///
    /// # Errors
    /// Returns an error when the `tables/` directory cannot be created.
    pub fn export_critical_tables_json(
        &self,
        dir: &Path,
        tables: &[String],
    ) -> Result<BTreeMap<String, TableExportInfo>> {
        let tables_dir = dir.join(TABLES_DIR);
        fs::create_dir_all(&tables_dir).with_context(|| {
            format!("failed to create table export directory {}", tables_dir.display())
        })?;

        let mut exports = BTreeMap::new();
        for table in tables {
            match self.table_exists(table) {
                Ok(true) => {}
                Ok(false) => {
                    warn!(table = %table, "critical table does not exist, skipping export");
                    continue;
                }
                Err(err) => {
                    warn!(table = %table, error = %format!("{err:#}"), "table lookup failed");
                    continue;
                }
            }

            match self.export_table_json(&tables_dir, table) {
                Ok(info) => {
                    debug!(table = %table, rows = info.rows, "critical table exported");
                    exports.insert(table.clone(), info);
                }
                Err(err) => {
                    warn!(table = %table, error = %format!("{err:#}"), "critical table export failed");
                }
            }
        }

        Ok(exports)
    }

    fn export_table_json(&self, tables_dir: &Path, table: &str) -> Result<TableExportInfo> {
        let rows = self.read_table_rows(table)?;
        let body = serde_json::to_vec_pretty(&rows)
            .with_context(|| format!("failed to serialize rows of {table}"))?;
        let file_name = format!("{table}.json");
        let path = tables_dir.join(&file_name);
        fs::write(&path, &body)
            .with_context(|| format!("failed to write table export {}", path.display()))?;

        let mut hasher = Sha256::new();
        hasher.update(&body);
        Ok(TableExportInfo {
            table: table.to_string(),
            path: format!("{TABLES_DIR}/{file_name}"),
            rows: rows.len(),
            bytes: body.len() as u64,
            sha256: format!("{:x}", hasher.finalize()),
        })
    }

    /// Every row of `table` with JSON-coerced values (blobs become hex strings).
    ///
    /// # Errors
    /// Returns an error when the table cannot be read.
    pub fn read_table_rows(&self, table: &str) -> Result<Vec<Row>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT * FROM {}", quote_identifier(table)))
            .with_context(|| format!("failed to prepare read of {table}"))?;
        let columns = stmt.column_names().into_iter().map(str::to_string).collect::<Vec<_>>();

        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut object = Map::new();
            for (index, column) in columns.iter().enumerate() {
                object.insert(column.clone(), sql_to_json(row.get_ref(index)?));
            }
            out.push(object);
        }
        Ok(out)
    }

    /// Stats, full dump, critical-table JSON and `metadata.json`, in that order.
    /// Without `dir`, a fresh `backup_<stamp>_*` directory is created under the
    /// system temp dir and left for the caller to remove.
    ///
    /// # Errors
    /// Returns an error when the directory, stats, the dump, or the metadata
    /// file fail.
    pub fn create_full_backup(
        &self,
        dir: Option<&Path>,
        critical_tables: &[String],
    ) -> Result<FullBackupExport> {
        let dir = match dir {
            Some(dir) => {
                fs::create_dir_all(dir).with_context(|| {
                    format!("failed to create export directory {}", dir.display())
                })?;
                dir.to_path_buf()
            }
            None => scratch_export_dir()?,
        };
        let dir = dir.as_path();

        let stats = self.get_stats()?;
        info!(
            tables = stats.tables_count,
            rows = stats.total_rows,
            bytes = stats.db_size,
            "collected database statistics"
        );

        let dump_path = self.export_full_dump(dir)?;
        let table_exports = self.export_critical_tables_json(dir, critical_tables)?;

        let metadata = ExportMetadata {
            exported_at: now_rfc3339()?,
            source_database: self.path.display().to_string(),
            dump_file: FULL_DUMP_FILE.to_string(),
            stats: stats.clone(),
            critical_tables: critical_tables.to_vec(),
            table_exports: table_exports.clone(),
        };
        let metadata_path = dir.join(METADATA_FILE);
        let body =
            serde_json::to_vec_pretty(&metadata).context("failed to serialize export metadata")?;
        fs::write(&metadata_path, body).with_context(|| {
            format!("failed to write export metadata {}", metadata_path.display())
        })?;

        Ok(FullBackupExport { dir: dir.to_path_buf(), dump_path, table_exports, metadata, stats })
    }

    /// Replace this database's contents with a dump produced by [`Self::export_full_dump`].
    ///
    /// # Errors
    /// Returns an error when the dump is missing or the restore fails.
    pub fn restore_from_dump(&mut self, dump_path: &Path) -> Result<()> {
        if !dump_path.exists() {
            return Err(anyhow!("dump file does not exist: {}", dump_path.display()));
        }

        self.conn
            .restore(DatabaseName::Main, dump_path, None::<fn(rusqlite::backup::Progress)>)
            .with_context(|| format!("failed to restore sqlite dump from {}", dump_path.display()))
    }

    /// Empty `table` and insert `rows` in one transaction.
    ///
    /// # Errors
    /// Returns an error when the table is missing, a row names an unknown
    /// column, or any statement fails. The table is left untouched on error.
    pub fn replace_table_rows(&mut self, table: &str, rows: &[Row]) -> Result<usize> {
        if !table_exists(&self.conn, table)? {
            return Err(anyhow!("table does not exist: {table}"));
        }
        let column_types = table_column_types(&self.conn, table)?;
        let quoted_table = quote_identifier(table);

        let tx = self
            .conn
            .transaction()
            .with_context(|| format!("failed to start restore transaction for {table}"))?;
        tx.execute(&format!("DELETE FROM {quoted_table}"), [])
            .with_context(|| format!("failed to clear table {table}"))?;

        for (index, row) in rows.iter().enumerate() {
            let mut names = Vec::with_capacity(row.len());
            let mut values = Vec::with_capacity(row.len());
            for (column, value) in row {
                let Some(declared) = column_types.get(column) else {
                    return Err(anyhow!("row {index} of {table} has unknown column {column}"));
                };
                names.push(quote_identifier(column));
                values.push(json_to_sql(value, declared));
            }

            let sql = if names.is_empty() {
                format!("INSERT INTO {quoted_table} DEFAULT VALUES")
            } else {
                let placeholders = (1..=names.len()).map(|n| format!("?{n}")).collect::<Vec<_>>();
                format!(
                    "INSERT INTO {quoted_table} ({}) VALUES ({})",
                    names.join(", "),
                    placeholders.join(", ")
                )
            };
            let mut stmt = tx
                .prepare_cached(&sql)
                .with_context(|| format!("failed to prepare insert into {table}"))?;
            stmt.execute(params_from_iter(values.iter()))
                .with_context(|| format!("failed to insert row {index} into {table}"))?;
        }

        tx.commit().with_context(|| format!("failed to commit restore of {table}"))?;
        Ok(rows.len())
    }

    /// Best-effort audit row. Returns `false` when the audit table does not exist.
    ///
    /// # Errors
    /// Returns an error when the insert itself fails.
    pub fn record_audit(&self, table: &str, entry: &AuditEntry) -> Result<bool> {
        if !table_exists(&self.conn, table)? {
            return Ok(false);
        }

        self.conn
            .execute(
                &format!(
                    "INSERT INTO {} (level, component, message, details, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    quote_identifier(table)
                ),
                params![
                    entry.level,
                    entry.component,
                    entry.message,
                    entry.details.to_string(),
                    now_rfc3339()?
                ],
            )
            .with_context(|| format!("failed to write audit entry into {table}"))?;
        Ok(true)
    }
}

/// Delete a database file and its WAL/shared-memory siblings.
///
/// # Errors
/// Returns an error when an existing file cannot be removed.
pub fn remove_database_files(path: &Path) -> Result<()> {
    for suffix in ["", "-wal", "-shm"] {
        let candidate = if suffix.is_empty() {
            path.to_path_buf()
        } else {
            PathBuf::from(format!("{}{suffix}", path.display()))
        };
        if candidate.exists() {
            fs::remove_file(&candidate)
                .with_context(|| format!("failed to remove database file {}", candidate.display()))?;
        }
    }
    Ok(())
}

/// True for names usable as table identifiers without quoting surprises.
#[must_use]
pub fn is_plain_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(first) if first.is_ascii_alphabetic() || first == '_')
        && chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}

#[must_use]
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn table_column_types(conn: &Connection, table: &str) -> Result<BTreeMap<String, String>> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({})", quote_identifier(table)))
        .with_context(|| format!("failed to inspect table_info for {table}"))?;
    let mut rows = stmt.query([])?;

    let mut columns = BTreeMap::new();
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        let declared: String = row.get::<_, Option<String>>(2)?.unwrap_or_default();
        columns.insert(name, declared.to_ascii_uppercase());
    }
    Ok(columns)
}

fn sql_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(int) => Value::from(int),
        ValueRef::Real(real) => serde_json::Number::from_f64(real).map_or(Value::Null, Value::Number),
        ValueRef::Text(text) => Value::String(String::from_utf8_lossy(text).into_owned()),
        ValueRef::Blob(blob) => Value::String(hex::encode(blob)),
    }
}

fn json_to_sql(value: &Value, declared_type: &str) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(flag) => SqlValue::Integer(i64::from(*flag)),
        Value::Number(number) => match number.as_i64() {
            Some(int) => SqlValue::Integer(int),
            None => number.as_f64().map_or(SqlValue::Null, SqlValue::Real),
        },
        Value::String(text) if declared_type.contains("BLOB") => {
            hex::decode(text).map_or_else(|_| SqlValue::Text(text.clone()), SqlValue::Blob)
        }
        Value::String(text) => SqlValue::Text(text.clone()),
        nested @ (Value::Array(_) | Value::Object(_)) => SqlValue::Text(nested.to_string()),
    }
}

fn scratch_export_dir() -> Result<PathBuf> {
    let stamp = OffsetDateTime::now_utc()
        .format(EXPORT_STAMP_FORMAT)
        .context("failed to format export stamp")?;
    let dir = tempfile::Builder::new()
        .prefix(&format!("backup_{stamp}_"))
        .tempdir()
        .context("failed to create scratch export directory")?;
    Ok(dir.keep())
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}
