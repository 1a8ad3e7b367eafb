use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use rusqlite::Connection;
use serde_json::Value;
use tempfile::TempDir;

struct Workspace {
    dir: TempDir,
}

impl Workspace {
    fn new() -> Self {
        let dir = TempDir::new().unwrap_or_else(|err| panic!("failed to create temp dir: {err}"));
        let workspace = Self { dir };
        seed(&workspace.database());
        workspace
    }

    fn root(&self) -> PathBuf {
        self.dir.path().join("root")
    }

    fn database(&self) -> PathBuf {
        self.dir.path().join("source.sqlite3")
    }

    fn common_args(&self) -> Vec<String> {
        vec![
            "--root".to_string(),
            path_str(&self.root()).to_string(),
            "--db".to_string(),
            path_str(&self.database()).to_string(),
            "--temp-root".to_string(),
            path_str(&self.dir.path().join("tmp")).to_string(),
        ]
    }

    fn run<I, S>(&self, binary: &str, args: I) -> Output
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        Command::new(binary)
            .args(self.common_args())
            .args(args)
            .env("RUST_LOG", "warn")
            .env_remove("BCHAIN_CONFIG")
            .env_remove("BCHAIN_ROOT")
            .env_remove("BCHAIN_DATABASE")
            .env_remove("BCHAIN_TEMP_ROOT")
            .output()
            .unwrap_or_else(|err| panic!("failed to execute {binary}: {err}"))
    }

    fn run_json<I, S>(&self, binary: &str, args: I) -> (Output, Value)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let output = self.run(binary, args);
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let value = serde_json::from_str(&stdout).unwrap_or_else(|err| {
            panic!(
                "stdout is not valid JSON: {err}\nstdout:\n{stdout}\nstderr:\n{}",
                String::from_utf8_lossy(&output.stderr)
            )
        });
        (output, value)
    }

    fn agent_count(&self) -> i64 {
        Connection::open(self.database())
            .and_then(|conn| conn.query_row("SELECT COUNT(*) FROM agents", [], |row| row.get(0)))
            .unwrap_or_else(|err| panic!("failed to count agents: {err}"))
    }
}

const BACKUP: &str = env!("CARGO_BIN_EXE_bchain-backup");
const VERIFY: &str = env!("CARGO_BIN_EXE_bchain-verify");
const RESTORE: &str = env!("CARGO_BIN_EXE_bchain-restore");

fn seed(path: &Path) {
    let conn = Connection::open(path)
        .unwrap_or_else(|err| panic!("failed to open {}: {err}", path.display()));
    conn.execute_batch(
        "CREATE TABLE agents (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
         INSERT INTO agents (id, name) VALUES (1, 'planner'), (2, 'critic');
         CREATE TABLE memories (id INTEGER PRIMARY KEY, content TEXT, embedding BLOB);
         INSERT INTO memories (id, content, embedding) VALUES (1, 'note', x'0102');
         CREATE TABLE system_logs (
           id INTEGER PRIMARY KEY AUTOINCREMENT,
           level TEXT, component TEXT, message TEXT, details TEXT, created_at TEXT
         );",
    )
    .unwrap_or_else(|err| panic!("failed to seed database: {err}"));
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

fn as_str<'a>(value: &'a Value, key: &str) -> &'a str {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string field `{key}` in payload: {value}"))
}

fn first_backup(workspace: &Workspace) -> Value {
    let (output, result) = workspace.run_json(BACKUP, ["--json"]);
    assert!(output.status.success(), "backup failed: {result}");
    assert_eq!(result["success"], Value::Bool(true));
    assert_eq!(result["block_number"], Value::from(0));
    result
}

#[test]
fn backup_then_verify_list_and_check() {
    let workspace = Workspace::new();
    let result = first_backup(&workspace);
    let archive = PathBuf::from(as_str(&result, "archive_path"));
    assert!(archive.is_file());
    assert!(workspace.root().join("chain.json").is_file());
    assert!(workspace.root().join("logs").join("bchain-backup.log").is_file());

    let (output, report) = workspace.run_json(VERIFY, ["--verify"]);
    assert!(output.status.success(), "verify failed: {report}");
    assert_eq!(report["healthy"], Value::Bool(true));

    let (output, listing) = workspace.run_json(VERIFY, ["--list"]);
    assert!(output.status.success());
    let entries = listing.as_array().unwrap_or_else(|| panic!("listing should be an array"));
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["block_number"], Value::from(0));

    let (output, check) = workspace.run_json(VERIFY, [OsStr::new("--check"), archive.as_os_str()]);
    assert!(output.status.success());
    assert_eq!(check["hash_matches"], Value::Bool(true));

    let (output, status) = workspace.run_json(VERIFY, ["--status"]);
    assert!(output.status.success());
    assert_eq!(status["chain"]["length"], Value::from(1));

    let output = workspace.run(BACKUP, ["--status"]);
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("chain length:    1"));
}

#[test]
fn tampered_chain_fails_both_verifiers() {
    let workspace = Workspace::new();
    first_backup(&workspace);

    let chain_path = workspace.root().join("chain.json");
    let body = fs::read_to_string(&chain_path)
        .unwrap_or_else(|err| panic!("failed to read chain: {err}"));
    let mut chain: Value =
        serde_json::from_str(&body).unwrap_or_else(|err| panic!("chain is not JSON: {err}"));
    chain["blocks"][0]["data_hash"] = Value::String("f".repeat(64));
    fs::write(&chain_path, chain.to_string())
        .unwrap_or_else(|err| panic!("failed to write chain: {err}"));

    let (output, report) = workspace.run_json(VERIFY, ["--verify"]);
    assert_eq!(output.status.code(), Some(1));
    assert_eq!(report["chain"]["is_valid"], Value::Bool(false));
    assert_eq!(report["chain"]["errors"].as_array().map(Vec::len), Some(1));

    let output = workspace.run(BACKUP, ["--verify"]);
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn restore_tables_and_full_restore_recover_rows() {
    let workspace = Workspace::new();
    let result = first_backup(&workspace);
    let archive = as_str(&result, "archive_path").to_string();

    let wipe = || {
        Connection::open(workspace.database())
            .and_then(|conn| conn.execute("DELETE FROM agents", []))
            .unwrap_or_else(|err| panic!("failed to wipe agents: {err}"));
    };

    wipe();
    let (output, restored) =
        workspace.run_json(RESTORE, ["tables", archive.as_str(), "--table", "agents"]);
    assert!(output.status.success(), "table restore failed: {restored}");
    assert_eq!(restored["tables_restored"], Value::from(1));
    assert_eq!(workspace.agent_count(), 2);

    wipe();
    let (output, restored) = workspace.run_json(RESTORE, ["full", archive.as_str()]);
    assert!(output.status.success(), "full restore failed: {restored}");
    assert_eq!(restored["hash_verified"], Value::Bool(true));
    assert_eq!(workspace.agent_count(), 2);

    let (output, listed) = workspace.run_json(RESTORE, ["list"]);
    assert!(output.status.success());
    assert_eq!(listed[0]["file_exists"], Value::Bool(true));
}

#[test]
fn verify_requires_exactly_one_mode() {
    let workspace = Workspace::new();
    assert_eq!(workspace.run(VERIFY, std::iter::empty::<&str>()).status.code(), Some(2));
    assert_eq!(workspace.run(VERIFY, ["--status", "--list"]).status.code(), Some(2));
}
