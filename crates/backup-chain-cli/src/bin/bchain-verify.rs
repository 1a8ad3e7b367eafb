use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use backup_chain_cli::{emit_json, exit_code, init_logging, CommonArgs};
use backup_chain_engine::{BackupOrchestrator, ChainInspector};
use clap::{ArgGroup, Parser};

#[derive(Debug, Parser)]
#[command(name = "bchain-verify")]
#[command(about = "Inspect and verify the backup chain and its archives")]
#[command(group(ArgGroup::new("mode").required(true).args(["status", "verify", "list", "check"])))]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    /// Chain and storage summary.
    #[arg(long)]
    status: bool,

    /// Verify every block's links, archive hash and archive contents.
    #[arg(long)]
    verify: bool,

    /// List archives on disk, oldest first, with their block numbers.
    #[arg(long)]
    list: bool,

    /// Check one file against the chain.
    #[arg(long, value_name = "FILE")]
    check: Option<PathBuf>,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config = cli.common.load_config()?;
    init_logging("bchain-verify", &config)?;

    if cli.status {
        let status = BackupOrchestrator::new(config)?.get_backup_status()?;
        emit_json(&status)?;
        return Ok(exit_code(status.chain_valid));
    }

    let inspector = ChainInspector::new(&config);
    if cli.verify {
        let report = inspector.verify_all()?;
        emit_json(&report)?;
        return Ok(exit_code(report.healthy));
    }
    if cli.list {
        emit_json(&inspector.list_archives()?)?;
        return Ok(ExitCode::SUCCESS);
    }
    if let Some(path) = cli.check {
        let check = inspector.check_file(&path)?;
        emit_json(&check)?;
        return Ok(exit_code(check.hash_matches));
    }
    Ok(ExitCode::FAILURE)
}
