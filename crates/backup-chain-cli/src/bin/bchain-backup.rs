use std::process::ExitCode;

use anyhow::Result;
use backup_chain_cli::{emit_json, exit_code, init_logging, CommonArgs};
use backup_chain_core::BackupResult;
use backup_chain_engine::{BackupOrchestrator, BackupStatus};
use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "bchain-backup")]
#[command(about = "Run one chained database backup, or report on existing ones")]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    /// Print chain and storage summary; exit 1 when the chain is invalid.
    #[arg(long, conflicts_with = "verify")]
    status: bool,

    /// Verify the chain and the latest archive; exit 1 on any problem.
    #[arg(long)]
    verify: bool,

    /// Print results as JSON instead of text.
    #[arg(long)]
    json: bool,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config = cli.common.load_config()?;
    init_logging("bchain-backup", &config)?;
    let orchestrator = BackupOrchestrator::new(config)?;

    if cli.status {
        let status = orchestrator.get_backup_status()?;
        if cli.json {
            emit_json(&status)?;
        } else {
            print_status(&status);
        }
        return Ok(exit_code(status.chain_valid));
    }

    if cli.verify {
        let check = orchestrator.verify_latest_backup()?;
        if cli.json {
            emit_json(&check)?;
        } else {
            println!("chain valid:      {}", check.chain.is_valid);
            println!("blocks checked:   {}", check.chain.blocks_checked);
            match (&check.block_number, &check.data_reference) {
                (Some(number), Some(reference)) => {
                    println!("latest block:     {number} ({reference})");
                }
                _ => println!("latest block:     none"),
            }
            println!("file exists:      {}", check.file_exists);
            println!("hash matches:     {}", check.hash_matches);
            for issue in &check.chain.errors {
                println!("error:   block {}: {}", issue.block_number, issue.message);
            }
            for issue in &check.chain.warnings {
                println!("warning: block {}: {}", issue.block_number, issue.message);
            }
        }
        return Ok(exit_code(check.is_healthy()));
    }

    let result = orchestrator.run();
    if cli.json {
        emit_json(&result)?;
    } else {
        print_result(&result);
    }
    Ok(exit_code(result.success))
}

fn print_result(result: &BackupResult) {
    if result.success {
        println!("backup succeeded");
        if let Some(number) = result.block_number {
            println!("block:    {number}");
        }
        if let Some(path) = &result.archive_path {
            println!("archive:  {path} ({} bytes)", result.archive_size);
        }
        if let Some(hash) = &result.data_hash {
            println!("sha256:   {hash}");
        }
        println!("tables:   {}, rows: {}", result.tables_count, result.total_rows);
    } else {
        println!("backup failed: {}", result.error.as_deref().unwrap_or("unknown error"));
    }
    println!("duration: {:.2}s", result.duration_secs);
    for warning in &result.warnings {
        println!("warning:  {warning}");
    }
}

fn print_status(status: &BackupStatus) {
    println!("chain id:        {}", status.chain.chain_id);
    println!("chain length:    {}", status.chain.length);
    println!(
        "chain valid:     {} ({} errors, {} warnings)",
        status.chain_valid, status.chain_errors, status.chain_warnings
    );
    if let Some(file) = &status.chain.latest_backup_file {
        println!(
            "latest backup:   {file} at {}",
            status.chain.latest_backup_time.as_deref().unwrap_or("?")
        );
    }
    println!("archives:        {} ({:.2} MB)", status.storage.count, status.storage.total_mb);
    println!("retention:       {} days", status.storage.retention_days);
}
