use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use backup_chain_cli::{emit_json, exit_code, init_logging, CommonArgs};
use backup_chain_engine::{FullRestoreOptions, RestoreService};
use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "bchain-restore")]
#[command(about = "Restore a database from a chained backup archive")]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Replace the whole database with the archive's full dump.
    Full(FullArgs),
    /// Reload selected tables from the archive's JSON exports.
    Tables(TablesArgs),
    /// Chained backups and whether their archives are still on disk.
    List,
}

#[derive(Debug, Args)]
struct FullArgs {
    archive: PathBuf,

    /// Skip the chain hash check.
    #[arg(long)]
    no_verify: bool,

    /// Delete the target database files before restoring.
    #[arg(long)]
    drop_existing: bool,
}

#[derive(Debug, Args)]
struct TablesArgs {
    archive: PathBuf,

    /// Table to restore; repeatable. Defaults to every critical table.
    #[arg(long = "table")]
    tables: Vec<String>,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config = cli.common.load_config()?;
    init_logging("bchain-restore", &config)?;
    let service = RestoreService::new(config)?;

    match cli.command {
        Command::Full(args) => {
            let options =
                FullRestoreOptions { verify_hash: !args.no_verify, drop_existing: args.drop_existing };
            let result = service.full_restore(&args.archive, options);
            emit_json(&result)?;
            Ok(exit_code(result.success))
        }
        Command::Tables(args) => {
            let tables = (!args.tables.is_empty()).then_some(args.tables.as_slice());
            let result = service.restore_critical_tables(&args.archive, tables);
            emit_json(&result)?;
            Ok(exit_code(result.success && result.warnings.is_empty()))
        }
        Command::List => {
            emit_json(&service.list_available_backups()?)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
