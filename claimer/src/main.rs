//! Ledger maintenance CLI for the claim engine.
//!
//! Operates on `<data_dir>/<provider>.json` ledgers only; it never drives a
//! browser. Claim runs are started by embedding [`claimer::run::RunCoordinator`]
//! with a site-specific page driver.

use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};

use claimer::exit_codes;
use claimer::io::config::{DEFAULT_CONFIG_PATH, load_config};
use claimer::io::ledger::Ledger;
use claimer::logging;
use claimer::migrate::{Migration, migrate_file};
use claimer::status::{render, summarize};

#[derive(Parser)]
#[command(name = "claimer", version, about = "Free-offer claim ledger maintenance")]
struct Cli {
    /// Config file (TOML). Missing file means defaults.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Per-user counts by status and the list of failed offers.
    Status { provider: String },
    /// Reset one record to discovered so the next run retries it.
    Reset {
        provider: String,
        user: String,
        offer_id: String,
    },
    /// Convert legacy ledgers (single `time` field) in place.
    Migrate {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Load and validate the config.
    CheckConfig,
}

fn main() {
    logging::init();
    match run() {
        Ok(output) => print!("{output}"),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::FAILURE);
        }
    }
}

fn run() -> Result<String> {
    let cli = Cli::parse();
    match cli.command {
        Command::Status { provider } => cmd_status(&cli.config, &provider),
        Command::Reset {
            provider,
            user,
            offer_id,
        } => cmd_reset(&cli.config, &provider, &user, &offer_id),
        Command::Migrate { files } => cmd_migrate(&files),
        Command::CheckConfig => cmd_check_config(&cli.config),
    }
}

fn cmd_status(config_path: &Path, provider: &str) -> Result<String> {
    let config = load_config(config_path)?;
    let ledger = Ledger::open(&config.ledger_path(provider))?;
    Ok(render(provider, &summarize(ledger.data())))
}

fn cmd_reset(config_path: &Path, provider: &str, user: &str, offer_id: &str) -> Result<String> {
    let config = load_config(config_path)?;
    let mut ledger = Ledger::open(&config.ledger_path(provider))?;
    let previous = ledger.reset(user, offer_id, Utc::now())?;
    ledger.commit()?;
    Ok(match previous {
        Some(status) => format!("{provider}/{user}/{offer_id}: {status} -> discovered\n"),
        None => format!("{provider}/{user}/{offer_id}: already discovered\n"),
    })
}

fn cmd_migrate(files: &[PathBuf]) -> Result<String> {
    let mut out = String::new();
    for file in files {
        if !file.exists() {
            bail!("{} does not exist", file.display());
        }
        match migrate_file(file)? {
            Migration::Current => out.push_str(&format!("{}: already current\n", file.display())),
            Migration::Converted { records, backup } => out.push_str(&format!(
                "{}: migrated {records} records (backup {})\n",
                file.display(),
                backup.display()
            )),
        }
    }
    Ok(out)
}

fn cmd_check_config(config_path: &Path) -> Result<String> {
    let config = load_config(config_path)?;
    let names: Vec<&str> = config.providers.keys().map(String::as_str).collect();
    Ok(format!(
        "{}: ok ({} providers: {})\n",
        config_path.display(),
        names.len(),
        names.join(", ")
    ))
}
