#![cfg(feature = "cli")]
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{ArgAction, Parser, Subcommand};
use log::{info, LevelFilter};

use rsmediadrm::storage::{JsonFileStorage, PersistentInfo};

#[derive(Parser)]
#[command(name = "rsmediadrm", version, disable_version_flag = true, about = "rsmediadrm license store CLI")]
struct Cli {
    #[arg(short = 'v', long = "version", action = ArgAction::SetTrue)]
    version: bool,

    #[arg(short = 'd', long = "debug", action = ArgAction::SetTrue)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

/// CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// List the offline licenses of a JSON license store.
    List { store: PathBuf },
    /// Print one stored license record as JSON.
    Show {
        store: PathBuf,
        /// Exchange id, hex encoded.
        exchange_id: String,
    },
    /// Delete one stored license record.
    Remove {
        store: PathBuf,
        /// Exchange id, hex encoded.
        exchange_id: String,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::new().filter_level(level).init();

    info!("rsmediadrm version {}", env!("CARGO_PKG_VERSION"));

    if cli.version {
        return Ok(());
    }

    match cli.command {
        Some(Commands::List { store }) => run_list(&store),
        Some(Commands::Show { store, exchange_id }) => run_show(&store, &exchange_id),
        Some(Commands::Remove { store, exchange_id }) => run_remove(&store, &exchange_id),
        None => Ok(()),
    }
}

fn open_store(path: &Path) -> anyhow::Result<JsonFileStorage> {
    if !path.is_file() {
        anyhow::bail!("No license store at '{}'", path.display());
    }
    JsonFileStorage::open(path)
        .with_context(|| format!("Failed to open license store '{}'", path.display()))
}

fn parse_exchange_id(exchange_id: &str) -> anyhow::Result<Vec<u8>> {
    hex::decode(exchange_id.trim())
        .with_context(|| format!("Invalid exchange id '{}', expected hex", exchange_id))
}

fn run_list(store: &Path) -> anyhow::Result<()> {
    let storage = open_store(store)?;
    info!(
        "{} license(s), origin provisioned: {}",
        storage.records().len(),
        storage.is_provisioned()
    );
    for record in storage.records() {
        println!("{}", describe(&record));
    }
    Ok(())
}

fn run_show(store: &Path, exchange_id: &str) -> anyhow::Result<()> {
    let storage = open_store(store)?;
    let exchange_id = parse_exchange_id(exchange_id)?;
    let record = storage
        .get(&exchange_id)
        .with_context(|| format!("No license stored for {}", hex::encode(&exchange_id)))?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

fn run_remove(store: &Path, exchange_id: &str) -> anyhow::Result<()> {
    let storage = open_store(store)?;
    let exchange_id = parse_exchange_id(exchange_id)?;
    if !storage.remove(&exchange_id)? {
        anyhow::bail!("No license stored for {}", hex::encode(&exchange_id));
    }
    info!("Removed license {}", hex::encode(&exchange_id));
    Ok(())
}

fn describe(record: &PersistentInfo) -> String {
    format!(
        "{} {} {}",
        hex::encode(&record.exchange_id),
        hex::encode(&record.persistent_id),
        record.mime_type
    )
}
