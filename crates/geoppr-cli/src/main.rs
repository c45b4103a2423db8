//! geoppr - terminal front-end for GeoPPR infrastructure data.
//!
//! Prints the dashboard views (global counts, per-piste aggregates), forces
//! reloads, writes record updates back and reports cache status.

use std::io;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use geoppr_core::utils::{format_date, format_km, pad_right};
use geoppr_core::{
    ApiClient, Config, DataSnapshot, InfrastructureService, LoadState, PisteFilter, ResourceType,
};

/// How long a command waits for the dataset before giving up.
const LOAD_TIMEOUT_SECS: u64 = 300;

#[derive(Parser, Debug)]
#[command(name = "geoppr", version)]
#[command(about = "GeoPPR infrastructure data from the terminal")]
#[command(arg_required_else_help = true)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Command {
    /// Global counts per infrastructure type
    Stats,
    /// Per-piste aggregates, optionally filtered
    Pistes {
        #[arg(long)]
        commune: Option<String>,
        #[arg(long = "user")]
        utilisateur: Option<String>,
        #[arg(long = "prefix")]
        code_prefix: Option<String>,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// One piste as JSON
    Piste { code_piste: String },
    /// Drop every cache tier and reload
    Reload,
    /// Write fields back to one record
    Update {
        resource: ResourceType,
        fid: String,
        /// JSON object of the fields to change
        #[arg(value_parser = parse_fields)]
        fields: Map<String, Value>,
    },
    /// Record counts of every map layer (uncached)
    Map,
    /// Cache status
    Status,
    /// Clear every cache tier
    Clear,
}

fn parse_fields(raw: &str) -> Result<Map<String, Value>, String> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(fields)) => Ok(fields),
        Ok(_) => Err("fields must be a JSON object".to_string()),
        Err(e) => Err(format!("fields must be a JSON object: {}", e)),
    }
}

/// Initialize the tracing subscriber for logging
fn init_tracing() {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    init_tracing();

    let cli = Cli::parse();

    let config = Config::load()?;
    let service = InfrastructureService::from_config(&config)?;
    info!(
        api = %config.api_base_url(),
        strategy = service.durable().strategy().name(),
        "geoppr starting"
    );

    run(cli.command, &service).await
}

async fn run(command: Command, service: &InfrastructureService<ApiClient>) -> Result<()> {
    match command {
        Command::Stats => {
            let snapshot = load(service, false).await?;
            print_stats(&snapshot);
        }
        Command::Pistes {
            commune,
            utilisateur,
            code_prefix,
            json,
        } => {
            let filter = PisteFilter {
                commune,
                utilisateur,
                code_prefix,
            };
            let snapshot = load(service, false).await?;
            let pistes = snapshot.processed.filter_pistes(&filter);
            if json {
                println!("{}", serde_json::to_string_pretty(&pistes)?);
            } else {
                print_pistes(&pistes);
            }
        }
        Command::Piste { code_piste: code } => {
            let snapshot = load(service, false).await?;
            let piste = snapshot
                .processed
                .piste(&code)
                .with_context(|| format!("No piste with code {}", code))?;
            println!("{}", serde_json::to_string_pretty(piste)?);
        }
        Command::Reload => {
            let snapshot = load(service, true).await?;
            println!(
                "Reloaded {} records, {} pistes",
                snapshot.raw.total_records(),
                snapshot.processed.pistes_counts.len()
            );
        }
        Command::Update {
            resource,
            fid,
            fields,
        } => {
            let outcome = service.update_record(resource, &fid, &fields).await?;
            println!("Updated {} {}: {:?}", resource.display_name(), fid, outcome);
        }
        Command::Map => {
            let layers = service.load_map_data().await?;
            for resource in ResourceType::MAP {
                println!(
                    "{} {:>7}",
                    pad_right(resource.display_name(), 32),
                    layers.collection(resource).len()
                );
            }
        }
        Command::Status => {
            let status = service.cache_status().await;
            println!("Strategy:        {}", status.strategy);
            println!("Durable cache:   {}", if status.durable_available { "available" } else { "unavailable" });
            match (&status.stored_at, &status.age) {
                (Some(stored_at), Some(age)) => {
                    println!("Stored:          {} ({})", format_date(&stored_at.to_rfc3339()), age)
                }
                _ => println!("Stored:          nothing cached"),
            }
            if let Some(counts) = &status.counts {
                println!("Records:         {}", counts.total());
            }
            if let Some(loader) = &status.loading {
                println!("Loading:         {}", loader);
            }
        }
        Command::Clear => {
            service.clear_cache().await?;
            println!("Cache cleared");
        }
    }
    Ok(())
}

/// Fetch the dataset, drawing load progress on stderr.
async fn load(service: &InfrastructureService<ApiClient>, force: bool) -> Result<DataSnapshot> {
    let mut progress = service.subscribe_progress();
    let reporter = tokio::spawn(async move {
        while progress.changed().await.is_ok() {
            let current = *progress.borrow_and_update();
            match current.state {
                LoadState::Loading | LoadState::Aggregating | LoadState::Populating => {
                    eprint!("\rLoading... {:>3}%", current.percent)
                }
                LoadState::Idle if current.percent == 100 => eprintln!("\rLoading... 100%"),
                _ => {}
            }
        }
    });

    let timeout = Duration::from_secs(LOAD_TIMEOUT_SECS);
    let result = if force {
        tokio::time::timeout(timeout, service.reload())
            .await
            .map_err(|_| geoppr_core::LoadError::Timeout(timeout))
            .and_then(|r| r)
    } else {
        service.get_data_with_timeout(timeout).await
    };
    reporter.abort();

    let snapshot = result?;
    info!(source = ?snapshot.source, "Dataset ready");
    Ok(snapshot)
}

fn print_stats(snapshot: &DataSnapshot) {
    let stats = &snapshot.processed.global_stats;
    for (resource, count) in stats.iter() {
        println!("{} {:>7}", pad_right(resource.display_name(), 32), count);
    }
    println!("{} {:>7}", pad_right("Total", 32), stats.total());

    let totals = snapshot.processed.totals();
    println!();
    println!(
        "Chaussees linked to pistes: {} ({})",
        totals.chaussees.count,
        format_km(totals.chaussees.km)
    );
    println!(
        "Declared piste length:      {}",
        format_km(snapshot.processed.total_kilometrage())
    );
}

fn print_pistes(pistes: &[&geoppr_core::PisteAggregate]) {
    println!(
        "{} {} {} {:>10} {:>10} {:>12} {:>7}",
        pad_right("Code", 14),
        pad_right("Commune", 18),
        pad_right("Utilisateur", 20),
        "Km",
        "Chaussees",
        "Km chaussee",
        "Autres"
    );
    for piste in pistes {
        let others = piste.counts.total().saturating_sub(piste.counts.chaussees.count);
        println!(
            "{} {} {} {:>10} {:>10} {:>12} {:>7}",
            pad_right(&piste.code_piste, 14),
            pad_right(&piste.commune, 18),
            pad_right(&piste.utilisateur, 20),
            format_km(piste.kilometrage),
            piste.counts.chaussees.count,
            format_km(piste.counts.chaussees.km),
            others
        );
    }
    println!("{} pistes", pistes.len());
}
