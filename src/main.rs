use std::process;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::json;

use waterfall_lib::cache::{CacheHandle, SqliteCache, StoreStats, QUERY_STORE};
use waterfall_lib::config::Settings;
use waterfall_lib::instance::InstanceOutcome;
use waterfall_lib::model::{Instance, InstanceView};
use waterfall_lib::state::{LoadStatus, Snapshot};
use waterfall_lib::Workspace;

/// Exit code when a table loaded but some aggregates failed.
const PARTIAL_EXIT_CODE: i32 = 2;

#[derive(Debug, Parser)]
#[command(name = "waterfall", about = "Waterfall cohort workbench core", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Query cache maintenance.
    #[command(subcommand)]
    Cache(CacheCommand),
    /// Load a table and print its cohort view.
    Inspect(InspectArgs),
}

#[derive(Debug, Subcommand)]
enum CacheCommand {
    /// Entry counts and sizes per logical store.
    Stats {
        /// Emit JSON instead of the table view.
        #[arg(long)]
        json: bool,
    },
    /// Remove every entry of one logical store.
    Clear {
        /// Store to clear.
        #[arg(long, default_value = QUERY_STORE)]
        store: String,
    },
}

#[derive(Debug, Args)]
struct InspectArgs {
    #[arg(long)]
    server: String,
    #[arg(long)]
    database: String,
    /// Table name, optionally schema-qualified (`dbo.Claims`).
    #[arg(long)]
    table: String,
    #[arg(long, default_value = "")]
    user: String,
    #[arg(long, default_value = "", hide_default_value = true)]
    password: String,
    /// Emit the view as JSON instead of tables.
    #[arg(long)]
    json: bool,
}

fn main() {
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => process::exit(code),
        Err(err) => {
            eprintln!("Error: {err:#}");
            process::exit(1);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    let settings = Settings::load()?;
    let _log_guard = match waterfall_lib::init_logging(&settings.log_dir()) {
        Ok(guard) => Some(guard),
        Err(err) => {
            eprintln!("Warning: file logging disabled: {err:#}");
            None
        }
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("start async runtime")?;
    runtime.block_on(async move {
        match cli.command {
            Commands::Cache(command) => handle_cache(&settings, command).await,
            Commands::Inspect(args) => handle_inspect(&settings, args).await,
        }
    })
}

async fn handle_cache(settings: &Settings, command: CacheCommand) -> Result<i32> {
    let cache = CacheHandle::sqlite(SqliteCache::open(settings.cache_path()));
    let result = match command {
        CacheCommand::Stats { json } => {
            let stats = cache.stats().await;
            if json {
                let payload = json!({
                    "path": settings.cache_path().display().to_string(),
                    "stores": stats,
                });
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else {
                print_stats(&settings.cache_path().display().to_string(), &stats);
            }
            Ok(0)
        }
        CacheCommand::Clear { store } => {
            cache.store(&store).clear().await;
            println!("Cleared cache store {store}.");
            Ok(0)
        }
    };
    cache.close().await;
    result
}

async fn handle_inspect(settings: &Settings, args: InspectArgs) -> Result<i32> {
    let workspace = Workspace::open(settings)?;
    let instance = Instance::new(args.server, args.database, args.table)
        .with_credentials(args.user, args.password);
    let key = instance.key();
    let outcome = workspace.select_table(instance).await;

    let mut projects = Vec::new();
    if let Some(user_id) = &settings.user_id {
        match workspace.projects().init_projects(user_id).await {
            Ok(_) => {
                projects = workspace
                    .projects()
                    .projects_for(&key)
                    .into_iter()
                    .map(|project| project.name)
                    .collect();
            }
            Err(err) => eprintln!("Warning: projects unavailable: {err}"),
        }
    }
    workspace.shutdown().await;

    let snapshot = match outcome {
        InstanceOutcome::Committed(snapshot) => snapshot,
        InstanceOutcome::Superseded => anyhow::bail!("table load was superseded"),
    };
    if args.json {
        let payload = json!({
            "status": snapshot.status,
            "view": snapshot.view,
            "projects": projects,
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        print_snapshot(&snapshot);
        if !projects.is_empty() {
            println!("\nProjects     : {}", projects.join(", "));
        }
    }
    Ok(match snapshot.status {
        LoadStatus::ReadyWithErrors(_) => PARTIAL_EXIT_CODE,
        _ => 0,
    })
}

fn print_stats(path: &str, stats: &[StoreStats]) {
    println!("Cache        : {path}");
    if stats.is_empty() {
        println!("Cache is empty.");
        return;
    }
    println!("{:<24} {:>10} {:>12}", "Store", "Entries", "Bytes");
    for entry in stats {
        println!("{:<24} {:>10} {:>12}", entry.store, entry.entries, entry.bytes);
    }
}

fn print_snapshot(snapshot: &Snapshot) {
    if let Some(instance) = &snapshot.instance {
        println!("Table        : {}", instance.key());
    }
    match &snapshot.status {
        LoadStatus::ReadyWithErrors(errors) => {
            println!("Status       : ready with {} error(s)", errors.len());
            for error in errors {
                println!("  - {} ({})", error.message(), error.code());
            }
        }
        LoadStatus::Ready => println!("Status       : ready"),
        LoadStatus::Loading => println!("Status       : loading"),
        LoadStatus::Unset => println!("Status       : unset"),
    }
    print_view(&snapshot.view);
}

fn print_view(view: &InstanceView) {
    println!("\nNumeric fields:");
    println!("{:<16} {:<7} {:>18}", "Field", "Type", "Total");
    for row in &view.numeric_table_data {
        println!(
            "{:<16} {:<7} {:>18.2}",
            row.field_name,
            format!("{:?}", row.kind),
            row.total
        );
    }

    println!("\nCohorts:");
    if view.waterfall_cohorts_table_data.is_empty() {
        println!("(no mapping keywords found)");
    } else {
        println!("{:<12} {:>8}  {:<5} {:<9}", "Cohort", "Groups", "Run", "Aggregate");
        for row in &view.waterfall_cohorts_table_data {
            println!(
                "{:<12} {:>8}  {:<5} {:<9}",
                row.waterfall_cohort_name, row.count, row.run, row.aggregate
            );
        }
    }

    println!("\nCohort values:");
    let labels: Vec<&str> = view
        .waterfall_cohort_list_data
        .iter()
        .map(|column| column.label.as_str())
        .collect();
    println!("{}", format_row(&labels));
    for row in view.pivot_rows() {
        let cells: Vec<&str> = row.iter().map(String::as_str).collect();
        println!("{}", format_row(&cells));
    }
}

fn format_row(cells: &[&str]) -> String {
    cells
        .iter()
        .map(|cell| format!("{cell:<20}"))
        .collect::<Vec<_>>()
        .join(" ")
        .trim_end()
        .to_string()
}
