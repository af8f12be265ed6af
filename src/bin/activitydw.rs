use std::io::BufRead;

use clap::{Parser, Subcommand};
use serde::Deserialize;

use activitydw::{Activity, ActivityDW, Database, DateRange, Period, QueryDescriptor};

#[derive(Parser)]
#[command(name = "activitydw", about = "Community activity metrics warehouse CLI")]
struct Cli {
    /// Database path (default: ~/.activitydw/activitydw.db)
    #[arg(long)]
    db: Option<String>,

    /// Increase logging verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load events or members from JSON Lines files
    Import {
        #[command(subcommand)]
        target: ImportTarget,
    },
    /// Run a query from a JSON descriptor
    Query {
        /// Descriptor as inline JSON
        #[arg(long, conflicts_with = "file")]
        json: Option<String>,
        /// Path to a descriptor JSON file
        #[arg(long)]
        file: Option<String>,
    },
    /// Period-over-period contributor leaderboard
    Leaderboard {
        /// Tenant id(s) to include
        #[arg(long = "tenant", required = true)]
        tenants: Vec<String>,
        /// Measure to rank by
        #[arg(long, default_value = "metric_contributor_contributions")]
        measure: String,
        /// Period (e.g. 2025-Q2, 2025-07, 30d); previous window is derived
        #[arg(long, conflicts_with_all = ["from", "to"])]
        period: Option<String>,
        /// Start date (YYYY-MM-DD)
        #[arg(long, requires = "to")]
        from: Option<String>,
        /// End date (YYYY-MM-DD)
        #[arg(long, requires = "from")]
        to: Option<String>,
    },
    /// Manage materialized rollups
    Rollup {
        #[command(subcommand)]
        action: RollupAction,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Show warehouse status
    Status,
}

#[derive(Subcommand)]
enum ImportTarget {
    /// Activity events, one JSON object per line
    Events {
        /// Input file ("-" for stdin)
        #[arg(value_name = "FILE")]
        file: String,
    },
    /// Member profiles, one JSON object per line
    Members {
        /// Input file ("-" for stdin)
        #[arg(value_name = "FILE")]
        file: String,
    },
}

#[derive(Subcommand)]
enum RollupAction {
    /// List rollup definitions
    List,
    /// Show refresh state per rollup
    Status,
    /// Refresh one rollup, or every rollup whose cadence has elapsed
    Refresh {
        #[arg(value_name = "ROLLUP_ID")]
        id: Option<String>,
    },
    /// Recompute one rollup from scratch
    Rebuild {
        #[arg(value_name = "ROLLUP_ID")]
        id: String,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Get { key: String },
    Set { key: String, value: String },
    List,
}

#[derive(Debug, Deserialize)]
struct MemberRecord {
    member_id: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    logo_url: Option<String>,
}

fn read_lines(path: &str) -> anyhow::Result<Vec<String>> {
    let reader: Box<dyn BufRead> = if path == "-" {
        Box::new(std::io::BufReader::new(std::io::stdin()))
    } else {
        Box::new(std::io::BufReader::new(std::fs::File::open(path)?))
    };
    let mut lines = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if !line.trim().is_empty() {
            lines.push(line);
        }
    }
    Ok(lines)
}

async fn handle_import(dw: &ActivityDW, target: ImportTarget) -> anyhow::Result<()> {
    match target {
        ImportTarget::Events { file } => {
            let mut events = Vec::new();
            for line in read_lines(&file)? {
                let event: Activity = serde_json::from_str(&line)?;
                events.push(event);
            }
            let n = dw.import_activities(events).await?;
            eprintln!("Imported {n} events");
        }
        ImportTarget::Members { file } => {
            let mut n = 0;
            for line in read_lines(&file)? {
                let m: MemberRecord = serde_json::from_str(&line)?;
                dw.upsert_member(&m.member_id, m.display_name.as_deref(), m.logo_url.as_deref())
                    .await?;
                n += 1;
            }
            eprintln!("Imported {n} members");
        }
    }
    Ok(())
}

async fn handle_rollup(dw: &ActivityDW, action: RollupAction) -> anyhow::Result<()> {
    match action {
        RollupAction::List => {
            println!("{}", serde_json::to_string_pretty(dw.rollups().defs())?);
        }
        RollupAction::Status => {
            println!("{}", serde_json::to_string_pretty(&dw.rollups().status())?);
        }
        RollupAction::Refresh { id: Some(id) } => {
            dw.refresh_rollup(&id).await?;
            eprintln!("Refreshed rollup {id}");
        }
        RollupAction::Refresh { id: None } => {
            let refreshed = dw.refresh_due_rollups().await?;
            if refreshed.is_empty() {
                eprintln!("No rollups due");
            } else {
                eprintln!("Refreshed: {}", refreshed.join(", "));
            }
        }
        RollupAction::Rebuild { id } => {
            dw.rebuild_rollup(&id).await?;
            eprintln!("Rebuilt rollup {id}");
        }
    }
    Ok(())
}

async fn handle_config(dw: &ActivityDW, action: ConfigAction) -> anyhow::Result<()> {
    match action {
        ConfigAction::Get { key } => match dw.config_get(&key).await? {
            Some(value) => println!("{value}"),
            None => eprintln!("(not set)"),
        },
        ConfigAction::Set { key, value } => {
            dw.config_set(&key, &value).await?;
        }
        ConfigAction::List => {
            for (key, value) in dw.config_list().await? {
                println!("{key}={value}");
            }
        }
    }
    Ok(())
}

async fn print_status(dw: &ActivityDW) -> anyhow::Result<()> {
    let (activities, members) = dw
        .db()
        .reader()
        .call(|conn| activitydw::storage::repository::warehouse_counts(conn))
        .await?;
    println!("Activities: {activities}");
    println!("Members:    {members}");
    println!("Rollups:");
    for report in dw.rollups().status() {
        let state = if report.rebuilding {
            "rebuilding"
        } else if report.needs_rebuild {
            "needs rebuild"
        } else if report.stale {
            "stale"
        } else {
            "ok"
        };
        let last = report
            .last_refresh
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".to_string());
        println!(
            "  {}: {} ({} partitions, last refresh {})",
            report.id, state, report.partitions, last
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let db = match &cli.db {
        Some(path) => Database::open_at(path).await?,
        None => Database::open().await?,
    };
    let dw = ActivityDW::open(db).await?;

    match cli.command {
        Commands::Import { target } => handle_import(&dw, target).await?,
        Commands::Query { json, file } => {
            let text = match (json, file) {
                (Some(json), _) => json,
                (None, Some(file)) => std::fs::read_to_string(file)?,
                (None, None) => anyhow::bail!("provide a descriptor via --json or --file"),
            };
            let descriptor: QueryDescriptor = serde_json::from_str(&text)?;
            let rows = dw.query(&descriptor).await?;
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        Commands::Leaderboard {
            tenants,
            measure,
            period,
            from,
            to,
        } => {
            let current = match (period, from, to) {
                (Some(p), _, _) => Period::parse(&p)?.date_range(),
                (None, Some(from), Some(to)) => DateRange::parse(&from, &to)?,
                _ => anyhow::bail!("provide --period or --from/--to"),
            };
            let previous = current.previous();
            let board = dw.leaderboard(&tenants, current, previous, &measure).await?;
            println!("{}", serde_json::to_string_pretty(&board)?);
        }
        Commands::Rollup { action } => handle_rollup(&dw, action).await?,
        Commands::Config { action } => handle_config(&dw, action).await?,
        Commands::Status => print_status(&dw).await?,
    }

    Ok(())
}
