// Stamp Ledger CLI
//
// Mutating commands start the worker pool in-process and wait until every
// recalculation and sync they triggered has settled before exiting.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use stamp_ledger::db;
use stamp_ledger::export::export_stream;
use stamp_ledger::{
    ClaimInput, ConfigArgs, EntryFilter, EntryPatch, LedgerRuntime, LedgerStore, Owner, OwnerKind,
    Settings,
};
use std::fs::File;
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(name = "stamp-ledger")]
#[command(about = "Stamp duty ledger: cumulative totals per company/sector, mirrored to ERPNext")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    config: ConfigArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the database and schema
    Init,

    /// Manage companies and sectors
    Owner {
        #[command(subcommand)]
        command: OwnerCommands,
    },

    /// Record a new claim
    Create {
        #[arg(long)]
        kind: OwnerKind,

        /// Owner name (created if it does not exist)
        #[arg(long)]
        owner: String,

        #[arg(long)]
        value: Decimal,

        #[arg(long, default_value_t = 1)]
        copies: i64,

        #[arg(long)]
        rate: Option<Decimal>,

        #[arg(long)]
        exchange_rate: Option<Decimal>,

        #[arg(long)]
        invoice_date: Option<NaiveDate>,

        #[arg(long)]
        note: Option<String>,

        /// Backdate the entry (RFC 3339)
        #[arg(long)]
        recorded_at: Option<DateTime<Utc>>,
    },

    /// Change the inputs of a claim
    Update {
        id: i64,

        #[arg(long)]
        value: Option<Decimal>,

        #[arg(long)]
        copies: Option<i64>,

        #[arg(long)]
        rate: Option<Decimal>,

        #[arg(long)]
        exchange_rate: Option<Decimal>,

        #[arg(long, conflicts_with = "clear_invoice_date")]
        invoice_date: Option<NaiveDate>,

        #[arg(long)]
        clear_invoice_date: bool,

        #[arg(long)]
        note: Option<String>,
    },

    /// Delete a claim
    Delete { id: i64 },

    /// List the claims of a stream
    List {
        #[arg(long)]
        kind: OwnerKind,

        #[arg(long)]
        owner: Option<String>,
    },

    /// Recalculate cumulative totals (one owner, or every owner of the stream)
    Recalc {
        #[arg(long)]
        kind: OwnerKind,

        #[arg(long)]
        owner: Option<String>,
    },

    /// Totals, yearly series, per-owner breakdown and pension estimate
    Report {
        #[arg(long)]
        kind: OwnerKind,

        #[arg(long)]
        owner: Option<String>,

        #[arg(long)]
        from: Option<NaiveDate>,

        #[arg(long)]
        to: Option<NaiveDate>,

        /// Target year of the pension estimate (default: current year)
        #[arg(long)]
        year: Option<i32>,

        /// Retired engineers (overrides configuration)
        #[arg(long)]
        retired: Option<u32>,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Audit trail of one claim
    History {
        #[arg(long)]
        kind: OwnerKind,

        id: i64,
    },

    /// Export a stream to CSV
    Export {
        #[arg(long)]
        kind: OwnerKind,

        /// Output file (stdout if not specified)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
enum OwnerCommands {
    Add {
        #[arg(long)]
        kind: OwnerKind,

        #[arg(long)]
        name: String,
    },
    List {
        #[arg(long)]
        kind: OwnerKind,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    let cli = Cli::parse();
    let settings = cli.config.into_settings();

    match cli.command {
        Commands::Init => run_init(&settings),
        Commands::Export { kind, output } => run_export(&settings, kind, output.as_deref()),
        command => run_with_runtime(&settings, command).await,
    }
}

fn load_env() {
    // Missing .env is fine
    let _ = dotenv::dotenv();
}

fn init_tracing() {
    use tracing_subscriber::prelude::*;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stamp_ledger=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn run_init(settings: &Settings) -> Result<()> {
    println!("🗄️  Stamp Ledger - database setup");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    LedgerStore::open(&settings.database_path)
        .with_context(|| format!("Failed to open {}", settings.database_path.display()))?;

    println!("✓ Database ready at {} (WAL mode)", settings.database_path.display());
    Ok(())
}

fn run_export(settings: &Settings, kind: OwnerKind, output: Option<&Path>) -> Result<()> {
    let store = LedgerStore::open(&settings.database_path)
        .with_context(|| format!("Failed to open {}", settings.database_path.display()))?;

    let rows = match output {
        Some(path) => {
            let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
            export_stream(&store, kind, file)?
        }
        None => export_stream(&store, kind, std::io::stdout().lock())?,
    };

    eprintln!("✓ Exported {} {}", rows, kind.stream_name());
    Ok(())
}

fn find_owner(runtime: &LedgerRuntime, kind: OwnerKind, name: &str) -> Result<Owner> {
    runtime
        .store()
        .with_conn(|conn| db::find_owner_by_name(conn, kind, name))?
        .with_context(|| format!("No {} named {:?}", kind, name))
}

async fn run_with_runtime(settings: &Settings, command: Commands) -> Result<()> {
    let runtime = LedgerRuntime::from_settings(settings)?;
    let service = runtime.service();

    match command {
        Commands::Owner { command } => match command {
            OwnerCommands::Add { kind, name } => {
                let owner = service.get_or_create_owner(kind, &name)?;
                println!("✓ {} #{}: {}", kind, owner.id, owner.name);
            }
            OwnerCommands::List { kind } => {
                for owner in service.owners(kind)? {
                    println!("#{:<6} {}", owner.id, owner.name);
                }
            }
        },

        Commands::Create {
            kind,
            owner,
            value,
            copies,
            rate,
            exchange_rate,
            invoice_date,
            note,
            recorded_at,
        } => {
            let owner = service.get_or_create_owner(kind, &owner)?;

            let mut claim = ClaimInput::new(value, copies).recorded_by(settings.actor.clone());
            if let Some(rate) = rate {
                claim = claim.with_rate(rate);
            }
            if let Some(x) = exchange_rate {
                claim = claim.with_exchange_rate(x);
            }
            if let Some(date) = invoice_date {
                claim = claim.with_invoice_date(date);
            }
            if let Some(note) = note {
                claim = claim.with_note(note);
            }
            if let Some(at) = recorded_at {
                claim = claim.backdated(at);
            }

            let entry = service.create_entry(owner.id, claim)?;
            runtime.wait_idle().await;

            let settled = service.get_entry(entry.id)?;
            println!("✓ Entry #{} for {}", settled.id, owner.name);
            println!("  own duty:      {}", settled.own_duty);
            println!("  past total:    {}", settled.past_total);
            println!("  running total: {}", settled.running_total);
        }

        Commands::Update {
            id,
            value,
            copies,
            rate,
            exchange_rate,
            invoice_date,
            clear_invoice_date,
            note,
        } => {
            let patch = EntryPatch {
                claim_value: value,
                copies,
                rate,
                exchange_rate,
                invoice_date: if clear_invoice_date {
                    Some(None)
                } else {
                    invoice_date.map(Some)
                },
                note: note.map(|n| if n.is_empty() { None } else { Some(n) }),
            };
            if patch.is_empty() {
                bail!("Nothing to update");
            }

            service.update_entry(id, patch, &settings.actor)?;
            runtime.wait_idle().await;

            let settled = service.get_entry(id)?;
            println!("✓ Entry #{} updated (version {})", id, settled.version);
            println!("  own duty:      {}", settled.own_duty);
            println!("  running total: {}", settled.running_total);
        }

        Commands::Delete { id } => {
            service.delete_entry(id, &settings.actor)?;
            runtime.wait_idle().await;
            println!("✓ Entry #{} deleted", id);
        }

        Commands::List { kind, owner } => {
            let mut filter = EntryFilter::stream(kind);
            if let Some(name) = owner {
                filter = filter.owner(find_owner(&runtime, kind, &name)?.id);
            }

            println!(
                "{:>6}  {:>8}  {:<10}  {:>14}  {:>14}  {:>14}",
                "id", "owner", "date", "own duty", "past", "running"
            );
            for entry in runtime.reporter().entries(&filter)? {
                println!(
                    "{:>6}  {:>8}  {:<10}  {:>14}  {:>14}  {:>14}",
                    entry.id,
                    entry.owner_id,
                    entry.reporting_date(),
                    entry.own_duty,
                    entry.past_total,
                    entry.running_total
                );
            }
        }

        Commands::Recalc { kind, owner } => {
            let count = match owner {
                Some(name) => {
                    let owner = find_owner(&runtime, kind, &name)?;
                    service.request_recalculation(kind, owner.id)?;
                    1
                }
                None => runtime.request_recalculation_all(kind)?,
            };
            runtime.wait_idle().await;
            println!("✓ Recalculated {} {} owner(s)", count, kind);
        }

        Commands::Report {
            kind,
            owner,
            from,
            to,
            year,
            retired,
            json,
        } => {
            let mut filter = EntryFilter::stream(kind).between(from, to);
            if let Some(name) = owner {
                filter = filter.owner(find_owner(&runtime, kind, &name)?.id);
            }

            let reporter = runtime.reporter();
            let year = year.unwrap_or_else(|| Utc::now().year());
            let retired = retired.unwrap_or(settings.retired_engineers);

            let total = reporter.total_amount(&filter)?;
            let series = reporter.yearly_series(&filter)?;
            let by_owner = reporter.grouped_by_owner(&filter)?;
            let pension = reporter.pension_estimate(&filter, retired, year)?;
            let facets = reporter.filter_facets(&filter)?;

            if json {
                let report = serde_json::json!({
                    "filter": filter,
                    "total": total,
                    "owners": reporter.owner_count(&filter)?,
                    "yearly": series,
                    "by_owner": by_owner,
                    "pension": { "year": year, "retired": retired, "monthly": pension },
                    "facets": facets,
                });
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("📊 {} report", kind.stream_name());
                println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
                println!("Total duty: {}", total);
                println!("Owners:     {}", by_owner.len());
                println!("\nYearly:");
                for point in &series {
                    println!("  {}  {:>14}  {:>14}", point.year, point.total, point.cumulative);
                }
                println!("\nBy owner:");
                for group in &by_owner {
                    let copies = reporter.copies_for_owner(&filter, group.owner_id)?;
                    println!(
                        "  {:<30} {:>14}  ({} entries, {} copies)",
                        group.owner_name, group.total, group.entries, copies
                    );
                }
                println!("\nPension estimate {} ({} retired): {}", year, retired, pension);
            }
        }

        Commands::History { kind, id } => {
            let events = service.history(kind, id)?;
            if events.is_empty() {
                println!("No events for {} entry #{}", kind, id);
            }
            for event in events {
                println!(
                    "{}  {:<20} {:<12} {}",
                    event.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    event.event_type,
                    event.actor,
                    event.data
                );
            }
        }

        Commands::Init | Commands::Export { .. } => bail!("command does not use the worker pool"),
    }

    runtime.shutdown().await;
    Ok(())
}
