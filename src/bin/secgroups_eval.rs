//! Secure group eligibility runner
//!
//! Runs the eligibility engine once against a YAML fixture or a Postgres
//! database and prints the batch report.
//!
//! Usage:
//!   cargo run --features cli --bin secgroups_eval -- --fixture groups.yaml all
//!   cargo run --features cli,database --bin secgroups_eval -- group 4 --json
//!   cargo run --features cli --bin secgroups_eval -- --fixture groups.yaml show 4 1001

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing_subscriber::EnvFilter;

use secure_groups::api::MembershipStatus;
use secure_groups::eligibility::{BatchOrchestrator, BatchReport, RunContext};
use secure_groups::store::Stores;
use secure_groups::store_memory::MemoryStore;
use secure_groups::EngineConfig;

/// Evaluate secure group memberships
#[derive(Parser, Debug)]
#[command(name = "secgroups_eval")]
#[command(about = "Run secure group eligibility evaluation")]
struct Args {
    /// YAML fixture to evaluate against an in-memory store
    #[arg(long, short = 'f', global = true)]
    fixture: Option<PathBuf>,

    /// Postgres connection string (requires the `database` feature)
    #[arg(long, env = "DATABASE_URL", global = true)]
    database_url: Option<String>,

    /// Actor recorded on log entries
    #[arg(long, default_value = "secgroups_eval", global = true)]
    actor: String,

    /// Print the report as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Every enabled group against every user
    All,
    /// One group against every user
    Group { group_id: i64 },
    /// Every enabled group against one user
    User { user_id: i64 },
    /// Show the stored membership and evidence for one pair
    Show { group_id: i64, user_id: i64 },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,secure_groups=debug".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = EngineConfig::from_env()?;
    let stores = open_stores(&args).await?;

    let engine = BatchOrchestrator::new(stores.clone(), config);
    let ctx = RunContext::new(args.actor.clone());
    let report = match args.command {
        Command::All => engine.evaluate_all(&ctx).await?,
        Command::Group { group_id } => engine.evaluate_group(group_id, &ctx).await?,
        Command::User { user_id } => engine.evaluate_user(user_id, &ctx).await?,
        Command::Show { group_id, user_id } => {
            return show(&stores, group_id, user_id, args.json).await
        }
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_summary(&report);
    }

    if report.has_failures() {
        std::process::exit(2);
    }
    Ok(())
}

async fn open_stores(args: &Args) -> Result<Stores> {
    if let Some(path) = &args.fixture {
        let store = MemoryStore::load_fixture(path)
            .await
            .with_context(|| format!("load fixture {}", path.display()))?;
        return Ok(Stores::from_backend(Arc::new(store)));
    }

    match &args.database_url {
        Some(url) => open_database(url).await,
        None => bail!("either --fixture or --database-url / DATABASE_URL is required"),
    }
}

#[cfg(feature = "database")]
async fn open_database(url: &str) -> Result<Stores> {
    use secure_groups::database::{DatabaseConfig, DatabaseManager};

    let manager = DatabaseManager::new(DatabaseConfig::with_url(url)).await?;
    manager.verify_schema().await?;
    Ok(Stores::from_backend(Arc::new(manager.secure_group_store())))
}

#[cfg(not(feature = "database"))]
async fn open_database(_url: &str) -> Result<Stores> {
    bail!("built without the `database` feature; use --fixture")
}

async fn show(stores: &Stores, group_id: i64, user_id: i64, json: bool) -> Result<()> {
    let Some(membership) = stores.memberships.get_membership(group_id, user_id).await? else {
        println!("No membership recorded for group {group_id}, user {user_id}");
        return Ok(());
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&membership)?);
        return Ok(());
    }

    println!(
        "{} group {} user {}: {} ({})",
        "Membership".bold(),
        group_id,
        user_id,
        paint(membership.status),
        membership.source.as_str()
    );
    println!("  Reason:  {}", membership.reason);
    if let Some(expires) = membership.grace_expires_at {
        println!("  Grace until: {expires}");
    }
    println!("  Updated: {}", membership.updated_at);
    for evidence in &membership.evidence {
        let mark = if evidence.pass { "PASS".green() } else { "FAIL".red() };
        println!("  [{}] #{} {}: {}", mark, evidence.filter_id, evidence.filter_type, evidence.message);
    }
    Ok(())
}

fn paint(status: MembershipStatus) -> colored::ColoredString {
    match status {
        MembershipStatus::In => status.as_str().green().bold(),
        MembershipStatus::Grace => status.as_str().yellow().bold(),
        MembershipStatus::Out => status.as_str().red().bold(),
    }
}

fn print_summary(report: &BatchReport) {
    println!("{} {}", "Run:".bold(), report.run_id);
    println!("  Pairs processed:   {}", report.pairs_processed);
    println!("  Succeeded:         {}", report.succeeded.to_string().green());
    println!(
        "  Failed:            {}",
        if report.failed > 0 {
            report.failed.to_string().red()
        } else {
            report.failed.to_string().normal()
        }
    );
    println!("  Status changes:    {}", report.status_changes);
    println!("  Overrides applied: {}", report.overrides_applied);
    println!(
        "  Duration:          {} ms",
        (report.finished_at - report.started_at).num_milliseconds()
    );

    for failure in &report.failures {
        println!(
            "  {} group {} user {}: {}",
            "ERROR:".red().bold(),
            failure.group_id,
            failure.user_id,
            failure.error
        );
    }
}
