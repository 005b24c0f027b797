//! # certflow-admin
//!
//! Operator commands for the certflow backends.
//!
//! - `certflow-admin migrate` - apply database migrations
//! - `certflow-admin recover --older-than-secs 300` - settle sagas interrupted by a crash
//! - `certflow-admin unresolved --limit 50` - list partial commits
//! - `certflow-admin reconcile <transaction-id>` - compensate a partial commit
//! - `certflow-admin resolve <transaction-id> --by <user-id>` - close a saga by hand
//! - `certflow-admin stats` - aggregate application counts
//! - `certflow-admin health` - probe every backend
//!
//! Configuration comes from the environment (and `.env`), see [`Config`].

use anyhow::{Context, Result};
use certflow_core::ids::{TransactionId, UserId};
use certflow_core::store::{RelationalStore, StatsFilter};
use certflow_runtime::cache::STATS_PREFIX;
use certflow_runtime::{AppContext, Config, MetricsServer};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// certflow operator tool
#[derive(Parser)]
#[command(name = "certflow-admin")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Print Prometheus metrics after the command
    #[arg(long, global = true)]
    print_metrics: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending migrations to both databases
    Migrate,

    /// Settle sagas left in `started` or `committing`
    Recover {
        /// Only sagas last updated at least this long ago
        #[arg(long, default_value_t = 300)]
        older_than_secs: i64,
    },

    /// List partial commits awaiting reconciliation
    Unresolved {
        /// Maximum number of sagas listed
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },

    /// Compensate a partial commit
    Reconcile {
        /// Saga transaction id
        transaction_id: TransactionId,
    },

    /// Mark a saga as resolved by hand
    Resolve {
        /// Saga transaction id
        transaction_id: TransactionId,

        /// Operator user id
        #[arg(long)]
        by: UserId,

        /// Resolution notes
        #[arg(long)]
        notes: Option<String>,
    },

    /// Print aggregate application counts
    Stats,

    /// Probe every backend
    Health,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env().context("Invalid configuration")?;

    let mut metrics = MetricsServer::new(config.metrics_addr);
    if cli.print_metrics {
        metrics.start().context("Failed to install metrics recorder")?;
    }

    let context = AppContext::connect(config)
        .await
        .context("Failed to connect to the databases")?;

    let outcome = run(&context, cli.command).await;
    context.shutdown().await;

    if let Some(rendered) = metrics.render() {
        println!("{rendered}");
    }
    outcome
}

async fn run(context: &AppContext, command: Commands) -> Result<()> {
    let coordinator = context.coordinator();

    match command {
        Commands::Migrate => {
            context.migrate().await.context("Migration failed")?;
            println!("migrations applied");
        }
        Commands::Recover { older_than_secs } => {
            let report = coordinator
                .recover_interrupted(chrono::Duration::seconds(older_than_secs))
                .await
                .context("Recovery failed")?;
            println!(
                "rolled back {} interrupted sagas, escalated {} to partial_commit",
                report.rolled_back.len(),
                report.escalated.len()
            );
            for transaction_id in &report.escalated {
                println!("needs reconciliation: {transaction_id}");
            }
        }
        Commands::Unresolved { limit } => {
            let entries = coordinator
                .unresolved(limit)
                .await
                .context("Failed to read the saga log")?;
            if entries.is_empty() {
                println!("no partial commits");
            }
            for entry in entries {
                println!(
                    "{}  {}  {}  {} operations  {}",
                    entry.transaction_id,
                    entry.updated_at.to_rfc3339(),
                    entry.label,
                    entry.operations.len(),
                    entry.error.as_deref().unwrap_or("-")
                );
            }
        }
        Commands::Reconcile { transaction_id } => {
            let receipt = coordinator
                .reconcile(transaction_id)
                .await
                .with_context(|| format!("Failed to reconcile {transaction_id}"))?;
            let cache = context.cache_layer();
            cache.invalidate_prefix("application:").await;
            cache.invalidate_prefix(STATS_PREFIX).await;
            println!(
                "compensated {} operations of {}",
                receipt.operations, receipt.transaction_id
            );
        }
        Commands::Resolve {
            transaction_id,
            by,
            notes,
        } => {
            coordinator
                .mark_resolved(transaction_id, by, notes)
                .await
                .with_context(|| format!("Failed to resolve {transaction_id}"))?;
            println!("{transaction_id} resolved");
        }
        Commands::Stats => {
            let stats = coordinator
                .relational()
                .stats(&StatsFilter::default())
                .await
                .context("Failed to read statistics")?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Commands::Health => {
            let report = context.health().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.status.is_serving() {
                anyhow::bail!("one or more backends are unhealthy");
            }
        }
    }

    Ok(())
}
