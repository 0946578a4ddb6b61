//! Contribution Engine - operator tool
//!
//! Inspects a contribution store:
//!
//! ```text
//! ┌──────────┐    ┌──────────┐    ┌──────────┐    ┌──────────────────┐
//! │  Config  │───▶│ Logging  │───▶│  Store   │───▶│ Queue + pending  │
//! │  (YAML)  │    │(tracing) │    │(migrate) │    │  contributions   │
//! └──────────┘    └──────────┘    └──────────┘    └──────────────────┘
//! ```
//!
//! Driving contributions needs real executors and is left to the embedding
//! application.

use anyhow::{Context, Result, bail};
use serde_json::json;
use tracing::info;

use contribution_engine::config::AppConfig;
use contribution_engine::logging::init_logging;
use contribution_engine::store::{ContributionStore, PgContributionStore};

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

fn use_json_output() -> bool {
    std::env::args().any(|a| a == "--json")
}

#[tokio::main]
async fn main() -> Result<()> {
    let env = get_env();
    let config = AppConfig::load(&env).with_context(|| format!("loading config for {}", env))?;
    let _guard = init_logging(&config);

    let url = match std::env::var("DATABASE_URL").ok().or(config.postgres_url.clone()) {
        Some(url) => url,
        None => bail!("postgres_url is not configured and DATABASE_URL is not set"),
    };

    info!(env = %env, environment = ?config.environment, "Connecting to contribution store");
    let store = PgContributionStore::connect(&url)
        .await
        .context("connecting to PostgreSQL")?;
    store.migrate().await.context("migrating schema")?;

    let next_entry = store.get_first_contribution_queue().await?;
    let pending = store
        .get_not_completed_contributions(config.worker.batch_size)
        .await?;
    let reconcile_stamp = store.get_reconcile_stamp().await?;

    if use_json_output() {
        let report = json!({
            "reconcile_stamp": reconcile_stamp,
            "next_queue_entry": next_entry.as_ref().map(|e| json!({
                "id": e.id,
                "type": e.rewards_type.as_str(),
                "amount": e.amount.to_string(),
                "partial": e.partial,
                "publishers": e.publishers.len(),
            })),
            "pending": pending.iter().map(|c| json!({
                "contribution_id": c.contribution_id.to_string(),
                "type": c.rewards_type.as_str(),
                "amount": c.amount.to_string(),
                "contributed": c.contributed_total().to_string(),
                "step": c.step.as_str(),
                "retry_count": c.retry_count,
            })).collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Reconcile stamp: {}", reconcile_stamp);
    match &next_entry {
        Some(entry) => println!(
            "Next queue entry: #{} {} amount={} partial={} publishers={}",
            entry.id,
            entry.rewards_type,
            entry.amount,
            entry.partial,
            entry.publishers.len()
        ),
        None => println!("Contribution queue is empty"),
    }

    println!("Unfinished contributions: {}", pending.len());
    for contribution in &pending {
        println!("  {}", contribution);
    }

    Ok(())
}
