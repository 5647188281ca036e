//! Verification Consistency Audit CLI
//!
//! Runs the consistency monitor against the Postgres session store, either
//! once (`--once`) or as a loop until Ctrl-C.
//!
//! Usage:
//!   cargo run --features database,cli --bin idv_audit -- --once
//!   cargo run --features database,cli --bin idv_audit -- --interval-secs 60
//!   cargo run --features database,cli --bin idv_audit -- --session <uuid>

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use sqlx::PgPool;
use tokio::sync::watch;
use uuid::Uuid;

use ob_idv::{ConsistencyMonitor, IdvConfig, PgSessionStore, VerificationStateManager};

/// Audit recently decided verification sessions and repair status drift
#[derive(Parser, Debug)]
#[command(name = "idv_audit")]
#[command(about = "Audit verification sessions and repair inconsistent statuses")]
struct Args {
    /// Run a single audit pass and exit
    #[arg(long)]
    once: bool,

    /// Recalculate one session instead of auditing a batch
    #[arg(long)]
    session: Option<Uuid>,

    /// Override the interval between passes
    #[arg(long)]
    interval_secs: Option<u64>,

    /// Postgres connection string
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Print reports as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut config = IdvConfig::from_env().context("loading configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if let Some(secs) = args.interval_secs {
        config.monitor.interval = Duration::from_secs(secs.max(1));
    }

    let database_url = args
        .database_url
        .or_else(|| config.database_url.clone())
        .context("DATABASE_URL must be set")?;
    let pool = PgPool::connect(&database_url)
        .await
        .context("connecting to Postgres")?;

    let store = PgSessionStore::new(pool);
    store
        .verify_schema()
        .await
        .context("session table missing; run the migrations first")?;

    let manager = Arc::new(
        VerificationStateManager::new(
            Arc::new(store),
            Arc::new(config.threshold_provider()),
        )
        .with_max_cas_attempts(config.max_cas_attempts),
    );

    if let Some(session_id) = args.session {
        let recalculation = manager.recalculate_consistent_scores(session_id).await?;
        print_json_or(&recalculation, args.json, |r| {
            format!(
                "{}: stored {} derived {} -> {:?}",
                r.session_id, r.stored_status, r.derived_status, r.outcome
            )
        })?;
        return Ok(());
    }

    let monitor = Arc::new(ConsistencyMonitor::new(manager, config.monitor.clone()));

    if args.once {
        let report = monitor.audit_once().await?;
        print_json_or(&report, args.json, |r| {
            format!(
                "audited {} consistent {} repaired {} failed {} skipped {} (rate {:.1}%)",
                r.audited,
                r.consistent,
                r.repaired,
                r.repair_failed,
                r.skipped,
                r.rate() * 100.0
            )
        })?;
        if monitor.is_degraded().await {
            std::process::exit(2);
        }
        return Ok(());
    }

    let (tx, rx) = watch::channel(false);
    let runner = {
        let monitor = monitor.clone();
        tokio::spawn(async move { monitor.run(rx).await })
    };

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    tracing::info!("shutdown requested");
    tx.send(true).ok();
    runner.await.context("monitor task panicked")?;

    let stats = monitor.stats().await;
    print_json_or(&stats, args.json, |s| {
        format!(
            "{} passes, {} audited, {} repaired, rate {:.1}%",
            s.passes,
            s.audited,
            s.repaired,
            s.rate() * 100.0
        )
    })?;
    Ok(())
}

fn print_json_or<T: serde::Serialize>(
    value: &T,
    json: bool,
    text: impl Fn(&T) -> String,
) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        println!("{}", text(value));
    }
    Ok(())
}
