use std::path::PathBuf;

use anyhow::Context;
use ccnwatch::config::AppConfig;
use ccnwatch::services::{presentation, reconciliation};
use mimalloc::MiMalloc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// M-MIMALLOC-APP: Use mimalloc as global allocator for improved performance.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "ccnwatch=debug".into()))
        .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
        .init();

    let batch_path: PathBuf = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .context("usage: ccnwatch <scan-batch.json>")?;

    let config = AppConfig::from_env().context("DATABASE_URL must be set")?;
    let batch = reconciliation::load_batch(&batch_path)
        .with_context(|| format!("loading {}", batch_path.display()))?;

    tracing::info!(
        task_id = batch.task_id,
        build_number = %batch.build_number,
        observations = batch.observations.len(),
        "Reconciling scan batch"
    );

    let pool = ccnwatch::db::create_pool(&config.database_url, config.database_max_connections).await?;
    ccnwatch::db::run_migrations(&pool).await?;

    let outcome =
        reconciliation::reconcile_and_store(&pool, &batch, &config.reconcile_options()).await?;
    let thresholds = config.risk_thresholds(batch.risk_thresholds);
    let risk = presentation::risk_breakdown(&outcome.defects, &thresholds);

    let report = serde_json::json!({
        "summary": outcome.summary,
        "risk_thresholds": thresholds,
        "active_by_risk": risk,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}
