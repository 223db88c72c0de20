//! POS Transaction Sync — Entry Point
//!
//! Loads configuration, connects to the store, and executes one pipeline
//! run: extract new transactions from the upstream API, normalize and
//! load them into the primary schema, then refresh the anonymized demo
//! mirror. Scheduling is the orchestrator's job; this binary is a single
//! invocation.

mod anonymize;
mod api;
mod config;
mod db;
mod error;
mod extract;
mod load;
mod logging;
mod model;
mod pipeline;
mod sync_state;
mod transform;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::db::pool;
use crate::pipeline::Pipeline;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file (ignore if missing)
    let _ = dotenvy::dotenv();

    let config = Config::load()?;
    logging::structured::init_logging(&config.logging);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        api_base = %config.api.base_url,
        page_size = config.sync.page_size,
        "pos-sync starting"
    );

    if config.database.url.is_empty() {
        anyhow::bail!("DATABASE_URL is not set");
    }
    if config.anonymize.key.is_empty() {
        anyhow::bail!("ANONYMIZE_KEY is not set");
    }

    let db_pool = pool::create_pool(&config.database.url).await?;
    pool::run_migrations(&db_pool).await?;

    // Cooperative cancellation: checked between aggregates, never inside
    // a partially-committed transaction.
    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, finishing current aggregate");
                cancel.store(true, Ordering::Relaxed);
            }
        });
    }

    let pipeline = Pipeline::new(config, db_pool);
    match pipeline.run(&cancel).await {
        Ok(summary) => {
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        Err(failure) => {
            error!(error = %failure.error, "run failed");
            // Partial summary still goes to the caller
            println!("{}", serde_json::to_string_pretty(&failure.summary)?);
            Err(failure.error.into())
        }
    }
}
