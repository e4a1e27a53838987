//! Campaign reconciler entry point.
//!
//! Serves the funding workflow over a small Axum REST API and keeps the
//! off-chain store converged with the escrow ledger: a background indexer
//! applies ledger events, and a sweeper retries failed escrow deployments.

mod api;
mod config;
mod db;
mod errors;
mod events;
mod governance;
mod indexer;
mod ledger;
mod mock_ledger;
mod models;
mod reconcile;
mod rpc;
mod soroban;

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::{Config, LedgerMode};
use indexer::IndexerState;
use ledger::LedgerClient;
use mock_ledger::MockLedger;
use reconcile::{Reconciler, ReconcilerSettings};
use soroban::SorobanLedger;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging (RUST_LOG controls verbosity).
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Load optional .env file (ignored if missing).
    let _ = dotenvy::dotenv();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;

    // Set up the SQLite connection pool and run migrations.
    let pool = db::init_pool(&config.database_url).await?;

    let ledger: Option<Arc<dyn LedgerClient>> = match config.ledger_mode {
        LedgerMode::Soroban => {
            let http = Client::builder().timeout(Duration::from_secs(30)).build()?;
            info!("Ledger: Soroban contract {}", config.contract_id);
            Some(Arc::new(SorobanLedger::new(&config, http)))
        }
        LedgerMode::Mock => {
            warn!("Ledger: in-memory mock (fee {} bps); nothing is secured on-chain", config.mock_fee_bps);
            Some(Arc::new(MockLedger::new(config.mock_fee_bps)))
        }
        LedgerMode::None => {
            warn!("Ledger: none; every action is recorded off-chain only");
            None
        }
    };

    let reconciler = Reconciler::new(pool, ReconcilerSettings::from(&config));
    let shutdown = CancellationToken::new();
    let mut tasks = Vec::new();

    // ─── Background convergence ───────────────────────────
    if let Some(ledger) = &ledger {
        let indexer_state = Arc::new(IndexerState {
            reconciler: reconciler.clone(),
            ledger: ledger.clone(),
            config: config.clone(),
        });
        tasks.push(tokio::spawn(indexer::run(indexer_state, shutdown.clone())));
        tasks.push(tokio::spawn(indexer::run_deploy_sweeper(
            reconciler.clone(),
            ledger.clone(),
            Duration::from_secs(config.retry_interval_secs),
            shutdown.clone(),
        )));
    }

    // ─── REST API ─────────────────────────────────────────
    let app = api::router(Arc::new(api::ApiState { reconciler, ledger }));

    let addr = format!("0.0.0.0:{}", config.api_port);
    info!("API listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let token = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
            token.cancel();
        })
        .await?;

    shutdown.cancel();
    for task in tasks {
        let _ = task.await;
    }
    info!("Reconciler stopped");
    Ok(())
}
