//! Background tasks that keep the store converged with the ledger.
//!
//! - [`run`] polls escrow events, persists them to the audit log and applies
//!   each one through [`Reconciler::apply_event`].
//! - [`run_deploy_sweeper`] periodically re-attempts escrow deployments that
//!   failed or timed out.
//!
//! Both loops stop when the shared [`CancellationToken`] is cancelled.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::db;
use crate::errors::{ReconcilerError, Result};
use crate::events::EventEnvelope;
use crate::ledger::{EventCursor, LedgerClient};
use crate::models::now;
use crate::reconcile::{Applied, Reconciler};

pub struct IndexerState {
    pub reconciler: Reconciler,
    pub ledger: Arc<dyn LedgerClient>,
    pub config: Config,
}

/// Run the event loop until `shutdown` is cancelled.
pub async fn run(state: Arc<IndexerState>, shutdown: CancellationToken) {
    let mut cursor = resume_cursor(&state).await;
    let mut deferred = Vec::new();

    info!("Indexer resuming from ledger {}", cursor.start_ledger);

    loop {
        match poll_once(&state, &cursor, &mut deferred).await {
            Ok(next) => cursor = next,
            Err(e) => error!("Indexer poll error: {e}"),
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(Duration::from_secs(state.config.poll_interval_secs)) => {}
        }
    }
    info!("Indexer stopped");
}

/// Load the persisted cursor; fall back to the configured start ledger.
async fn resume_cursor(state: &IndexerState) -> EventCursor {
    let pool = state.reconciler.pool();
    let last_ledger = db::get_last_ledger(pool).await.unwrap_or(0);
    EventCursor {
        start_ledger: if last_ledger > 0 {
            last_ledger as u32
        } else {
            state.config.start_ledger
        },
        cursor: db::get_cursor_string(pool).await.unwrap_or(None),
    }
}

/// Fetch one page of events, record and apply them, and persist the cursor.
///
/// Events that cannot be applied yet, or whose application hit a transient
/// store error, are carried in `deferred` and retried on the next poll.
/// While any are waiting, the persisted cursor stays at the oldest one's
/// ledger so a restart fetches it again.
async fn poll_once(
    state: &IndexerState,
    cursor: &EventCursor,
    deferred: &mut Vec<EventEnvelope>,
) -> Result<EventCursor> {
    let pool = state.reconciler.pool();
    let page = state
        .ledger
        .events(cursor, state.config.events_per_page)
        .await?;

    if !page.events.is_empty() {
        let inserted = db::insert_events(pool, &page.events, now()).await?;
        info!(
            "Polled {} events → {} new records stored",
            page.events.len(),
            inserted
        );
    }

    let mut queue = std::mem::take(deferred);
    queue.extend(page.events);
    for event in queue {
        match state.reconciler.apply_event(&event).await {
            Ok(Applied::Deferred) => deferred.push(event),
            Ok(_) => {}
            Err(ReconcilerError::Consistency(msg)) => {
                error!("Skipping event {}: {msg}", event.tx_hash);
            }
            Err(e) => {
                warn!("Could not apply event {}: {e}; will retry", event.tx_hash);
                deferred.push(event);
            }
        }
    }

    // Advance the ledger cursor:
    // - If there is a next_cursor string, keep paginating from it.
    // - Otherwise restart from the latest known ledger.
    let start_ledger = page
        .latest_ledger
        .map(|l| (l as u32).max(cursor.start_ledger))
        .unwrap_or(cursor.start_ledger);

    match deferred.iter().map(|e| e.ledger).min() {
        Some(oldest) => {
            let resume_at = oldest.min(start_ledger as i64);
            debug!("{} events deferred; persisting resume point {resume_at}", deferred.len());
            db::save_cursor(pool, resume_at, None).await?;
        }
        None => db::save_cursor(pool, start_ledger as i64, page.next_cursor.as_deref()).await?,
    }

    Ok(EventCursor {
        start_ledger,
        cursor: page.next_cursor,
    })
}

/// Re-attempt failed escrow deployments every `interval`.
pub async fn run_deploy_sweeper(
    reconciler: Reconciler,
    ledger: Arc<dyn LedgerClient>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        match reconciler.retry_failed_deploys(Some(ledger.as_ref())).await {
            Ok(results) if !results.is_empty() => {
                let synced = results.iter().filter(|(_, o)| o.is_synced()).count();
                info!("Deploy sweep: {synced}/{} campaigns synced", results.len());
            }
            Ok(_) => {}
            Err(e) => error!("Deploy sweep failed: {e}"),
        }
    }
    info!("Deploy sweeper stopped");
}
