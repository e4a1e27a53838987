//! Database layer: migrations, queries and cursor management.
//!
//! Query helpers take any [`SqliteExecutor`] so the same function runs
//! against the pool or inside a transaction (`&mut *tx`).

use sqlx::{sqlite::SqlitePoolOptions, SqliteExecutor, SqlitePool};
use tracing::info;

use crate::errors::Result;
use crate::events::{EventEnvelope, EventRecord};
use crate::models::{
    Campaign, CampaignStatus, Contribution, ContributionSyncStatus, DaoStatus, LedgerSyncStatus,
    Milestone, MilestoneStatus, NewCampaign, NewMilestone, NewVote, Proposal, Vote,
};

/// Establish a SQLite connection pool and run pending migrations.
pub async fn init_pool(database_url: &str) -> Result<SqlitePool> {
    let url = if database_url.starts_with("sqlite:") {
        database_url.to_string()
    } else {
        format!("sqlite:{database_url}")
    };
    // Create the database file if it doesn't exist yet.
    let url = if url.contains('?') || url.contains(":memory:") {
        url
    } else {
        format!("{url}?mode=rwc")
    };

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database migrations applied successfully");
    Ok(pool)
}

/// Single-connection in-memory store with migrations applied.
#[cfg(test)]
pub async fn test_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

// ─────────────────────────────────────────────────────────
// Cursor helpers
// ─────────────────────────────────────────────────────────

/// Read the last-seen ledger from the cursor row.
/// Returns `0` when no cursor has been persisted yet.
pub async fn get_last_ledger(pool: &SqlitePool) -> Result<i64> {
    let row: Option<(i64,)> = sqlx::query_as("SELECT last_ledger FROM indexer_cursor WHERE id = 1")
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|(v,)| v).unwrap_or(0))
}

/// Persist the last-seen ledger (and optionally a pagination cursor string).
pub async fn save_cursor(
    pool: &SqlitePool,
    last_ledger: i64,
    last_cursor: Option<&str>,
) -> Result<()> {
    sqlx::query("UPDATE indexer_cursor SET last_ledger = ?1, last_cursor = ?2 WHERE id = 1")
        .bind(last_ledger)
        .bind(last_cursor)
        .execute(pool)
        .await?;
    Ok(())
}

/// Read back the raw cursor string (used to resume pagination mid-ledger).
pub async fn get_cursor_string(pool: &SqlitePool) -> Result<Option<String>> {
    let row: Option<(Option<String>,)> =
        sqlx::query_as("SELECT last_cursor FROM indexer_cursor WHERE id = 1")
            .fetch_optional(pool)
            .await?;
    Ok(row.and_then(|(v,)| v))
}

// ─────────────────────────────────────────────────────────
// Ledger event log
// ─────────────────────────────────────────────────────────

/// Persist a batch of observed events. Events that share the same
/// `(tx_hash, event_type)` pair are silently ignored to make the indexer
/// idempotent. Returns the number of new rows.
pub async fn insert_events(pool: &SqlitePool, events: &[EventEnvelope], now: i64) -> Result<usize> {
    let mut count = 0usize;
    for env in events {
        let ev = &env.event;
        let rows_affected = sqlx::query(
            r#"
            INSERT OR IGNORE INTO ledger_events
                (event_type, campaign_id, actor, amount, ledger, tx_hash, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(ev.kind().as_str())
        .bind(ev.campaign_id() as i64)
        .bind(ev.actor())
        .bind(ev.amount())
        .bind(env.ledger)
        .bind(&env.tx_hash)
        .bind(now)
        .execute(pool)
        .await?
        .rows_affected();

        count += rows_affected as usize;
    }
    Ok(count)
}

/// Fetch all events for a given campaign, ordered by ledger ascending.
pub async fn get_events_for_campaign(pool: &SqlitePool, campaign_id: i64) -> Result<Vec<EventRecord>> {
    let rows = sqlx::query_as::<_, EventRecord>(
        r#"
        SELECT id, event_type, campaign_id, actor, amount, ledger, tx_hash, created_at
        FROM   ledger_events
        WHERE  campaign_id = ?1
        ORDER  BY ledger ASC, id ASC
        "#,
    )
    .bind(campaign_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Fetch all events, ordered by ledger ascending.
pub async fn get_all_events(pool: &SqlitePool) -> Result<Vec<EventRecord>> {
    let rows = sqlx::query_as::<_, EventRecord>(
        r#"
        SELECT id, event_type, campaign_id, actor, amount, ledger, tx_hash, created_at
        FROM   ledger_events
        ORDER  BY ledger ASC, id ASC
        "#,
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

// ─────────────────────────────────────────────────────────
// Campaigns
// ─────────────────────────────────────────────────────────

pub async fn insert_campaign<'e, E: SqliteExecutor<'e>>(
    ex: E,
    new: &NewCampaign,
    now: i64,
) -> Result<i64> {
    let id = sqlx::query(
        r#"
        INSERT INTO campaigns (owner, title, funding_goal, status, created_at, updated_at)
        VALUES (?1, ?2, ?3, 'draft', ?4, ?4)
        "#,
    )
    .bind(&new.owner)
    .bind(&new.title)
    .bind(new.funding_goal)
    .bind(now)
    .execute(ex)
    .await?
    .last_insert_rowid();
    Ok(id)
}

pub async fn get_campaign<'e, E: SqliteExecutor<'e>>(ex: E, id: i64) -> Result<Option<Campaign>> {
    let row = sqlx::query_as::<_, Campaign>("SELECT * FROM campaigns WHERE id = ?1")
        .bind(id)
        .fetch_optional(ex)
        .await?;
    Ok(row)
}

pub async fn set_campaign_status<'e, E: SqliteExecutor<'e>>(
    ex: E,
    id: i64,
    status: CampaignStatus,
    now: i64,
) -> Result<()> {
    sqlx::query("UPDATE campaigns SET status = ?2, updated_at = ?3 WHERE id = ?1")
        .bind(id)
        .bind(status)
        .bind(now)
        .execute(ex)
        .await?;
    Ok(())
}

/// Move a campaign to `active` together with the initial ledger sync status.
pub async fn activate_campaign<'e, E: SqliteExecutor<'e>>(
    ex: E,
    id: i64,
    sync: LedgerSyncStatus,
    now: i64,
) -> Result<()> {
    sqlx::query(
        "UPDATE campaigns SET status = 'active', ledger_sync_status = ?2, updated_at = ?3 WHERE id = ?1",
    )
    .bind(id)
    .bind(sync)
    .bind(now)
    .execute(ex)
    .await?;
    Ok(())
}

pub async fn set_campaign_sync<'e, E: SqliteExecutor<'e>>(
    ex: E,
    id: i64,
    sync: LedgerSyncStatus,
    now: i64,
) -> Result<()> {
    sqlx::query("UPDATE campaigns SET ledger_sync_status = ?2, updated_at = ?3 WHERE id = ?1")
        .bind(id)
        .bind(sync)
        .bind(now)
        .execute(ex)
        .await?;
    Ok(())
}

/// Record a submitted deployment whose confirmation is still outstanding.
pub async fn mark_deploy_pending<'e, E: SqliteExecutor<'e>>(
    ex: E,
    id: i64,
    tx_hash: &str,
    now: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE campaigns
        SET    ledger_sync_status = 'pending', ledger_tx_hash = ?2,
               deploy_attempts = deploy_attempts + 1, updated_at = ?3
        WHERE  id = ?1 AND ledger_sync_status <> 'synced'
        "#,
    )
    .bind(id)
    .bind(tx_hash)
    .bind(now)
    .execute(ex)
    .await?;
    Ok(())
}

/// Link a campaign to its escrow. Returns `false` if it was already synced.
/// A `None` tx hash keeps whatever hash is already recorded.
pub async fn mark_deploy_synced<'e, E: SqliteExecutor<'e>>(
    ex: E,
    id: i64,
    ledger_campaign_id: i64,
    tx_hash: Option<&str>,
    now: i64,
) -> Result<bool> {
    let rows = sqlx::query(
        r#"
        UPDATE campaigns
        SET    ledger_sync_status = 'synced', ledger_campaign_id = ?2,
               ledger_tx_hash = COALESCE(?3, ledger_tx_hash),
               last_ledger_error = NULL, updated_at = ?4
        WHERE  id = ?1 AND ledger_sync_status <> 'synced'
        "#,
    )
    .bind(id)
    .bind(ledger_campaign_id)
    .bind(tx_hash)
    .bind(now)
    .execute(ex)
    .await?
    .rows_affected();
    Ok(rows > 0)
}

pub async fn mark_deploy_failed<'e, E: SqliteExecutor<'e>>(
    ex: E,
    id: i64,
    error: &str,
    now: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE campaigns
        SET    ledger_sync_status = 'failed', last_ledger_error = ?2,
               deploy_attempts = deploy_attempts + 1, updated_at = ?3
        WHERE  id = ?1 AND ledger_sync_status <> 'synced'
        "#,
    )
    .bind(id)
    .bind(error)
    .bind(now)
    .execute(ex)
    .await?;
    Ok(())
}

/// Active campaigns whose deployment failed or timed out and that still have
/// attempts left.
pub async fn campaigns_needing_deploy<'e, E: SqliteExecutor<'e>>(
    ex: E,
    max_attempts: u32,
) -> Result<Vec<Campaign>> {
    let rows = sqlx::query_as::<_, Campaign>(
        r#"
        SELECT * FROM campaigns
        WHERE  status = 'active'
          AND  deploy_attempts < ?1
          AND  (ledger_sync_status = 'failed'
                OR (ledger_sync_status = 'pending' AND ledger_tx_hash IS NOT NULL))
        ORDER  BY id ASC
        "#,
    )
    .bind(max_attempts as i64)
    .fetch_all(ex)
    .await?;
    Ok(rows)
}

/// Recompute `funds_raised` as the ledger-confirmed total plus every
/// unsynced contribution. `ledger_total` only ever raises `ledger_funded`;
/// pass `0` to leave it unchanged.
pub async fn refresh_funds<'e, E: SqliteExecutor<'e>>(
    ex: E,
    campaign_id: i64,
    ledger_total: i64,
    now: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE campaigns
        SET    ledger_funded = MAX(ledger_funded, ?2),
               funds_raised  = MAX(ledger_funded, ?2) + (
                   SELECT COALESCE(SUM(amount), 0) FROM contributions
                   WHERE  campaign_id = ?1 AND ledger_sync_status = 'unsynced'
               ),
               updated_at = ?3
        WHERE  id = ?1
        "#,
    )
    .bind(campaign_id)
    .bind(ledger_total)
    .bind(now)
    .execute(ex)
    .await?;
    Ok(())
}

// ─────────────────────────────────────────────────────────
// Milestones
// ─────────────────────────────────────────────────────────

pub async fn insert_milestone<'e, E: SqliteExecutor<'e>>(
    ex: E,
    campaign_id: i64,
    index: i64,
    new: &NewMilestone,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO milestones (campaign_id, idx, description, funding_amount, target_date)
        VALUES (?1, ?2, ?3, ?4, ?5)
        "#,
    )
    .bind(campaign_id)
    .bind(index)
    .bind(&new.description)
    .bind(new.funding_amount)
    .bind(new.target_date)
    .execute(ex)
    .await?;
    Ok(())
}

pub async fn get_milestones<'e, E: SqliteExecutor<'e>>(ex: E, campaign_id: i64) -> Result<Vec<Milestone>> {
    let rows = sqlx::query_as::<_, Milestone>(
        "SELECT * FROM milestones WHERE campaign_id = ?1 ORDER BY idx ASC",
    )
    .bind(campaign_id)
    .fetch_all(ex)
    .await?;
    Ok(rows)
}

pub async fn get_milestone<'e, E: SqliteExecutor<'e>>(
    ex: E,
    campaign_id: i64,
    index: i64,
) -> Result<Option<Milestone>> {
    let row = sqlx::query_as::<_, Milestone>(
        "SELECT * FROM milestones WHERE campaign_id = ?1 AND idx = ?2",
    )
    .bind(campaign_id)
    .bind(index)
    .fetch_optional(ex)
    .await?;
    Ok(row)
}

pub async fn set_milestone_evidence<'e, E: SqliteExecutor<'e>>(
    ex: E,
    campaign_id: i64,
    index: i64,
    evidence_ref: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE milestones SET status = 'evidence_submitted', evidence_ref = ?3
        WHERE  campaign_id = ?1 AND idx = ?2
        "#,
    )
    .bind(campaign_id)
    .bind(index)
    .bind(evidence_ref)
    .execute(ex)
    .await?;
    Ok(())
}

pub async fn set_milestone_status<'e, E: SqliteExecutor<'e>>(
    ex: E,
    campaign_id: i64,
    index: i64,
    status: MilestoneStatus,
) -> Result<()> {
    sqlx::query("UPDATE milestones SET status = ?3 WHERE campaign_id = ?1 AND idx = ?2")
        .bind(campaign_id)
        .bind(index)
        .bind(status)
        .execute(ex)
        .await?;
    Ok(())
}

/// Sync status of a release that has not been recorded as released yet.
pub async fn set_milestone_sync<'e, E: SqliteExecutor<'e>>(
    ex: E,
    campaign_id: i64,
    index: i64,
    sync: LedgerSyncStatus,
    tx_hash: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE milestones
        SET    ledger_sync_status = ?3, release_tx_hash = COALESCE(?4, release_tx_hash)
        WHERE  campaign_id = ?1 AND idx = ?2 AND status <> 'released'
        "#,
    )
    .bind(campaign_id)
    .bind(index)
    .bind(sync)
    .bind(tx_hash)
    .execute(ex)
    .await?;
    Ok(())
}

/// Ledger-confirmed payout figures for one milestone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleaseRecord<'a> {
    pub tx_hash: &'a str,
    pub platform_fee: i64,
    pub researcher_amount: i64,
}

/// Mark a milestone released. Returns `false` when it already was.
pub async fn mark_milestone_released<'e, E: SqliteExecutor<'e>>(
    ex: E,
    campaign_id: i64,
    index: i64,
    release: ReleaseRecord<'_>,
    now: i64,
) -> Result<bool> {
    let rows = sqlx::query(
        r#"
        UPDATE milestones
        SET    status = 'released', ledger_sync_status = 'synced', release_tx_hash = ?3,
               platform_fee = ?4, researcher_amount = ?5, released_at = ?6
        WHERE  campaign_id = ?1 AND idx = ?2 AND status <> 'released'
        "#,
    )
    .bind(campaign_id)
    .bind(index)
    .bind(release.tx_hash)
    .bind(release.platform_fee)
    .bind(release.researcher_amount)
    .bind(now)
    .execute(ex)
    .await?
    .rows_affected();
    Ok(rows > 0)
}

pub async fn count_released<'e, E: SqliteExecutor<'e>>(ex: E, campaign_id: i64) -> Result<i64> {
    let (n,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM milestones WHERE campaign_id = ?1 AND status = 'released'",
    )
    .bind(campaign_id)
    .fetch_one(ex)
    .await?;
    Ok(n)
}

// ─────────────────────────────────────────────────────────
// Contributions
// ─────────────────────────────────────────────────────────

pub async fn insert_contribution<'e, E: SqliteExecutor<'e>>(
    ex: E,
    campaign_id: i64,
    contributor: &str,
    amount: i64,
    tx_hash: Option<&str>,
    sync: ContributionSyncStatus,
    now: i64,
) -> Result<i64> {
    let id = sqlx::query(
        r#"
        INSERT INTO contributions
            (campaign_id, contributor, amount, ledger_tx_hash, ledger_sync_status, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
    )
    .bind(campaign_id)
    .bind(contributor)
    .bind(amount)
    .bind(tx_hash)
    .bind(sync)
    .bind(now)
    .execute(ex)
    .await?
    .last_insert_rowid();
    Ok(id)
}

pub async fn get_contribution<'e, E: SqliteExecutor<'e>>(ex: E, id: i64) -> Result<Option<Contribution>> {
    let row = sqlx::query_as::<_, Contribution>("SELECT * FROM contributions WHERE id = ?1")
        .bind(id)
        .fetch_optional(ex)
        .await?;
    Ok(row)
}

pub async fn find_contribution_by_tx<'e, E: SqliteExecutor<'e>>(
    ex: E,
    tx_hash: &str,
) -> Result<Option<Contribution>> {
    let row = sqlx::query_as::<_, Contribution>(
        "SELECT * FROM contributions WHERE ledger_tx_hash = ?1",
    )
    .bind(tx_hash)
    .fetch_optional(ex)
    .await?;
    Ok(row)
}

/// Upgrade a pending contribution to confirmed. Returns `false` if it was
/// already confirmed or does not exist.
pub async fn confirm_contribution<'e, E: SqliteExecutor<'e>>(ex: E, tx_hash: &str) -> Result<bool> {
    let rows = sqlx::query(
        r#"
        UPDATE contributions SET ledger_sync_status = 'confirmed'
        WHERE  ledger_tx_hash = ?1 AND ledger_sync_status <> 'confirmed'
        "#,
    )
    .bind(tx_hash)
    .execute(ex)
    .await?
    .rows_affected();
    Ok(rows > 0)
}

/// Attach a ledger transaction to the oldest store-only or hashless pending
/// contribution with the same contributor and amount, and confirm it.
/// Returns `false` when no such record exists.
pub async fn claim_untracked_contribution<'e, E: SqliteExecutor<'e>>(
    ex: E,
    campaign_id: i64,
    contributor: &str,
    amount: i64,
    tx_hash: &str,
) -> Result<bool> {
    let rows = sqlx::query(
        r#"
        UPDATE contributions
        SET    ledger_tx_hash = ?4, ledger_sync_status = 'confirmed'
        WHERE  id = (
            SELECT id FROM contributions
            WHERE  campaign_id = ?1 AND contributor = ?2 AND amount = ?3
              AND  ledger_tx_hash IS NULL
              AND  ledger_sync_status IN ('pending', 'unsynced')
            ORDER BY ledger_sync_status = 'pending' DESC, id ASC
            LIMIT 1
        )
        "#,
    )
    .bind(campaign_id)
    .bind(contributor)
    .bind(amount)
    .bind(tx_hash)
    .execute(ex)
    .await?
    .rows_affected();
    Ok(rows > 0)
}

pub async fn get_contributions<'e, E: SqliteExecutor<'e>>(
    ex: E,
    campaign_id: i64,
) -> Result<Vec<Contribution>> {
    let rows = sqlx::query_as::<_, Contribution>(
        "SELECT * FROM contributions WHERE campaign_id = ?1 ORDER BY id ASC",
    )
    .bind(campaign_id)
    .fetch_all(ex)
    .await?;
    Ok(rows)
}

/// Ledger-confirmed total per contributor, largest first.
pub async fn confirmed_totals<'e, E: SqliteExecutor<'e>>(
    ex: E,
    campaign_id: i64,
) -> Result<Vec<(String, i64)>> {
    let rows = sqlx::query_as(
        r#"
        SELECT contributor, SUM(amount) AS total FROM contributions
        WHERE  campaign_id = ?1 AND ledger_sync_status = 'confirmed'
        GROUP  BY contributor
        ORDER  BY total DESC, contributor ASC
        "#,
    )
    .bind(campaign_id)
    .fetch_all(ex)
    .await?;
    Ok(rows)
}

// ─────────────────────────────────────────────────────────
// Proposals & votes
// ─────────────────────────────────────────────────────────

pub async fn insert_proposal<'e, E: SqliteExecutor<'e>>(ex: E, campaign_id: i64, now: i64) -> Result<i64> {
    let id = sqlx::query(
        "INSERT INTO proposals (campaign_id, dao_status, created_at) VALUES (?1, 'pending_vote', ?2)",
    )
    .bind(campaign_id)
    .bind(now)
    .execute(ex)
    .await?
    .last_insert_rowid();
    Ok(id)
}

pub async fn get_proposal<'e, E: SqliteExecutor<'e>>(ex: E, id: i64) -> Result<Option<Proposal>> {
    let row = sqlx::query_as::<_, Proposal>("SELECT * FROM proposals WHERE id = ?1")
        .bind(id)
        .fetch_optional(ex)
        .await?;
    Ok(row)
}

pub async fn get_proposal_for_campaign<'e, E: SqliteExecutor<'e>>(
    ex: E,
    campaign_id: i64,
) -> Result<Option<Proposal>> {
    let row = sqlx::query_as::<_, Proposal>("SELECT * FROM proposals WHERE campaign_id = ?1")
        .bind(campaign_id)
        .fetch_optional(ex)
        .await?;
    Ok(row)
}

/// Close a proposal. Only a `pending_vote` proposal transitions; returns
/// `false` otherwise.
pub async fn decide_proposal<'e, E: SqliteExecutor<'e>>(
    ex: E,
    id: i64,
    status: DaoStatus,
    now: i64,
) -> Result<bool> {
    let rows = sqlx::query(
        r#"
        UPDATE proposals SET dao_status = ?2, decided_at = ?3
        WHERE  id = ?1 AND dao_status = 'pending_vote'
        "#,
    )
    .bind(id)
    .bind(status)
    .bind(now)
    .execute(ex)
    .await?
    .rows_affected();
    Ok(rows > 0)
}

pub async fn insert_vote<'e, E: SqliteExecutor<'e>>(
    ex: E,
    proposal_id: i64,
    vote: &NewVote,
    now: i64,
) -> std::result::Result<i64, sqlx::Error> {
    let id = sqlx::query(
        r#"
        INSERT INTO votes (proposal_id, validator, decision, comment, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        "#,
    )
    .bind(proposal_id)
    .bind(&vote.validator)
    .bind(vote.decision)
    .bind(&vote.comment)
    .bind(now)
    .execute(ex)
    .await?
    .last_insert_rowid();
    Ok(id)
}

pub async fn get_votes<'e, E: SqliteExecutor<'e>>(ex: E, proposal_id: i64) -> Result<Vec<Vote>> {
    let rows = sqlx::query_as::<_, Vote>("SELECT * FROM votes WHERE proposal_id = ?1 ORDER BY id ASC")
        .bind(proposal_id)
        .fetch_all(ex)
        .await?;
    Ok(rows)
}
