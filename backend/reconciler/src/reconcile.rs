//! # Reconciliation Service
//!
//! Orchestrates the dual write between the off-chain store and the escrow
//! ledger. Every workflow step follows the same saga:
//!
//! ```text
//! validate ─► optimistic store write ─► ledger call ─► confirm ─► correct store
//!                                           │             │
//!                                           │             └─ timeout ─► pending (indeterminate)
//!                                           └─ error / no client ─► failed | unsynced | no_client
//! ```
//!
//! The ledger client is injected per call as `Option<&dyn LedgerClient>`; an
//! absent client is an explicit branch, not an error. Ledger failures never
//! roll back committed store state; they surface as a [`SyncOutcome`] and as
//! the record's `ledger_sync_status`.
//!
//! Convergence with the ledger happens in [`Reconciler::apply_event`], whose
//! handlers are idempotent and keyed by transaction hash.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use sqlx::SqlitePool;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use escrow_rules::Violation;

use crate::config::Config;
use crate::db::{self, ReleaseRecord};
use crate::errors::{ReconcilerError, Result, ValidationError};
use crate::events::{EventEnvelope, LedgerEvent};
use crate::governance::{self, VoteOutcome};
use crate::ledger::{
    evidence_digest, Confirmation, ContributeRequest, DeployRequest, LedgerClient, LedgerError,
    ReleaseReceipt,
};
use crate::models::{
    now, Campaign, CampaignStatus, Contribution, ContributionSyncStatus, DaoStatus,
    LedgerSyncStatus, Milestone, MilestoneStatus, NewCampaign, NewContribution, NewVote, Proposal,
};

const ESCROW_NOT_LINKED: &str = "campaign has no confirmed escrow on the ledger";

// ─────────────────────────────────────────────────────────
// Outcomes
// ─────────────────────────────────────────────────────────

/// Ledger-side result of a workflow step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum SyncOutcome<T> {
    /// Confirmed on the ledger.
    Synced(T),
    /// Outcome unknown: confirmation did not arrive in time, or the submit
    /// itself failed in a way that may have reached the ledger. The event
    /// stream settles it later. `tx_hash` is absent when the submit never
    /// returned one.
    Pending { tx_hash: Option<String> },
    /// The ledger path failed; the store records the degraded state.
    Failed { reason: String },
    /// No ledger client was available.
    NoClient,
}

impl<T> SyncOutcome<T> {
    pub fn is_synced(&self) -> bool {
        matches!(self, Self::Synced(_))
    }

    fn failed(reason: impl ToString) -> Self {
        Self::Failed {
            reason: reason.to_string(),
        }
    }
}

/// What [`Reconciler::apply_event`] did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// The store changed.
    Applied,
    /// Already reflected in the store.
    Duplicate,
    /// Cannot apply yet; an earlier event must land first.
    Deferred,
    /// Nothing in the store corresponds to this event.
    Ignored,
}

#[derive(Debug, Clone, Serialize)]
pub struct VoteReport {
    #[serde(flatten)]
    pub outcome: VoteOutcome,
    /// Campaign sync status set by activation, when this vote approved it.
    pub activation: Option<LedgerSyncStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContributionReport {
    pub contribution: Contribution,
    /// Ledger funded total on success.
    pub ledger: SyncOutcome<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MilestoneReport<T> {
    pub milestone: Milestone,
    pub ledger: SyncOutcome<T>,
}

enum Confirm {
    Confirmed(Confirmation),
    TimedOut,
    Failed(LedgerError),
}

// ─────────────────────────────────────────────────────────
// Reconciler
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    pub governance_quorum: u32,
    pub confirm_timeout: Duration,
    pub max_deploy_attempts: u32,
}

impl From<&Config> for ReconcilerSettings {
    fn from(config: &Config) -> Self {
        Self {
            governance_quorum: config.governance_quorum,
            confirm_timeout: Duration::from_secs(config.confirm_timeout_secs),
            max_deploy_attempts: config.max_deploy_attempts,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Reconciler {
    pool: SqlitePool,
    settings: ReconcilerSettings,
}

impl Reconciler {
    pub fn new(pool: SqlitePool, settings: ReconcilerSettings) -> Self {
        Self { pool, settings }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn campaign(&self, id: i64) -> Result<Campaign> {
        db::get_campaign(&self.pool, id)
            .await?
            .ok_or_else(|| ReconcilerError::NotFound(format!("campaign {id}")))
    }

    async fn milestone(&self, campaign_id: i64, index: u32) -> Result<Milestone> {
        db::get_milestone(&self.pool, campaign_id, index as i64)
            .await?
            .ok_or_else(|| {
                ReconcilerError::NotFound(format!("milestone {index} of campaign {campaign_id}"))
            })
    }

    async fn await_confirmation(&self, client: &dyn LedgerClient, tx_hash: &str) -> Confirm {
        match tokio::time::timeout(self.settings.confirm_timeout, client.confirm(tx_hash)).await {
            Ok(Ok(c)) => {
                debug!("{tx_hash} confirmed in ledger {}", c.ledger);
                Confirm::Confirmed(c)
            }
            Ok(Err(LedgerError::Timeout)) | Err(_) => {
                warn!("Confirmation of {tx_hash} timed out; outcome is indeterminate");
                Confirm::TimedOut
            }
            Ok(Err(e)) => Confirm::Failed(e),
        }
    }

    // ─── Campaign lifecycle ───────────────────────────────

    pub async fn create_campaign(&self, new: &NewCampaign) -> Result<Campaign> {
        if new.owner.trim().is_empty() || new.title.trim().is_empty() {
            return Err(ValidationError::Field("owner and title are required".to_string()).into());
        }
        let amounts = new.milestones.iter().map(|m| m.funding_amount as i128);
        escrow_rules::validate_schedule(new.funding_goal as i128, amounts)
            .map_err(|v| schedule_error(v, new))?;

        let ts = now();
        let mut tx = self.pool.begin().await?;
        let id = db::insert_campaign(&mut *tx, new, ts).await?;
        for (index, milestone) in new.milestones.iter().enumerate() {
            db::insert_milestone(&mut *tx, id, index as i64, milestone).await?;
        }
        tx.commit().await?;

        info!(
            "Created campaign {id} ({} milestones, goal {})",
            new.milestones.len(),
            new.funding_goal
        );
        self.campaign(id).await
    }

    /// Owner moves a draft to review; opens its proposal.
    pub async fn submit_for_review(&self, campaign_id: i64, owner: &str) -> Result<Proposal> {
        let mut tx = self.pool.begin().await?;
        let campaign = db::get_campaign(&mut *tx, campaign_id)
            .await?
            .ok_or_else(|| ReconcilerError::NotFound(format!("campaign {campaign_id}")))?;
        if campaign.owner != owner {
            return Err(ValidationError::NotOwner.into());
        }
        expect_status(&campaign, &[CampaignStatus::Draft], "draft")?;

        let ts = now();
        db::set_campaign_status(&mut *tx, campaign_id, CampaignStatus::PendingReview, ts).await?;
        let proposal_id = db::insert_proposal(&mut *tx, campaign_id, ts).await?;
        let proposal = db::get_proposal(&mut *tx, proposal_id)
            .await?
            .ok_or_else(|| ReconcilerError::Consistency(format!("proposal {proposal_id} vanished")))?;
        tx.commit().await?;

        info!("Campaign {campaign_id} submitted for review (proposal {proposal_id})");
        Ok(proposal)
    }

    pub async fn cancel_campaign(&self, campaign_id: i64, owner: &str) -> Result<Campaign> {
        let mut tx = self.pool.begin().await?;
        let campaign = db::get_campaign(&mut *tx, campaign_id)
            .await?
            .ok_or_else(|| ReconcilerError::NotFound(format!("campaign {campaign_id}")))?;
        if campaign.owner != owner {
            return Err(ValidationError::NotOwner.into());
        }
        expect_status(
            &campaign,
            &[CampaignStatus::Draft, CampaignStatus::PendingReview],
            "draft or pending_review",
        )?;

        let ts = now();
        db::set_campaign_status(&mut *tx, campaign_id, CampaignStatus::Cancelled, ts).await?;
        if let Some(proposal) = db::get_proposal_for_campaign(&mut *tx, campaign_id).await? {
            db::decide_proposal(&mut *tx, proposal.id, DaoStatus::Rejected, ts).await?;
        }
        tx.commit().await?;

        info!("Campaign {campaign_id} cancelled by owner");
        self.campaign(campaign_id).await
    }

    // ─── Governance ───────────────────────────────────────

    /// Record a vote; activate the campaign when the vote approves it.
    ///
    /// Ledger deployment is not started here; callers spawn
    /// [`Reconciler::spawn_deploy`] when `activation` is `Pending`.
    pub async fn submit_vote(
        &self,
        ledger: Option<&dyn LedgerClient>,
        proposal_id: i64,
        vote: &NewVote,
    ) -> Result<VoteReport> {
        let outcome =
            governance::cast_vote(&self.pool, proposal_id, vote, self.settings.governance_quorum)
                .await?;

        let activation = if outcome.decided && outcome.dao_status == DaoStatus::Approved {
            Some(self.activate(outcome.campaign_id, ledger.is_some()).await?)
        } else {
            None
        };
        Ok(VoteReport {
            outcome,
            activation,
        })
    }

    /// Make an approved campaign usable on the platform, independently of
    /// the ledger.
    pub async fn activate(&self, campaign_id: i64, has_client: bool) -> Result<LedgerSyncStatus> {
        let sync = if has_client {
            LedgerSyncStatus::Pending
        } else {
            LedgerSyncStatus::NoClient
        };
        db::activate_campaign(&self.pool, campaign_id, sync, now()).await?;
        info!("Campaign {campaign_id} activated (ledger: {sync:?})");
        Ok(sync)
    }

    // ─── Deployment ───────────────────────────────────────

    /// Deploy the campaign's escrow, keyed by the campaign id.
    ///
    /// Safe to call any number of times: a synced campaign is left alone, and
    /// an escrow that already exists on the ledger is adopted instead of
    /// deployed again.
    pub async fn deploy_escrow(
        &self,
        ledger: Option<&dyn LedgerClient>,
        campaign_id: i64,
    ) -> Result<SyncOutcome<i64>> {
        let campaign = self.campaign(campaign_id).await?;
        expect_status(&campaign, &[CampaignStatus::Active], "active")?;
        if let Some(escrow_id) = campaign.linked_escrow() {
            debug!("Campaign {campaign_id} already linked to escrow {escrow_id}");
            return Ok(SyncOutcome::Synced(escrow_id as i64));
        }

        let Some(client) = ledger else {
            db::set_campaign_sync(&self.pool, campaign_id, LedgerSyncStatus::NoClient, now()).await?;
            return Ok(SyncOutcome::NoClient);
        };
        let escrow_id = campaign_id as u64;

        match client.escrow(escrow_id).await {
            Ok(Some(snapshot)) => {
                info!("Escrow {escrow_id} already on the ledger; adopting it");
                db::mark_deploy_synced(&self.pool, campaign_id, campaign_id, None, now()).await?;
                db::refresh_funds(&self.pool, campaign_id, snapshot.funded, now()).await?;
                return Ok(SyncOutcome::Synced(campaign_id));
            }
            Ok(None) => {}
            Err(e) => warn!("Could not read escrow {escrow_id} before deploying: {e}"),
        }

        let milestones = db::get_milestones(&self.pool, campaign_id).await?;
        let req = DeployRequest {
            campaign_id: escrow_id,
            owner: campaign.owner.clone(),
            goal: campaign.funding_goal,
            milestones: milestones.iter().map(|m| m.funding_amount).collect(),
        };

        let submitted = match client.deploy(&req).await {
            Ok(s) => s,
            Err(e) if e.is_already_deployed() => {
                info!("Escrow {escrow_id} was deployed by an earlier attempt; adopting it");
                db::mark_deploy_synced(&self.pool, campaign_id, campaign_id, None, now()).await?;
                return Ok(SyncOutcome::Synced(campaign_id));
            }
            Err(e) => return self.deploy_failed(campaign_id, e).await,
        };

        match self.await_confirmation(client, &submitted.tx_hash).await {
            Confirm::Confirmed(_) => {
                db::mark_deploy_synced(
                    &self.pool,
                    campaign_id,
                    campaign_id,
                    Some(&submitted.tx_hash),
                    now(),
                )
                .await?;
                info!("Escrow for campaign {campaign_id} deployed in {}", submitted.tx_hash);
                Ok(SyncOutcome::Synced(campaign_id))
            }
            Confirm::TimedOut => {
                db::mark_deploy_pending(&self.pool, campaign_id, &submitted.tx_hash, now()).await?;
                Ok(SyncOutcome::Pending {
                    tx_hash: Some(submitted.tx_hash),
                })
            }
            Confirm::Failed(e) => self.deploy_failed(campaign_id, e).await,
        }
    }

    async fn deploy_failed(&self, campaign_id: i64, e: LedgerError) -> Result<SyncOutcome<i64>> {
        warn!("Escrow deployment for campaign {campaign_id} failed: {e}");
        db::mark_deploy_failed(&self.pool, campaign_id, &e.to_string(), now()).await?;
        Ok(SyncOutcome::failed(e))
    }

    /// Run [`Reconciler::deploy_escrow`] in the background.
    pub fn spawn_deploy(&self, ledger: Arc<dyn LedgerClient>, campaign_id: i64) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            match this.deploy_escrow(Some(ledger.as_ref()), campaign_id).await {
                Ok(outcome) => info!("Deploy of campaign {campaign_id}: {outcome:?}"),
                Err(e) => error!("Deploy of campaign {campaign_id} errored: {e}"),
            }
        })
    }

    /// Re-attempt deployments that failed or timed out, up to the configured
    /// number of attempts per campaign.
    pub async fn retry_failed_deploys(
        &self,
        ledger: Option<&dyn LedgerClient>,
    ) -> Result<Vec<(i64, SyncOutcome<i64>)>> {
        if ledger.is_none() {
            return Ok(Vec::new());
        }
        let campaigns =
            db::campaigns_needing_deploy(&self.pool, self.settings.max_deploy_attempts).await?;
        let mut results = Vec::with_capacity(campaigns.len());
        for campaign in campaigns {
            info!(
                "Retrying escrow deployment for campaign {} (attempt {})",
                campaign.id,
                campaign.deploy_attempts + 1
            );
            let outcome = self.deploy_escrow(ledger, campaign.id).await?;
            results.push((campaign.id, outcome));
        }
        Ok(results)
    }

    // ─── Contributions ────────────────────────────────────

    /// Record a contribution, through the ledger when the campaign has a
    /// confirmed escrow and a client is available, otherwise off-chain only.
    pub async fn contribute(
        &self,
        ledger: Option<&dyn LedgerClient>,
        campaign_id: i64,
        new: &NewContribution,
    ) -> Result<ContributionReport> {
        let campaign = self.campaign(campaign_id).await?;
        expect_status(&campaign, &[CampaignStatus::Active], "active")?;
        escrow_rules::accept_contribution(
            campaign.funding_goal as i128,
            campaign.funds_raised as i128,
            new.amount as i128,
            new.contributor == campaign.owner,
        )
        .map_err(|v| contribution_error(v, new.amount, campaign.remaining_goal()))?;

        let (client, escrow_id) = match (ledger, campaign.linked_escrow()) {
            (Some(client), Some(escrow_id)) => (client, escrow_id),
            (None, _) => return self.contribute_offchain(&campaign, new, SyncOutcome::NoClient).await,
            (Some(_), None) => {
                let outcome = SyncOutcome::failed(ESCROW_NOT_LINKED);
                return self.contribute_offchain(&campaign, new, outcome).await;
            }
        };

        if let Err(e) = client.approve_spend(&new.contributor, new.amount).await {
            warn!("Spending approval for campaign {campaign_id} failed: {e}");
            return self
                .contribute_offchain(&campaign, new, SyncOutcome::failed(e))
                .await;
        }
        let req = ContributeRequest {
            campaign_id: escrow_id,
            contributor: new.contributor.clone(),
            amount: new.amount,
        };
        let submitted = match client.contribute(&req).await {
            Ok(s) => s,
            Err(e) if e.is_definite() => {
                warn!("Ledger rejected contribution to campaign {campaign_id}: {e}");
                return self
                    .contribute_offchain(&campaign, new, SyncOutcome::failed(e))
                    .await;
            }
            Err(e) => {
                warn!("Contribution to campaign {campaign_id} may have reached the ledger: {e}");
                return self.contribute_pending(campaign_id, new, None).await;
            }
        };

        match self.await_confirmation(client, &submitted.tx_hash).await {
            Confirm::Confirmed(_) => {
                let contribution = self
                    .record_ledger_contribution(
                        campaign_id,
                        &new.contributor,
                        new.amount,
                        &submitted.tx_hash,
                        ContributionSyncStatus::Confirmed,
                    )
                    .await?;
                // Re-read the authoritative total; fall back to the total the
                // contract returned for this call.
                let funded = match client.escrow(escrow_id).await {
                    Ok(Some(snapshot)) => snapshot.funded,
                    Ok(None) | Err(_) => submitted.value,
                };
                db::refresh_funds(&self.pool, campaign_id, funded, now()).await?;
                Ok(ContributionReport {
                    contribution,
                    ledger: SyncOutcome::Synced(funded),
                })
            }
            Confirm::Failed(e) if e.is_definite() => {
                warn!("Contribution {} was rejected: {e}", submitted.tx_hash);
                self.contribute_offchain(&campaign, new, SyncOutcome::failed(e))
                    .await
            }
            Confirm::TimedOut | Confirm::Failed(_) => {
                self.contribute_pending(campaign_id, new, Some(submitted.tx_hash))
                    .await
            }
        }
    }

    /// Record a contribution whose ledger outcome is unknown. It is not
    /// counted in `funds_raised` until its ledger event confirms it.
    async fn contribute_pending(
        &self,
        campaign_id: i64,
        new: &NewContribution,
        tx_hash: Option<String>,
    ) -> Result<ContributionReport> {
        let contribution = match &tx_hash {
            Some(hash) => {
                self.record_ledger_contribution(
                    campaign_id,
                    &new.contributor,
                    new.amount,
                    hash,
                    ContributionSyncStatus::Pending,
                )
                .await?
            }
            None => {
                let id = db::insert_contribution(
                    &self.pool,
                    campaign_id,
                    &new.contributor,
                    new.amount,
                    None,
                    ContributionSyncStatus::Pending,
                    now(),
                )
                .await?;
                db::get_contribution(&self.pool, id).await?.ok_or_else(|| {
                    ReconcilerError::Consistency(format!("contribution {id} vanished"))
                })?
            }
        };
        info!(
            "Contribution {} to campaign {campaign_id} is pending ledger confirmation",
            contribution.id
        );
        Ok(ContributionReport {
            contribution,
            ledger: SyncOutcome::Pending { tx_hash },
        })
    }

    async fn contribute_offchain(
        &self,
        campaign: &Campaign,
        new: &NewContribution,
        ledger: SyncOutcome<i64>,
    ) -> Result<ContributionReport> {
        let ts = now();
        let mut tx = self.pool.begin().await?;
        let id = db::insert_contribution(
            &mut *tx,
            campaign.id,
            &new.contributor,
            new.amount,
            None,
            ContributionSyncStatus::Unsynced,
            ts,
        )
        .await?;
        db::refresh_funds(&mut *tx, campaign.id, 0, ts).await?;
        let contribution = db::get_contribution(&mut *tx, id)
            .await?
            .ok_or_else(|| ReconcilerError::Consistency(format!("contribution {id} vanished")))?;
        tx.commit().await?;

        warn!(
            "Contribution {id} to campaign {} recorded off-chain only (not ledger-secured)",
            campaign.id
        );
        Ok(ContributionReport {
            contribution,
            ledger,
        })
    }

    /// Insert a ledger-path contribution, or merge with the record the event
    /// stream already created for the same transaction.
    async fn record_ledger_contribution(
        &self,
        campaign_id: i64,
        contributor: &str,
        amount: i64,
        tx_hash: &str,
        sync: ContributionSyncStatus,
    ) -> Result<Contribution> {
        let inserted = db::insert_contribution(
            &self.pool,
            campaign_id,
            contributor,
            amount,
            Some(tx_hash),
            sync,
            now(),
        )
        .await;

        let found = match inserted {
            Ok(id) => db::get_contribution(&self.pool, id).await?,
            Err(ReconcilerError::Database(sqlx::Error::Database(e))) if e.is_unique_violation() => {
                if sync == ContributionSyncStatus::Confirmed {
                    db::confirm_contribution(&self.pool, tx_hash).await?;
                }
                db::find_contribution_by_tx(&self.pool, tx_hash).await?
            }
            Err(e) => return Err(e),
        };
        found.ok_or_else(|| ReconcilerError::Consistency(format!("contribution {tx_hash} vanished")))
    }

    // ─── Milestones ───────────────────────────────────────

    /// Record milestone evidence in the store and mirror its digest to the
    /// ledger. The store write stands even when the ledger step fails.
    pub async fn submit_evidence(
        &self,
        ledger: Option<&dyn LedgerClient>,
        campaign_id: i64,
        index: u32,
        evidence_ref: &str,
    ) -> Result<MilestoneReport<()>> {
        if evidence_ref.trim().is_empty() {
            return Err(ValidationError::Field("evidence_ref is required".to_string()).into());
        }
        let campaign = self.campaign(campaign_id).await?;
        expect_status(&campaign, &[CampaignStatus::Active], "active")?;
        let milestone = self.milestone(campaign_id, index).await?;
        match milestone.status {
            MilestoneStatus::Pending | MilestoneStatus::EvidenceSubmitted => {}
            MilestoneStatus::Approved => {
                return Err(ValidationError::Field(format!(
                    "milestone {index} is already approved"
                ))
                .into())
            }
            MilestoneStatus::Released => {
                return Err(ValidationError::MilestoneAlreadyReleased { index }.into())
            }
        }

        db::set_milestone_evidence(&self.pool, campaign_id, index as i64, evidence_ref).await?;
        info!("Evidence recorded for milestone {index} of campaign {campaign_id}");

        let outcome = match (ledger, campaign.linked_escrow()) {
            (None, _) => SyncOutcome::NoClient,
            (Some(_), None) => SyncOutcome::failed(ESCROW_NOT_LINKED),
            (Some(client), Some(escrow_id)) => {
                match self
                    .mirror_evidence(client, escrow_id, index, evidence_ref)
                    .await
                {
                    Ok((_, Confirm::Confirmed(_))) => SyncOutcome::Synced(()),
                    Ok((tx_hash, Confirm::TimedOut)) => SyncOutcome::Pending {
                        tx_hash: Some(tx_hash),
                    },
                    Ok((_, Confirm::Failed(e))) | Err(e) => {
                        warn!("Evidence mirror for campaign {campaign_id} failed: {e}");
                        SyncOutcome::failed(e)
                    }
                }
            }
        };

        Ok(MilestoneReport {
            milestone: self.milestone(campaign_id, index).await?,
            ledger: outcome,
        })
    }

    async fn mirror_evidence(
        &self,
        client: &dyn LedgerClient,
        escrow_id: u64,
        index: u32,
        evidence_ref: &str,
    ) -> std::result::Result<(String, Confirm), LedgerError> {
        let submitted = client
            .submit_evidence(escrow_id, index, evidence_digest(evidence_ref))
            .await?;
        let confirm = self.await_confirmation(client, &submitted.tx_hash).await;
        Ok((submitted.tx_hash, confirm))
    }

    /// Governance sign-off on submitted evidence. Store-only.
    pub async fn approve_milestone(&self, campaign_id: i64, index: u32) -> Result<Milestone> {
        let campaign = self.campaign(campaign_id).await?;
        expect_status(&campaign, &[CampaignStatus::Active], "active")?;
        let milestone = self.milestone(campaign_id, index).await?;
        match milestone.status {
            MilestoneStatus::EvidenceSubmitted => {
                db::set_milestone_status(
                    &self.pool,
                    campaign_id,
                    index as i64,
                    MilestoneStatus::Approved,
                )
                .await?;
                info!("Milestone {index} of campaign {campaign_id} approved");
                self.milestone(campaign_id, index).await
            }
            MilestoneStatus::Approved => Ok(milestone),
            MilestoneStatus::Pending => Err(ValidationError::MissingEvidence { index }.into()),
            MilestoneStatus::Released => {
                Err(ValidationError::MilestoneAlreadyReleased { index }.into())
            }
        }
    }

    /// Release an approved milestone through the ledger. The store marks it
    /// released only once the ledger confirms.
    pub async fn release_milestone(
        &self,
        ledger: Option<&dyn LedgerClient>,
        campaign_id: i64,
        index: u32,
    ) -> Result<MilestoneReport<ReleaseReceipt>> {
        let campaign = self.campaign(campaign_id).await?;
        expect_status(&campaign, &[CampaignStatus::Active], "active")?;
        let milestone = self.milestone(campaign_id, index).await?;
        if milestone.status == MilestoneStatus::Released {
            return Err(ValidationError::MilestoneAlreadyReleased { index }.into());
        }
        let released = db::count_released(&self.pool, campaign_id).await? as u32;
        if index != released {
            return Err(ValidationError::OutOfOrderRelease {
                requested: index,
                expected: released,
            }
            .into());
        }
        match milestone.status {
            MilestoneStatus::Pending => return Err(ValidationError::MissingEvidence { index }.into()),
            MilestoneStatus::EvidenceSubmitted => {
                return Err(ValidationError::MilestoneNotApproved { index }.into())
            }
            MilestoneStatus::Approved | MilestoneStatus::Released => {}
        }

        let outcome = match (ledger, campaign.linked_escrow()) {
            (None, _) => {
                self.set_release_sync(campaign_id, index, LedgerSyncStatus::NoClient, None)
                    .await?;
                SyncOutcome::NoClient
            }
            (Some(_), None) => {
                self.set_release_sync(campaign_id, index, LedgerSyncStatus::Failed, None)
                    .await?;
                SyncOutcome::failed(ESCROW_NOT_LINKED)
            }
            (Some(client), Some(escrow_id)) => {
                self.release_on_ledger(client, escrow_id, &milestone).await?
            }
        };

        Ok(MilestoneReport {
            milestone: self.milestone(campaign_id, index).await?,
            ledger: outcome,
        })
    }

    async fn release_on_ledger(
        &self,
        client: &dyn LedgerClient,
        escrow_id: u64,
        milestone: &Milestone,
    ) -> Result<SyncOutcome<ReleaseReceipt>> {
        let campaign_id = milestone.campaign_id;
        let index = milestone.index as u32;
        let evidence_ref = milestone.evidence_ref.as_deref().unwrap_or_default();

        // The contract gates release on recorded evidence; re-submitting is
        // harmless until the release lands.
        match self
            .mirror_evidence(client, escrow_id, index, evidence_ref)
            .await
        {
            Ok((_, Confirm::Confirmed(_))) => {}
            Ok((tx_hash, Confirm::TimedOut)) => {
                self.set_release_sync(campaign_id, index, LedgerSyncStatus::Failed, None)
                    .await?;
                return Ok(SyncOutcome::failed(format!(
                    "evidence transaction {tx_hash} not confirmed in time"
                )));
            }
            Ok((_, Confirm::Failed(e))) | Err(e) => {
                if e.violation() == Some(Violation::MilestoneAlreadyReleased) {
                    // An earlier attempt landed; its release event settles the store.
                    self.set_release_sync(campaign_id, index, LedgerSyncStatus::Pending, None)
                        .await?;
                    return Ok(SyncOutcome::failed(
                        "milestone already released on the ledger; awaiting its event",
                    ));
                }
                return self.release_failed(campaign_id, index, e).await;
            }
        }

        let submitted = match client.release_milestone(escrow_id, index).await {
            Ok(s) => s,
            Err(e) => return self.release_failed(campaign_id, index, e).await,
        };

        match self.await_confirmation(client, &submitted.tx_hash).await {
            Confirm::Confirmed(_) => {
                let receipt = submitted.value;
                self.apply_release(campaign_id, index, &submitted.tx_hash, &receipt)
                    .await?;
                Ok(SyncOutcome::Synced(receipt))
            }
            Confirm::TimedOut => {
                self.set_release_sync(
                    campaign_id,
                    index,
                    LedgerSyncStatus::Pending,
                    Some(&submitted.tx_hash),
                )
                .await?;
                Ok(SyncOutcome::Pending {
                    tx_hash: Some(submitted.tx_hash),
                })
            }
            Confirm::Failed(e) => self.release_failed(campaign_id, index, e).await,
        }
    }

    async fn release_failed<T>(
        &self,
        campaign_id: i64,
        index: u32,
        e: LedgerError,
    ) -> Result<SyncOutcome<T>> {
        warn!("Release of milestone {index} of campaign {campaign_id} failed: {e}");
        self.set_release_sync(campaign_id, index, LedgerSyncStatus::Failed, None)
            .await?;
        Ok(SyncOutcome::failed(e))
    }

    async fn set_release_sync(
        &self,
        campaign_id: i64,
        index: u32,
        sync: LedgerSyncStatus,
        tx_hash: Option<&str>,
    ) -> Result<()> {
        db::set_milestone_sync(&self.pool, campaign_id, index as i64, sync, tx_hash).await
    }

    /// Mark a ledger-confirmed release in the store; completes the campaign
    /// on its last milestone. Returns `false` if it was already recorded.
    async fn apply_release(
        &self,
        campaign_id: i64,
        index: u32,
        tx_hash: &str,
        receipt: &ReleaseReceipt,
    ) -> Result<bool> {
        let ts = now();
        let mut tx = self.pool.begin().await?;
        let changed = db::mark_milestone_released(
            &mut *tx,
            campaign_id,
            index as i64,
            ReleaseRecord {
                tx_hash,
                platform_fee: receipt.fee,
                researcher_amount: receipt.researcher_amount,
            },
            ts,
        )
        .await?;

        if changed {
            let total = db::get_milestones(&mut *tx, campaign_id).await?.len() as i64;
            let released = db::count_released(&mut *tx, campaign_id).await?;
            if released == total {
                db::set_campaign_status(&mut *tx, campaign_id, CampaignStatus::Completed, ts)
                    .await?;
                info!("Campaign {campaign_id} completed: all {total} milestones released");
            }
        }
        tx.commit().await?;

        if changed {
            info!(
                "Milestone {index} of campaign {campaign_id} released in {tx_hash} (fee {}, researcher {})",
                receipt.fee, receipt.researcher_amount
            );
        }
        Ok(changed)
    }

    // ─── Event convergence ────────────────────────────────

    /// Converge the store with one observed ledger event. Safe to call any
    /// number of times for the same event.
    pub async fn apply_event(&self, envelope: &EventEnvelope) -> Result<Applied> {
        let tx_hash = envelope.tx_hash.as_str();
        let campaign_id = envelope.event.campaign_id() as i64;
        let Some(campaign) = db::get_campaign(&self.pool, campaign_id).await? else {
            debug!("Event {tx_hash} for unknown campaign {campaign_id}; ignoring");
            return Ok(Applied::Ignored);
        };

        match &envelope.event {
            LedgerEvent::EscrowCreated { .. } => {
                let changed =
                    db::mark_deploy_synced(&self.pool, campaign_id, campaign_id, Some(tx_hash), now())
                        .await?;
                if changed {
                    info!("Escrow for campaign {campaign_id} confirmed by event {tx_hash}");
                    Ok(Applied::Applied)
                } else {
                    Ok(Applied::Duplicate)
                }
            }

            LedgerEvent::ContributionReceived {
                contributor,
                amount,
                funded,
                ..
            } => {
                let applied = match db::find_contribution_by_tx(&self.pool, tx_hash).await? {
                    Some(c) if c.ledger_sync_status == ContributionSyncStatus::Confirmed => {
                        Applied::Duplicate
                    }
                    Some(_) => {
                        db::confirm_contribution(&self.pool, tx_hash).await?;
                        info!("Contribution {tx_hash} confirmed by event");
                        Applied::Applied
                    }
                    None => {
                        let claimed = db::claim_untracked_contribution(
                            &self.pool,
                            campaign_id,
                            contributor,
                            *amount,
                            tx_hash,
                        )
                        .await?;
                        if claimed {
                            info!("Contribution {tx_hash} matched a store record without a transaction");
                        } else {
                            self.record_ledger_contribution(
                                campaign.id,
                                contributor,
                                *amount,
                                tx_hash,
                                ContributionSyncStatus::Confirmed,
                            )
                            .await?;
                            info!("Recorded contribution {tx_hash} first seen on the ledger");
                        }
                        Applied::Applied
                    }
                };
                db::refresh_funds(&self.pool, campaign_id, *funded, now()).await?;
                Ok(applied)
            }

            LedgerEvent::EvidenceSubmitted { index, .. } => {
                debug!("Evidence for milestone {index} of campaign {campaign_id} seen on the ledger");
                Ok(Applied::Ignored)
            }

            LedgerEvent::MilestoneReleased {
                index,
                amount,
                fee,
                researcher_amount,
                ..
            } => {
                let Some(milestone) =
                    db::get_milestone(&self.pool, campaign_id, *index as i64).await?
                else {
                    warn!("Release event {tx_hash} for unknown milestone {index}");
                    return Ok(Applied::Ignored);
                };
                if milestone.status == MilestoneStatus::Released {
                    return Ok(Applied::Duplicate);
                }
                if milestone.funding_amount != *amount {
                    error!(
                        "Release event {tx_hash} pays {amount} for milestone {index} of campaign {campaign_id}, expected {}",
                        milestone.funding_amount
                    );
                    return Err(ReconcilerError::Consistency(format!(
                        "release amount mismatch for milestone {index} of campaign {campaign_id}"
                    )));
                }
                let released = db::count_released(&self.pool, campaign_id).await?;
                if (*index as i64) > released {
                    warn!(
                        "Release event {tx_hash} for milestone {index} arrived before milestone {released}; deferring"
                    );
                    return Ok(Applied::Deferred);
                }
                let receipt = ReleaseReceipt {
                    index: *index,
                    amount: *amount,
                    fee: *fee,
                    researcher_amount: *researcher_amount,
                };
                if self.apply_release(campaign_id, *index, tx_hash, &receipt).await? {
                    Ok(Applied::Applied)
                } else {
                    Ok(Applied::Duplicate)
                }
            }
        }
    }
}

// ─────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────

fn expect_status(
    campaign: &Campaign,
    allowed: &[CampaignStatus],
    expected: &'static str,
) -> std::result::Result<(), ValidationError> {
    if allowed.contains(&campaign.status) {
        Ok(())
    } else {
        Err(ValidationError::InvalidCampaignStatus {
            expected,
            actual: campaign.status.as_str().to_string(),
        })
    }
}

fn schedule_error(v: Violation, new: &NewCampaign) -> ValidationError {
    match v {
        Violation::GoalMismatch => ValidationError::MilestoneSumMismatch {
            goal: new.funding_goal,
            sum: new
                .milestones
                .iter()
                .fold(0i64, |acc, m| acc.saturating_add(m.funding_amount)),
        },
        Violation::InvalidMilestones if new.milestones.is_empty() => ValidationError::NoMilestones,
        _ => ValidationError::NonPositiveAmount,
    }
}

fn contribution_error(v: Violation, amount: i64, remaining: i64) -> ValidationError {
    match v {
        Violation::SelfContribution => ValidationError::SelfContribution,
        Violation::ExceedsGoal => ValidationError::ExceedsRemainingGoal { amount, remaining },
        _ => ValidationError::NonPositiveAmount,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{EscrowSnapshot, EventCursor, EventPage, Submitted};
    use crate::mock_ledger::{LedgerOp, MockLedger};
    use crate::models::{NewMilestone, VoteDecision};

    const OWNER: &str = "GOWNER";

    fn reconciler(pool: SqlitePool) -> Reconciler {
        Reconciler::new(
            pool,
            ReconcilerSettings {
                governance_quorum: 1,
                confirm_timeout: Duration::from_millis(100),
                max_deploy_attempts: 3,
            },
        )
    }

    fn campaign_with(goal: i64, amounts: &[i64]) -> NewCampaign {
        NewCampaign {
            owner: OWNER.to_string(),
            title: "Deep-sea vent genomics".to_string(),
            funding_goal: goal,
            milestones: amounts
                .iter()
                .enumerate()
                .map(|(i, a)| NewMilestone {
                    description: format!("phase {i}"),
                    funding_amount: *a,
                    target_date: None,
                })
                .collect(),
        }
    }

    fn approve(validator: &str) -> NewVote {
        NewVote {
            validator: validator.to_string(),
            decision: VoteDecision::Approve,
            comment: None,
        }
    }

    fn contribution(contributor: &str, amount: i64) -> NewContribution {
        NewContribution {
            contributor: contributor.to_string(),
            amount,
        }
    }

    /// Create, review and approve a campaign; returns its id.
    async fn approved_campaign(r: &Reconciler, ledger: Option<&dyn LedgerClient>, amounts: &[i64]) -> i64 {
        let goal = amounts.iter().sum();
        let campaign = r.create_campaign(&campaign_with(goal, amounts)).await.unwrap();
        let proposal = r.submit_for_review(campaign.id, OWNER).await.unwrap();
        let report = r.submit_vote(ledger, proposal.id, &approve("V1")).await.unwrap();
        assert_eq!(report.outcome.dao_status, DaoStatus::Approved);
        campaign.id
    }

    async fn deployed_campaign(r: &Reconciler, mock: &MockLedger, amounts: &[i64]) -> i64 {
        let id = approved_campaign(r, Some(mock), amounts).await;
        assert!(r.deploy_escrow(Some(mock), id).await.unwrap().is_synced());
        id
    }

    #[tokio::test]
    async fn campaign_creation_checks_milestone_sum() {
        let r = reconciler(db::test_pool().await);
        let ok = r
            .create_campaign(&campaign_with(10_000, &[3_000, 4_000, 3_000]))
            .await
            .unwrap();
        assert_eq!(ok.status, CampaignStatus::Draft);
        assert_eq!(db::get_milestones(r.pool(), ok.id).await.unwrap().len(), 3);

        let err = r
            .create_campaign(&campaign_with(10_000, &[3_000, 4_000]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ReconcilerError::Validation(ValidationError::MilestoneSumMismatch {
                goal: 10_000,
                sum: 7_000
            })
        ));

        let err = r.create_campaign(&campaign_with(10_000, &[])).await.unwrap_err();
        assert!(matches!(
            err,
            ReconcilerError::Validation(ValidationError::NoMilestones)
        ));
    }

    #[tokio::test]
    async fn only_owner_submits_and_cancels() {
        let r = reconciler(db::test_pool().await);
        let c = r.create_campaign(&campaign_with(100, &[100])).await.unwrap();
        assert!(matches!(
            r.submit_for_review(c.id, "GSTRANGER").await.unwrap_err(),
            ReconcilerError::Validation(ValidationError::NotOwner)
        ));

        let proposal = r.submit_for_review(c.id, OWNER).await.unwrap();
        let cancelled = r.cancel_campaign(c.id, OWNER).await.unwrap();
        assert_eq!(cancelled.status, CampaignStatus::Cancelled);

        let view = governance::proposal_view(r.pool(), proposal.id).await.unwrap();
        assert_eq!(view.proposal.dao_status, DaoStatus::Rejected);
    }

    #[tokio::test]
    async fn tie_then_majority_activates_campaign() {
        let r = reconciler(db::test_pool().await);
        let mock = MockLedger::default();
        let c2 = r.create_campaign(&campaign_with(100, &[100])).await.unwrap();
        let p2 = r.submit_for_review(c2.id, OWNER).await.unwrap();
        let reject = NewVote {
            validator: "V2".to_string(),
            decision: VoteDecision::Reject,
            comment: Some("needs budget detail".to_string()),
        };
        // With quorum 1 a lone approval would decide, so seed it directly.
        db::insert_vote(r.pool(), p2.id, &approve("V1"), 0).await.unwrap();
        let tie = r.submit_vote(Some(&mock), p2.id, &reject).await.unwrap();
        assert_eq!(tie.outcome.dao_status, DaoStatus::PendingVote);
        assert_eq!(tie.activation, None);

        let decided = r.submit_vote(Some(&mock), p2.id, &approve("V3")).await.unwrap();
        assert_eq!(decided.outcome.dao_status, DaoStatus::Approved);
        assert_eq!(decided.activation, Some(LedgerSyncStatus::Pending));

        let campaign = db::get_campaign(r.pool(), c2.id).await.unwrap().unwrap();
        assert_eq!(campaign.status, CampaignStatus::Active);
        assert_eq!(campaign.ledger_sync_status, LedgerSyncStatus::Pending);
    }

    #[tokio::test]
    async fn approval_without_client_is_explicit() {
        let r = reconciler(db::test_pool().await);
        let id = approved_campaign(&r, None, &[100]).await;
        let campaign = db::get_campaign(r.pool(), id).await.unwrap().unwrap();
        assert_eq!(campaign.status, CampaignStatus::Active);
        assert_eq!(campaign.ledger_sync_status, LedgerSyncStatus::NoClient);
        assert_eq!(r.deploy_escrow(None, id).await.unwrap(), SyncOutcome::NoClient);
    }

    #[tokio::test]
    async fn failed_deploy_is_retried_exactly_once() {
        let r = reconciler(db::test_pool().await);
        let mock = MockLedger::default();
        let id = approved_campaign(&r, Some(&mock), &[3_000, 4_000, 3_000]).await;

        mock.fail_next(LedgerOp::Deploy, LedgerError::Network("connection reset".into()));
        let outcome = r.deploy_escrow(Some(&mock), id).await.unwrap();
        assert!(matches!(outcome, SyncOutcome::Failed { .. }));

        let campaign = db::get_campaign(r.pool(), id).await.unwrap().unwrap();
        assert_eq!(campaign.status, CampaignStatus::Active);
        assert_eq!(campaign.ledger_sync_status, LedgerSyncStatus::Failed);
        assert_eq!(campaign.deploy_attempts, 1);
        assert_eq!(mock.escrow_count(), 0);

        let retried = r.retry_failed_deploys(Some(&mock)).await.unwrap();
        assert_eq!(retried, vec![(id, SyncOutcome::Synced(id))]);

        // Nothing left to retry, and a direct re-deploy is a no-op.
        assert!(r.retry_failed_deploys(Some(&mock)).await.unwrap().is_empty());
        assert!(r.deploy_escrow(Some(&mock), id).await.unwrap().is_synced());

        let campaign = db::get_campaign(r.pool(), id).await.unwrap().unwrap();
        assert_eq!(campaign.ledger_sync_status, LedgerSyncStatus::Synced);
        assert_eq!(campaign.ledger_campaign_id, Some(id));
        assert!(campaign.ledger_tx_hash.is_some());
        assert_eq!(mock.escrow_count(), 1);
    }

    #[tokio::test]
    async fn existing_escrow_is_adopted() {
        let r = reconciler(db::test_pool().await);
        let mock = MockLedger::default();
        let id = approved_campaign(&r, Some(&mock), &[100]).await;
        mock.deploy(&DeployRequest {
            campaign_id: id as u64,
            owner: OWNER.to_string(),
            goal: 100,
            milestones: vec![100],
        })
        .await
        .unwrap();

        assert_eq!(
            r.deploy_escrow(Some(&mock), id).await.unwrap(),
            SyncOutcome::Synced(id)
        );
        assert_eq!(mock.escrow_count(), 1);
    }

    #[tokio::test]
    async fn deploy_timeout_is_pending_then_adopted() {
        let r = reconciler(db::test_pool().await);
        let mock = MockLedger::default();
        let id = approved_campaign(&r, Some(&mock), &[100]).await;

        mock.stall_confirmations(true);
        let outcome = r.deploy_escrow(Some(&mock), id).await.unwrap();
        let SyncOutcome::Pending { tx_hash: Some(tx_hash) } = outcome else {
            panic!("expected pending, got {outcome:?}");
        };
        let campaign = db::get_campaign(r.pool(), id).await.unwrap().unwrap();
        assert_eq!(campaign.ledger_sync_status, LedgerSyncStatus::Pending);
        assert_eq!(campaign.ledger_tx_hash.as_deref(), Some(tx_hash.as_str()));

        mock.stall_confirmations(false);
        let retried = r.retry_failed_deploys(Some(&mock)).await.unwrap();
        assert_eq!(retried, vec![(id, SyncOutcome::Synced(id))]);
        assert_eq!(mock.escrow_count(), 1);
        let campaign = db::get_campaign(r.pool(), id).await.unwrap().unwrap();
        assert_eq!(campaign.ledger_tx_hash.as_deref(), Some(tx_hash.as_str()));
    }

    #[tokio::test]
    async fn ledger_contribution_uses_ledger_total() {
        let r = reconciler(db::test_pool().await);
        let mock = MockLedger::default();
        let id = deployed_campaign(&r, &mock, &[3_000, 4_000, 3_000]).await;

        let report = r
            .contribute(Some(&mock), id, &contribution("GINVESTOR", 2_000))
            .await
            .unwrap();
        assert_eq!(report.ledger, SyncOutcome::Synced(2_000));
        assert_eq!(
            report.contribution.ledger_sync_status,
            ContributionSyncStatus::Confirmed
        );
        assert!(report.contribution.ledger_tx_hash.is_some());

        let campaign = db::get_campaign(r.pool(), id).await.unwrap().unwrap();
        assert_eq!(campaign.funds_raised, 2_000);
        assert_eq!(campaign.ledger_funded, 2_000);

        let snap = mock.escrow(id as u64).await.unwrap().unwrap();
        assert_eq!(
            escrow_rules::share_bps(snap.total_shares as i128, snap.goal as i128),
            2_000
        );
    }

    #[tokio::test]
    async fn failed_ledger_contribution_falls_back_to_store() {
        let r = reconciler(db::test_pool().await);
        let mock = MockLedger::default();
        let id = deployed_campaign(&r, &mock, &[10_000]).await;

        mock.fail_next(
            LedgerOp::Contribute,
            LedgerError::Unauthorized("contributor signature rejected".into()),
        );
        let report = r
            .contribute(Some(&mock), id, &contribution("GINVESTOR", 1_500))
            .await
            .unwrap();
        assert!(matches!(report.ledger, SyncOutcome::Failed { .. }));
        assert_eq!(
            report.contribution.ledger_sync_status,
            ContributionSyncStatus::Unsynced
        );
        assert_eq!(report.contribution.ledger_tx_hash, None);

        let campaign = db::get_campaign(r.pool(), id).await.unwrap().unwrap();
        assert_eq!(campaign.funds_raised, 1_500);
        assert_eq!(campaign.ledger_funded, 0);
    }

    #[tokio::test]
    async fn contribution_without_client_is_store_only() {
        let r = reconciler(db::test_pool().await);
        let id = approved_campaign(&r, None, &[1_000]).await;
        let report = r
            .contribute(None, id, &contribution("GINVESTOR", 400))
            .await
            .unwrap();
        assert_eq!(report.ledger, SyncOutcome::NoClient);
        assert_eq!(
            report.contribution.ledger_sync_status,
            ContributionSyncStatus::Unsynced
        );
    }

    #[tokio::test]
    async fn contribution_validation() {
        let r = reconciler(db::test_pool().await);
        let id = approved_campaign(&r, None, &[1_000]).await;

        let err = r.contribute(None, id, &contribution(OWNER, 10)).await.unwrap_err();
        assert!(matches!(
            err,
            ReconcilerError::Validation(ValidationError::SelfContribution)
        ));
        let err = r
            .contribute(None, id, &contribution("GINVESTOR", 0))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ReconcilerError::Validation(ValidationError::NonPositiveAmount)
        ));

        r.contribute(None, id, &contribution("GINVESTOR", 900))
            .await
            .unwrap();
        let err = r
            .contribute(None, id, &contribution("GOTHER", 200))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ReconcilerError::Validation(ValidationError::ExceedsRemainingGoal {
                amount: 200,
                remaining: 100
            })
        ));
    }

    #[tokio::test]
    async fn pending_contribution_converges_once_via_event() {
        let r = reconciler(db::test_pool().await);
        let mock = MockLedger::default();
        let id = deployed_campaign(&r, &mock, &[10_000]).await;

        mock.stall_confirmations(true);
        let report = r
            .contribute(Some(&mock), id, &contribution("GINVESTOR", 2_000))
            .await
            .unwrap();
        let SyncOutcome::Pending { tx_hash: Some(tx_hash) } = report.ledger else {
            panic!("expected pending");
        };
        let campaign = db::get_campaign(r.pool(), id).await.unwrap().unwrap();
        assert_eq!(campaign.funds_raised, 0);

        let event = mock
            .emitted()
            .into_iter()
            .find(|e| e.tx_hash == tx_hash)
            .unwrap();
        assert_eq!(r.apply_event(&event).await.unwrap(), Applied::Applied);
        assert_eq!(r.apply_event(&event).await.unwrap(), Applied::Duplicate);

        let contributions = db::get_contributions(r.pool(), id).await.unwrap();
        assert_eq!(contributions.len(), 1);
        assert_eq!(
            contributions[0].ledger_sync_status,
            ContributionSyncStatus::Confirmed
        );
        let campaign = db::get_campaign(r.pool(), id).await.unwrap().unwrap();
        assert_eq!(campaign.funds_raised, 2_000);
    }

    type LedgerResult<T> = std::result::Result<T, LedgerError>;

    /// Delegates to the mock ledger, but confirmation always errors.
    struct UnreachableConfirm<'a>(&'a MockLedger);

    #[async_trait::async_trait]
    impl LedgerClient for UnreachableConfirm<'_> {
        async fn deploy(&self, req: &DeployRequest) -> LedgerResult<Submitted<EscrowSnapshot>> {
            self.0.deploy(req).await
        }
        async fn approve_spend(&self, contributor: &str, amount: i64) -> LedgerResult<Submitted<()>> {
            self.0.approve_spend(contributor, amount).await
        }
        async fn contribute(&self, req: &ContributeRequest) -> LedgerResult<Submitted<i64>> {
            self.0.contribute(req).await
        }
        async fn submit_evidence(
            &self,
            campaign_id: u64,
            index: u32,
            evidence_hash: [u8; 32],
        ) -> LedgerResult<Submitted<()>> {
            self.0.submit_evidence(campaign_id, index, evidence_hash).await
        }
        async fn release_milestone(
            &self,
            campaign_id: u64,
            index: u32,
        ) -> LedgerResult<Submitted<ReleaseReceipt>> {
            self.0.release_milestone(campaign_id, index).await
        }
        async fn confirm(&self, _tx_hash: &str) -> LedgerResult<Confirmation> {
            Err(LedgerError::Network("rpc unreachable".into()))
        }
        async fn escrow(&self, campaign_id: u64) -> LedgerResult<Option<EscrowSnapshot>> {
            self.0.escrow(campaign_id).await
        }
        async fn events(&self, cursor: &EventCursor, limit: u32) -> LedgerResult<EventPage> {
            self.0.events(cursor, limit).await
        }
    }

    async fn replay_ledger_events(r: &Reconciler, mock: &MockLedger) {
        for event in mock.emitted() {
            r.apply_event(&event).await.unwrap();
        }
    }

    #[tokio::test]
    async fn unconfirmed_contribution_is_not_counted_twice() {
        let r = reconciler(db::test_pool().await);
        let mock = MockLedger::default();
        let id = deployed_campaign(&r, &mock, &[10_000]).await;

        let client = UnreachableConfirm(&mock);
        let report = r
            .contribute(Some(&client), id, &contribution("GINVESTOR", 2_000))
            .await
            .unwrap();
        let SyncOutcome::Pending { tx_hash: Some(tx_hash) } = report.ledger else {
            panic!("expected pending, got {:?}", report.ledger);
        };
        assert_eq!(
            report.contribution.ledger_sync_status,
            ContributionSyncStatus::Pending
        );
        assert_eq!(report.contribution.ledger_tx_hash.as_deref(), Some(tx_hash.as_str()));
        assert_eq!(db::get_campaign(r.pool(), id).await.unwrap().unwrap().funds_raised, 0);

        replay_ledger_events(&r, &mock).await;

        let ledger_funded = mock.escrow(id as u64).await.unwrap().unwrap().funded;
        let campaign = db::get_campaign(r.pool(), id).await.unwrap().unwrap();
        assert_eq!(ledger_funded, 2_000);
        assert_eq!(campaign.funds_raised, ledger_funded);
        let contributions = db::get_contributions(r.pool(), id).await.unwrap();
        assert_eq!(contributions.len(), 1);
        assert_eq!(
            contributions[0].ledger_sync_status,
            ContributionSyncStatus::Confirmed
        );
    }

    #[tokio::test]
    async fn submit_timeout_is_pending_and_claimed_by_event() {
        let r = reconciler(db::test_pool().await);
        let mock = MockLedger::default();
        let id = deployed_campaign(&r, &mock, &[10_000]).await;

        mock.fail_next(LedgerOp::Contribute, LedgerError::Timeout);
        let report = r
            .contribute(Some(&mock), id, &contribution("GINVESTOR", 1_000))
            .await
            .unwrap();
        assert_eq!(report.ledger, SyncOutcome::Pending { tx_hash: None });
        assert_eq!(report.contribution.ledger_tx_hash, None);

        // The transaction landed after all.
        mock.approve_spend("GINVESTOR", 1_000).await.unwrap();
        mock.contribute(&ContributeRequest {
            campaign_id: id as u64,
            contributor: "GINVESTOR".to_string(),
            amount: 1_000,
        })
        .await
        .unwrap();
        replay_ledger_events(&r, &mock).await;

        let contributions = db::get_contributions(r.pool(), id).await.unwrap();
        assert_eq!(contributions.len(), 1);
        assert_eq!(contributions[0].id, report.contribution.id);
        assert!(contributions[0].ledger_tx_hash.is_some());
        assert_eq!(
            contributions[0].ledger_sync_status,
            ContributionSyncStatus::Confirmed
        );
        assert_eq!(db::get_campaign(r.pool(), id).await.unwrap().unwrap().funds_raised, 1_000);
    }

    #[tokio::test]
    async fn store_only_contribution_is_upgraded_by_matching_event() {
        let r = reconciler(db::test_pool().await);
        let mock = MockLedger::default();
        let id = deployed_campaign(&r, &mock, &[10_000]).await;

        r.contribute(None, id, &contribution("GINVESTOR", 600))
            .await
            .unwrap();
        assert_eq!(db::get_campaign(r.pool(), id).await.unwrap().unwrap().funds_raised, 600);

        mock.approve_spend("GINVESTOR", 600).await.unwrap();
        mock.contribute(&ContributeRequest {
            campaign_id: id as u64,
            contributor: "GINVESTOR".to_string(),
            amount: 600,
        })
        .await
        .unwrap();
        replay_ledger_events(&r, &mock).await;
        replay_ledger_events(&r, &mock).await;

        let contributions = db::get_contributions(r.pool(), id).await.unwrap();
        assert_eq!(contributions.len(), 1);
        assert_eq!(
            contributions[0].ledger_sync_status,
            ContributionSyncStatus::Confirmed
        );
        let campaign = db::get_campaign(r.pool(), id).await.unwrap().unwrap();
        assert_eq!(campaign.funds_raised, 600);
        assert_eq!(campaign.ledger_funded, 600);
    }

    #[tokio::test]
    async fn external_contribution_event_is_recorded() {
        let r = reconciler(db::test_pool().await);
        let mock = MockLedger::default();
        let id = deployed_campaign(&r, &mock, &[10_000]).await;

        mock.approve_spend("GWALLET", 700).await.unwrap();
        mock.contribute(&ContributeRequest {
            campaign_id: id as u64,
            contributor: "GWALLET".to_string(),
            amount: 700,
        })
        .await
        .unwrap();

        let page = mock.events(&EventCursor::default(), 100).await.unwrap();
        for event in &page.events {
            r.apply_event(event).await.unwrap();
        }
        let contributions = db::get_contributions(r.pool(), id).await.unwrap();
        assert_eq!(contributions.len(), 1);
        assert_eq!(contributions[0].contributor, "GWALLET");
        let campaign = db::get_campaign(r.pool(), id).await.unwrap().unwrap();
        assert_eq!(campaign.funds_raised, 700);
    }

    #[tokio::test]
    async fn milestone_release_is_ordered_and_fee_split() {
        let r = reconciler(db::test_pool().await);
        let mock = MockLedger::new(250);
        let id = deployed_campaign(&r, &mock, &[3_000, 4_000, 3_000]).await;
        r.contribute(Some(&mock), id, &contribution("GINVESTOR", 10_000))
            .await
            .unwrap();

        let err = r.release_milestone(Some(&mock), id, 0).await.unwrap_err();
        assert!(matches!(
            err,
            ReconcilerError::Validation(ValidationError::MissingEvidence { index: 0 })
        ));

        for index in 0..2 {
            let report = r
                .submit_evidence(Some(&mock), id, index, &format!("ipfs://evidence-{index}"))
                .await
                .unwrap();
            assert_eq!(report.milestone.status, MilestoneStatus::EvidenceSubmitted);
            assert!(report.ledger.is_synced());
        }
        let err = r.release_milestone(Some(&mock), id, 0).await.unwrap_err();
        assert!(matches!(
            err,
            ReconcilerError::Validation(ValidationError::MilestoneNotApproved { index: 0 })
        ));

        r.approve_milestone(id, 0).await.unwrap();
        r.approve_milestone(id, 1).await.unwrap();
        let err = r.release_milestone(Some(&mock), id, 1).await.unwrap_err();
        assert!(matches!(
            err,
            ReconcilerError::Validation(ValidationError::OutOfOrderRelease {
                requested: 1,
                expected: 0
            })
        ));

        let report = r.release_milestone(Some(&mock), id, 0).await.unwrap();
        let SyncOutcome::Synced(receipt) = report.ledger else {
            panic!("expected synced release");
        };
        assert_eq!((receipt.fee, receipt.researcher_amount), (75, 2_925));
        assert_eq!(report.milestone.status, MilestoneStatus::Released);
        assert_eq!(report.milestone.platform_fee, Some(75));
        assert_eq!(report.milestone.researcher_amount, Some(2_925));

        let err = r.release_milestone(Some(&mock), id, 0).await.unwrap_err();
        assert!(matches!(
            err,
            ReconcilerError::Validation(ValidationError::MilestoneAlreadyReleased { index: 0 })
        ));
    }

    #[tokio::test]
    async fn failed_release_keeps_approval() {
        let r = reconciler(db::test_pool().await);
        let mock = MockLedger::default();
        let id = deployed_campaign(&r, &mock, &[1_000]).await;
        r.contribute(Some(&mock), id, &contribution("GINVESTOR", 1_000))
            .await
            .unwrap();
        r.submit_evidence(Some(&mock), id, 0, "ipfs://report").await.unwrap();
        r.approve_milestone(id, 0).await.unwrap();

        mock.fail_next(LedgerOp::Release, LedgerError::Timeout);
        let report = r.release_milestone(Some(&mock), id, 0).await.unwrap();
        assert!(matches!(report.ledger, SyncOutcome::Failed { .. }));
        assert_eq!(report.milestone.status, MilestoneStatus::Approved);
        assert_eq!(report.milestone.ledger_sync_status, LedgerSyncStatus::Failed);

        let report = r.release_milestone(Some(&mock), id, 0).await.unwrap();
        assert!(report.ledger.is_synced());
        let campaign = db::get_campaign(r.pool(), id).await.unwrap().unwrap();
        assert_eq!(campaign.status, CampaignStatus::Completed);
    }

    #[tokio::test]
    async fn out_of_order_release_event_is_deferred() {
        let r = reconciler(db::test_pool().await);
        let id = approved_campaign(&r, None, &[3_000, 4_000, 3_000]).await;

        let release = |index: u32, amount: i64, tx: &str| EventEnvelope {
            tx_hash: tx.to_string(),
            ledger: 10,
            event: LedgerEvent::MilestoneReleased {
                campaign_id: id as u64,
                index,
                amount,
                fee: amount / 40,
                researcher_amount: amount - amount / 40,
            },
        };

        assert_eq!(
            r.apply_event(&release(1, 4_000, "tx-b")).await.unwrap(),
            Applied::Deferred
        );
        assert_eq!(
            r.apply_event(&release(0, 3_000, "tx-a")).await.unwrap(),
            Applied::Applied
        );
        assert_eq!(
            r.apply_event(&release(1, 4_000, "tx-b")).await.unwrap(),
            Applied::Applied
        );
        assert_eq!(db::count_released(r.pool(), id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn release_event_with_wrong_amount_is_a_consistency_error() {
        let r = reconciler(db::test_pool().await);
        let id = approved_campaign(&r, None, &[3_000, 7_000]).await;
        let event = EventEnvelope {
            tx_hash: "tx".to_string(),
            ledger: 1,
            event: LedgerEvent::MilestoneReleased {
                campaign_id: id as u64,
                index: 0,
                amount: 5_000,
                fee: 0,
                researcher_amount: 5_000,
            },
        };
        assert!(matches!(
            r.apply_event(&event).await.unwrap_err(),
            ReconcilerError::Consistency(_)
        ));
    }
}
