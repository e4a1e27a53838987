//! Off-chain store records and their status enums.
//!
//! Every record that carries economic effect has two independent status
//! fields: the platform state (`status`, `dao_status`) and the ledger
//! security state (`ledger_sync_status`). A degraded ledger path therefore
//! shows up as a sync status, never as a different platform state.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    PendingReview,
    Active,
    Completed,
    Cancelled,
    Rejected,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::PendingReview => "pending_review",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Rejected => "rejected",
        }
    }
}

/// Ledger security state of a campaign escrow or a milestone release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum LedgerSyncStatus {
    /// Nothing has been attempted on the ledger yet.
    Unsynced,
    /// Submitted; confirmation outstanding or indeterminate.
    Pending,
    Synced,
    Failed,
    /// No ledger client was available when the action ran.
    NoClient,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ContributionSyncStatus {
    /// Submitted to the ledger; waiting for the confirming event.
    Pending,
    Confirmed,
    /// Recorded off-chain only; not ledger-secured.
    Unsynced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum MilestoneStatus {
    Pending,
    EvidenceSubmitted,
    Approved,
    Released,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum DaoStatus {
    PendingVote,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum VoteDecision {
    Approve,
    Reject,
}

// ─────────────────────────────────────────────────────────
// Records
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Campaign {
    pub id: i64,
    pub owner: String,
    pub title: String,
    pub funding_goal: i64,
    /// `ledger_funded` plus every unsynced contribution.
    pub funds_raised: i64,
    /// Last funded total confirmed by the ledger.
    pub ledger_funded: i64,
    pub status: CampaignStatus,
    pub ledger_campaign_id: Option<i64>,
    pub ledger_tx_hash: Option<String>,
    pub ledger_sync_status: LedgerSyncStatus,
    pub deploy_attempts: i64,
    pub last_ledger_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Campaign {
    pub fn remaining_goal(&self) -> i64 {
        (self.funding_goal - self.funds_raised).max(0)
    }

    /// The escrow id on the ledger, once the deployment is confirmed.
    pub fn linked_escrow(&self) -> Option<u64> {
        match self.ledger_sync_status {
            LedgerSyncStatus::Synced => self.ledger_campaign_id.map(|id| id as u64),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Milestone {
    pub id: i64,
    pub campaign_id: i64,
    #[sqlx(rename = "idx")]
    pub index: i64,
    pub description: String,
    pub funding_amount: i64,
    pub status: MilestoneStatus,
    pub target_date: Option<i64>,
    pub evidence_ref: Option<String>,
    pub ledger_sync_status: LedgerSyncStatus,
    pub release_tx_hash: Option<String>,
    pub platform_fee: Option<i64>,
    pub researcher_amount: Option<i64>,
    pub released_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Contribution {
    pub id: i64,
    pub campaign_id: i64,
    pub contributor: String,
    pub amount: i64,
    pub ledger_tx_hash: Option<String>,
    pub ledger_sync_status: ContributionSyncStatus,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Proposal {
    pub id: i64,
    pub campaign_id: i64,
    pub dao_status: DaoStatus,
    pub created_at: i64,
    pub decided_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Vote {
    pub id: i64,
    pub proposal_id: i64,
    pub validator: String,
    pub decision: VoteDecision,
    pub comment: Option<String>,
    pub created_at: i64,
}

// ─────────────────────────────────────────────────────────
// Inputs
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct NewMilestone {
    pub description: String,
    pub funding_amount: i64,
    #[serde(default)]
    pub target_date: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewCampaign {
    pub owner: String,
    pub title: String,
    pub funding_goal: i64,
    pub milestones: Vec<NewMilestone>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewVote {
    pub validator: String,
    pub decision: VoteDecision,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewContribution {
    pub contributor: String,
    pub amount: i64,
}

pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}
