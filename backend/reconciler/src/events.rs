//! Typed events emitted by the campaign escrow contract.
//!
//! These mirror the contract events defined in
//! `contracts/campaign_escrow/src/events.rs`.

use serde::{Deserialize, Serialize};

/// All recognised event kinds from the escrow contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// An escrow was deployed for a campaign (`created` topic).
    EscrowCreated,
    /// A contribution was accepted (`funded` topic).
    ContributionReceived,
    /// Milestone evidence was recorded (`evidence` topic).
    EvidenceSubmitted,
    /// A milestone was paid out (`released` topic).
    MilestoneReleased,
    /// An event from this contract that we don't recognise yet.
    Unknown,
}

impl EventKind {
    /// Parse the leading topic symbol produced by Soroban into an [`EventKind`].
    pub fn from_topic(topic: &str) -> Self {
        match topic {
            "created" => Self::EscrowCreated,
            "funded" => Self::ContributionReceived,
            "evidence" => Self::EvidenceSubmitted,
            "released" => Self::MilestoneReleased,
            _ => Self::Unknown,
        }
    }

    /// Short identifier string stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EscrowCreated => "escrow_created",
            Self::ContributionReceived => "contribution_received",
            Self::EvidenceSubmitted => "evidence_submitted",
            Self::MilestoneReleased => "milestone_released",
            Self::Unknown => "unknown",
        }
    }
}

/// A decoded escrow event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerEvent {
    EscrowCreated {
        campaign_id: u64,
        owner: String,
        goal: i64,
        milestones_total: u32,
    },
    ContributionReceived {
        campaign_id: u64,
        contributor: String,
        amount: i64,
        /// Escrow funded total after this contribution.
        funded: i64,
    },
    EvidenceSubmitted {
        campaign_id: u64,
        index: u32,
    },
    MilestoneReleased {
        campaign_id: u64,
        index: u32,
        amount: i64,
        fee: i64,
        researcher_amount: i64,
    },
}

impl LedgerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::EscrowCreated { .. } => EventKind::EscrowCreated,
            Self::ContributionReceived { .. } => EventKind::ContributionReceived,
            Self::EvidenceSubmitted { .. } => EventKind::EvidenceSubmitted,
            Self::MilestoneReleased { .. } => EventKind::MilestoneReleased,
        }
    }

    pub fn campaign_id(&self) -> u64 {
        match self {
            Self::EscrowCreated { campaign_id, .. }
            | Self::ContributionReceived { campaign_id, .. }
            | Self::EvidenceSubmitted { campaign_id, .. }
            | Self::MilestoneReleased { campaign_id, .. } => *campaign_id,
        }
    }

    /// Address most associated with the event, for the audit log.
    pub fn actor(&self) -> Option<&str> {
        match self {
            Self::EscrowCreated { owner, .. } => Some(owner),
            Self::ContributionReceived { contributor, .. } => Some(contributor),
            _ => None,
        }
    }

    pub fn amount(&self) -> Option<i64> {
        match self {
            Self::EscrowCreated { goal, .. } => Some(*goal),
            Self::ContributionReceived { amount, .. } | Self::MilestoneReleased { amount, .. } => {
                Some(*amount)
            }
            Self::EvidenceSubmitted { .. } => None,
        }
    }
}

/// An event together with the transaction that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub tx_hash: String,
    pub ledger: i64,
    pub event: LedgerEvent,
}

/// A raw event record as stored in / read from the database.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct EventRecord {
    pub id: i64,
    pub event_type: String,
    pub campaign_id: Option<i64>,
    pub actor: Option<String>,
    pub amount: Option<i64>,
    pub ledger: i64,
    pub tx_hash: String,
    pub created_at: i64,
}
