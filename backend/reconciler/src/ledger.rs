//! # Ledger Client
//!
//! Statically typed access to the campaign escrow contract.
//!
//! ```text
//! Reconciler ──► dyn LedgerClient ──┬─► SorobanLedger (stellar CLI + JSON-RPC)
//!                                   └─► MockLedger    (in-memory escrow book)
//! ```
//!
//! Every write returns a [`Submitted`] handle carrying the transaction hash
//! and the call's typed return value. [`LedgerClient::confirm`] is the
//! receipt-wait primitive; callers bound it with their own timeout and treat
//! an elapsed wait as indeterminate, not as failure.
//!
//! Implementations make a single attempt per call and do not retry; retry
//! policy belongs to the reconciler.

use async_trait::async_trait;
use escrow_rules::Violation;
use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::events::EventEnvelope;

/// Contract error codes that are not accounting violations.
pub const ESCROW_NOT_FOUND: u32 = 1;
pub const NOT_AUTHORIZED: u32 = 6;
pub const ALREADY_DEPLOYED: u32 = 9;

// ════════════════════════════════════════════════════════════════════════════════
// ERROR
// ════════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("ledger network error: {0}")]
    Network(String),

    #[error("ledger call timed out")]
    Timeout,

    #[error("ledger reverted (code {code:?}): {message}")]
    Reverted { code: Option<u32>, message: String },

    #[error("ledger authorization failed: {0}")]
    Unauthorized(String),

    #[error("could not decode ledger response: {0}")]
    Decode(String),
}

impl LedgerError {
    pub fn reverted(v: Violation) -> Self {
        Self::Reverted {
            code: Some(v.code()),
            message: v.describe().to_string(),
        }
    }

    pub fn from_code(code: u32) -> Self {
        match code {
            NOT_AUTHORIZED => Self::Unauthorized("caller lacks the required role".to_string()),
            ESCROW_NOT_FOUND => Self::Reverted {
                code: Some(code),
                message: "escrow not found".to_string(),
            },
            ALREADY_DEPLOYED => Self::Reverted {
                code: Some(code),
                message: "escrow already deployed".to_string(),
            },
            _ => match Violation::from_code(code) {
                Some(v) => Self::reverted(v),
                None => Self::Reverted {
                    code: Some(code),
                    message: format!("contract error #{code}"),
                },
            },
        }
    }

    /// The accounting rule behind a revert, if any.
    pub fn violation(&self) -> Option<Violation> {
        match self {
            Self::Reverted { code: Some(c), .. } => Violation::from_code(*c),
            _ => None,
        }
    }

    /// Transient failures where a later identical attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout)
    }

    /// The ledger definitely rejected the call, so nothing was applied.
    /// Any other error may have happened after the transaction was broadcast.
    pub fn is_definite(&self) -> bool {
        matches!(self, Self::Reverted { .. } | Self::Unauthorized(_))
    }

    pub fn is_already_deployed(&self) -> bool {
        matches!(self, Self::Reverted { code: Some(ALREADY_DEPLOYED), .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Reverted { code: Some(ESCROW_NOT_FOUND), .. })
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// REQUESTS / RESPONSES
// ════════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployRequest {
    pub campaign_id: u64,
    pub owner: String,
    pub goal: i64,
    pub milestones: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContributeRequest {
    pub campaign_id: u64,
    pub contributor: String,
    pub amount: i64,
}

/// A transaction accepted by the ledger, with the call's return value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submitted<T> {
    pub tx_hash: String,
    pub value: T,
}

/// Receipt of a confirmed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Confirmation {
    pub ledger: i64,
}

/// Authoritative escrow totals as read from the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowSnapshot {
    pub campaign_id: u64,
    pub owner: String,
    #[serde(deserialize_with = "de_amount")]
    pub goal: i64,
    #[serde(deserialize_with = "de_amount")]
    pub funded: i64,
    pub investor_count: u32,
    pub milestones_total: u32,
    pub milestones_released: u32,
    #[serde(deserialize_with = "de_amount")]
    pub released_amount: i64,
    #[serde(deserialize_with = "de_amount")]
    pub total_shares: i64,
    pub completed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseReceipt {
    pub index: u32,
    #[serde(deserialize_with = "de_amount")]
    pub amount: i64,
    #[serde(deserialize_with = "de_amount")]
    pub fee: i64,
    #[serde(deserialize_with = "de_amount")]
    pub researcher_amount: i64,
}

/// Where to resume reading events.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventCursor {
    pub start_ledger: u32,
    /// Opaque pagination cursor from a previous page.
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct EventPage {
    pub events: Vec<EventEnvelope>,
    pub next_cursor: Option<String>,
    pub latest_ledger: Option<u64>,
}

// ════════════════════════════════════════════════════════════════════════════════
// CLIENT TRAIT
// ════════════════════════════════════════════════════════════════════════════════

#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Create the escrow for a campaign. Fails with `AlreadyDeployed` if the
    /// campaign id already has one.
    async fn deploy(&self, req: &DeployRequest) -> Result<Submitted<EscrowSnapshot>, LedgerError>;

    /// Authorize the escrow to pull `amount` from the contributor.
    async fn approve_spend(&self, contributor: &str, amount: i64) -> Result<Submitted<()>, LedgerError>;

    /// Contribute to an escrow. Returns the escrow's new funded total.
    async fn contribute(&self, req: &ContributeRequest) -> Result<Submitted<i64>, LedgerError>;

    async fn submit_evidence(
        &self,
        campaign_id: u64,
        index: u32,
        evidence_hash: [u8; 32],
    ) -> Result<Submitted<()>, LedgerError>;

    async fn release_milestone(
        &self,
        campaign_id: u64,
        index: u32,
    ) -> Result<Submitted<ReleaseReceipt>, LedgerError>;

    /// Wait until `tx_hash` is confirmed. May wait indefinitely.
    async fn confirm(&self, tx_hash: &str) -> Result<Confirmation, LedgerError>;

    /// Read an escrow; `None` when the campaign has no escrow.
    async fn escrow(&self, campaign_id: u64) -> Result<Option<EscrowSnapshot>, LedgerError>;

    /// Fetch the next page of escrow events.
    async fn events(&self, cursor: &EventCursor, limit: u32) -> Result<EventPage, LedgerError>;
}

/// 32-byte digest recorded on the ledger for a piece of milestone evidence.
pub fn evidence_digest(evidence_ref: &str) -> [u8; 32] {
    Sha256::digest(evidence_ref.as_bytes()).into()
}

/// Soroban renders `i128` as a JSON string; accept numbers too.
fn de_amount<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(i64),
        Str(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Num(n) => Ok(n),
        Raw::Str(s) => s.parse().map_err(serde::de::Error::custom),
    }
}
