//! Application-wide error types.

use thiserror::Error;

use crate::ledger::LedgerError;

#[derive(Debug, Error)]
pub enum ReconcilerError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// A store/ledger divergence that idempotency keys should have prevented.
    #[error("Consistency error: {0}")]
    Consistency(String),
}

/// Local, non-retryable rejections. These never reach the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("milestone amounts sum to {sum} but the funding goal is {goal}")]
    MilestoneSumMismatch { goal: i64, sum: i64 },

    #[error("a campaign needs at least one milestone")]
    NoMilestones,

    #[error("amount must be positive")]
    NonPositiveAmount,

    #[error("contribution of {amount} exceeds the remaining goal of {remaining}")]
    ExceedsRemainingGoal { amount: i64, remaining: i64 },

    #[error("campaign owner cannot contribute to their own campaign")]
    SelfContribution,

    #[error("validator {validator} has already voted on this proposal")]
    DuplicateVote { validator: String },

    #[error("proposal is closed")]
    ProposalClosed,

    #[error("milestone {requested} requested but milestone {expected} is next to release")]
    OutOfOrderRelease { requested: u32, expected: u32 },

    #[error("milestone {index} has no submitted evidence")]
    MissingEvidence { index: u32 },

    #[error("milestone {index} has not been approved")]
    MilestoneNotApproved { index: u32 },

    #[error("milestone {index} is already released")]
    MilestoneAlreadyReleased { index: u32 },

    #[error("campaign is {actual}, expected {expected}")]
    InvalidCampaignStatus {
        expected: &'static str,
        actual: String,
    },

    #[error("only the campaign owner may do this")]
    NotOwner,

    #[error("{0}")]
    Field(String),
}

impl ValidationError {
    /// Conflicts with already-persisted state rather than malformed input.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::DuplicateVote { .. } | Self::ProposalClosed | Self::MilestoneAlreadyReleased { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ReconcilerError>;
