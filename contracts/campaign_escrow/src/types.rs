//! # Types
//!
//! Shared data structures used across all modules of the escrow contract.
//!
//! ## Design decisions
//!
//! ### Config / State split
//!
//! An escrow is internally stored as two separate ledger entries:
//!
//! - [`EscrowConfig`]: written once at deployment; never mutated. Holds the
//!   milestone schedule, so the schedule is immutable by construction.
//! - [`EscrowState`]: written on every contribution and every release.
//!
//! The public API exposes the reconstructed [`Escrow`] struct for convenience.
//!
//! ### Release progress as a counter
//!
//! Released milestones always form a prefix `0..milestones_released` of the
//! schedule, so a single counter is enough to describe release progress:
//!
//! ```text
//! released = 0 ──► 1 ──► 2 ──► … ──► total  (completed)
//! ```

use soroban_sdk::{contracttype, Address, Vec};

/// Platform-wide settings, written once by `init`.
#[contracttype]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PlatformConfig {
    /// Governance-controlled identity allowed to deploy escrows.
    pub deployer: Address,
    /// Governance/owner-authorized identity allowed to release milestones.
    pub releaser: Address,
    /// Receives the platform fee of every release.
    pub fee_recipient: Address,
    /// Funding asset accepted by every escrow.
    pub token: Address,
    /// Platform fee in basis points.
    pub fee_bps: u32,
}

/// Immutable escrow configuration, written once at deployment.
#[contracttype]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EscrowConfig {
    pub campaign_id: u64,
    pub owner: Address,
    pub goal: i128,
    pub milestones: Vec<i128>,
}

/// Mutable escrow state, updated on contributions and releases.
#[contracttype]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EscrowState {
    pub funded: i128,
    pub investor_count: u32,
    pub milestones_released: u32,
    pub released_amount: i128,
    pub total_shares: i128,
    pub completed: bool,
}

/// Full on-chain representation of a campaign escrow.
#[contracttype]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Escrow {
    /// Platform campaign identifier; one escrow per id.
    pub campaign_id: u64,
    /// Researcher who receives milestone payouts.
    pub owner: Address,
    /// Funding goal; equals the sum of the milestone amounts.
    pub goal: i128,
    /// Total contributed so far.
    pub funded: i128,
    /// Distinct contributors.
    pub investor_count: u32,
    pub milestones_total: u32,
    pub milestones_released: u32,
    /// Sum of the amounts of released milestones (fees included).
    pub released_amount: i128,
    /// Shares minted so far.
    pub total_shares: i128,
    /// Every milestone has been released.
    pub completed: bool,
}

/// Payout breakdown of a single milestone release.
#[contracttype]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MilestoneRelease {
    pub index: u32,
    pub amount: i128,
    pub fee: i128,
    pub researcher_amount: i128,
}
