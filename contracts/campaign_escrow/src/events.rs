//! # Events
//!
//! Every state-changing entry point publishes exactly one event. Topics are
//! `(symbol, campaign_id)`; the data payload is one of the structs below.
//! The off-chain reconciler keys its idempotent handlers on the transaction
//! hash of these events.
//!
//! | Topic       | Data                    |
//! |-------------|-------------------------|
//! | `created`   | [`EscrowCreated`]       |
//! | `funded`    | [`ContributionReceived`]|
//! | `evidence`  | [`EvidenceSubmitted`]   |
//! | `released`  | [`MilestoneReleased`]   |

use soroban_sdk::{contracttype, symbol_short, Address, BytesN, Env};

#[contracttype]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EscrowCreated {
    pub campaign_id: u64,
    pub owner: Address,
    pub goal: i128,
    pub milestones_total: u32,
}

#[contracttype]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ContributionReceived {
    pub campaign_id: u64,
    pub contributor: Address,
    pub amount: i128,
    /// Escrow funded total after this contribution.
    pub funded: i128,
}

#[contracttype]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EvidenceSubmitted {
    pub campaign_id: u64,
    pub index: u32,
    pub evidence_hash: BytesN<32>,
}

#[contracttype]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MilestoneReleased {
    pub campaign_id: u64,
    pub index: u32,
    pub amount: i128,
    pub fee: i128,
    pub researcher_amount: i128,
}

pub fn escrow_created(env: &Env, data: EscrowCreated) {
    env.events()
        .publish((symbol_short!("created"), data.campaign_id), data);
}

pub fn contribution_received(env: &Env, data: ContributionReceived) {
    env.events()
        .publish((symbol_short!("funded"), data.campaign_id), data);
}

pub fn evidence_submitted(env: &Env, data: EvidenceSubmitted) {
    env.events()
        .publish((symbol_short!("evidence"), data.campaign_id), data);
}

pub fn milestone_released(env: &Env, data: MilestoneReleased) {
    env.events()
        .publish((symbol_short!("released"), data.campaign_id), data);
}
