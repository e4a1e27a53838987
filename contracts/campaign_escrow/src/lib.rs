//! # Campaign Escrow Contract
//!
//! Milestone-gated escrow for research campaigns. One contract instance holds
//! one escrow per platform campaign id; contributors receive shares
//! proportional to their contribution, and funds leave the escrow only as
//! milestones are released in order.
//!
//! | Phase        | Entry Point(s)                                   |
//! |--------------|--------------------------------------------------|
//! | Bootstrap    | [`CampaignEscrow::init`]                         |
//! | Deployment   | [`CampaignEscrow::deploy_campaign`]              |
//! | Funding      | [`CampaignEscrow::contribute`]                   |
//! | Milestones   | `submit_evidence`, `release_milestone`           |
//! | Queries      | `get_escrow`, `share_balance`, `share_bps`, …    |
//!
//! ## Architecture
//!
//! Accounting decisions are delegated to [`escrow_rules`], which the off-chain
//! reconciler evaluates too. Storage access is delegated to [`storage`] and
//! event emission to [`events`]. This file contains the entry points and the
//! authorization checks.

#![no_std]

use escrow_rules::Violation;
use soroban_sdk::{
    contract, contracterror, contractimpl, panic_with_error, token, Address, BytesN, Env, Vec,
};

pub mod events;
mod storage;
mod types;

#[cfg(test)]
mod invariants;
#[cfg(test)]
mod test;
#[cfg(test)]
mod test_events;

use storage::{
    has_escrow, has_platform, load_contribution, load_escrow_config,
    load_escrow_state, load_platform, load_shares, save_contribution, save_escrow_state,
    save_evidence, save_new_escrow, save_platform, save_shares, to_escrow,
};
pub use types::{Escrow, EscrowConfig, EscrowState, MilestoneRelease, PlatformConfig};

#[contracterror]
#[derive(Copy, Clone, Debug, Eq, PartialEq, PartialOrd, Ord)]
#[repr(u32)]
pub enum Error {
    EscrowNotFound           = 1,
    MilestoneNotFound        = 2,
    MilestoneAlreadyReleased = 3,
    InsufficientEscrow       = 4,
    InvalidMilestones        = 5,
    NotAuthorized            = 6,
    GoalMismatch             = 7,
    AlreadyInitialized       = 8,
    AlreadyDeployed          = 9,
    InvalidAmount            = 10,
    ExceedsGoal              = 11,
    SelfContribution         = 12,
    OutOfOrderRelease        = 13,
    EvidenceMissing          = 14,
    FeeTooHigh               = 15,
    NotInitialized           = 16,
    EscrowCompleted          = 17,
}

impl From<Violation> for Error {
    fn from(v: Violation) -> Self {
        match v {
            Violation::MilestoneNotFound => Error::MilestoneNotFound,
            Violation::MilestoneAlreadyReleased => Error::MilestoneAlreadyReleased,
            Violation::InsufficientEscrow => Error::InsufficientEscrow,
            Violation::InvalidMilestones => Error::InvalidMilestones,
            Violation::GoalMismatch => Error::GoalMismatch,
            Violation::InvalidAmount => Error::InvalidAmount,
            Violation::ExceedsGoal => Error::ExceedsGoal,
            Violation::SelfContribution => Error::SelfContribution,
            Violation::OutOfOrderRelease => Error::OutOfOrderRelease,
            Violation::EvidenceMissing => Error::EvidenceMissing,
            Violation::FeeTooHigh => Error::FeeTooHigh,
            Violation::EscrowCompleted => Error::EscrowCompleted,
        }
    }
}

fn require_platform(env: &Env) -> PlatformConfig {
    match load_platform(env) {
        Some(p) => p,
        None => panic_with_error!(env, Error::NotInitialized),
    }
}

fn require_escrow(env: &Env, campaign_id: u64) -> (EscrowConfig, EscrowState) {
    match (
        load_escrow_config(env, campaign_id),
        load_escrow_state(env, campaign_id),
    ) {
        (Some(config), Some(state)) => (config, state),
        _ => panic_with_error!(env, Error::EscrowNotFound),
    }
}

fn reject(env: &Env, v: Violation) -> ! {
    panic_with_error!(env, Error::from(v))
}

#[contract]
pub struct CampaignEscrow;

#[contractimpl]
impl CampaignEscrow {
    // ─────────────────────────────────────────────────────────
    // Initialisation
    // ─────────────────────────────────────────────────────────

    /// Initialise platform roles, the funding asset, and the platform fee.
    ///
    /// Must be called exactly once immediately after deployment.
    /// Subsequent calls panic with `Error::AlreadyInitialized`.
    pub fn init(
        env: Env,
        admin: Address,
        deployer: Address,
        releaser: Address,
        fee_recipient: Address,
        token: Address,
        fee_bps: u32,
    ) {
        admin.require_auth();
        if has_platform(&env) {
            panic_with_error!(&env, Error::AlreadyInitialized);
        }
        if let Err(v) = escrow_rules::check_fee_bps(fee_bps) {
            reject(&env, v);
        }
        save_platform(
            &env,
            &PlatformConfig {
                deployer,
                releaser,
                fee_recipient,
                token,
                fee_bps,
            },
        );
    }

    pub fn get_platform(env: Env) -> PlatformConfig {
        require_platform(&env)
    }

    // ─────────────────────────────────────────────────────────
    // Deployment
    // ─────────────────────────────────────────────────────────

    /// Create the escrow for `campaign_id`.
    ///
    /// Only the governance-controlled deployer may call this. A second call
    /// for the same id panics with `Error::AlreadyDeployed`; the campaign id
    /// is the idempotency key of the off-chain deploy retry.
    pub fn deploy_campaign(
        env: Env,
        campaign_id: u64,
        owner: Address,
        goal: i128,
        milestones: Vec<i128>,
    ) -> Escrow {
        let platform = require_platform(&env);
        platform.deployer.require_auth();

        if has_escrow(&env, campaign_id) {
            panic_with_error!(&env, Error::AlreadyDeployed);
        }
        if let Err(v) = escrow_rules::validate_schedule(goal, milestones.iter()) {
            reject(&env, v);
        }

        let config = EscrowConfig {
            campaign_id,
            owner: owner.clone(),
            goal,
            milestones,
        };
        save_new_escrow(&env, &config);

        events::escrow_created(
            &env,
            events::EscrowCreated {
                campaign_id,
                owner,
                goal,
                milestones_total: config.milestones.len(),
            },
        );

        let (config, state) = require_escrow(&env, campaign_id);
        to_escrow(&config, &state)
    }

    // ─────────────────────────────────────────────────────────
    // Funding
    // ─────────────────────────────────────────────────────────

    /// Contribute `amount` to the escrow of `campaign_id`.
    ///
    /// The contributor must first `approve` this contract as spender on the
    /// funding token; the escrow pulls the funds with `transfer_from`.
    /// Returns the new funded total.
    pub fn contribute(env: Env, campaign_id: u64, contributor: Address, amount: i128) -> i128 {
        contributor.require_auth();

        let platform = require_platform(&env);
        let (config, mut state) = require_escrow(&env, campaign_id);

        if state.completed {
            reject(&env, Violation::EscrowCompleted);
        }
        let funded = match escrow_rules::accept_contribution(
            config.goal,
            state.funded,
            amount,
            contributor == config.owner,
        ) {
            Ok(next) => next,
            Err(v) => reject(&env, v),
        };

        let this = env.current_contract_address();
        token::Client::new(&env, &platform.token).transfer_from(&this, &contributor, &this, &amount);

        let previous = load_contribution(&env, campaign_id, &contributor);
        if previous == 0 {
            state.investor_count += 1;
        }
        save_contribution(&env, campaign_id, &contributor, previous + amount);

        let minted = escrow_rules::shares_for(amount);
        let shares = load_shares(&env, campaign_id, &contributor);
        save_shares(&env, campaign_id, &contributor, shares + minted);

        state.funded = funded;
        state.total_shares += minted;
        save_escrow_state(&env, campaign_id, &state);

        events::contribution_received(
            &env,
            events::ContributionReceived {
                campaign_id,
                contributor,
                amount,
                funded,
            },
        );
        funded
    }

    // ─────────────────────────────────────────────────────────
    // Milestones
    // ─────────────────────────────────────────────────────────

    /// Record the evidence digest for milestone `index`.
    ///
    /// `caller` must be the campaign owner or the releaser. Re-submitting
    /// replaces the digest until the milestone is released.
    pub fn submit_evidence(
        env: Env,
        caller: Address,
        campaign_id: u64,
        index: u32,
        evidence_hash: BytesN<32>,
    ) {
        caller.require_auth();

        let platform = require_platform(&env);
        let (config, state) = require_escrow(&env, campaign_id);

        if caller != config.owner && caller != platform.releaser {
            panic_with_error!(&env, Error::NotAuthorized);
        }
        if index >= config.milestones.len() {
            reject(&env, Violation::MilestoneNotFound);
        }
        if index < state.milestones_released {
            reject(&env, Violation::MilestoneAlreadyReleased);
        }

        save_evidence(&env, campaign_id, index, &evidence_hash);
        events::evidence_submitted(
            &env,
            events::EvidenceSubmitted {
                campaign_id,
                index,
                evidence_hash,
            },
        );
    }

    /// Release milestone `index` of `campaign_id`.
    ///
    /// Releases happen in strict ascending order and require submitted
    /// evidence. The platform fee goes to the fee recipient and the remainder
    /// to the campaign owner.
    pub fn release_milestone(env: Env, campaign_id: u64, index: u32) -> MilestoneRelease {
        let platform = require_platform(&env);
        platform.releaser.require_auth();

        let (config, mut state) = require_escrow(&env, campaign_id);

        if let Err(v) = escrow_rules::check_release(
            index,
            state.milestones_released,
            config.milestones.len(),
            storage::has_evidence(&env, campaign_id, index),
        ) {
            reject(&env, v);
        }

        let amount = match config.milestones.get(index) {
            Some(a) => a,
            None => reject(&env, Violation::MilestoneNotFound),
        };
        if state.funded - state.released_amount < amount {
            reject(&env, Violation::InsufficientEscrow);
        }

        let split = match escrow_rules::split_fee(amount, platform.fee_bps) {
            Ok(split) => split,
            Err(v) => reject(&env, v),
        };
        let this = env.current_contract_address();
        let token = token::Client::new(&env, &platform.token);
        if split.fee > 0 {
            token.transfer(&this, &platform.fee_recipient, &split.fee);
        }
        token.transfer(&this, &config.owner, &split.researcher_amount);

        state.milestones_released += 1;
        state.released_amount += amount;
        state.completed = state.milestones_released == config.milestones.len();
        save_escrow_state(&env, campaign_id, &state);

        events::milestone_released(
            &env,
            events::MilestoneReleased {
                campaign_id,
                index,
                amount,
                fee: split.fee,
                researcher_amount: split.researcher_amount,
            },
        );

        MilestoneRelease {
            index,
            amount,
            fee: split.fee,
            researcher_amount: split.researcher_amount,
        }
    }

    // ─────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────

    pub fn get_escrow(env: Env, campaign_id: u64) -> Escrow {
        let (config, state) = require_escrow(&env, campaign_id);
        to_escrow(&config, &state)
    }

    pub fn get_milestone_amounts(env: Env, campaign_id: u64) -> Vec<i128> {
        let (config, _) = require_escrow(&env, campaign_id);
        config.milestones
    }

    pub fn contribution_of(env: Env, campaign_id: u64, contributor: Address) -> i128 {
        require_escrow(&env, campaign_id);
        load_contribution(&env, campaign_id, &contributor)
    }

    pub fn share_balance(env: Env, campaign_id: u64, holder: Address) -> i128 {
        require_escrow(&env, campaign_id);
        load_shares(&env, campaign_id, &holder)
    }

    /// Share of the total issuable supply held by `holder`, in basis points
    /// (rounded down).
    pub fn share_bps(env: Env, campaign_id: u64, holder: Address) -> u32 {
        let (config, _) = require_escrow(&env, campaign_id);
        escrow_rules::share_bps(load_shares(&env, campaign_id, &holder), config.goal)
    }

    pub fn has_evidence(env: Env, campaign_id: u64, index: u32) -> bool {
        storage::has_evidence(&env, campaign_id, index)
    }
}
