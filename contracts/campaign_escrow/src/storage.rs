//! # Storage
//!
//! Provides typed helpers over Soroban's two storage tiers used by the escrow:
//!
//! ## Instance storage (contract-lifetime TTL)
//!
//! | Key        | Type             | Description                     |
//! |------------|------------------|---------------------------------|
//! | `Platform` | `PlatformConfig` | Roles, funding asset, fee       |
//!
//! Instance TTL is bumped by **7 days** whenever it falls below 1 day remaining.
//!
//! ## Persistent storage (per-entry TTL)
//!
//! | Key                       | Type           | Description                        |
//! |---------------------------|----------------|------------------------------------|
//! | `EscConfig(id)`           | `EscrowConfig` | Immutable owner, goal, schedule    |
//! | `EscState(id)`            | `EscrowState`  | Funded, investors, release counter |
//! | `Contribution(id, addr)`  | `i128`         | Total contributed by `addr`        |
//! | `Shares(id, addr)`        | `i128`         | Share balance of `addr`            |
//! | `Evidence(id, index)`     | `BytesN<32>`   | Evidence digest for a milestone    |
//!
//! Persistent TTL is bumped by **30 days** whenever it falls below 7 days remaining.

use soroban_sdk::{contracttype, Address, BytesN, Env};

use crate::types::{Escrow, EscrowConfig, EscrowState, PlatformConfig};

// ── TTL Constants ────────────────────────────────────────────────────

/// Approximate ledgers per day (~5 seconds per ledger).
const DAY_IN_LEDGERS: u32 = 17_280;

const INSTANCE_BUMP_AMOUNT: u32 = 7 * DAY_IN_LEDGERS;
const INSTANCE_LIFETIME_THRESHOLD: u32 = DAY_IN_LEDGERS;

const PERSISTENT_BUMP_AMOUNT: u32 = 30 * DAY_IN_LEDGERS;
const PERSISTENT_LIFETIME_THRESHOLD: u32 = 7 * DAY_IN_LEDGERS;

// ── Storage Keys ─────────────────────────────────────────────────────

#[contracttype]
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DataKey {
    /// Platform configuration (Instance).
    Platform,
    /// Immutable escrow configuration keyed by campaign id (Persistent).
    EscConfig(u64),
    /// Mutable escrow state keyed by campaign id (Persistent).
    EscState(u64),
    /// Per-contributor contributed total (Persistent).
    Contribution(u64, Address),
    /// Per-contributor share balance (Persistent).
    Shares(u64, Address),
    /// Evidence digest per milestone (Persistent).
    Evidence(u64, u32),
}

// ── Instance Storage Helpers ─────────────────────────────────────────

fn bump_instance(env: &Env) {
    env.storage()
        .instance()
        .extend_ttl(INSTANCE_LIFETIME_THRESHOLD, INSTANCE_BUMP_AMOUNT);
}

pub fn has_platform(env: &Env) -> bool {
    env.storage().instance().has(&DataKey::Platform)
}

pub fn save_platform(env: &Env, platform: &PlatformConfig) {
    env.storage().instance().set(&DataKey::Platform, platform);
    bump_instance(env);
}

/// Returns `None` before `init` has run.
pub fn load_platform(env: &Env) -> Option<PlatformConfig> {
    let platform = env.storage().instance().get(&DataKey::Platform);
    if platform.is_some() {
        bump_instance(env);
    }
    platform
}

// ── Persistent Storage Helpers ───────────────────────────────────────

fn bump_persistent(env: &Env, key: &DataKey) {
    env.storage()
        .persistent()
        .extend_ttl(key, PERSISTENT_LIFETIME_THRESHOLD, PERSISTENT_BUMP_AMOUNT);
}

pub fn has_escrow(env: &Env, campaign_id: u64) -> bool {
    env.storage()
        .persistent()
        .has(&DataKey::EscConfig(campaign_id))
}

/// Save the immutable config and the initial state of a new escrow.
pub fn save_new_escrow(env: &Env, config: &EscrowConfig) {
    let config_key = DataKey::EscConfig(config.campaign_id);
    let state_key = DataKey::EscState(config.campaign_id);

    let state = EscrowState {
        funded: 0,
        investor_count: 0,
        milestones_released: 0,
        released_amount: 0,
        total_shares: 0,
        completed: false,
    };

    env.storage().persistent().set(&config_key, config);
    env.storage().persistent().set(&state_key, &state);
    bump_persistent(env, &config_key);
    bump_persistent(env, &state_key);
}

pub fn load_escrow_config(env: &Env, campaign_id: u64) -> Option<EscrowConfig> {
    let key = DataKey::EscConfig(campaign_id);
    let config: Option<EscrowConfig> = env.storage().persistent().get(&key);
    if config.is_some() {
        bump_persistent(env, &key);
    }
    config
}

pub fn load_escrow_state(env: &Env, campaign_id: u64) -> Option<EscrowState> {
    let key = DataKey::EscState(campaign_id);
    let state: Option<EscrowState> = env.storage().persistent().get(&key);
    if state.is_some() {
        bump_persistent(env, &key);
    }
    state
}

/// Write back only the small mutable state entry.
pub fn save_escrow_state(env: &Env, campaign_id: u64, state: &EscrowState) {
    let key = DataKey::EscState(campaign_id);
    env.storage().persistent().set(&key, state);
    bump_persistent(env, &key);
}

/// Combine config and state into the public [`Escrow`] view.
pub fn to_escrow(config: &EscrowConfig, state: &EscrowState) -> Escrow {
    Escrow {
        campaign_id: config.campaign_id,
        owner: config.owner.clone(),
        goal: config.goal,
        funded: state.funded,
        investor_count: state.investor_count,
        milestones_total: config.milestones.len(),
        milestones_released: state.milestones_released,
        released_amount: state.released_amount,
        total_shares: state.total_shares,
        completed: state.completed,
    }
}

// ── Per-contributor balances ─────────────────────────────────────────

fn load_i128(env: &Env, key: &DataKey) -> i128 {
    let value: Option<i128> = env.storage().persistent().get(key);
    match value {
        Some(v) => {
            bump_persistent(env, key);
            v
        }
        None => 0,
    }
}

fn save_i128(env: &Env, key: &DataKey, value: i128) {
    env.storage().persistent().set(key, &value);
    bump_persistent(env, key);
}

pub fn load_contribution(env: &Env, campaign_id: u64, contributor: &Address) -> i128 {
    load_i128(env, &DataKey::Contribution(campaign_id, contributor.clone()))
}

pub fn save_contribution(env: &Env, campaign_id: u64, contributor: &Address, total: i128) {
    save_i128(
        env,
        &DataKey::Contribution(campaign_id, contributor.clone()),
        total,
    );
}

pub fn load_shares(env: &Env, campaign_id: u64, holder: &Address) -> i128 {
    load_i128(env, &DataKey::Shares(campaign_id, holder.clone()))
}

pub fn save_shares(env: &Env, campaign_id: u64, holder: &Address, balance: i128) {
    save_i128(env, &DataKey::Shares(campaign_id, holder.clone()), balance);
}

// ── Milestone evidence ───────────────────────────────────────────────

pub fn has_evidence(env: &Env, campaign_id: u64, index: u32) -> bool {
    env.storage()
        .persistent()
        .has(&DataKey::Evidence(campaign_id, index))
}

pub fn save_evidence(env: &Env, campaign_id: u64, index: u32, digest: &BytesN<32>) {
    let key = DataKey::Evidence(campaign_id, index);
    env.storage().persistent().set(&key, digest);
    bump_persistent(env, &key);
}
