//! # Escrow rules
//!
//! Pure accounting rules for milestone-gated campaign escrows.
//!
//! The on-ledger `campaign_escrow` contract and the off-chain reconciler both
//! evaluate escrow operations through these functions, so a contribution or a
//! milestone release is accepted or rejected for exactly the same reasons on
//! both sides of the dual write.
//!
//! | Rule                       | Function                 |
//! |----------------------------|--------------------------|
//! | Milestone schedule         | [`validate_schedule`]    |
//! | Fund intake                | [`accept_contribution`]  |
//! | Share issuance             | [`shares_for`]           |
//! | Share percentage (bps)     | [`share_bps`]            |
//! | Ordered milestone release  | [`check_release`]        |
//! | Platform fee split         | [`split_fee`]            |
//!
//! All amounts are integers in the funding asset's smallest unit.

#![cfg_attr(not(test), no_std)]

use core::fmt;

/// Denominator for basis-point arithmetic (100.00%).
pub const BPS_DENOMINATOR: i128 = 10_000;

/// Highest platform fee the escrow accepts at initialisation (10%).
pub const MAX_FEE_BPS: u32 = 1_000;

/// Fixed issuance price: units of the funding asset per share.
pub const SHARE_PRICE: i128 = 1;

/// A rejected escrow operation.
///
/// Discriminants are stable and identical to the contract's error codes, so
/// a ledger revert `Error(Contract, #N)` maps back onto the same variant.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum Violation {
    MilestoneNotFound = 2,
    MilestoneAlreadyReleased = 3,
    InsufficientEscrow = 4,
    InvalidMilestones = 5,
    GoalMismatch = 7,
    InvalidAmount = 10,
    ExceedsGoal = 11,
    SelfContribution = 12,
    OutOfOrderRelease = 13,
    EvidenceMissing = 14,
    FeeTooHigh = 15,
    EscrowCompleted = 17,
}

impl Violation {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        let v = match code {
            2 => Self::MilestoneNotFound,
            3 => Self::MilestoneAlreadyReleased,
            4 => Self::InsufficientEscrow,
            5 => Self::InvalidMilestones,
            7 => Self::GoalMismatch,
            10 => Self::InvalidAmount,
            11 => Self::ExceedsGoal,
            12 => Self::SelfContribution,
            13 => Self::OutOfOrderRelease,
            14 => Self::EvidenceMissing,
            15 => Self::FeeTooHigh,
            17 => Self::EscrowCompleted,
            _ => return None,
        };
        Some(v)
    }

    pub fn describe(self) -> &'static str {
        match self {
            Self::MilestoneNotFound => "milestone index out of range",
            Self::MilestoneAlreadyReleased => "milestone already released",
            Self::InsufficientEscrow => "escrow does not hold the milestone amount",
            Self::InvalidMilestones => "milestone schedule is empty or has a non-positive amount",
            Self::GoalMismatch => "milestone amounts do not sum to the funding goal",
            Self::InvalidAmount => "amount must be positive",
            Self::ExceedsGoal => "contribution would exceed the funding goal",
            Self::SelfContribution => "campaign owner cannot contribute to their own escrow",
            Self::OutOfOrderRelease => "milestones must be released in ascending order",
            Self::EvidenceMissing => "milestone evidence has not been submitted",
            Self::FeeTooHigh => "platform fee exceeds the allowed maximum",
            Self::EscrowCompleted => "escrow has released every milestone",
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Outcome of splitting a milestone payout between platform and researcher.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FeeSplit {
    pub fee: i128,
    pub researcher_amount: i128,
}

/// Check that a milestone schedule funds exactly `goal`.
pub fn validate_schedule<I>(goal: i128, amounts: I) -> Result<(), Violation>
where
    I: IntoIterator<Item = i128>,
{
    if goal <= 0 {
        return Err(Violation::InvalidAmount);
    }

    let mut count = 0u32;
    let mut sum: i128 = 0;
    for amount in amounts {
        if amount <= 0 {
            return Err(Violation::InvalidMilestones);
        }
        sum = sum.checked_add(amount).ok_or(Violation::GoalMismatch)?;
        count += 1;
    }

    if count == 0 {
        return Err(Violation::InvalidMilestones);
    }
    if sum != goal {
        return Err(Violation::GoalMismatch);
    }
    Ok(())
}

/// Accept `amount` into an escrow that currently holds `funded` of `goal`.
///
/// Returns the new funded total.
pub fn accept_contribution(
    goal: i128,
    funded: i128,
    amount: i128,
    is_owner: bool,
) -> Result<i128, Violation> {
    if amount <= 0 {
        return Err(Violation::InvalidAmount);
    }
    if is_owner {
        return Err(Violation::SelfContribution);
    }
    let next = funded.checked_add(amount).ok_or(Violation::ExceedsGoal)?;
    if next > goal {
        return Err(Violation::ExceedsGoal);
    }
    Ok(next)
}

/// Shares minted for a contribution of `amount` at [`SHARE_PRICE`].
pub fn shares_for(amount: i128) -> i128 {
    amount / SHARE_PRICE
}

/// Total shares issuable by an escrow with the given goal.
pub fn max_supply(goal: i128) -> i128 {
    goal / SHARE_PRICE
}

/// Share of the total issuable supply held by `balance`, in basis points.
///
/// Rounds down to the nearest basis point. A zero supply yields 0.
pub fn share_bps(balance: i128, goal: i128) -> u32 {
    let supply = max_supply(goal);
    if supply <= 0 || balance <= 0 {
        return 0;
    }
    let bps = balance.saturating_mul(BPS_DENOMINATOR) / supply;
    bps.clamp(0, BPS_DENOMINATOR) as u32
}

/// Check that milestone `index` may be released next.
///
/// `released` is the count of milestones already released; releases must
/// follow `0, 1, 2, …` with no gaps and no repeats.
pub fn check_release(
    index: u32,
    released: u32,
    total: u32,
    evidence_submitted: bool,
) -> Result<(), Violation> {
    if index >= total {
        return Err(Violation::MilestoneNotFound);
    }
    if index < released {
        return Err(Violation::MilestoneAlreadyReleased);
    }
    if index != released {
        return Err(Violation::OutOfOrderRelease);
    }
    if !evidence_submitted {
        return Err(Violation::EvidenceMissing);
    }
    Ok(())
}

/// Split a milestone payout into the platform fee and the researcher's share.
///
/// Fails with [`Violation::InvalidAmount`] when the fee product overflows.
pub fn split_fee(amount: i128, fee_bps: u32) -> Result<FeeSplit, Violation> {
    let fee = amount
        .checked_mul(fee_bps as i128)
        .ok_or(Violation::InvalidAmount)?
        / BPS_DENOMINATOR;
    Ok(FeeSplit {
        fee,
        researcher_amount: amount - fee,
    })
}

/// Reject fee configurations above [`MAX_FEE_BPS`].
pub fn check_fee_bps(fee_bps: u32) -> Result<(), Violation> {
    if fee_bps > MAX_FEE_BPS {
        return Err(Violation::FeeTooHigh);
    }
    Ok(())
}
