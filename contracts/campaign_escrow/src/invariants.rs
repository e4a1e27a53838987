#![allow(dead_code)]

extern crate std;

use crate::types::Escrow;

/// INV-1: Funded total never exceeds the goal.
pub fn assert_funded_within_goal(escrow: &Escrow) {
    assert!(
        escrow.funded >= 0 && escrow.funded <= escrow.goal,
        "INV-1 violated: escrow {} funded {} outside [0, {}]",
        escrow.campaign_id,
        escrow.funded,
        escrow.goal
    );
}

/// INV-2: Released amount never exceeds what was funded.
pub fn assert_released_within_funded(escrow: &Escrow) {
    assert!(
        escrow.released_amount <= escrow.funded,
        "INV-2 violated: escrow {} released {} of only {} funded",
        escrow.campaign_id,
        escrow.released_amount,
        escrow.funded
    );
}

/// INV-3: Release progress stays within the schedule and `completed`
/// means every milestone was released.
pub fn assert_release_progress(escrow: &Escrow) {
    assert!(
        escrow.milestones_released <= escrow.milestones_total,
        "INV-3 violated: escrow {} released {} of {} milestones",
        escrow.campaign_id,
        escrow.milestones_released,
        escrow.milestones_total
    );
    assert_eq!(
        escrow.completed,
        escrow.milestones_released == escrow.milestones_total,
        "INV-3 violated: escrow {} completed flag inconsistent",
        escrow.campaign_id
    );
}

/// INV-4: Share supply scales with funding and never exceeds the supply
/// implied by the goal.
pub fn assert_share_supply(escrow: &Escrow) {
    assert_eq!(
        escrow.total_shares,
        escrow_rules::shares_for(escrow.funded),
        "INV-4 violated: escrow {} minted {} shares for {} funded",
        escrow.campaign_id,
        escrow.total_shares,
        escrow.funded
    );
    assert!(
        escrow.total_shares <= escrow_rules::max_supply(escrow.goal),
        "INV-4 violated: escrow {} share supply above maximum",
        escrow.campaign_id
    );
}

/// INV-5: Funded total is monotonic.
pub fn assert_funded_monotonic(before: i128, after: i128) {
    assert!(
        after >= before,
        "INV-5 violated: funded decreased from {} to {}",
        before,
        after
    );
}

/// INV-6: Fields fixed at deployment never change.
pub fn assert_escrow_immutable_fields(original: &Escrow, current: &Escrow) {
    assert_eq!(original.campaign_id, current.campaign_id, "INV-6 violated: id changed");
    assert_eq!(original.owner, current.owner, "INV-6 violated: owner changed");
    assert_eq!(original.goal, current.goal, "INV-6 violated: goal changed");
    assert_eq!(
        original.milestones_total, current.milestones_total,
        "INV-6 violated: milestone count changed"
    );
}

/// Run all stateless escrow invariants.
pub fn assert_all_escrow_invariants(escrow: &Escrow) {
    assert_funded_within_goal(escrow);
    assert_released_within_funded(escrow);
    assert_release_progress(escrow);
    assert_share_supply(escrow);
}
