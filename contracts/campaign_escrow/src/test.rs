extern crate std;

use soroban_sdk::{testutils::Address as _, token, vec, Address, BytesN, Env, Vec};

use crate::invariants::{
    assert_all_escrow_invariants, assert_escrow_immutable_fields, assert_funded_monotonic,
};
use crate::{CampaignEscrow, CampaignEscrowClient};

const FEE_BPS: u32 = 250;

struct Fixture {
    env: Env,
    client: CampaignEscrowClient<'static>,
    token: token::Client<'static>,
    sac: token::StellarAssetClient<'static>,
    releaser: Address,
    fee_recipient: Address,
    owner: Address,
}

fn setup() -> Fixture {
    let env = Env::default();
    env.mock_all_auths();

    let contract_id = env.register(CampaignEscrow, ());
    let client = CampaignEscrowClient::new(&env, &contract_id);

    let token_admin = Address::generate(&env);
    let asset = env.register_stellar_asset_contract_v2(token_admin);
    let token = token::Client::new(&env, &asset.address());
    let sac = token::StellarAssetClient::new(&env, &asset.address());

    let admin = Address::generate(&env);
    let deployer = Address::generate(&env);
    let releaser = Address::generate(&env);
    let fee_recipient = Address::generate(&env);
    client.init(
        &admin,
        &deployer,
        &releaser,
        &fee_recipient,
        &token.address,
        &FEE_BPS,
    );

    let owner = Address::generate(&env);
    Fixture {
        env,
        client,
        token,
        sac,
        releaser,
        fee_recipient,
        owner,
    }
}

fn schedule(env: &Env) -> Vec<i128> {
    vec![env, 3_000i128, 4_000, 3_000]
}

fn deploy(f: &Fixture, campaign_id: u64) {
    f.client
        .deploy_campaign(&campaign_id, &f.owner, &10_000i128, &schedule(&f.env));
}

fn fund(f: &Fixture, campaign_id: u64, contributor: &Address, amount: i128) -> i128 {
    f.sac.mint(contributor, &amount);
    let expiration = f.env.ledger().sequence() + 1_000;
    f.token
        .approve(contributor, &f.client.address, &amount, &expiration);
    f.client.contribute(&campaign_id, contributor, &amount)
}

fn evidence(env: &Env) -> BytesN<32> {
    BytesN::from_array(env, &[0xabu8; 32])
}

// ── Deployment ───────────────────────────────────────────────────────

#[test]
fn test_deploy_creates_empty_escrow() {
    let f = setup();
    let escrow = f
        .client
        .deploy_campaign(&7, &f.owner, &10_000i128, &schedule(&f.env));

    assert_eq!(escrow.campaign_id, 7);
    assert_eq!(escrow.owner, f.owner);
    assert_eq!(escrow.goal, 10_000);
    assert_eq!(escrow.funded, 0);
    assert_eq!(escrow.investor_count, 0);
    assert_eq!(escrow.milestones_total, 3);
    assert_eq!(escrow.milestones_released, 0);
    assert!(!escrow.completed);
    assert_eq!(f.client.get_milestone_amounts(&7), schedule(&f.env));
    assert_all_escrow_invariants(&escrow);
}

#[test]
#[should_panic(expected = "Error(Contract, #9)")]
fn test_deploy_twice_for_same_campaign_fails() {
    let f = setup();
    deploy(&f, 1);
    deploy(&f, 1);
}

#[test]
#[should_panic(expected = "Error(Contract, #7)")]
fn test_deploy_rejects_schedule_not_matching_goal() {
    let f = setup();
    let short = vec![&f.env, 3_000i128, 4_000];
    f.client.deploy_campaign(&1, &f.owner, &10_000i128, &short);
}

#[test]
#[should_panic(expected = "Error(Contract, #5)")]
fn test_deploy_rejects_empty_schedule() {
    let f = setup();
    let empty: Vec<i128> = Vec::new(&f.env);
    f.client.deploy_campaign(&1, &f.owner, &10_000i128, &empty);
}

#[test]
#[should_panic(expected = "Error(Contract, #1)")]
fn test_unknown_escrow_is_not_found() {
    let f = setup();
    f.client.get_escrow(&99);
}

// ── Initialisation ───────────────────────────────────────────────────

#[test]
#[should_panic(expected = "Error(Contract, #8)")]
fn test_init_twice_fails() {
    let f = setup();
    let admin = Address::generate(&f.env);
    f.client.init(
        &admin,
        &admin,
        &admin,
        &admin,
        &f.token.address,
        &FEE_BPS,
    );
}

#[test]
#[should_panic(expected = "Error(Contract, #15)")]
fn test_init_rejects_fee_above_cap() {
    let env = Env::default();
    env.mock_all_auths();
    let client = CampaignEscrowClient::new(&env, &env.register(CampaignEscrow, ()));
    let a = Address::generate(&env);
    client.init(&a, &a, &a, &a, &a, &(escrow_rules::MAX_FEE_BPS + 1));
}

#[test]
#[should_panic(expected = "Error(Contract, #16)")]
fn test_deploy_before_init_fails() {
    let env = Env::default();
    env.mock_all_auths();
    let client = CampaignEscrowClient::new(&env, &env.register(CampaignEscrow, ()));
    let owner = Address::generate(&env);
    client.deploy_campaign(&1, &owner, &100i128, &vec![&env, 100i128]);
}

// ── Funding ──────────────────────────────────────────────────────────

#[test]
fn test_contribution_updates_funded_and_shares() {
    let f = setup();
    deploy(&f, 1);
    let investor = Address::generate(&f.env);

    let funded = fund(&f, 1, &investor, 2_000);

    assert_eq!(funded, 2_000);
    let escrow = f.client.get_escrow(&1);
    assert_eq!(escrow.funded, 2_000);
    assert_eq!(escrow.investor_count, 1);
    assert_eq!(f.client.contribution_of(&1, &investor), 2_000);
    assert_eq!(f.client.share_balance(&1, &investor), 2_000);
    // 2000 of 10000 issuable shares = 20.00%
    assert_eq!(f.client.share_bps(&1, &investor), 2_000);
    assert_eq!(f.token.balance(&f.client.address), 2_000);
    assert_eq!(f.token.balance(&investor), 0);
    assert_all_escrow_invariants(&escrow);
}

#[test]
fn test_investor_count_counts_distinct_contributors() {
    let f = setup();
    deploy(&f, 1);
    let alice = Address::generate(&f.env);
    let bob = Address::generate(&f.env);

    fund(&f, 1, &alice, 1_000);
    fund(&f, 1, &alice, 500);
    assert_eq!(f.client.get_escrow(&1).investor_count, 1);

    fund(&f, 1, &bob, 250);
    let escrow = f.client.get_escrow(&1);
    assert_eq!(escrow.investor_count, 2);
    assert_eq!(escrow.funded, 1_750);
    assert_eq!(f.client.contribution_of(&1, &alice), 1_500);
    assert_all_escrow_invariants(&escrow);
}

#[test]
fn test_share_bps_rounds_down() {
    let f = setup();
    f.client
        .deploy_campaign(&3, &f.owner, &3i128, &vec![&f.env, 3i128]);
    let investor = Address::generate(&f.env);
    fund(&f, 3, &investor, 1);
    assert_eq!(f.client.share_bps(&3, &investor), 3_333);
}

#[test]
fn test_contributions_can_fill_goal_exactly() {
    let f = setup();
    deploy(&f, 1);
    let investor = Address::generate(&f.env);
    let original = f.client.get_escrow(&1);

    let mut before = 0;
    for amount in [4_000i128, 4_000, 2_000] {
        let after = fund(&f, 1, &investor, amount);
        assert_funded_monotonic(before, after);
        before = after;
    }

    let escrow = f.client.get_escrow(&1);
    assert_eq!(escrow.funded, escrow.goal);
    assert_escrow_immutable_fields(&original, &escrow);
    assert_all_escrow_invariants(&escrow);
}

#[test]
#[should_panic(expected = "Error(Contract, #11)")]
fn test_contribution_above_goal_fails() {
    let f = setup();
    deploy(&f, 1);
    let investor = Address::generate(&f.env);
    fund(&f, 1, &investor, 9_000);
    fund(&f, 1, &investor, 1_001);
}

#[test]
#[should_panic(expected = "Error(Contract, #10)")]
fn test_zero_contribution_fails() {
    let f = setup();
    deploy(&f, 1);
    let investor = Address::generate(&f.env);
    f.client.contribute(&1, &investor, &0i128);
}

#[test]
#[should_panic(expected = "Error(Contract, #12)")]
fn test_owner_cannot_fund_own_escrow() {
    let f = setup();
    deploy(&f, 1);
    let owner = f.owner.clone();
    fund(&f, 1, &owner, 1_000);
}

// ── Milestones ───────────────────────────────────────────────────────

#[test]
fn test_release_splits_fee_and_pays_owner() {
    let f = setup();
    deploy(&f, 1);
    let investor = Address::generate(&f.env);
    fund(&f, 1, &investor, 10_000);

    f.client
        .submit_evidence(&f.owner, &1, &0, &evidence(&f.env));
    assert!(f.client.has_evidence(&1, &0));

    let release = f.client.release_milestone(&1, &0);

    assert_eq!(release.index, 0);
    assert_eq!(release.amount, 3_000);
    assert_eq!(release.fee, 75);
    assert_eq!(release.researcher_amount, 2_925);
    assert_eq!(f.token.balance(&f.fee_recipient), 75);
    assert_eq!(f.token.balance(&f.owner), 2_925);
    assert_eq!(f.token.balance(&f.client.address), 7_000);

    let escrow = f.client.get_escrow(&1);
    assert_eq!(escrow.milestones_released, 1);
    assert_eq!(escrow.released_amount, 3_000);
    assert!(!escrow.completed);
    assert_all_escrow_invariants(&escrow);
}

#[test]
fn test_releasing_every_milestone_completes_escrow() {
    let f = setup();
    deploy(&f, 1);
    let investor = Address::generate(&f.env);
    fund(&f, 1, &investor, 10_000);

    for index in 0..3u32 {
        f.client
            .submit_evidence(&f.releaser, &1, &index, &evidence(&f.env));
        f.client.release_milestone(&1, &index);
    }

    let escrow = f.client.get_escrow(&1);
    assert!(escrow.completed);
    assert_eq!(escrow.released_amount, 10_000);
    assert_eq!(f.token.balance(&f.client.address), 0);
    assert_eq!(
        f.token.balance(&f.owner) + f.token.balance(&f.fee_recipient),
        10_000
    );
    assert_all_escrow_invariants(&escrow);
}

#[test]
#[should_panic(expected = "Error(Contract, #13)")]
fn test_release_out_of_order_fails() {
    let f = setup();
    deploy(&f, 1);
    let investor = Address::generate(&f.env);
    fund(&f, 1, &investor, 10_000);
    f.client
        .submit_evidence(&f.owner, &1, &1, &evidence(&f.env));
    f.client.release_milestone(&1, &1);
}

#[test]
#[should_panic(expected = "Error(Contract, #14)")]
fn test_release_without_evidence_fails() {
    let f = setup();
    deploy(&f, 1);
    let investor = Address::generate(&f.env);
    fund(&f, 1, &investor, 10_000);
    f.client.release_milestone(&1, &0);
}

#[test]
#[should_panic(expected = "Error(Contract, #3)")]
fn test_release_twice_fails() {
    let f = setup();
    deploy(&f, 1);
    let investor = Address::generate(&f.env);
    fund(&f, 1, &investor, 10_000);
    f.client
        .submit_evidence(&f.owner, &1, &0, &evidence(&f.env));
    f.client.release_milestone(&1, &0);
    f.client.release_milestone(&1, &0);
}

#[test]
#[should_panic(expected = "Error(Contract, #4)")]
fn test_release_without_enough_funds_fails() {
    let f = setup();
    deploy(&f, 1);
    let investor = Address::generate(&f.env);
    fund(&f, 1, &investor, 2_999);
    f.client
        .submit_evidence(&f.owner, &1, &0, &evidence(&f.env));
    f.client.release_milestone(&1, &0);
}

#[test]
#[should_panic(expected = "Error(Contract, #6)")]
fn test_evidence_from_stranger_fails() {
    let f = setup();
    deploy(&f, 1);
    let stranger = Address::generate(&f.env);
    f.client
        .submit_evidence(&stranger, &1, &0, &evidence(&f.env));
}

#[test]
#[should_panic(expected = "Error(Contract, #2)")]
fn test_evidence_for_unknown_milestone_fails() {
    let f = setup();
    deploy(&f, 1);
    f.client
        .submit_evidence(&f.owner, &1, &3, &evidence(&f.env));
}
