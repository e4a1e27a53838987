extern crate std;

use soroban_sdk::{
    symbol_short,
    testutils::{Address as _, Events},
    token, vec, Address, BytesN, Env, IntoVal, TryIntoVal,
};

use crate::events::{ContributionReceived, EscrowCreated, EvidenceSubmitted, MilestoneReleased};
use crate::{CampaignEscrow, CampaignEscrowClient};

struct Setup {
    env: Env,
    client: CampaignEscrowClient<'static>,
    token: token::Client<'static>,
    owner: Address,
}

fn setup_with_escrow(campaign_id: u64) -> Setup {
    let env = Env::default();
    env.mock_all_auths();
    let contract_id = env.register(CampaignEscrow, ());
    let client = CampaignEscrowClient::new(&env, &contract_id);

    let token_admin = Address::generate(&env);
    let asset = env.register_stellar_asset_contract_v2(token_admin);
    let token = token::Client::new(&env, &asset.address());

    let admin = Address::generate(&env);
    client.init(&admin, &admin, &admin, &admin, &token.address, &250u32);

    let owner = Address::generate(&env);
    client.deploy_campaign(
        &campaign_id,
        &owner,
        &10_000i128,
        &vec![&env, 3_000i128, 4_000, 3_000],
    );

    Setup {
        env,
        client,
        token,
        owner,
    }
}

fn contribute(s: &Setup, campaign_id: u64, contributor: &Address, amount: i128) {
    token::StellarAssetClient::new(&s.env, &s.token.address).mint(contributor, &amount);
    let expiration = s.env.ledger().sequence() + 100;
    s.token
        .approve(contributor, &s.client.address, &amount, &expiration);
    s.client.contribute(&campaign_id, contributor, &amount);
}

#[test]
fn test_escrow_created_event() {
    let s = setup_with_escrow(5);

    let all_events = s.env.events().all();
    let last_event = all_events.last().expect("No events found");

    // Topic: (symbol_short!("created"), campaign_id)
    assert_eq!(last_event.0, s.client.address);
    let expected_topics = vec![
        &s.env,
        symbol_short!("created").into_val(&s.env),
        5u64.into_val(&s.env),
    ];
    assert_eq!(last_event.1, expected_topics);

    let event_data: EscrowCreated = last_event.2.try_into_val(&s.env).unwrap();
    assert_eq!(
        event_data,
        EscrowCreated {
            campaign_id: 5,
            owner: s.owner.clone(),
            goal: 10_000,
            milestones_total: 3,
        }
    );
}

#[test]
fn test_contribution_received_event() {
    let s = setup_with_escrow(1);
    let investor = Address::generate(&s.env);

    contribute(&s, 1, &investor, 1_500);
    contribute(&s, 1, &investor, 500);

    let all_events = s.env.events().all();
    let last_event = all_events.last().expect("No events found");

    assert_eq!(last_event.0, s.client.address);
    let expected_topics = vec![
        &s.env,
        symbol_short!("funded").into_val(&s.env),
        1u64.into_val(&s.env),
    ];
    assert_eq!(last_event.1, expected_topics);

    // The event carries the escrow's new authoritative total.
    let event_data: ContributionReceived = last_event.2.try_into_val(&s.env).unwrap();
    assert_eq!(
        event_data,
        ContributionReceived {
            campaign_id: 1,
            contributor: investor.clone(),
            amount: 500,
            funded: 2_000,
        }
    );
}

#[test]
fn test_evidence_and_release_events() {
    let s = setup_with_escrow(1);
    let investor = Address::generate(&s.env);
    contribute(&s, 1, &investor, 3_000);

    let digest = BytesN::from_array(&s.env, &[0x11u8; 32]);
    s.client.submit_evidence(&s.owner, &1, &0, &digest);

    let all_events = s.env.events().all();
    let last_event = all_events.last().expect("No events found");
    let expected_topics = vec![
        &s.env,
        symbol_short!("evidence").into_val(&s.env),
        1u64.into_val(&s.env),
    ];
    assert_eq!(last_event.1, expected_topics);
    let event_data: EvidenceSubmitted = last_event.2.try_into_val(&s.env).unwrap();
    assert_eq!(
        event_data,
        EvidenceSubmitted {
            campaign_id: 1,
            index: 0,
            evidence_hash: digest.clone(),
        }
    );

    s.client.release_milestone(&1, &0);

    let all_events = s.env.events().all();
    let last_event = all_events.last().expect("No events found");
    let expected_topics = vec![
        &s.env,
        symbol_short!("released").into_val(&s.env),
        1u64.into_val(&s.env),
    ];
    assert_eq!(last_event.1, expected_topics);
    let event_data: MilestoneReleased = last_event.2.try_into_val(&s.env).unwrap();
    assert_eq!(
        event_data,
        MilestoneReleased {
            campaign_id: 1,
            index: 0,
            amount: 3_000,
            fee: 75,
            researcher_amount: 2_925,
        }
    );
}
