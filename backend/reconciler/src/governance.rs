//! # Governance Vote Aggregator
//!
//! ```text
//! pending_vote ──► approved   (approvals > rejections, total ≥ quorum)
//!              └─► rejected   (rejections > approvals, total ≥ quorum)
//! ```
//!
//! The tally is recomputed from the full persisted vote set on every
//! accepted vote; there is no stored counter. A tie at or above quorum keeps
//! the proposal open until a later vote breaks it. Votes on a decided
//! proposal are refused with `ProposalClosed`.

use serde::Serialize;
use sqlx::SqlitePool;
use tracing::info;

use crate::db;
use crate::errors::{ReconcilerError, Result, ValidationError};
use crate::models::{now, CampaignStatus, DaoStatus, NewVote, Proposal, Vote, VoteDecision};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Tally {
    pub approvals: u32,
    pub rejections: u32,
}

impl Tally {
    pub fn from_votes<'a>(votes: impl IntoIterator<Item = &'a Vote>) -> Self {
        votes.into_iter().fold(Self::default(), |mut t, v| {
            match v.decision {
                VoteDecision::Approve => t.approvals += 1,
                VoteDecision::Reject => t.rejections += 1,
            }
            t
        })
    }

    pub fn total(&self) -> u32 {
        self.approvals + self.rejections
    }

    /// Status implied by this tally under `quorum`.
    pub fn decide(&self, quorum: u32) -> DaoStatus {
        if self.total() < quorum {
            return DaoStatus::PendingVote;
        }
        match self.approvals.cmp(&self.rejections) {
            std::cmp::Ordering::Greater => DaoStatus::Approved,
            std::cmp::Ordering::Less => DaoStatus::Rejected,
            std::cmp::Ordering::Equal => DaoStatus::PendingVote,
        }
    }
}

/// Result of an accepted vote.
#[derive(Debug, Clone, Serialize)]
pub struct VoteOutcome {
    pub proposal_id: i64,
    pub campaign_id: i64,
    pub tally: Tally,
    pub dao_status: DaoStatus,
    /// `true` when this vote closed the proposal.
    pub decided: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProposalView {
    #[serde(flatten)]
    pub proposal: Proposal,
    pub tally: Tally,
    pub votes: Vec<Vote>,
}

/// Record a validator's vote and apply any resulting transition.
///
/// Runs in one transaction: the vote insert, the recount, the proposal
/// transition and (on rejection) the campaign's move to `rejected` commit
/// together.
pub async fn cast_vote(
    pool: &SqlitePool,
    proposal_id: i64,
    vote: &NewVote,
    quorum: u32,
) -> Result<VoteOutcome> {
    if vote.validator.trim().is_empty() {
        return Err(ValidationError::Field("validator is required".to_string()).into());
    }

    let mut tx = pool.begin().await?;
    let ts = now();

    let proposal = db::get_proposal(&mut *tx, proposal_id)
        .await?
        .ok_or_else(|| ReconcilerError::NotFound(format!("proposal {proposal_id}")))?;
    if proposal.dao_status != DaoStatus::PendingVote {
        return Err(ValidationError::ProposalClosed.into());
    }

    match db::insert_vote(&mut *tx, proposal_id, vote, ts).await {
        Ok(_) => {}
        Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
            return Err(ValidationError::DuplicateVote {
                validator: vote.validator.clone(),
            }
            .into());
        }
        Err(e) => return Err(e.into()),
    }

    let votes = db::get_votes(&mut *tx, proposal_id).await?;
    let tally = Tally::from_votes(&votes);
    let dao_status = tally.decide(quorum);

    let decided = match dao_status {
        DaoStatus::PendingVote => false,
        status => db::decide_proposal(&mut *tx, proposal_id, status, ts).await?,
    };
    if decided && dao_status == DaoStatus::Rejected {
        db::set_campaign_status(&mut *tx, proposal.campaign_id, CampaignStatus::Rejected, ts).await?;
    }

    tx.commit().await?;

    info!(
        "Vote by {} on proposal {proposal_id}: {}/{} (quorum {quorum}) → {:?}",
        vote.validator, tally.approvals, tally.rejections, dao_status
    );

    Ok(VoteOutcome {
        proposal_id,
        campaign_id: proposal.campaign_id,
        tally,
        dao_status,
        decided,
    })
}

pub async fn proposal_view(pool: &SqlitePool, proposal_id: i64) -> Result<ProposalView> {
    let proposal = db::get_proposal(pool, proposal_id)
        .await?
        .ok_or_else(|| ReconcilerError::NotFound(format!("proposal {proposal_id}")))?;
    let votes = db::get_votes(pool, proposal_id).await?;
    Ok(ProposalView {
        tally: Tally::from_votes(&votes),
        proposal,
        votes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewCampaign, NewMilestone};

    fn vote(validator: &str, decision: VoteDecision) -> NewVote {
        NewVote {
            validator: validator.to_string(),
            decision,
            comment: None,
        }
    }

    async fn open_proposal(pool: &SqlitePool) -> (i64, i64) {
        let new = NewCampaign {
            owner: "GOWNER".to_string(),
            title: "Coral bleaching sensors".to_string(),
            funding_goal: 10_000,
            milestones: vec![NewMilestone {
                description: "deploy sensors".to_string(),
                funding_amount: 10_000,
                target_date: None,
            }],
        };
        let campaign_id = db::insert_campaign(pool, &new, 0).await.unwrap();
        db::set_campaign_status(pool, campaign_id, CampaignStatus::PendingReview, 0)
            .await
            .unwrap();
        let proposal_id = db::insert_proposal(pool, campaign_id, 0).await.unwrap();
        (campaign_id, proposal_id)
    }

    #[test]
    fn decide_follows_quorum_and_majority() {
        let t = |approvals, rejections| Tally {
            approvals,
            rejections,
        };
        assert_eq!(t(0, 0).decide(1), DaoStatus::PendingVote);
        assert_eq!(t(1, 0).decide(1), DaoStatus::Approved);
        assert_eq!(t(0, 1).decide(1), DaoStatus::Rejected);
        assert_eq!(t(1, 1).decide(1), DaoStatus::PendingVote);
        assert_eq!(t(2, 0).decide(3), DaoStatus::PendingVote);
        assert_eq!(t(2, 1).decide(3), DaoStatus::Approved);
    }

    #[tokio::test]
    async fn tie_stays_pending_until_broken() {
        let pool = db::test_pool().await;
        let (_, proposal_id) = open_proposal(&pool).await;

        // Quorum 2: the first vote alone cannot decide.
        let first = cast_vote(&pool, proposal_id, &vote("V1", VoteDecision::Approve), 2)
            .await
            .unwrap();
        assert_eq!(first.dao_status, DaoStatus::PendingVote);

        let tie = cast_vote(&pool, proposal_id, &vote("V2", VoteDecision::Reject), 2)
            .await
            .unwrap();
        assert_eq!(tie.dao_status, DaoStatus::PendingVote);
        assert!(!tie.decided);

        let third = cast_vote(&pool, proposal_id, &vote("V3", VoteDecision::Approve), 2)
            .await
            .unwrap();
        assert_eq!(third.dao_status, DaoStatus::Approved);
        assert!(third.decided);
        assert_eq!(
            third.tally,
            Tally {
                approvals: 2,
                rejections: 1
            }
        );
    }

    #[tokio::test]
    async fn duplicate_vote_is_rejected_not_overwritten() {
        let pool = db::test_pool().await;
        let (_, proposal_id) = open_proposal(&pool).await;
        cast_vote(&pool, proposal_id, &vote("V1", VoteDecision::Approve), 3)
            .await
            .unwrap();

        let err = cast_vote(&pool, proposal_id, &vote("V1", VoteDecision::Reject), 3)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ReconcilerError::Validation(ValidationError::DuplicateVote { .. })
        ));

        let view = proposal_view(&pool, proposal_id).await.unwrap();
        assert_eq!(view.votes.len(), 1);
        assert_eq!(view.votes[0].decision, VoteDecision::Approve);
    }

    #[tokio::test]
    async fn rejection_closes_proposal_and_campaign() {
        let pool = db::test_pool().await;
        let (campaign_id, proposal_id) = open_proposal(&pool).await;

        let outcome = cast_vote(&pool, proposal_id, &vote("V1", VoteDecision::Reject), 1)
            .await
            .unwrap();
        assert_eq!(outcome.dao_status, DaoStatus::Rejected);

        let campaign = db::get_campaign(&pool, campaign_id).await.unwrap().unwrap();
        assert_eq!(campaign.status, CampaignStatus::Rejected);

        let err = cast_vote(&pool, proposal_id, &vote("V2", VoteDecision::Approve), 1)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ReconcilerError::Validation(ValidationError::ProposalClosed)
        ));
    }

    #[tokio::test]
    async fn view_tally_matches_persisted_votes() {
        let pool = db::test_pool().await;
        let (_, proposal_id) = open_proposal(&pool).await;
        for (i, decision) in [
            VoteDecision::Approve,
            VoteDecision::Reject,
            VoteDecision::Reject,
            VoteDecision::Approve,
        ]
        .into_iter()
        .enumerate()
        {
            cast_vote(&pool, proposal_id, &vote(&format!("V{i}"), decision), 10)
                .await
                .unwrap();
        }
        let view = proposal_view(&pool, proposal_id).await.unwrap();
        let approvals = view
            .votes
            .iter()
            .filter(|v| v.decision == VoteDecision::Approve)
            .count() as u32;
        assert_eq!(view.tally.approvals, approvals);
        assert_eq!(view.tally.total() as usize, view.votes.len());
    }

    #[tokio::test]
    async fn unknown_proposal_is_not_found() {
        let pool = db::test_pool().await;
        let err = cast_vote(&pool, 99, &vote("V1", VoteDecision::Approve), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcilerError::NotFound(_)));
    }
}
