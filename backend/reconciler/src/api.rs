//! Axum REST API handlers.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::db;
use crate::errors::{ReconcilerError, Result};
use crate::events::EventRecord;
use crate::governance::{self, ProposalView};
use crate::ledger::LedgerClient;
use crate::models::{
    Campaign, Contribution, LedgerSyncStatus, Milestone, NewCampaign, NewContribution, NewVote,
    Proposal,
};
use crate::reconcile::Reconciler;

#[derive(Clone)]
pub struct ApiState {
    pub reconciler: Reconciler,
    /// `None` runs every workflow down its no-client branch.
    pub ledger: Option<Arc<dyn LedgerClient>>,
}

impl ApiState {
    fn ledger(&self) -> Option<&dyn LedgerClient> {
        self.ledger.as_deref()
    }
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/events", get(get_all_events))
        .route("/campaigns", post(create_campaign))
        .route("/campaigns/:id", get(get_campaign))
        .route("/campaigns/:id/submit", post(submit_campaign))
        .route("/campaigns/:id/cancel", post(cancel_campaign))
        .route(
            "/campaigns/:id/contributions",
            get(get_contributions).post(contribute),
        )
        .route("/campaigns/:id/events", get(get_campaign_events))
        .route("/campaigns/:id/ledger/retry", post(retry_deploy))
        .route(
            "/campaigns/:id/milestones/:index/evidence",
            post(submit_evidence),
        )
        .route(
            "/campaigns/:id/milestones/:index/approve",
            post(approve_milestone),
        )
        .route(
            "/campaigns/:id/milestones/:index/release",
            post(release_milestone),
        )
        .route("/proposals/:id", get(get_proposal))
        .route("/proposals/:id/votes", post(vote))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ─────────────────────────────────────────────────────────
// Request / response shapes
// ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct OwnerRequest {
    pub owner: String,
}

#[derive(Deserialize)]
pub struct EvidenceRequest {
    pub evidence_ref: String,
}

#[derive(Serialize)]
pub struct EventsResponse {
    pub campaign_id: i64,
    pub count: usize,
    pub events: Vec<EventRecord>,
}

#[derive(Serialize)]
pub struct AllEventsResponse {
    pub count: usize,
    pub events: Vec<EventRecord>,
}

#[derive(Serialize)]
pub struct ContributionsResponse {
    pub campaign_id: i64,
    pub count: usize,
    pub contributions: Vec<Contribution>,
}

/// A contributor's ledger-secured stake.
#[derive(Debug, Serialize)]
pub struct ShareView {
    pub contributor: String,
    pub contributed: i64,
    pub share_bps: u32,
}

#[derive(Serialize)]
pub struct CampaignView {
    #[serde(flatten)]
    pub campaign: Campaign,
    pub remaining_goal: i64,
    pub milestones: Vec<Milestone>,
    pub shares: Vec<ShareView>,
    pub proposal: Option<Proposal>,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub ledger: bool,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl IntoResponse for ReconcilerError {
    fn into_response(self) -> Response {
        let status = match &self {
            ReconcilerError::Validation(v) if v.is_conflict() => StatusCode::CONFLICT,
            ReconcilerError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ReconcilerError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!("Request failed: {self}");
        }
        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

// ─────────────────────────────────────────────────────────
// Read-only projections
// ─────────────────────────────────────────────────────────

/// `GET /health`
pub async fn health(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        ledger: state.ledger.is_some(),
    })
}

/// `GET /campaigns/:id`
///
/// Platform status, ledger sync status, funds, milestones and per-contributor
/// shares in one document.
pub async fn get_campaign(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
) -> Result<Json<CampaignView>> {
    let pool = state.reconciler.pool();
    let campaign = db::get_campaign(pool, id)
        .await?
        .ok_or_else(|| ReconcilerError::NotFound(format!("campaign {id}")))?;
    let milestones = db::get_milestones(pool, id).await?;
    let proposal = db::get_proposal_for_campaign(pool, id).await?;
    let goal = campaign.funding_goal as i128;
    let shares = db::confirmed_totals(pool, id)
        .await?
        .into_iter()
        .map(|(contributor, contributed)| ShareView {
            share_bps: escrow_rules::share_bps(
                escrow_rules::shares_for(contributed as i128),
                goal,
            ),
            contributor,
            contributed,
        })
        .collect();

    Ok(Json(CampaignView {
        remaining_goal: campaign.remaining_goal(),
        campaign,
        milestones,
        shares,
        proposal,
    }))
}

/// `GET /campaigns/:id/contributions`
pub async fn get_contributions(
    State(state): State<Arc<ApiState>>,
    Path(campaign_id): Path<i64>,
) -> Result<Json<ContributionsResponse>> {
    let contributions = db::get_contributions(state.reconciler.pool(), campaign_id).await?;
    Ok(Json(ContributionsResponse {
        campaign_id,
        count: contributions.len(),
        contributions,
    }))
}

/// `GET /campaigns/:id/events`
///
/// Returns all indexed ledger events for the given campaign.
pub async fn get_campaign_events(
    State(state): State<Arc<ApiState>>,
    Path(campaign_id): Path<i64>,
) -> Result<Json<EventsResponse>> {
    let events = db::get_events_for_campaign(state.reconciler.pool(), campaign_id).await?;
    Ok(Json(EventsResponse {
        campaign_id,
        count: events.len(),
        events,
    }))
}

/// `GET /events`
///
/// Returns all indexed events across all campaigns.
pub async fn get_all_events(State(state): State<Arc<ApiState>>) -> Result<Json<AllEventsResponse>> {
    let events = db::get_all_events(state.reconciler.pool()).await?;
    Ok(Json(AllEventsResponse {
        count: events.len(),
        events,
    }))
}

/// `GET /proposals/:id`
pub async fn get_proposal(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
) -> Result<Json<ProposalView>> {
    Ok(Json(governance::proposal_view(state.reconciler.pool(), id).await?))
}

// ─────────────────────────────────────────────────────────
// Workflow
// ─────────────────────────────────────────────────────────

/// `POST /campaigns`
pub async fn create_campaign(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<NewCampaign>,
) -> Result<impl IntoResponse> {
    let campaign = state.reconciler.create_campaign(&body).await?;
    Ok((StatusCode::CREATED, Json(campaign)))
}

/// `POST /campaigns/:id/submit`
pub async fn submit_campaign(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
    Json(body): Json<OwnerRequest>,
) -> Result<impl IntoResponse> {
    let proposal = state.reconciler.submit_for_review(id, &body.owner).await?;
    Ok((StatusCode::CREATED, Json(proposal)))
}

/// `POST /campaigns/:id/cancel`
pub async fn cancel_campaign(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
    Json(body): Json<OwnerRequest>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.reconciler.cancel_campaign(id, &body.owner).await?))
}

/// `POST /proposals/:id/votes`
///
/// An approving vote activates the campaign and starts escrow deployment in
/// the background.
pub async fn vote(
    State(state): State<Arc<ApiState>>,
    Path(proposal_id): Path<i64>,
    Json(body): Json<NewVote>,
) -> Result<impl IntoResponse> {
    let report = state
        .reconciler
        .submit_vote(state.ledger(), proposal_id, &body)
        .await?;
    if let (Some(LedgerSyncStatus::Pending), Some(ledger)) = (report.activation, &state.ledger) {
        state
            .reconciler
            .spawn_deploy(ledger.clone(), report.outcome.campaign_id);
    }
    Ok((StatusCode::CREATED, Json(report)))
}

/// `POST /campaigns/:id/contributions`
pub async fn contribute(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
    Json(body): Json<NewContribution>,
) -> Result<impl IntoResponse> {
    let report = state
        .reconciler
        .contribute(state.ledger(), id, &body)
        .await?;
    Ok((StatusCode::CREATED, Json(report)))
}

/// `POST /campaigns/:id/milestones/:index/evidence`
pub async fn submit_evidence(
    State(state): State<Arc<ApiState>>,
    Path((id, index)): Path<(i64, u32)>,
    Json(body): Json<EvidenceRequest>,
) -> Result<impl IntoResponse> {
    let report = state
        .reconciler
        .submit_evidence(state.ledger(), id, index, &body.evidence_ref)
        .await?;
    Ok(Json(report))
}

/// `POST /campaigns/:id/milestones/:index/approve`
pub async fn approve_milestone(
    State(state): State<Arc<ApiState>>,
    Path((id, index)): Path<(i64, u32)>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.reconciler.approve_milestone(id, index).await?))
}

/// `POST /campaigns/:id/milestones/:index/release`
pub async fn release_milestone(
    State(state): State<Arc<ApiState>>,
    Path((id, index)): Path<(i64, u32)>,
) -> Result<impl IntoResponse> {
    let report = state
        .reconciler
        .release_milestone(state.ledger(), id, index)
        .await?;
    Ok(Json(report))
}

/// `POST /campaigns/:id/ledger/retry`
///
/// Re-run escrow deployment for one campaign now, regardless of the
/// sweeper's attempt budget.
pub async fn retry_deploy(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.reconciler.deploy_escrow(state.ledger(), id).await?))
}
