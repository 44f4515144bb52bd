//! HTTP route handlers.
//!
//! All endpoints speak JSON. Randomness and the clock are taken here, at
//! the boundary, and passed down to the engine.

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, warn};

use crate::config::AppConfig;
use crate::engine::orchestrator::AuctionEngine;
use crate::engine::simulation::SimulationReport;
use crate::metrics::{AnalyticsReport, DspLeaderboardEntry, MetricsAggregator};
use crate::storage::AuctionStore;
use crate::types::{AdRequest, AuctionError, AuctionOpportunity, AuctionOutcome, Bid, PublisherInventory};

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// Shared state accessible by all route handlers.
pub struct ApiState {
    pub engine: AuctionEngine,
    pub metrics: MetricsAggregator,
    pub config: AppConfig,
}

impl ApiState {
    pub fn new(engine: AuctionEngine, metrics: MetricsAggregator, config: AppConfig) -> Self {
        Self {
            engine,
            metrics,
            config,
        }
    }

    fn store(&self) -> &dyn AuctionStore {
        self.engine.store().as_ref()
    }
}

pub type AppState = Arc<ApiState>;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Maps engine errors onto HTTP status codes.
#[derive(Debug)]
pub struct ApiError(pub AuctionError);

impl From<AuctionError> for ApiError {
    fn from(e: AuctionError) -> Self {
        ApiError(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError(AuctionError::Validation(rejection.body_text()))
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError(AuctionError::Validation(rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self.0 {
            AuctionError::Validation(_) => (StatusCode::BAD_REQUEST, self.0.to_string()),
            AuctionError::NotFound { .. } => (StatusCode::NOT_FOUND, self.0.to_string()),
            AuctionError::Transient(e) => {
                error!(error = %e, "Request failed on storage");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to process request".to_string(),
                )
            }
        };
        if status.is_client_error() {
            warn!(status = status.as_u16(), error = %message, "Request rejected");
        }
        (status, Json(json!({ "error": message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn request_rng() -> StdRng {
    StdRng::from_entropy()
}

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

fn one() -> u32 {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct SimulateRequest {
    pub publisher_id: String,
    pub ad_slot_id: String,
    pub geo: String,
    pub device: String,
    #[serde(default = "one")]
    pub count: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRequestBody {
    pub publisher_id: String,
    pub ad_slot_id: String,
    pub geo: String,
    pub device: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRequestResponse {
    pub success: bool,
    pub auction_result: Option<AuctionOutcome>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AnalyticsQuery {
    pub days: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PageQuery {
    pub page: Option<u64>,
    pub limit: Option<u64>,
}

pub const MAX_PAGE_LIMIT: u64 = 100;

#[derive(Debug, Clone, Serialize)]
pub struct Pagination {
    pub total: u64,
    pub page: u64,
    pub limit: u64,
    pub pages: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SlotSummary {
    pub name: String,
    #[serde(rename = "type")]
    pub slot_type: String,
    pub size: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BidView {
    #[serde(flatten)]
    pub bid: Bid,
    pub dsp_name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestLogEntry {
    #[serde(flatten)]
    pub opportunity: AuctionOpportunity,
    pub publisher_name: Option<String>,
    pub ad_slot: Option<SlotSummary>,
    pub bids: Vec<BidView>,
    pub winning_bid: Option<BidView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestLogPage {
    pub data: Vec<RequestLogEntry>,
    pub pagination: Pagination,
}

// ---------------------------------------------------------------------------
// Route handlers
// ---------------------------------------------------------------------------

/// POST /api/ad-request
pub async fn ad_request(
    State(state): State<AppState>,
    payload: Result<Json<AdRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(request) = payload?;
    let outcome = state
        .engine
        .run_auction(&request, &mut request_rng(), Utc::now())
        .await?;

    Ok(match outcome {
        Some(outcome) => Json(outcome).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    })
}

/// POST /api/simulate
pub async fn simulate(
    State(state): State<AppState>,
    payload: Result<Json<SimulateRequest>, JsonRejection>,
) -> ApiResult<Json<SimulationReport>> {
    let Json(body) = payload?;
    let max_batch = state.config.simulation.max_batch;
    if body.count == 0 || body.count > max_batch {
        return Err(AuctionError::Validation(format!(
            "count must be between 1 and {max_batch}, got {}",
            body.count
        ))
        .into());
    }

    let request = AdRequest::new(body.publisher_id, body.ad_slot_id, body.geo, body.device);
    let report = state
        .engine
        .simulate(&request, body.count, &mut request_rng(), Utc::now())
        .await?;
    Ok(Json(report))
}

/// GET /api/admin/analytics?days=N
pub async fn analytics(
    State(state): State<AppState>,
    query: Result<Query<AnalyticsQuery>, QueryRejection>,
) -> ApiResult<Json<AnalyticsReport>> {
    let Query(query) = query?;
    let days = query
        .days
        .unwrap_or(state.config.reporting.default_window_days);
    let report = state.metrics.aggregate(days, Utc::now()).await?;
    Ok(Json(report))
}

/// GET /api/admin/dsps
pub async fn dsps(State(state): State<AppState>) -> ApiResult<Json<Vec<DspLeaderboardEntry>>> {
    Ok(Json(state.metrics.dsp_leaderboard().await?))
}

/// GET /api/admin/publishers
pub async fn publishers(
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<PublisherInventory>>> {
    let inventory = state
        .store()
        .list_publishers()
        .await
        .map_err(AuctionError::from)?;
    Ok(Json(inventory))
}

/// GET /api/admin/requests?page=P&limit=L
pub async fn requests(
    State(state): State<AppState>,
    query: Result<Query<PageQuery>, QueryRejection>,
) -> ApiResult<Json<RequestLogPage>> {
    let Query(query) = query?;
    let page = query.page.unwrap_or(1);
    let limit = query.limit.unwrap_or(10);
    if page == 0 {
        return Err(AuctionError::Validation("page must be at least 1".into()).into());
    }
    if limit == 0 || limit > MAX_PAGE_LIMIT {
        return Err(AuctionError::Validation(format!(
            "limit must be between 1 and {MAX_PAGE_LIMIT}, got {limit}"
        ))
        .into());
    }
    let offset = (page - 1)
        .checked_mul(limit)
        .filter(|o| i64::try_from(*o).is_ok())
        .ok_or_else(|| AuctionError::Validation(format!("page {page} is out of range")))?;

    let store = state.store();
    let (records, inventory, dsps) = futures::try_join!(
        store.list_opportunities(offset, limit),
        store.list_publishers(),
        store.list_dsps(),
    )
    .map_err(AuctionError::from)?;

    let publisher_names: HashMap<&str, &str> = inventory
        .iter()
        .map(|p| (p.publisher.id.as_str(), p.publisher.name.as_str()))
        .collect();
    let slots: HashMap<&str, SlotSummary> = inventory
        .iter()
        .flat_map(|p| p.ad_slots.iter())
        .map(|s| {
            (
                s.id.as_str(),
                SlotSummary {
                    name: s.name.clone(),
                    slot_type: s.slot_type.clone(),
                    size: s.size.clone(),
                },
            )
        })
        .collect();
    let dsp_names: HashMap<&str, &str> = dsps
        .iter()
        .map(|d| (d.id.as_str(), d.name.as_str()))
        .collect();
    let view = |bid: &Bid| BidView {
        bid: bid.clone(),
        dsp_name: dsp_names.get(bid.dsp_id.as_str()).map(|n| n.to_string()),
    };

    let data = records
        .items
        .iter()
        .map(|record| RequestLogEntry {
            publisher_name: publisher_names
                .get(record.opportunity.publisher_id.as_str())
                .map(|n| n.to_string()),
            ad_slot: slots.get(record.opportunity.ad_slot_id.as_str()).cloned(),
            bids: record.bids.iter().map(view).collect(),
            winning_bid: record.winning_bid().map(view),
            opportunity: record.opportunity.clone(),
        })
        .collect();

    Ok(Json(RequestLogPage {
        data,
        pagination: Pagination {
            total: records.total,
            page,
            limit,
            pages: records.total.div_ceil(limit),
        },
    }))
}

/// POST /api/admin/create-request
pub async fn create_request(
    State(state): State<AppState>,
    payload: Result<Json<CreateRequestBody>, JsonRejection>,
) -> ApiResult<Json<CreateRequestResponse>> {
    let Json(body) = payload?;
    let request = AdRequest::new(body.publisher_id, body.ad_slot_id, body.geo, body.device);
    let auction_result = state
        .engine
        .run_auction(&request, &mut request_rng(), Utc::now())
        .await?;
    Ok(Json(CreateRequestResponse {
        success: true,
        auction_result,
    }))
}

/// GET /health
pub async fn health() -> StatusCode {
    StatusCode::OK
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
