//! Persistence layer.
//!
//! Defines the `AuctionStore` trait consumed by the engine and the metrics
//! aggregator, plus two implementations: an in-memory store (tests, demo
//! runs) and a SQLite store backed by `sqlx`.
//!
//! Aggregate queries are grouped scans over a whole time window; callers
//! never issue one query per day.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::types::{AdSlot, AuctionOpportunity, Bid, Dsp, Publisher, PublisherInventory};

/// Storage collaborator failures. All of them are transient to callers.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{entity} not found: {id}")]
    Missing { entity: &'static str, id: String },

    #[error("Write conflict: {0}")]
    Conflict(String),

    #[error("Corrupt stored value: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

// ---------------------------------------------------------------------------
// Query shapes
// ---------------------------------------------------------------------------

/// Inclusive time range `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// Unbounded window, for all-time rollups.
    pub fn all() -> Self {
        Self {
            start: DateTime::<Utc>::MIN_UTC,
            end: DateTime::<Utc>::MAX_UTC,
        }
    }

    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        t >= self.start && t <= self.end
    }
}

/// Opportunities per local calendar day.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DailyOpportunityCounts {
    pub day: NaiveDate,
    pub total: u64,
    pub filled: u64,
}

/// Bid volume and price sum per local calendar day.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DailyBidStats {
    pub day: NaiveDate,
    pub bids: u64,
    pub price_sum: Decimal,
}

/// Bid rollup for one DSP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DspBidStats {
    pub dsp_id: String,
    pub bids: u64,
    /// Bids of this DSP that are their opportunity's winner.
    pub wins: u64,
    pub price_sum: Decimal,
    pub min_price: Option<Decimal>,
    pub max_price: Option<Decimal>,
}

/// An opportunity with every bid placed for it.
#[derive(Debug, Clone, Serialize)]
pub struct OpportunityRecord {
    pub opportunity: AuctionOpportunity,
    pub bids: Vec<Bid>,
}

impl OpportunityRecord {
    pub fn winning_bid(&self) -> Option<&Bid> {
        let id = self.opportunity.winning_bid_id.as_deref()?;
        self.bids.iter().find(|b| b.id == id)
    }
}

/// One page of opportunities, newest first.
#[derive(Debug, Clone)]
pub struct OpportunityPage {
    pub total: u64,
    pub items: Vec<OpportunityRecord>,
}

/// Calendar day of `t` at the given UTC offset.
pub fn local_day(t: DateTime<Utc>, utc_offset: FixedOffset) -> NaiveDate {
    t.with_timezone(&utc_offset).date_naive()
}

// ---------------------------------------------------------------------------
// Store trait
// ---------------------------------------------------------------------------

/// Durable storage for inventory, DSPs, opportunities and bids.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AuctionStore: Send + Sync {
    async fn get_publisher(&self, id: &str) -> StoreResult<Option<Publisher>>;

    async fn get_ad_slot(&self, id: &str) -> StoreResult<Option<AdSlot>>;

    async fn get_dsp(&self, id: &str) -> StoreResult<Option<Dsp>>;

    async fn get_opportunity(&self, id: &str) -> StoreResult<Option<AuctionOpportunity>>;

    /// Publishers with their slots, in creation order.
    async fn list_publishers(&self) -> StoreResult<Vec<PublisherInventory>>;

    /// All DSPs in creation order. This is the auction's enumeration order.
    async fn list_dsps(&self) -> StoreResult<Vec<Dsp>>;

    async fn insert_publisher(&self, publisher: &Publisher) -> StoreResult<()>;

    async fn insert_ad_slot(&self, slot: &AdSlot) -> StoreResult<()>;

    async fn insert_dsp(&self, dsp: &Dsp) -> StoreResult<()>;

    async fn insert_opportunity(&self, opportunity: &AuctionOpportunity) -> StoreResult<()>;

    /// Insert the opportunity's bids and set its winner in one transaction.
    ///
    /// Fails when the opportunity is unknown, already settled, or when the
    /// winner is not one of `bids`.
    async fn settle_opportunity(
        &self,
        opportunity_id: &str,
        bids: &[Bid],
        winning_bid_id: Option<String>,
    ) -> StoreResult<()>;

    async fn list_opportunities(&self, offset: u64, limit: u64) -> StoreResult<OpportunityPage>;

    /// Opportunity totals grouped by local day, ascending.
    async fn opportunity_counts_by_day(
        &self,
        window: TimeWindow,
        utc_offset: FixedOffset,
    ) -> StoreResult<Vec<DailyOpportunityCounts>>;

    /// Bid totals grouped by local day, ascending.
    async fn bid_stats_by_day(
        &self,
        window: TimeWindow,
        utc_offset: FixedOffset,
    ) -> StoreResult<Vec<DailyBidStats>>;

    /// Bid totals grouped by DSP. DSPs without bids in the window are absent.
    async fn bid_stats_by_dsp(&self, window: TimeWindow) -> StoreResult<Vec<DspBidStats>>;

    async fn count_opportunities(&self) -> StoreResult<u64>;

    async fn count_bids(&self) -> StoreResult<u64>;

    async fn count_dsps(&self) -> StoreResult<u64>;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
