//! Failure-injecting store for integration testing.
//!
//! Wraps a `MemoryStore` and delegates every call to it, except that
//! settlement can be forced to fail. Lets tests observe what is left
//! behind when the second write phase of an auction breaks.

use async_trait::async_trait;
use chrono::FixedOffset;
use std::sync::{Arc, Mutex};

use adsim::storage::memory::MemoryStore;
use adsim::storage::{
    AuctionStore, DailyBidStats, DailyOpportunityCounts, DspBidStats, OpportunityPage,
    StoreError, StoreResult, TimeWindow,
};
use adsim::types::{AdSlot, AuctionOpportunity, Bid, Dsp, Publisher, PublisherInventory};

pub struct FlakyStore {
    inner: MemoryStore,
    /// If set, `settle_opportunity` fails with this message.
    fail_settle: Arc<Mutex<Option<String>>>,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            fail_settle: Arc::new(Mutex::new(None)),
        }
    }

    pub fn fail_settlements(&self, msg: &str) {
        *self.fail_settle.lock().unwrap() = Some(msg.to_string());
    }

    pub fn heal(&self) {
        *self.fail_settle.lock().unwrap() = None;
    }
}

#[async_trait]
impl AuctionStore for FlakyStore {
    async fn get_publisher(&self, id: &str) -> StoreResult<Option<Publisher>> {
        self.inner.get_publisher(id).await
    }

    async fn get_ad_slot(&self, id: &str) -> StoreResult<Option<AdSlot>> {
        self.inner.get_ad_slot(id).await
    }

    async fn get_dsp(&self, id: &str) -> StoreResult<Option<Dsp>> {
        self.inner.get_dsp(id).await
    }

    async fn get_opportunity(&self, id: &str) -> StoreResult<Option<AuctionOpportunity>> {
        self.inner.get_opportunity(id).await
    }

    async fn list_publishers(&self) -> StoreResult<Vec<PublisherInventory>> {
        self.inner.list_publishers().await
    }

    async fn list_dsps(&self) -> StoreResult<Vec<Dsp>> {
        self.inner.list_dsps().await
    }

    async fn insert_publisher(&self, publisher: &Publisher) -> StoreResult<()> {
        self.inner.insert_publisher(publisher).await
    }

    async fn insert_ad_slot(&self, slot: &AdSlot) -> StoreResult<()> {
        self.inner.insert_ad_slot(slot).await
    }

    async fn insert_dsp(&self, dsp: &Dsp) -> StoreResult<()> {
        self.inner.insert_dsp(dsp).await
    }

    async fn insert_opportunity(&self, opportunity: &AuctionOpportunity) -> StoreResult<()> {
        self.inner.insert_opportunity(opportunity).await
    }

    async fn settle_opportunity(
        &self,
        opportunity_id: &str,
        bids: &[Bid],
        winning_bid_id: Option<String>,
    ) -> StoreResult<()> {
        let forced = self.fail_settle.lock().unwrap().clone();
        if let Some(msg) = forced {
            return Err(StoreError::Conflict(msg));
        }
        self.inner
            .settle_opportunity(opportunity_id, bids, winning_bid_id)
            .await
    }

    async fn list_opportunities(&self, offset: u64, limit: u64) -> StoreResult<OpportunityPage> {
        self.inner.list_opportunities(offset, limit).await
    }

    async fn opportunity_counts_by_day(
        &self,
        window: TimeWindow,
        utc_offset: FixedOffset,
    ) -> StoreResult<Vec<DailyOpportunityCounts>> {
        self.inner.opportunity_counts_by_day(window, utc_offset).await
    }

    async fn bid_stats_by_day(
        &self,
        window: TimeWindow,
        utc_offset: FixedOffset,
    ) -> StoreResult<Vec<DailyBidStats>> {
        self.inner.bid_stats_by_day(window, utc_offset).await
    }

    async fn bid_stats_by_dsp(&self, window: TimeWindow) -> StoreResult<Vec<DspBidStats>> {
        self.inner.bid_stats_by_dsp(window).await
    }

    async fn count_opportunities(&self) -> StoreResult<u64> {
        self.inner.count_opportunities().await
    }

    async fn count_bids(&self) -> StoreResult<u64> {
        self.inner.count_bids().await
    }

    async fn count_dsps(&self) -> StoreResult<u64> {
        self.inner.count_dsps().await
    }
}
