//! In-memory store.
//!
//! Keeps every table in a `Vec` behind a tokio `RwLock`. Aggregates are a
//! single pass over the relevant table, grouped in a `BTreeMap`.

use async_trait::async_trait;
use chrono::{FixedOffset, NaiveDate};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashSet};
use tokio::sync::RwLock;

use super::{
    local_day, AuctionStore, DailyBidStats, DailyOpportunityCounts, DspBidStats,
    OpportunityPage, OpportunityRecord, StoreError, StoreResult, TimeWindow,
};
use crate::types::{AdSlot, AuctionOpportunity, Bid, Dsp, Publisher, PublisherInventory};

#[derive(Debug, Default)]
struct Tables {
    publishers: Vec<Publisher>,
    ad_slots: Vec<AdSlot>,
    dsps: Vec<Dsp>,
    opportunities: Vec<AuctionOpportunity>,
    settled: HashSet<String>,
    bids: Vec<Bid>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn conflict_if_present(exists: bool, entity: &str, id: &str) -> StoreResult<()> {
    if exists {
        return Err(StoreError::Conflict(format!("{entity} {id} already exists")));
    }
    Ok(())
}

#[async_trait]
impl AuctionStore for MemoryStore {
    async fn get_publisher(&self, id: &str) -> StoreResult<Option<Publisher>> {
        let t = self.tables.read().await;
        Ok(t.publishers.iter().find(|p| p.id == id).cloned())
    }

    async fn get_ad_slot(&self, id: &str) -> StoreResult<Option<AdSlot>> {
        let t = self.tables.read().await;
        Ok(t.ad_slots.iter().find(|s| s.id == id).cloned())
    }

    async fn get_dsp(&self, id: &str) -> StoreResult<Option<Dsp>> {
        let t = self.tables.read().await;
        Ok(t.dsps.iter().find(|d| d.id == id).cloned())
    }

    async fn get_opportunity(&self, id: &str) -> StoreResult<Option<AuctionOpportunity>> {
        let t = self.tables.read().await;
        Ok(t.opportunities.iter().find(|o| o.id == id).cloned())
    }

    async fn list_publishers(&self) -> StoreResult<Vec<PublisherInventory>> {
        let t = self.tables.read().await;
        Ok(t.publishers
            .iter()
            .map(|p| PublisherInventory {
                publisher: p.clone(),
                ad_slots: t
                    .ad_slots
                    .iter()
                    .filter(|s| s.publisher_id == p.id)
                    .cloned()
                    .collect(),
            })
            .collect())
    }

    async fn list_dsps(&self) -> StoreResult<Vec<Dsp>> {
        Ok(self.tables.read().await.dsps.clone())
    }

    async fn insert_publisher(&self, publisher: &Publisher) -> StoreResult<()> {
        let mut t = self.tables.write().await;
        conflict_if_present(
            t.publishers.iter().any(|p| p.id == publisher.id),
            "Publisher",
            &publisher.id,
        )?;
        t.publishers.push(publisher.clone());
        Ok(())
    }

    async fn insert_ad_slot(&self, slot: &AdSlot) -> StoreResult<()> {
        let mut t = self.tables.write().await;
        conflict_if_present(t.ad_slots.iter().any(|s| s.id == slot.id), "Ad slot", &slot.id)?;
        if !t.publishers.iter().any(|p| p.id == slot.publisher_id) {
            return Err(StoreError::Missing {
                entity: "Publisher",
                id: slot.publisher_id.clone(),
            });
        }
        t.ad_slots.push(slot.clone());
        Ok(())
    }

    async fn insert_dsp(&self, dsp: &Dsp) -> StoreResult<()> {
        let mut t = self.tables.write().await;
        conflict_if_present(t.dsps.iter().any(|d| d.id == dsp.id), "DSP", &dsp.id)?;
        t.dsps.push(dsp.clone());
        Ok(())
    }

    async fn insert_opportunity(&self, opportunity: &AuctionOpportunity) -> StoreResult<()> {
        let mut t = self.tables.write().await;
        conflict_if_present(
            t.opportunities.iter().any(|o| o.id == opportunity.id),
            "Opportunity",
            &opportunity.id,
        )?;
        t.opportunities.push(opportunity.clone());
        Ok(())
    }

    async fn settle_opportunity(
        &self,
        opportunity_id: &str,
        bids: &[Bid],
        winning_bid_id: Option<String>,
    ) -> StoreResult<()> {
        let mut t = self.tables.write().await;

        // Validate everything before mutating anything.
        let idx = t
            .opportunities
            .iter()
            .position(|o| o.id == opportunity_id)
            .ok_or_else(|| StoreError::Missing {
                entity: "Opportunity",
                id: opportunity_id.to_string(),
            })?;
        if t.settled.contains(opportunity_id) {
            return Err(StoreError::Conflict(format!(
                "opportunity {opportunity_id} already settled"
            )));
        }
        if let Some(bid) = bids.iter().find(|b| b.opportunity_id != opportunity_id) {
            return Err(StoreError::Conflict(format!(
                "bid {} belongs to opportunity {}",
                bid.id, bid.opportunity_id
            )));
        }
        if let Some(ref winner) = winning_bid_id {
            if !bids.iter().any(|b| &b.id == winner) {
                return Err(StoreError::Conflict(format!(
                    "winning bid {winner} is not among the settled bids"
                )));
            }
        }

        t.bids.extend_from_slice(bids);
        t.opportunities[idx].winning_bid_id = winning_bid_id;
        t.settled.insert(opportunity_id.to_string());
        Ok(())
    }

    async fn list_opportunities(&self, offset: u64, limit: u64) -> StoreResult<OpportunityPage> {
        let t = self.tables.read().await;
        // Newest insert first among equal request times.
        let mut sorted: Vec<&AuctionOpportunity> = t.opportunities.iter().rev().collect();
        sorted.sort_by(|a, b| b.request_time.cmp(&a.request_time));

        let items = sorted
            .into_iter()
            .skip(usize::try_from(offset).unwrap_or(usize::MAX))
            .take(usize::try_from(limit).unwrap_or(usize::MAX))
            .map(|o| OpportunityRecord {
                opportunity: o.clone(),
                bids: t
                    .bids
                    .iter()
                    .filter(|b| b.opportunity_id == o.id)
                    .cloned()
                    .collect(),
            })
            .collect();

        Ok(OpportunityPage {
            total: t.opportunities.len() as u64,
            items,
        })
    }

    async fn opportunity_counts_by_day(
        &self,
        window: TimeWindow,
        utc_offset: FixedOffset,
    ) -> StoreResult<Vec<DailyOpportunityCounts>> {
        let t = self.tables.read().await;
        let mut days: BTreeMap<NaiveDate, (u64, u64)> = BTreeMap::new();
        for o in t.opportunities.iter().filter(|o| window.contains(o.request_time)) {
            let entry = days.entry(local_day(o.request_time, utc_offset)).or_default();
            entry.0 += 1;
            if o.is_filled() {
                entry.1 += 1;
            }
        }
        Ok(days
            .into_iter()
            .map(|(day, (total, filled))| DailyOpportunityCounts { day, total, filled })
            .collect())
    }

    async fn bid_stats_by_day(
        &self,
        window: TimeWindow,
        utc_offset: FixedOffset,
    ) -> StoreResult<Vec<DailyBidStats>> {
        let t = self.tables.read().await;
        let mut days: BTreeMap<NaiveDate, (u64, Decimal)> = BTreeMap::new();
        for b in t.bids.iter().filter(|b| window.contains(b.created_at)) {
            let entry = days.entry(local_day(b.created_at, utc_offset)).or_default();
            entry.0 += 1;
            entry.1 += b.price;
        }
        Ok(days
            .into_iter()
            .map(|(day, (bids, price_sum))| DailyBidStats { day, bids, price_sum })
            .collect())
    }

    async fn bid_stats_by_dsp(&self, window: TimeWindow) -> StoreResult<Vec<DspBidStats>> {
        let t = self.tables.read().await;
        let winners: HashSet<&str> = t
            .opportunities
            .iter()
            .filter_map(|o| o.winning_bid_id.as_deref())
            .collect();

        let mut by_dsp: BTreeMap<&str, DspBidStats> = BTreeMap::new();
        for b in t.bids.iter().filter(|b| window.contains(b.created_at)) {
            let stats = by_dsp.entry(b.dsp_id.as_str()).or_insert_with(|| DspBidStats {
                dsp_id: b.dsp_id.clone(),
                bids: 0,
                wins: 0,
                price_sum: Decimal::ZERO,
                min_price: None,
                max_price: None,
            });
            stats.bids += 1;
            if winners.contains(b.id.as_str()) {
                stats.wins += 1;
            }
            stats.price_sum += b.price;
            stats.min_price = Some(stats.min_price.map_or(b.price, |m| m.min(b.price)));
            stats.max_price = Some(stats.max_price.map_or(b.price, |m| m.max(b.price)));
        }
        Ok(by_dsp.into_values().collect())
    }

    async fn count_opportunities(&self) -> StoreResult<u64> {
        Ok(self.tables.read().await.opportunities.len() as u64)
    }

    async fn count_bids(&self) -> StoreResult<u64> {
        Ok(self.tables.read().await.bids.len() as u64)
    }

    async fn count_dsps(&self) -> StoreResult<u64> {
        Ok(self.tables.read().await.dsps.len() as u64)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
