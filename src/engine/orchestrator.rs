//! Auction orchestrator: validate, open the opportunity, bid, resolve.
//!
//! The write path is two-phase: the opportunity row is inserted first, then
//! bids and the winner reference are written together by
//! `settle_opportunity`. A failure between the phases leaves an unsettled
//! opportunity without bids; retrying the auction opens a new opportunity.

use chrono::{DateTime, Utc};
use rand::Rng;
use std::sync::Arc;
use tracing::{error, info, warn};

use super::bidder::BidGenerator;
use super::resolver::AuctionResolver;
use crate::storage::AuctionStore;
use crate::types::{AdRequest, AuctionError, AuctionOpportunity, AuctionOutcome};

pub struct AuctionEngine {
    store: Arc<dyn AuctionStore>,
}

impl AuctionEngine {
    pub fn new(store: Arc<dyn AuctionStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn AuctionStore> {
        &self.store
    }

    /// Run one auction.
    ///
    /// `Ok(None)` means the auction ran and nobody bid. `now` is used as the
    /// request time when the request carries none.
    pub async fn run_auction<R: Rng + Send + ?Sized>(
        &self,
        request: &AdRequest,
        rng: &mut R,
        now: DateTime<Utc>,
    ) -> Result<Option<AuctionOutcome>, AuctionError> {
        validate(request)?;

        let publisher = self
            .store
            .get_publisher(&request.publisher_id)
            .await?
            .ok_or_else(|| AuctionError::not_found("Publisher", &request.publisher_id))?;
        let slot = self
            .store
            .get_ad_slot(&request.ad_slot_id)
            .await?
            .ok_or_else(|| AuctionError::not_found("Ad slot", &request.ad_slot_id))?;
        if slot.publisher_id != publisher.id {
            return Err(AuctionError::Validation(format!(
                "ad slot {} does not belong to publisher {}",
                slot.id, publisher.id
            )));
        }

        let opportunity = AuctionOpportunity::new(request, request.time.unwrap_or(now));
        self.store.insert_opportunity(&opportunity).await?;

        match self.bid_and_settle(&opportunity, rng).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                error!(
                    opportunity_id = %opportunity.id,
                    error = %e,
                    "Auction failed after opening opportunity"
                );
                Err(e)
            }
        }
    }

    async fn bid_and_settle<R: Rng + Send + ?Sized>(
        &self,
        opportunity: &AuctionOpportunity,
        rng: &mut R,
    ) -> Result<Option<AuctionOutcome>, AuctionError> {
        let dsps = self.store.list_dsps().await?;
        let batch = BidGenerator::generate(&dsps, opportunity, rng);
        if !batch.errors.is_empty() {
            warn!(
                opportunity_id = %opportunity.id,
                skipped = batch.errors.len(),
                "Some DSPs were excluded from the auction"
            );
        }

        let Some(winner) =
            AuctionResolver::settle(self.store.as_ref(), opportunity, &batch.bids).await?
        else {
            info!(opportunity = %opportunity, "No eligible bids");
            return Ok(None);
        };

        let winner_dsp = dsps
            .iter()
            .find(|d| d.id == winner.dsp_id)
            .map(|d| d.name.clone())
            .unwrap_or_else(|| winner.dsp_id.clone());

        Ok(Some(AuctionOutcome {
            winner_dsp,
            bid_price: winner.price,
            creative: winner.creative.clone(),
        }))
    }
}

fn validate(request: &AdRequest) -> Result<(), AuctionError> {
    let fields = [
        ("publisher_id", &request.publisher_id),
        ("ad_slot_id", &request.ad_slot_id),
        ("geo", &request.geo),
        ("device", &request.device),
    ];
    for (name, value) in fields {
        if value.trim().is_empty() {
            return Err(AuctionError::Validation(format!("{name} must not be empty")));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
