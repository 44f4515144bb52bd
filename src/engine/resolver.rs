//! First-price winner selection and settlement.

use tracing::info;

use crate::storage::{AuctionStore, StoreError};
use crate::types::{AuctionOpportunity, Bid};

/// Pick the winning bid: strictly highest price, earliest bid on ties.
pub fn resolve(bids: &[Bid]) -> Option<&Bid> {
    let (first, rest) = bids.split_first()?;
    Some(rest.iter().fold(first, |winner, bid| {
        if bid.price > winner.price {
            bid
        } else {
            winner
        }
    }))
}

/// Selects the winner and persists the outcome.
pub struct AuctionResolver;

impl AuctionResolver {
    /// Resolve `bids` for `opportunity` and write bids + winner atomically.
    ///
    /// Returns the winning bid, or `None` when nobody bid. The opportunity is
    /// settled either way so its bid set is final.
    pub async fn settle<'a>(
        store: &dyn AuctionStore,
        opportunity: &AuctionOpportunity,
        bids: &'a [Bid],
    ) -> Result<Option<&'a Bid>, StoreError> {
        let winner = resolve(bids);
        store
            .settle_opportunity(&opportunity.id, bids, winner.map(|b| b.id.clone()))
            .await?;

        match winner {
            Some(bid) => info!(
                opportunity_id = %opportunity.id,
                bids = bids.len(),
                winning_bid = %bid,
                "Auction resolved"
            ),
            None => info!(opportunity_id = %opportunity.id, "Auction closed with no bids"),
        }
        Ok(winner)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
