//! Batch simulation: N sequential auctions with a per-DSP win summary.

use chrono::{DateTime, Utc};
use rand::Rng;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::info;

use super::orchestrator::AuctionEngine;
use crate::types::{AdRequest, AuctionError, AuctionOutcome};

/// Wins of one DSP across a simulation batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DspWinSummary {
    pub dsp_name: String,
    pub wins: u64,
    /// `wins / total_auctions * 100`.
    pub win_rate: f64,
    /// Mean winning price.
    pub avg_bid: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub total_auctions: u32,
    pub successful_auctions: u32,
    pub by_dsp: Vec<DspWinSummary>,
    /// One entry per auction; `null` when nobody bid.
    pub raw_results: Vec<Option<AuctionOutcome>>,
}

impl SimulationReport {
    /// Summarise auction results. DSP rows are ordered by first win.
    pub fn from_results(results: Vec<Option<AuctionOutcome>>) -> Self {
        let total = results.len() as u32;
        let mut tallies: Vec<(String, u64, Decimal)> = Vec::new();
        for outcome in results.iter().flatten() {
            match tallies.iter_mut().find(|(name, _, _)| *name == outcome.winner_dsp) {
                Some((_, wins, sum)) => {
                    *wins += 1;
                    *sum += outcome.bid_price;
                }
                None => tallies.push((outcome.winner_dsp.clone(), 1, outcome.bid_price)),
            }
        }

        let by_dsp = tallies
            .into_iter()
            .map(|(dsp_name, wins, sum)| DspWinSummary {
                dsp_name,
                wins,
                win_rate: crate::metrics::percentage(wins, total as u64),
                avg_bid: (sum / Decimal::from(wins)).round_dp(2),
            })
            .collect();

        Self {
            total_auctions: total,
            successful_auctions: results.iter().filter(|r| r.is_some()).count() as u32,
            by_dsp,
            raw_results: results,
        }
    }
}

impl AuctionEngine {
    /// Run `count` auctions for the same request, one after another.
    ///
    /// Stops at the first error; auctions already run stay recorded.
    pub async fn simulate<R: Rng + Send + ?Sized>(
        &self,
        request: &AdRequest,
        count: u32,
        rng: &mut R,
        now: DateTime<Utc>,
    ) -> Result<SimulationReport, AuctionError> {
        if count == 0 {
            return Err(AuctionError::Validation("count must be at least 1".into()));
        }

        let mut results = Vec::with_capacity(count as usize);
        for _ in 0..count {
            results.push(self.run_auction(request, &mut *rng, now).await?);
        }

        let report = SimulationReport::from_results(results);
        info!(
            total = report.total_auctions,
            filled = report.successful_auctions,
            winners = report.by_dsp.len(),
            "Simulation complete"
        );
        Ok(report)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
