//! Bid generator.
//!
//! Evaluates every DSP against one opportunity, in the caller's DSP order,
//! and materialises bids for the eligible ones. Randomness (price jitter and
//! creative selection) comes from an injected `Rng` so tests can pin it.

use rand::Rng;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use tracing::{debug, warn};

use super::targeting::{Evaluation, TargetingError};
use crate::types::{new_id, AuctionOpportunity, Bid, Creative, Dsp};

/// Lower bound of the multiplicative price jitter (inclusive).
pub const JITTER_MIN: Decimal = dec!(0.90);
/// Upper bound of the multiplicative price jitter (inclusive).
pub const JITTER_MAX: Decimal = dec!(1.10);

/// Jitter is drawn on a basis-point grid over `[JITTER_MIN, JITTER_MAX]`.
const JITTER_MIN_BPS: u32 = 9_000;
const JITTER_MAX_BPS: u32 = 11_000;

/// A DSP that could not be evaluated. Logged and excluded, never fatal.
#[derive(Debug, thiserror::Error)]
#[error("DSP {dsp_name} ({dsp_id}) skipped: {source}")]
pub struct DspEvaluationError {
    pub dsp_id: String,
    pub dsp_name: String,
    #[source]
    pub source: TargetingError,
}

/// Everything one generation pass produced.
#[derive(Debug, Default)]
pub struct BidBatch {
    /// Bids in DSP enumeration order.
    pub bids: Vec<Bid>,
    pub errors: Vec<DspEvaluationError>,
}

impl BidBatch {
    pub fn is_empty(&self) -> bool {
        self.bids.is_empty()
    }
}

/// Draw a jitter factor uniformly from `[0.90, 1.10]`.
pub fn draw_jitter<R: Rng + ?Sized>(rng: &mut R) -> Decimal {
    Decimal::new(rng.gen_range(JITTER_MIN_BPS..=JITTER_MAX_BPS) as i64, 4)
}

/// Apply jitter to a base price, rounded to cents and kept inside
/// `[0.90 × base, 1.10 × base]`.
pub fn jittered_price(base: Decimal, jitter: Decimal) -> Decimal {
    let floor = (base * JITTER_MIN).round_dp_with_strategy(2, RoundingStrategy::ToPositiveInfinity);
    let ceil = (base * JITTER_MAX).round_dp_with_strategy(2, RoundingStrategy::ToNegativeInfinity);
    let price = (base * jitter).round_dp(2);
    if floor > ceil {
        // Sub-cent bases leave no cent value inside the band.
        return price;
    }
    price.clamp(floor, ceil)
}

/// Placeholder creative for a DSP.
pub fn mock_creative<R: Rng + ?Sized>(dsp: &Dsp, rng: &mut R) -> Creative {
    let image = rng.gen_range(0..100);
    let creative = rng.gen_range(0..1000);
    Creative {
        image_url: format!("https://picsum.photos/id/{image}/600/400"),
        click_url: format!(
            "https://example.com/landing?campaign={}&creative={creative}",
            urlencoding::encode(&dsp.id)
        ),
    }
}

pub struct BidGenerator;

impl BidGenerator {
    /// Generate bids for `opportunity` from every eligible DSP.
    ///
    /// The returned bids preserve `dsps` order, which is the tie-break order
    /// used by the resolver. An empty batch is a normal outcome.
    pub fn generate<R: Rng + ?Sized>(
        dsps: &[Dsp],
        opportunity: &AuctionOpportunity,
        rng: &mut R,
    ) -> BidBatch {
        dsps.iter().fold(BidBatch::default(), |mut batch, dsp| {
            match Self::bid_for(dsp, opportunity, rng) {
                Ok(Some(bid)) => {
                    debug!(
                        dsp = %dsp.name,
                        opportunity_id = %opportunity.id,
                        price = %bid.price,
                        "Bid placed"
                    );
                    batch.bids.push(bid);
                }
                Ok(None) => {}
                Err(source) => {
                    let err = DspEvaluationError {
                        dsp_id: dsp.id.clone(),
                        dsp_name: dsp.name.clone(),
                        source,
                    };
                    warn!(
                        dsp = %dsp,
                        opportunity_id = %opportunity.id,
                        error = %err,
                        "DSP evaluation failed"
                    );
                    batch.errors.push(err);
                }
            }
            batch
        })
    }

    fn bid_for<R: Rng + ?Sized>(
        dsp: &Dsp,
        opportunity: &AuctionOpportunity,
        rng: &mut R,
    ) -> Result<Option<Bid>, TargetingError> {
        let rule = dsp.targeting()?;
        let base_price = match rule.evaluate(&opportunity.geo, &opportunity.device) {
            Evaluation::Eligible { base_price } => base_price,
            Evaluation::Ineligible => return Ok(None),
        };

        let price = jittered_price(base_price, draw_jitter(rng));
        Ok(Some(Bid {
            id: new_id(),
            dsp_id: dsp.id.clone(),
            opportunity_id: opportunity.id.clone(),
            price,
            creative: mock_creative(dsp, rng),
            created_at: opportunity.request_time,
        }))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
