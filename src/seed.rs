//! Demo data: inventory, DSPs and historical auctions.
//!
//! History is produced by running real auctions back-dated over the last
//! `history_days` days, so seeded bids follow the same targeting, jitter and
//! resolution rules as live traffic.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::info;

use crate::config::SeedConfig;
use crate::engine::orchestrator::AuctionEngine;
use crate::engine::targeting::{TargetingError, TargetingRule};
use crate::storage::AuctionStore;
use crate::types::{AdRequest, AdSlot, Dsp, Publisher};

/// Geos drawn for historical requests.
pub const SEED_GEOS: [&str; 5] = ["US", "CA", "UK", "DE", "FR"];
/// Devices drawn for historical requests.
pub const SEED_DEVICES: [&str; 3] = ["desktop", "mobile", "tablet"];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeedSummary {
    pub publishers: usize,
    pub ad_slots: usize,
    pub dsps: usize,
    pub opportunities: u32,
    pub filled: u32,
}

fn rule(
    geos: &[&str],
    devices: &[&str],
    pricing: &[(&str, Decimal)],
) -> Result<TargetingRule, TargetingError> {
    TargetingRule::new(
        geos.iter().copied(),
        devices.iter().copied(),
        pricing.iter().map(|(k, v)| (k.to_string(), *v)),
    )
}

/// The three demo DSPs, in enumeration order.
pub fn demo_dsps() -> Result<Vec<Dsp>, TargetingError> {
    let brand = rule(
        &["US", "CA", "UK"],
        &["desktop", "mobile"],
        &[
            ("US-desktop", dec!(4.5)),
            ("US-mobile", dec!(3.8)),
            ("CA-desktop", dec!(3.2)),
            ("CA-mobile", dec!(2.8)),
            ("UK-desktop", dec!(3.0)),
            ("UK-mobile", dec!(2.5)),
            ("default", dec!(1.0)),
        ],
    )?;
    let performance = rule(
        &["US", "CA", "UK", "AU", "DE"],
        &["desktop", "mobile", "tablet"],
        &[
            ("US-mobile", dec!(5.0)),
            ("US-tablet", dec!(4.2)),
            ("US-desktop", dec!(3.5)),
            ("CA-mobile", dec!(3.2)),
            ("UK-mobile", dec!(3.0)),
            ("default", dec!(1.5)),
        ],
    )?;
    let global = rule(
        &["US", "CA", "UK", "AU", "DE", "FR", "JP", "BR", "MX"],
        &["desktop", "mobile", "tablet", "tv"],
        &[
            ("US-mobile", dec!(4.2)),
            ("JP-desktop", dec!(5.0)),
            ("UK-mobile", dec!(3.5)),
            ("DE-tablet", dec!(3.0)),
            ("FR-desktop", dec!(2.8)),
            ("default", dec!(2.0)),
        ],
    )?;

    Ok(vec![
        Dsp::new("Brand Advertisers", &brand)?,
        Dsp::new("Performance Network", &performance)?,
        Dsp::new("Global Reach", &global)?,
    ])
}

/// Two demo publishers with two slots each.
pub fn demo_inventory() -> Vec<(Publisher, Vec<AdSlot>)> {
    let news = Publisher::new("News Site");
    let news_slots = vec![
        AdSlot::new(&news, "Header Banner", "banner", "728x90"),
        AdSlot::new(&news, "Sidebar", "banner", "300x250"),
    ];
    let gaming = Publisher::new("Gaming Portal");
    let gaming_slots = vec![
        AdSlot::new(&gaming, "Top Banner", "banner", "970x250"),
        AdSlot::new(&gaming, "In-content", "native", "600x400"),
    ];
    vec![(news, news_slots), (gaming, gaming_slots)]
}

/// Seed the store unless DSPs already exist.
///
/// Returns `None` when seeding was skipped.
pub async fn seed<R: Rng + Send + ?Sized>(
    engine: &AuctionEngine,
    cfg: &SeedConfig,
    rng: &mut R,
    now: DateTime<Utc>,
) -> Result<Option<SeedSummary>> {
    let store = engine.store();
    let existing = store.count_dsps().await.context("Failed to count DSPs")?;
    if existing > 0 {
        info!(dsps = existing, "Store already populated, skipping seed");
        return Ok(None);
    }

    let mut summary = SeedSummary::default();
    let mut slots = Vec::new();
    for (publisher, ad_slots) in demo_inventory() {
        store
            .insert_publisher(&publisher)
            .await
            .with_context(|| format!("Failed to insert publisher {}", publisher.name))?;
        summary.publishers += 1;
        for slot in ad_slots {
            store
                .insert_ad_slot(&slot)
                .await
                .with_context(|| format!("Failed to insert ad slot {}", slot.name))?;
            slots.push(slot);
        }
    }
    summary.ad_slots = slots.len();

    for dsp in demo_dsps().context("Invalid demo targeting rules")? {
        store
            .insert_dsp(&dsp)
            .await
            .with_context(|| format!("Failed to insert DSP {}", dsp.name))?;
        summary.dsps += 1;
    }

    let span_secs = i64::from(cfg.history_days) * 86_400;
    for _ in 0..cfg.opportunities {
        let (Some(slot), Some(geo), Some(device)) = (
            slots.choose(&mut *rng),
            SEED_GEOS.choose(&mut *rng),
            SEED_DEVICES.choose(&mut *rng),
        ) else {
            break;
        };
        let at = now - Duration::seconds(rng.gen_range(0..span_secs.max(1)));
        let request = AdRequest::new(&slot.publisher_id, &slot.id, *geo, *device).at(at);

        let outcome = engine
            .run_auction(&request, &mut *rng, now)
            .await
            .context("Seed auction failed")?;
        summary.opportunities += 1;
        if outcome.is_some() {
            summary.filled += 1;
        }
    }
    info!(
        publishers = summary.publishers,
        ad_slots = summary.ad_slots,
        dsps = summary.dsps,
        opportunities = summary.opportunities,
        filled = summary.filled,
        "Demo data seeded"
    );
    Ok(Some(summary))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
