//! End-to-end auctions against both store backends.

use chrono::{TimeZone, Utc};
use rand::rngs::mock::StepRng;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rust_decimal_macros::dec;
use std::sync::Arc;

use adsim::engine::orchestrator::AuctionEngine;
use adsim::seed::{demo_dsps, demo_inventory};
use adsim::storage::memory::MemoryStore;
use adsim::storage::sqlite::SqliteStore;
use adsim::storage::AuctionStore;
use adsim::types::{AdRequest, AdSlot, AuctionError, Dsp};

use crate::flaky_store::FlakyStore;

/// Insert demo inventory and DSPs; returns the "Top Banner" slot.
async fn populate(store: &dyn AuctionStore) -> AdSlot {
    let mut top_banner = None;
    for (publisher, slots) in demo_inventory() {
        store.insert_publisher(&publisher).await.unwrap();
        for slot in slots {
            store.insert_ad_slot(&slot).await.unwrap();
            if slot.name == "Top Banner" {
                top_banner = Some(slot);
            }
        }
    }
    for dsp in demo_dsps().unwrap() {
        store.insert_dsp(&dsp).await.unwrap();
    }
    top_banner.unwrap()
}

fn request(slot: &AdSlot, geo: &str, device: &str) -> AdRequest {
    AdRequest::new(&slot.publisher_id, &slot.id, geo, device)
}

#[tokio::test]
async fn test_sqlite_auction_persists_bids_and_winner() {
    let store = Arc::new(SqliteStore::in_memory().await.unwrap());
    let slot = populate(store.as_ref()).await;
    let engine = AuctionEngine::new(store.clone());
    let at = Utc.with_ymd_and_hms(2026, 2, 20, 8, 15, 0).unwrap();

    // Lowest jitter for everyone: 3.8, 5.0 and 4.2 become 3.42, 4.50, 3.78.
    let outcome = engine
        .run_auction(&request(&slot, "US", "mobile").at(at), &mut StepRng::new(0, 0), Utc::now())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome.winner_dsp, "Performance Network");
    assert_eq!(outcome.bid_price, dec!(4.50));

    let page = store.list_opportunities(0, 10).await.unwrap();
    assert_eq!(page.total, 1);
    let record = &page.items[0];
    assert_eq!(record.opportunity.request_time, at);
    assert_eq!(record.bids.len(), 3);
    assert!(record.bids.iter().all(|b| b.created_at == at));
    let winner = record.winning_bid().unwrap();
    assert_eq!(winner.price, dec!(4.50));
    assert_eq!(winner.creative, outcome.creative);
}

#[tokio::test]
async fn test_untargeted_request_is_recorded_unfilled() {
    let store = Arc::new(SqliteStore::in_memory().await.unwrap());
    let slot = populate(store.as_ref()).await;
    let engine = AuctionEngine::new(store.clone());

    let outcome = engine
        .run_auction(&request(&slot, "ZZ", "mobile"), &mut StdRng::seed_from_u64(3), Utc::now())
        .await
        .unwrap();
    assert!(outcome.is_none());

    let page = store.list_opportunities(0, 10).await.unwrap();
    assert_eq!(page.total, 1);
    assert!(!page.items[0].opportunity.is_filled());
    assert!(page.items[0].bids.is_empty());
    assert_eq!(store.count_bids().await.unwrap(), 0);
}

#[tokio::test]
async fn test_malformed_dsp_does_not_block_auction() {
    let store = Arc::new(MemoryStore::new());
    let slot = populate(store.as_ref()).await;
    store
        .insert_dsp(&Dsp::with_raw_rules("Broken", "{\"geos\": [\"US\""))
        .await
        .unwrap();
    let engine = AuctionEngine::new(store.clone());

    let outcome = engine
        .run_auction(&request(&slot, "US", "desktop"), &mut StepRng::new(0, 0), Utc::now())
        .await
        .unwrap()
        .unwrap();
    // 4.5 × 0.90 beats 3.5 × 0.90 and 2.0 × 0.90.
    assert_eq!(outcome.winner_dsp, "Brand Advertisers");
    assert_eq!(outcome.bid_price, dec!(4.05));
    assert_eq!(store.count_bids().await.unwrap(), 3);
}

#[tokio::test]
async fn test_failed_settlement_leaves_no_orphan_bids() {
    let store = Arc::new(FlakyStore::new());
    let slot = populate(store.as_ref()).await;
    let engine = AuctionEngine::new(store.clone());
    let req = request(&slot, "US", "mobile");

    store.fail_settlements("disk full");
    let err = engine
        .run_auction(&req, &mut StdRng::seed_from_u64(9), Utc::now())
        .await
        .unwrap_err();
    assert!(matches!(err, AuctionError::Transient(_)));
    assert!(err.is_retryable());

    let page = store.list_opportunities(0, 10).await.unwrap();
    assert_eq!(page.total, 1);
    assert!(!page.items[0].opportunity.is_filled());
    assert_eq!(store.count_bids().await.unwrap(), 0);

    // A retry opens a fresh opportunity.
    store.heal();
    let outcome = engine
        .run_auction(&req, &mut StdRng::seed_from_u64(9), Utc::now())
        .await
        .unwrap();
    assert!(outcome.is_some());
    assert_eq!(store.count_opportunities().await.unwrap(), 2);
    assert_eq!(store.count_bids().await.unwrap(), 3);
}

#[tokio::test]
async fn test_same_seed_same_prices_across_backends() {
    let memory = Arc::new(MemoryStore::new());
    let sqlite = Arc::new(SqliteStore::in_memory().await.unwrap());
    let mem_slot = populate(memory.as_ref()).await;
    let sql_slot = populate(sqlite.as_ref()).await;
    let mem_engine = AuctionEngine::new(memory);
    let sql_engine = AuctionEngine::new(sqlite);

    let mut a = StdRng::seed_from_u64(2024);
    let mut b = StdRng::seed_from_u64(2024);
    for (geo, device) in [("US", "mobile"), ("UK", "desktop"), ("DE", "tablet"), ("FR", "mobile")] {
        let x = mem_engine
            .run_auction(&request(&mem_slot, geo, device), &mut a, Utc::now())
            .await
            .unwrap();
        let y = sql_engine
            .run_auction(&request(&sql_slot, geo, device), &mut b, Utc::now())
            .await
            .unwrap();
        assert_eq!(
            x.map(|o| (o.winner_dsp, o.bid_price)),
            y.map(|o| (o.winner_dsp, o.bid_price)),
            "{geo}-{device}"
        );
    }
}
