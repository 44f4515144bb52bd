//! Seeded history through the metrics aggregator.

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, TimeZone, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rust_decimal::Decimal;
use std::sync::Arc;

use adsim::config::SeedConfig;
use adsim::engine::orchestrator::AuctionEngine;
use adsim::metrics::MetricsAggregator;
use adsim::seed;
use adsim::storage::memory::MemoryStore;
use adsim::storage::sqlite::SqliteStore;
use adsim::storage::AuctionStore;
use adsim::types::AdRequest;

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 2, 21, 12, 0, 0).unwrap()
}

fn seed_cfg() -> SeedConfig {
    SeedConfig {
        enabled: true,
        opportunities: 60,
        history_days: 7,
        rng_seed: Some(11),
    }
}

async fn seeded(store: Arc<dyn AuctionStore>) -> AuctionEngine {
    let engine = AuctionEngine::new(store);
    seed::seed(&engine, &seed_cfg(), &mut StdRng::seed_from_u64(11), now())
        .await
        .unwrap()
        .unwrap();
    engine
}

fn aggregator(store: Arc<dyn AuctionStore>, offset_hours: i32) -> MetricsAggregator {
    MetricsAggregator::new(store, FixedOffset::east_opt(offset_hours * 3600).unwrap(), 90)
}

#[tokio::test]
async fn test_seeded_report_is_consistent() {
    let store: Arc<dyn AuctionStore> = Arc::new(SqliteStore::in_memory().await.unwrap());
    seeded(store.clone()).await;

    // Eight local days reach back past the seven-day history span.
    let report = aggregator(store.clone(), 0).aggregate(8, now()).await.unwrap();
    assert_eq!(report.summary.total_requests, 60);
    assert_eq!(report.summary.total_bids, store.count_bids().await.unwrap());
    assert_eq!(report.summary.dsps_count, 3);
    assert_eq!(report.daily_trends.len(), 8);
    assert_eq!(
        report.daily_trends.last().unwrap().date,
        NaiveDate::from_ymd_opt(2026, 2, 21).unwrap()
    );

    let trend_requests: u64 = report.daily_trends.iter().map(|t| t.requests).sum();
    assert_eq!(trend_requests, report.summary.total_requests);
    for t in &report.daily_trends {
        assert!(t.filled <= t.requests);
        assert!((0.0..=100.0).contains(&t.fill_rate));
        assert!(t.avg_cpm >= Decimal::ZERO);
    }

    let wins: u64 = report.dsp_performance.iter().map(|p| p.wins).sum();
    let filled: u64 = report.daily_trends.iter().map(|t| t.filled).sum();
    assert_eq!(wins, filled);
    let names: Vec<_> = report.dsp_performance.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, ["Brand Advertisers", "Performance Network", "Global Reach"]);
}

#[tokio::test]
async fn test_backends_agree() {
    let memory: Arc<dyn AuctionStore> = Arc::new(MemoryStore::new());
    let sqlite: Arc<dyn AuctionStore> = Arc::new(SqliteStore::in_memory().await.unwrap());
    seeded(memory.clone()).await;
    seeded(sqlite.clone()).await;

    for (days, offset) in [(1, 0), (7, 0), (8, 10), (30, -5)] {
        let a = aggregator(memory.clone(), offset).aggregate(days, now()).await.unwrap();
        let b = aggregator(sqlite.clone(), offset).aggregate(days, now()).await.unwrap();
        assert_eq!(a, b, "window {days} at UTC{offset:+}");
    }

    let a = aggregator(memory, 0).dsp_leaderboard().await.unwrap();
    let b = aggregator(sqlite, 0).dsp_leaderboard().await.unwrap();
    let stats = |board: Vec<adsim::metrics::DspLeaderboardEntry>| {
        board.into_iter().map(|e| (e.name, e.stats)).collect::<Vec<_>>()
    };
    assert_eq!(stats(a), stats(b));
}

#[tokio::test]
async fn test_back_dated_request_lands_on_its_local_day() {
    let store: Arc<dyn AuctionStore> = Arc::new(MemoryStore::new());
    let engine = seeded(store.clone()).await;
    let slot = store.list_publishers().await.unwrap()[0].ad_slots[0].clone();

    // 23:30 UTC on Feb 21 is Feb 22 at UTC+2.
    let late = Utc.with_ymd_and_hms(2026, 2, 21, 23, 30, 0).unwrap();
    let req = AdRequest::new(&slot.publisher_id, &slot.id, "US", "desktop").at(late);
    engine
        .run_auction(&req, &mut StdRng::seed_from_u64(5), now())
        .await
        .unwrap();

    let at_utc = aggregator(store.clone(), 0)
        .aggregate(1, late)
        .await
        .unwrap();
    let plus_two = aggregator(store.clone(), 2)
        .aggregate(1, late + Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(
        plus_two.daily_trends[0].date,
        NaiveDate::from_ymd_opt(2026, 2, 22).unwrap()
    );
    assert_eq!(plus_two.summary.total_requests, 1);
    assert_eq!(plus_two.summary.fill_rate, 100.0);
    assert!(at_utc.summary.total_requests >= 1);
}
