//! Metrics aggregation over stored auction history.
//!
//! A report is built from three grouped scans issued concurrently (by
//! day for opportunities, by day for bids, by DSP for bids) plus the DSP
//! list. Days with no traffic are filled in as zero rows, so the trend
//! always has exactly `window_days` entries in ascending date order.
//!
//! Ratios are percentages in `[0, 100]`; a zero denominator yields `0`.

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveTime, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::storage::{local_day, AuctionStore, DspBidStats, TimeWindow};
use crate::types::AuctionError;

// ---------------------------------------------------------------------------
// Ratio helpers
// ---------------------------------------------------------------------------

/// `num / den * 100`, or `0` when `den` is zero.
pub fn percentage(num: u64, den: u64) -> f64 {
    if den == 0 {
        return 0.0;
    }
    num as f64 / den as f64 * 100.0
}

/// Mean price × 1000, rounded to cents; `0` without bids.
pub fn avg_cpm(price_sum: Decimal, bids: u64) -> Decimal {
    if bids == 0 {
        return Decimal::ZERO;
    }
    (price_sum / Decimal::from(bids) * dec!(1000)).round_dp(2)
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

// ---------------------------------------------------------------------------
// Report types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub total_requests: u64,
    pub total_bids: u64,
    pub fill_rate: f64,
    pub avg_cpm: Decimal,
    pub dsps_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyTrend {
    /// Serialised as `yyyy-MM-dd`.
    pub date: NaiveDate,
    pub requests: u64,
    pub filled: u64,
    pub fill_rate: f64,
    pub avg_cpm: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DspPerformance {
    pub name: String,
    pub bids: u64,
    pub wins: u64,
    pub win_rate: f64,
    pub avg_cpm: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsReport {
    pub summary: Summary,
    pub daily_trends: Vec<DailyTrend>,
    pub dsp_performance: Vec<DspPerformance>,
}

/// All-time stats of one DSP, for the DSP admin listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DspStats {
    pub total_bids: u64,
    pub winning_bids: u64,
    pub win_rate: f64,
    pub avg_bid_price: Decimal,
    pub max_bid_price: Decimal,
    pub min_bid_price: Decimal,
}

impl DspStats {
    fn from_rollup(rollup: Option<&DspBidStats>) -> Self {
        let Some(r) = rollup else {
            return Self {
                total_bids: 0,
                winning_bids: 0,
                win_rate: 0.0,
                avg_bid_price: Decimal::ZERO,
                max_bid_price: Decimal::ZERO,
                min_bid_price: Decimal::ZERO,
            };
        };
        let avg = if r.bids > 0 {
            (r.price_sum / Decimal::from(r.bids)).round_dp(2)
        } else {
            Decimal::ZERO
        };
        Self {
            total_bids: r.bids,
            winning_bids: r.wins,
            win_rate: round2(percentage(r.wins, r.bids)),
            avg_bid_price: avg,
            max_bid_price: r.max_price.unwrap_or(Decimal::ZERO),
            min_bid_price: r.min_price.unwrap_or(Decimal::ZERO),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DspLeaderboardEntry {
    pub id: String,
    pub name: String,
    pub targeting_rules: String,
    pub stats: DspStats,
}

// ---------------------------------------------------------------------------
// Window
// ---------------------------------------------------------------------------

/// The calendar days covered by a report and their UTC bounds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportWindow {
    /// Ascending; the last entry is "today".
    pub days: Vec<NaiveDate>,
    /// From the first day's 00:00:00.000 to the last day's 23:59:59.999.
    pub range: TimeWindow,
}

impl ReportWindow {
    /// The `window_days` local days ending with the day containing `now`.
    pub fn ending_at(now: DateTime<Utc>, window_days: u32, utc_offset: FixedOffset) -> Self {
        let today = local_day(now, utc_offset);
        let days: Vec<NaiveDate> = (0..window_days as i64)
            .rev()
            .map(|back| today - Duration::days(back))
            .collect();
        let first = days.first().copied().unwrap_or(today);

        let start = local_midnight(first, utc_offset);
        let end = local_midnight(today + Duration::days(1), utc_offset) - Duration::milliseconds(1);
        Self {
            days,
            range: TimeWindow::new(start, end),
        }
    }
}

fn local_midnight(day: NaiveDate, utc_offset: FixedOffset) -> DateTime<Utc> {
    let local = day.and_time(NaiveTime::MIN);
    Utc.from_utc_datetime(&(local - Duration::seconds(utc_offset.local_minus_utc() as i64)))
}

// ---------------------------------------------------------------------------
// Aggregator
// ---------------------------------------------------------------------------

pub struct MetricsAggregator {
    store: Arc<dyn AuctionStore>,
    utc_offset: FixedOffset,
    max_window_days: u32,
}

impl MetricsAggregator {
    pub fn new(store: Arc<dyn AuctionStore>, utc_offset: FixedOffset, max_window_days: u32) -> Self {
        Self {
            store,
            utc_offset,
            max_window_days,
        }
    }

    pub fn utc_offset(&self) -> FixedOffset {
        self.utc_offset
    }

    /// Summary, daily trend and per-DSP performance for the last
    /// `window_days` days ending with the day of `now`.
    pub async fn aggregate(
        &self,
        window_days: u32,
        now: DateTime<Utc>,
    ) -> Result<AnalyticsReport, AuctionError> {
        if window_days == 0 || window_days > self.max_window_days {
            return Err(AuctionError::Validation(format!(
                "window must be between 1 and {} days, got {window_days}",
                self.max_window_days
            )));
        }

        let window = ReportWindow::ending_at(now, window_days, self.utc_offset);
        let (opportunity_days, bid_days, dsp_rollups, dsps) = futures::try_join!(
            self.store.opportunity_counts_by_day(window.range, self.utc_offset),
            self.store.bid_stats_by_day(window.range, self.utc_offset),
            self.store.bid_stats_by_dsp(window.range),
            self.store.list_dsps(),
        )?;
        debug!(
            opportunity_days = opportunity_days.len(),
            bid_days = bid_days.len(),
            dsps = dsp_rollups.len(),
            "Grouped scans complete"
        );

        let opportunities: HashMap<NaiveDate, (u64, u64)> = opportunity_days
            .into_iter()
            .map(|d| (d.day, (d.total, d.filled)))
            .collect();
        let bids: HashMap<NaiveDate, (u64, Decimal)> = bid_days
            .into_iter()
            .map(|d| (d.day, (d.bids, d.price_sum)))
            .collect();

        let mut total_requests = 0;
        let mut total_filled = 0;
        let mut total_bids = 0;
        let mut total_price = Decimal::ZERO;

        let daily_trends: Vec<DailyTrend> = window
            .days
            .iter()
            .map(|day| {
                let (requests, filled) = opportunities.get(day).copied().unwrap_or((0, 0));
                let (day_bids, price_sum) = bids.get(day).copied().unwrap_or((0, Decimal::ZERO));
                total_requests += requests;
                total_filled += filled;
                total_bids += day_bids;
                total_price += price_sum;
                DailyTrend {
                    date: *day,
                    requests,
                    filled,
                    fill_rate: percentage(filled, requests),
                    avg_cpm: avg_cpm(price_sum, day_bids),
                }
            })
            .collect();

        let rollups: HashMap<&str, &DspBidStats> =
            dsp_rollups.iter().map(|r| (r.dsp_id.as_str(), r)).collect();
        let dsp_performance = dsps
            .iter()
            .map(|dsp| {
                let (bids, wins, price_sum) = rollups
                    .get(dsp.id.as_str())
                    .map(|r| (r.bids, r.wins, r.price_sum))
                    .unwrap_or((0, 0, Decimal::ZERO));
                DspPerformance {
                    name: dsp.name.clone(),
                    bids,
                    wins,
                    win_rate: percentage(wins, bids),
                    avg_cpm: avg_cpm(price_sum, bids),
                }
            })
            .collect();

        let summary = Summary {
            total_requests,
            total_bids,
            fill_rate: percentage(total_filled, total_requests),
            avg_cpm: avg_cpm(total_price, total_bids),
            dsps_count: dsps.len() as u64,
        };
        info!(
            window_days,
            requests = summary.total_requests,
            bids = summary.total_bids,
            fill_rate = format!("{:.1}%", summary.fill_rate),
            "Analytics aggregated"
        );

        Ok(AnalyticsReport {
            summary,
            daily_trends,
            dsp_performance,
        })
    }

    /// All-time per-DSP stats, in DSP creation order.
    pub async fn dsp_leaderboard(&self) -> Result<Vec<DspLeaderboardEntry>, AuctionError> {
        let (dsps, rollups) = futures::try_join!(
            self.store.list_dsps(),
            self.store.bid_stats_by_dsp(TimeWindow::all()),
        )?;
        let by_id: HashMap<&str, &DspBidStats> =
            rollups.iter().map(|r| (r.dsp_id.as_str(), r)).collect();

        Ok(dsps
            .into_iter()
            .map(|dsp| {
                let stats = DspStats::from_rollup(by_id.get(dsp.id.as_str()).copied());
                DspLeaderboardEntry {
                    id: dsp.id,
                    name: dsp.name,
                    targeting_rules: dsp.targeting_rules,
                    stats,
                }
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::targeting::TargetingRule;
    use crate::storage::memory::MemoryStore;
    use crate::storage::{MockAuctionStore, StoreError};
    use crate::types::{AdRequest, AuctionOpportunity, Bid, Creative, Dsp};

    fn utc() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 21, 15, 30, 0).unwrap()
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 2, d).unwrap()
    }

    fn rule() -> TargetingRule {
        TargetingRule::new(["US"], ["mobile"], [("default".to_string(), dec!(1))]).unwrap()
    }

    struct History {
        store: Arc<MemoryStore>,
    }

    impl History {
        fn new() -> Self {
            Self {
                store: Arc::new(MemoryStore::new()),
            }
        }

        /// Record one opportunity with the given bids; the first bid at the
        /// highest price wins.
        async fn auction(&self, at: DateTime<Utc>, bids: &[(&Dsp, Decimal)]) {
            let opp = AuctionOpportunity::new(&AdRequest::new("p", "s", "US", "mobile"), at);
            self.store.insert_opportunity(&opp).await.unwrap();
            let bids: Vec<Bid> = bids
                .iter()
                .map(|(dsp, price)| Bid {
                    id: crate::types::new_id(),
                    dsp_id: dsp.id.clone(),
                    opportunity_id: opp.id.clone(),
                    price: *price,
                    creative: Creative {
                        image_url: String::new(),
                        click_url: String::new(),
                    },
                    created_at: at,
                })
                .collect();
            let winner = crate::engine::resolver::resolve(&bids).map(|b| b.id.clone());
            self.store.settle_opportunity(&opp.id, &bids, winner).await.unwrap();
        }

        fn aggregator(&self) -> MetricsAggregator {
            MetricsAggregator::new(self.store.clone(), utc(), 90)
        }
    }

    #[test]
    fn test_percentage_zero_denominator() {
        assert_eq!(percentage(0, 0), 0.0);
        assert_eq!(percentage(5, 0), 0.0);
        assert!((percentage(1, 4) - 25.0).abs() < 1e-12);
        assert!((percentage(4, 4) - 100.0).abs() < 1e-12);
    }

    #[test]
    fn test_avg_cpm() {
        assert_eq!(avg_cpm(Decimal::ZERO, 0), Decimal::ZERO);
        assert_eq!(avg_cpm(dec!(6.00), 2), dec!(3000));
        assert_eq!(avg_cpm(dec!(1.00), 3), dec!(333.33));
    }

    #[test]
    fn test_window_bounds() {
        let w = ReportWindow::ending_at(now(), 7, utc());
        assert_eq!(w.days.len(), 7);
        assert_eq!(w.days[0], day(15));
        assert_eq!(w.days[6], day(21));
        assert_eq!(w.range.start, Utc.with_ymd_and_hms(2026, 2, 15, 0, 0, 0).unwrap());
        assert_eq!(
            w.range.end,
            Utc.with_ymd_and_hms(2026, 2, 21, 23, 59, 59).unwrap() + Duration::milliseconds(999)
        );
    }

    #[test]
    fn test_window_with_offset() {
        // 15:30 UTC is already Feb 22 at UTC+10.
        let plus_ten = FixedOffset::east_opt(10 * 3600).unwrap();
        let w = ReportWindow::ending_at(now(), 1, plus_ten);
        assert_eq!(w.days, vec![day(22)]);
        assert_eq!(w.range.start, Utc.with_ymd_and_hms(2026, 2, 21, 14, 0, 0).unwrap());
    }

    #[tokio::test]
    async fn test_empty_history_is_zeroed() {
        let history = History::new();
        let report = history.aggregator().aggregate(7, now()).await.unwrap();

        assert_eq!(report.summary.total_requests, 0);
        assert_eq!(report.summary.fill_rate, 0.0);
        assert_eq!(report.summary.avg_cpm, Decimal::ZERO);
        assert_eq!(report.daily_trends.len(), 7);
        assert!(report.daily_trends.windows(2).all(|w| w[0].date < w[1].date));
        for t in &report.daily_trends {
            assert_eq!((t.requests, t.filled), (0, 0));
            assert_eq!(t.fill_rate, 0.0);
            assert_eq!(t.avg_cpm, Decimal::ZERO);
        }
        assert!(report.dsp_performance.is_empty());
    }

    #[tokio::test]
    async fn test_report_over_history() {
        let history = History::new();
        let a = Dsp::new("A", &rule()).unwrap();
        let b = Dsp::new("B", &rule()).unwrap();
        let idle = Dsp::new("Idle", &rule()).unwrap();
        for d in [&a, &b, &idle] {
            history.store.insert_dsp(d).await.unwrap();
        }

        let t = |d: u32, h: u32| Utc.with_ymd_and_hms(2026, 2, d, h, 0, 0).unwrap();
        history.auction(t(21, 9), &[(&a, dec!(2.00)), (&b, dec!(3.00))]).await;
        history.auction(t(21, 10), &[]).await;
        history.auction(t(19, 23), &[(&a, dec!(4.00))]).await;
        // Outside the 7-day window.
        history.auction(t(10, 12), &[(&b, dec!(9.00))]).await;

        let report = history.aggregator().aggregate(7, now()).await.unwrap();

        let s = &report.summary;
        assert_eq!(s.total_requests, 3);
        assert_eq!(s.total_bids, 3);
        assert!((s.fill_rate - 200.0 / 3.0).abs() < 1e-9);
        assert_eq!(s.avg_cpm, dec!(3000));
        assert_eq!(s.dsps_count, 3);

        let by_date: HashMap<NaiveDate, &DailyTrend> =
            report.daily_trends.iter().map(|t| (t.date, t)).collect();
        let today = by_date[&day(21)];
        assert_eq!((today.requests, today.filled), (2, 1));
        assert!((today.fill_rate - 50.0).abs() < 1e-9);
        assert_eq!(today.avg_cpm, dec!(2500));
        let d19 = by_date[&day(19)];
        assert_eq!((d19.requests, d19.filled), (1, 1));
        assert_eq!(d19.avg_cpm, dec!(4000));
        assert_eq!(by_date[&day(20)].requests, 0);

        let perf: HashMap<&str, &DspPerformance> =
            report.dsp_performance.iter().map(|p| (p.name.as_str(), p)).collect();
        assert_eq!((perf["A"].bids, perf["A"].wins), (2, 1));
        assert!((perf["A"].win_rate - 50.0).abs() < 1e-9);
        assert_eq!(perf["A"].avg_cpm, dec!(3000));
        assert_eq!((perf["B"].bids, perf["B"].wins), (1, 1));
        assert_eq!(perf["Idle"].win_rate, 0.0);
        assert_eq!(perf["Idle"].avg_cpm, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_rates_bounded() {
        let history = History::new();
        let a = Dsp::new("A", &rule()).unwrap();
        history.store.insert_dsp(&a).await.unwrap();
        for h in 0..5 {
            let at = Utc.with_ymd_and_hms(2026, 2, 20, h, 0, 0).unwrap();
            history.auction(at, &[(&a, dec!(1.10))]).await;
        }
        let report = history.aggregator().aggregate(3, now()).await.unwrap();
        for t in &report.daily_trends {
            assert!((0.0..=100.0).contains(&t.fill_rate));
        }
        for p in &report.dsp_performance {
            assert!((0.0..=100.0).contains(&p.win_rate));
        }
        assert!((report.summary.fill_rate - 100.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_window_validation() {
        let history = History::new();
        let agg = history.aggregator();
        assert!(matches!(agg.aggregate(0, now()).await, Err(AuctionError::Validation(_))));
        assert!(matches!(agg.aggregate(91, now()).await, Err(AuctionError::Validation(_))));
        assert!(agg.aggregate(90, now()).await.is_ok());
    }

    #[tokio::test]
    async fn test_storage_failure_is_transient() {
        let mut mock = MockAuctionStore::new();
        mock.expect_opportunity_counts_by_day()
            .returning(|_, _| Err(StoreError::Corrupt("bad day".into())));
        mock.expect_bid_stats_by_day().returning(|_, _| Ok(vec![]));
        mock.expect_bid_stats_by_dsp().returning(|_| Ok(vec![]));
        mock.expect_list_dsps().returning(|| Ok(vec![]));

        let agg = MetricsAggregator::new(Arc::new(mock), utc(), 30);
        let err = agg.aggregate(7, now()).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_leaderboard() {
        let history = History::new();
        let a = Dsp::new("A", &rule()).unwrap();
        let quiet = Dsp::new("Quiet", &rule()).unwrap();
        history.store.insert_dsp(&a).await.unwrap();
        history.store.insert_dsp(&quiet).await.unwrap();
        let t = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        history.auction(t, &[(&a, dec!(2.00))]).await;
        history.auction(t, &[(&a, dec!(3.34))]).await;

        let board = history.aggregator().dsp_leaderboard().await.unwrap();
        assert_eq!(board.len(), 2);
        assert_eq!(board[0].name, "A");
        assert_eq!(board[0].stats.total_bids, 2);
        assert_eq!(board[0].stats.winning_bids, 2);
        assert_eq!(board[0].stats.win_rate, 100.0);
        assert_eq!(board[0].stats.avg_bid_price, dec!(2.67));
        assert_eq!(board[0].stats.max_bid_price, dec!(3.34));
        assert_eq!(board[0].stats.min_bid_price, dec!(2.00));
        assert_eq!(board[1].stats.total_bids, 0);
        assert_eq!(board[1].stats.win_rate, 0.0);
    }

    #[test]
    fn test_report_serialises_camel_case() {
        let report = AnalyticsReport {
            summary: Summary {
                total_requests: 1,
                total_bids: 2,
                fill_rate: 100.0,
                avg_cpm: dec!(1500),
                dsps_count: 3,
            },
            daily_trends: vec![DailyTrend {
                date: day(21),
                requests: 1,
                filled: 1,
                fill_rate: 100.0,
                avg_cpm: dec!(1500),
            }],
            dsp_performance: vec![],
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["summary"]["totalRequests"], 1);
        assert_eq!(json["summary"]["dspsCount"], 3);
        assert_eq!(json["dailyTrends"][0]["date"], "2026-02-21");
        assert!(json["dailyTrends"][0]["fillRate"].is_number());
        assert!(json["dspPerformance"].is_array());
    }
}
