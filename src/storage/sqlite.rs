//! SQLite store via `sqlx`.
//!
//! Prices are stored as integer cents and timestamps as epoch
//! milliseconds, so sums and range filters stay exact inside SQLite.
//! Daily grouping shifts timestamps by the reporting UTC offset before
//! taking `date(..)`.

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::collections::HashMap;
use tracing::{debug, info};

use super::{
    AuctionStore, DailyBidStats, DailyOpportunityCounts, DspBidStats, OpportunityPage,
    OpportunityRecord, StoreError, StoreResult, TimeWindow,
};
use crate::types::{
    AdSlot, AuctionOpportunity, Bid, Creative, Dsp, Publisher, PublisherInventory,
};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS publishers (
        id   TEXT PRIMARY KEY,
        name TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS ad_slots (
        id           TEXT PRIMARY KEY,
        publisher_id TEXT NOT NULL REFERENCES publishers(id),
        name         TEXT NOT NULL,
        slot_type    TEXT NOT NULL,
        size         TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS dsps (
        id              TEXT PRIMARY KEY,
        name            TEXT NOT NULL,
        targeting_rules TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS opportunities (
        id              TEXT PRIMARY KEY,
        publisher_id    TEXT NOT NULL,
        ad_slot_id      TEXT NOT NULL,
        geo             TEXT NOT NULL,
        device          TEXT NOT NULL,
        request_time_ms INTEGER NOT NULL,
        winning_bid_id  TEXT,
        settled         INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS bids (
        id             TEXT PRIMARY KEY,
        dsp_id         TEXT NOT NULL REFERENCES dsps(id),
        opportunity_id TEXT NOT NULL REFERENCES opportunities(id),
        price_cents    INTEGER NOT NULL,
        image_url      TEXT NOT NULL,
        click_url      TEXT NOT NULL,
        created_at_ms  INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_opportunities_time ON opportunities(request_time_ms)",
    "CREATE INDEX IF NOT EXISTS idx_bids_time ON bids(created_at_ms)",
    "CREATE INDEX IF NOT EXISTS idx_bids_opportunity ON bids(opportunity_id)",
    "CREATE INDEX IF NOT EXISTS idx_bids_dsp ON bids(dsp_id)",
];

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) a database and ensure the schema exists.
    pub async fn connect(url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        info!(url, "SQLite store ready");
        Ok(store)
    }

    /// Private in-memory database on a single pinned connection.
    pub async fn in_memory() -> StoreResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> StoreResult<()> {
        for stmt in SCHEMA {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        debug!(statements = SCHEMA.len(), "Schema applied");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Encoding helpers
// ---------------------------------------------------------------------------

fn to_cents(price: Decimal) -> StoreResult<i64> {
    (price * Decimal::ONE_HUNDRED)
        .round()
        .to_i64()
        .ok_or_else(|| StoreError::Corrupt(format!("price out of range: {price}")))
}

fn from_cents(cents: i64) -> Decimal {
    Decimal::new(cents, 2)
}

fn from_millis(ms: i64) -> StoreResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {ms}")))
}

fn parse_day(raw: &str) -> StoreResult<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|e| StoreError::Corrupt(format!("bad day bucket {raw}: {e}")))
}

fn offset_millis(utc_offset: FixedOffset) -> i64 {
    utc_offset.local_minus_utc() as i64 * 1000
}

fn count(row: &SqliteRow, column: &str) -> StoreResult<u64> {
    let n: i64 = row.try_get(column)?;
    Ok(n.max(0) as u64)
}

fn publisher_from_row(row: &SqliteRow) -> StoreResult<Publisher> {
    Ok(Publisher {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
    })
}

fn ad_slot_from_row(row: &SqliteRow) -> StoreResult<AdSlot> {
    Ok(AdSlot {
        id: row.try_get("id")?,
        publisher_id: row.try_get("publisher_id")?,
        name: row.try_get("name")?,
        slot_type: row.try_get("slot_type")?,
        size: row.try_get("size")?,
    })
}

fn dsp_from_row(row: &SqliteRow) -> StoreResult<Dsp> {
    Ok(Dsp {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        targeting_rules: row.try_get("targeting_rules")?,
    })
}

fn opportunity_from_row(row: &SqliteRow) -> StoreResult<AuctionOpportunity> {
    Ok(AuctionOpportunity {
        id: row.try_get("id")?,
        publisher_id: row.try_get("publisher_id")?,
        ad_slot_id: row.try_get("ad_slot_id")?,
        geo: row.try_get("geo")?,
        device: row.try_get("device")?,
        request_time: from_millis(row.try_get("request_time_ms")?)?,
        winning_bid_id: row.try_get("winning_bid_id")?,
    })
}

fn bid_from_row(row: &SqliteRow) -> StoreResult<Bid> {
    Ok(Bid {
        id: row.try_get("id")?,
        dsp_id: row.try_get("dsp_id")?,
        opportunity_id: row.try_get("opportunity_id")?,
        price: from_cents(row.try_get("price_cents")?),
        creative: Creative {
            image_url: row.try_get("image_url")?,
            click_url: row.try_get("click_url")?,
        },
        created_at: from_millis(row.try_get("created_at_ms")?)?,
    })
}

const OPPORTUNITY_COLUMNS: &str =
    "id, publisher_id, ad_slot_id, geo, device, request_time_ms, winning_bid_id";

const BID_COLUMNS: &str =
    "id, dsp_id, opportunity_id, price_cents, image_url, click_url, created_at_ms";

// ---------------------------------------------------------------------------
// AuctionStore
// ---------------------------------------------------------------------------

#[async_trait]
impl AuctionStore for SqliteStore {
    async fn get_publisher(&self, id: &str) -> StoreResult<Option<Publisher>> {
        sqlx::query("SELECT id, name FROM publishers WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(publisher_from_row)
            .transpose()
    }

    async fn get_ad_slot(&self, id: &str) -> StoreResult<Option<AdSlot>> {
        sqlx::query("SELECT id, publisher_id, name, slot_type, size FROM ad_slots WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(ad_slot_from_row)
            .transpose()
    }

    async fn get_dsp(&self, id: &str) -> StoreResult<Option<Dsp>> {
        sqlx::query("SELECT id, name, targeting_rules FROM dsps WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(dsp_from_row)
            .transpose()
    }

    async fn get_opportunity(&self, id: &str) -> StoreResult<Option<AuctionOpportunity>> {
        sqlx::query(&format!(
            "SELECT {OPPORTUNITY_COLUMNS} FROM opportunities WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(opportunity_from_row)
        .transpose()
    }

    async fn list_publishers(&self) -> StoreResult<Vec<PublisherInventory>> {
        let publishers = sqlx::query("SELECT id, name FROM publishers ORDER BY rowid")
            .fetch_all(&self.pool)
            .await?;
        let slots = sqlx::query(
            "SELECT id, publisher_id, name, slot_type, size FROM ad_slots ORDER BY rowid",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut by_publisher: HashMap<String, Vec<AdSlot>> = HashMap::new();
        for row in &slots {
            let slot = ad_slot_from_row(row)?;
            by_publisher.entry(slot.publisher_id.clone()).or_default().push(slot);
        }

        publishers
            .iter()
            .map(|row| {
                let publisher = publisher_from_row(row)?;
                let ad_slots = by_publisher.remove(&publisher.id).unwrap_or_default();
                Ok(PublisherInventory { publisher, ad_slots })
            })
            .collect()
    }

    async fn list_dsps(&self) -> StoreResult<Vec<Dsp>> {
        sqlx::query("SELECT id, name, targeting_rules FROM dsps ORDER BY rowid")
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(dsp_from_row)
            .collect()
    }

    async fn insert_publisher(&self, publisher: &Publisher) -> StoreResult<()> {
        sqlx::query("INSERT INTO publishers (id, name) VALUES (?, ?)")
            .bind(&publisher.id)
            .bind(&publisher.name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_ad_slot(&self, slot: &AdSlot) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO ad_slots (id, publisher_id, name, slot_type, size) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&slot.id)
        .bind(&slot.publisher_id)
        .bind(&slot.name)
        .bind(&slot.slot_type)
        .bind(&slot.size)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_dsp(&self, dsp: &Dsp) -> StoreResult<()> {
        sqlx::query("INSERT INTO dsps (id, name, targeting_rules) VALUES (?, ?, ?)")
            .bind(&dsp.id)
            .bind(&dsp.name)
            .bind(&dsp.targeting_rules)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_opportunity(&self, opportunity: &AuctionOpportunity) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO opportunities
                (id, publisher_id, ad_slot_id, geo, device, request_time_ms, winning_bid_id)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&opportunity.id)
        .bind(&opportunity.publisher_id)
        .bind(&opportunity.ad_slot_id)
        .bind(&opportunity.geo)
        .bind(&opportunity.device)
        .bind(opportunity.request_time.timestamp_millis())
        .bind(&opportunity.winning_bid_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn settle_opportunity(
        &self,
        opportunity_id: &str,
        bids: &[Bid],
        winning_bid_id: Option<String>,
    ) -> StoreResult<()> {
        if let Some(ref winner) = winning_bid_id {
            if !bids.iter().any(|b| &b.id == winner) {
                return Err(StoreError::Conflict(format!(
                    "winning bid {winner} is not among the settled bids"
                )));
            }
        }
        if let Some(bid) = bids.iter().find(|b| b.opportunity_id != opportunity_id) {
            return Err(StoreError::Conflict(format!(
                "bid {} belongs to opportunity {}",
                bid.id, bid.opportunity_id
            )));
        }

        let mut tx = self.pool.begin().await?;

        let settled: Option<i64> =
            sqlx::query_scalar("SELECT settled FROM opportunities WHERE id = ?")
                .bind(opportunity_id)
                .fetch_optional(&mut *tx)
                .await?;
        match settled {
            None => {
                return Err(StoreError::Missing {
                    entity: "Opportunity",
                    id: opportunity_id.to_string(),
                })
            }
            Some(flag) if flag != 0 => {
                return Err(StoreError::Conflict(format!(
                    "opportunity {opportunity_id} already settled"
                )))
            }
            Some(_) => {}
        }

        for bid in bids {
            sqlx::query(&format!(
                "INSERT INTO bids ({BID_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?)"
            ))
            .bind(&bid.id)
            .bind(&bid.dsp_id)
            .bind(&bid.opportunity_id)
            .bind(to_cents(bid.price)?)
            .bind(&bid.creative.image_url)
            .bind(&bid.creative.click_url)
            .bind(bid.created_at.timestamp_millis())
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("UPDATE opportunities SET winning_bid_id = ?, settled = 1 WHERE id = ?")
            .bind(&winning_bid_id)
            .bind(opportunity_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn list_opportunities(&self, offset: u64, limit: u64) -> StoreResult<OpportunityPage> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM opportunities")
            .fetch_one(&self.pool)
            .await?;
        let total = total.max(0) as u64;

        // SQLite reads a negative OFFSET as 0.
        let Ok(offset) = i64::try_from(offset) else {
            return Ok(OpportunityPage {
                total,
                items: Vec::new(),
            });
        };

        let rows = sqlx::query(&format!(
            "SELECT {OPPORTUNITY_COLUMNS} FROM opportunities
             ORDER BY request_time_ms DESC, rowid DESC LIMIT ? OFFSET ?"
        ))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        let opportunities = rows
            .iter()
            .map(opportunity_from_row)
            .collect::<StoreResult<Vec<_>>>()?;

        // One bid query for the whole page.
        let mut bids_by_opportunity: HashMap<String, Vec<Bid>> = HashMap::new();
        if !opportunities.is_empty() {
            let placeholders = vec!["?"; opportunities.len()].join(", ");
            let sql = format!(
                "SELECT {BID_COLUMNS} FROM bids WHERE opportunity_id IN ({placeholders}) ORDER BY rowid"
            );
            let mut query = sqlx::query(&sql);
            for o in &opportunities {
                query = query.bind(&o.id);
            }
            for row in query.fetch_all(&self.pool).await?.iter() {
                let bid = bid_from_row(row)?;
                bids_by_opportunity
                    .entry(bid.opportunity_id.clone())
                    .or_default()
                    .push(bid);
            }
        }

        let items = opportunities
            .into_iter()
            .map(|opportunity| OpportunityRecord {
                bids: bids_by_opportunity.remove(&opportunity.id).unwrap_or_default(),
                opportunity,
            })
            .collect();

        Ok(OpportunityPage { total, items })
    }

    async fn opportunity_counts_by_day(
        &self,
        window: TimeWindow,
        utc_offset: FixedOffset,
    ) -> StoreResult<Vec<DailyOpportunityCounts>> {
        let rows = sqlx::query(
            "SELECT date((request_time_ms + ?) / 1000, 'unixepoch') AS day,
                    COUNT(*) AS total,
                    SUM(CASE WHEN winning_bid_id IS NOT NULL THEN 1 ELSE 0 END) AS filled
             FROM opportunities
             WHERE request_time_ms BETWEEN ? AND ?
             GROUP BY day
             ORDER BY day",
        )
        .bind(offset_millis(utc_offset))
        .bind(window.start.timestamp_millis())
        .bind(window.end.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let day: String = row.try_get("day")?;
                Ok(DailyOpportunityCounts {
                    day: parse_day(&day)?,
                    total: count(row, "total")?,
                    filled: count(row, "filled")?,
                })
            })
            .collect()
    }

    async fn bid_stats_by_day(
        &self,
        window: TimeWindow,
        utc_offset: FixedOffset,
    ) -> StoreResult<Vec<DailyBidStats>> {
        let rows = sqlx::query(
            "SELECT date((created_at_ms + ?) / 1000, 'unixepoch') AS day,
                    COUNT(*) AS bids,
                    SUM(price_cents) AS price_cents
             FROM bids
             WHERE created_at_ms BETWEEN ? AND ?
             GROUP BY day
             ORDER BY day",
        )
        .bind(offset_millis(utc_offset))
        .bind(window.start.timestamp_millis())
        .bind(window.end.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let day: String = row.try_get("day")?;
                Ok(DailyBidStats {
                    day: parse_day(&day)?,
                    bids: count(row, "bids")?,
                    price_sum: from_cents(row.try_get("price_cents")?),
                })
            })
            .collect()
    }

    async fn bid_stats_by_dsp(&self, window: TimeWindow) -> StoreResult<Vec<DspBidStats>> {
        let rows = sqlx::query(
            "SELECT b.dsp_id AS dsp_id,
                    COUNT(*) AS bids,
                    SUM(CASE WHEN o.winning_bid_id = b.id THEN 1 ELSE 0 END) AS wins,
                    SUM(b.price_cents) AS price_cents,
                    MIN(b.price_cents) AS min_cents,
                    MAX(b.price_cents) AS max_cents
             FROM bids b
             JOIN opportunities o ON o.id = b.opportunity_id
             WHERE b.created_at_ms BETWEEN ? AND ?
             GROUP BY b.dsp_id",
        )
        .bind(window.start.timestamp_millis())
        .bind(window.end.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let min: Option<i64> = row.try_get("min_cents")?;
                let max: Option<i64> = row.try_get("max_cents")?;
                Ok(DspBidStats {
                    dsp_id: row.try_get("dsp_id")?,
                    bids: count(row, "bids")?,
                    wins: count(row, "wins")?,
                    price_sum: from_cents(row.try_get("price_cents")?),
                    min_price: min.map(from_cents),
                    max_price: max.map(from_cents),
                })
            })
            .collect()
    }

    async fn count_opportunities(&self) -> StoreResult<u64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM opportunities")
            .fetch_one(&self.pool)
            .await?;
        Ok(n.max(0) as u64)
    }

    async fn count_bids(&self) -> StoreResult<u64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM bids")
            .fetch_one(&self.pool)
            .await?;
        Ok(n.max(0) as u64)
    }

    async fn count_dsps(&self) -> StoreResult<u64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dsps")
            .fetch_one(&self.pool)
            .await?;
        Ok(n.max(0) as u64)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
