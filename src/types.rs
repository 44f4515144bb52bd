//! Shared types for the ADSIM marketplace.
//!
//! These types form the data model used across all modules.
//! Configuration entities (publishers, ad slots, DSPs) are created
//! out-of-band and read-only to the auction path; opportunities and bids
//! are produced by the engine.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::engine::targeting::{TargetingError, TargetingRule};
use crate::storage::StoreError;

/// Fresh opaque identifier for any stored entity.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

// ---------------------------------------------------------------------------
// Inventory
// ---------------------------------------------------------------------------

/// A site or app that exposes ad slots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Publisher {
    pub id: String,
    pub name: String,
}

impl Publisher {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            name: name.into(),
        }
    }
}

/// A placement on a publisher's property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdSlot {
    pub id: String,
    pub publisher_id: String,
    pub name: String,
    /// Format type, e.g. "banner" or "native".
    #[serde(rename = "type")]
    pub slot_type: String,
    /// Size descriptor, e.g. "728x90".
    pub size: String,
}

impl AdSlot {
    pub fn new(
        publisher: &Publisher,
        name: impl Into<String>,
        slot_type: impl Into<String>,
        size: impl Into<String>,
    ) -> Self {
        Self {
            id: new_id(),
            publisher_id: publisher.id.clone(),
            name: name.into(),
            slot_type: slot_type.into(),
            size: size.into(),
        }
    }
}

/// Publisher together with its slots, as listed by the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct PublisherInventory {
    #[serde(flatten)]
    pub publisher: Publisher,
    #[serde(rename = "adSlots")]
    pub ad_slots: Vec<AdSlot>,
}

// ---------------------------------------------------------------------------
// Demand
// ---------------------------------------------------------------------------

/// A simulated demand-side platform.
///
/// The targeting configuration is kept in its persisted JSON form and
/// parsed per evaluation, so a malformed row only affects this DSP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dsp {
    pub id: String,
    pub name: String,
    pub targeting_rules: String,
}

impl Dsp {
    pub fn new(name: impl Into<String>, rule: &TargetingRule) -> Result<Self, TargetingError> {
        Ok(Self {
            id: new_id(),
            name: name.into(),
            targeting_rules: rule.to_json()?,
        })
    }

    /// Build a DSP from raw (possibly malformed) stored configuration.
    pub fn with_raw_rules(name: impl Into<String>, raw: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            name: name.into(),
            targeting_rules: raw.into(),
        }
    }

    pub fn targeting(&self) -> Result<TargetingRule, TargetingError> {
        TargetingRule::parse(&self.targeting_rules)
    }
}

impl fmt::Display for Dsp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

// ---------------------------------------------------------------------------
// Auctions
// ---------------------------------------------------------------------------

/// One instance of inventory being auctioned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuctionOpportunity {
    pub id: String,
    pub publisher_id: String,
    pub ad_slot_id: String,
    pub geo: String,
    pub device: String,
    pub request_time: DateTime<Utc>,
    /// Set exactly once, when the auction is settled with a winner.
    pub winning_bid_id: Option<String>,
}

impl AuctionOpportunity {
    pub fn new(request: &AdRequest, request_time: DateTime<Utc>) -> Self {
        Self {
            id: new_id(),
            publisher_id: request.publisher_id.clone(),
            ad_slot_id: request.ad_slot_id.clone(),
            geo: request.geo.clone(),
            device: request.device.clone(),
            request_time,
            winning_bid_id: None,
        }
    }

    pub fn is_filled(&self) -> bool {
        self.winning_bid_id.is_some()
    }
}

impl fmt::Display for AuctionOpportunity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] slot={} {}-{} @ {}",
            self.id,
            self.ad_slot_id,
            self.geo,
            self.device,
            self.request_time.to_rfc3339(),
        )
    }
}

/// Creative payload attached to a bid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Creative {
    pub image_url: String,
    pub click_url: String,
}

/// A DSP's offer for one opportunity. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bid {
    pub id: String,
    pub dsp_id: String,
    pub opportunity_id: String,
    /// Final price after jitter, exactly two decimal places.
    pub price: Decimal,
    pub creative: Creative,
    /// Always the owning opportunity's request time.
    pub created_at: DateTime<Utc>,
}

impl fmt::Display for Bid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bid {} by {} @ ${}", self.id, self.dsp_id, self.price)
    }
}

/// An incoming ad request, as accepted by the decision API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdRequest {
    pub publisher_id: String,
    pub ad_slot_id: String,
    pub geo: String,
    pub device: String,
    /// Request time; defaults to the caller-supplied "now".
    #[serde(default)]
    pub time: Option<DateTime<Utc>>,
}

impl AdRequest {
    pub fn new(
        publisher_id: impl Into<String>,
        ad_slot_id: impl Into<String>,
        geo: impl Into<String>,
        device: impl Into<String>,
    ) -> Self {
        Self {
            publisher_id: publisher_id.into(),
            ad_slot_id: ad_slot_id.into(),
            geo: geo.into(),
            device: device.into(),
            time: None,
        }
    }

    pub fn at(mut self, time: DateTime<Utc>) -> Self {
        self.time = Some(time);
        self
    }
}

/// Decision returned to the caller when an auction has a winner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuctionOutcome {
    pub winner_dsp: String,
    pub bid_price: Decimal,
    pub creative: Creative,
}

impl fmt::Display for AuctionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} won at ${}", self.winner_dsp, self.bid_price)
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Failures surfaced by the decision and reporting paths.
///
/// "No bids" is not an error: it is `Ok(None)` from the orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum AuctionError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Transient failure: {0}")]
    Transient(#[from] StoreError),
}

impl AuctionError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        AuctionError::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Whether retrying the whole operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AuctionError::Transient(_))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
