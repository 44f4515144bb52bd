//! Targeting and pricing evaluation.
//!
//! A DSP's targeting rule is a pure decision table: the opportunity is
//! eligible when both its geo and device are listed, and the base price
//! comes from the `"{geo}-{device}"` entry of the pricing table, falling
//! back to the mandatory `default` entry.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Key of the mandatory fallback price.
pub const DEFAULT_PRICE_KEY: &str = "default";

/// Errors raised while reading a targeting configuration.
#[derive(Debug, thiserror::Error)]
pub enum TargetingError {
    #[error("Malformed targeting rules: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Targeting rules have no `default` price")]
    MissingDefault,

    #[error("Negative price {price} for pricing key `{key}`")]
    NegativePrice { key: String, price: Decimal },

    #[error("Price {price} for pricing key `{key}` does not survive the JSON form")]
    LossyPrice { key: String, price: Decimal },
}

/// Persisted/transmitted targeting configuration of a DSP.
///
/// Serialises to `{"geos": [...], "devices": [...], "bidPricing": {...}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetingRule {
    pub geos: BTreeSet<String>,
    pub devices: BTreeSet<String>,
    pub bid_pricing: BTreeMap<String, Decimal>,
}

/// Result of evaluating one rule against one (geo, device) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Evaluation {
    Ineligible,
    Eligible { base_price: Decimal },
}

impl Evaluation {
    pub fn is_eligible(&self) -> bool {
        matches!(self, Evaluation::Eligible { .. })
    }

    pub fn base_price(&self) -> Option<Decimal> {
        match self {
            Evaluation::Eligible { base_price } => Some(*base_price),
            Evaluation::Ineligible => None,
        }
    }
}

impl TargetingRule {
    /// Build a rule; fails when `default` is absent or any price is negative
    /// or too precise to persist.
    pub fn new<G, D, P>(geos: G, devices: D, bid_pricing: P) -> Result<Self, TargetingError>
    where
        G: IntoIterator,
        G::Item: Into<String>,
        D: IntoIterator,
        D::Item: Into<String>,
        P: IntoIterator<Item = (String, Decimal)>,
    {
        let rule = Self {
            geos: geos.into_iter().map(Into::into).collect(),
            devices: devices.into_iter().map(Into::into).collect(),
            bid_pricing: bid_pricing.into_iter().collect(),
        };
        rule.validate()?;
        Ok(rule)
    }

    /// Parse the persisted JSON form and check its invariants.
    pub fn parse(raw: &str) -> Result<Self, TargetingError> {
        let rule: TargetingRule = serde_json::from_str(raw)?;
        rule.validate()?;
        Ok(rule)
    }

    pub fn to_json(&self) -> Result<String, TargetingError> {
        Ok(serde_json::to_string(self)?)
    }

    fn validate(&self) -> Result<(), TargetingError> {
        if !self.bid_pricing.contains_key(DEFAULT_PRICE_KEY) {
            return Err(TargetingError::MissingDefault);
        }
        if let Some((key, price)) = self.bid_pricing.iter().find(|(_, p)| p.is_sign_negative()) {
            return Err(TargetingError::NegativePrice {
                key: key.clone(),
                price: *price,
            });
        }
        if let Some((key, price)) = self.bid_pricing.iter().find(|(_, p)| !survives_json(**p)) {
            return Err(TargetingError::LossyPrice {
                key: key.clone(),
                price: *price,
            });
        }
        Ok(())
    }

    /// Whether the rule targets this geo and device.
    pub fn is_eligible(&self, geo: &str, device: &str) -> bool {
        self.geos.contains(geo) && self.devices.contains(device)
    }

    /// Base price for a geo/device pair, ignoring eligibility.
    pub fn base_price(&self, geo: &str, device: &str) -> Decimal {
        self.bid_pricing
            .get(&pricing_key(geo, device))
            .or_else(|| self.bid_pricing.get(DEFAULT_PRICE_KEY))
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    /// Evaluate the rule. Price lookup only happens for eligible traffic.
    pub fn evaluate(&self, geo: &str, device: &str) -> Evaluation {
        if !self.is_eligible(geo, device) {
            return Evaluation::Ineligible;
        }
        Evaluation::Eligible {
            base_price: self.base_price(geo, device),
        }
    }
}

/// Prices are persisted as JSON numbers; more than ~15 significant digits
/// would come back changed.
fn survives_json(price: Decimal) -> bool {
    serde_json::to_string(&price)
        .ok()
        .and_then(|raw| serde_json::from_str::<Decimal>(&raw).ok())
        == Some(price)
}

/// Composite pricing-table key for a geo/device pair.
pub fn pricing_key(geo: &str, device: &str) -> String {
    format!("{geo}-{device}")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
