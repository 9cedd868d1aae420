use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Canonical product
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Article {
    pub id: Uuid,
    pub name: String,
    pub normalized_key: String,
}

/// Learned mapping (supplier, normalized label) -> article
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ArticleAlias {
    pub id: Uuid,
    pub supplier_id: Uuid,
    pub normalized_label: String,
    pub article_id: Uuid,
    pub confidence: i16,
    pub updated_at: DateTime<Utc>,
}

/// Confidence written for user-confirmed aliases
pub const CONFIRMED_CONFIDENCE: i16 = 100;

/// How a price observation's unit price was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceBasis {
    /// unit price printed on the receipt
    Unit,
    /// line_total / quantity
    Derived,
    /// whole line total, no usable quantity
    Package,
}

impl PriceBasis {
    pub fn as_str(&self) -> &'static str {
        match self {
            PriceBasis::Unit => "unit",
            PriceBasis::Derived => "derived",
            PriceBasis::Package => "package",
        }
    }
}

/// Price observation row
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PriceObservation {
    pub id: Uuid,
    pub article_id: Uuid,
    pub supplier_id: Uuid,
    pub expense_item_id: Option<Uuid>,
    pub observed_at: DateTime<Utc>,
    pub unit_price: BigDecimal,
    pub quantity: Option<BigDecimal>,
    pub price_basis: String,
    pub currency: String,
}

/// Posted item still waiting for an article
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct UnmappedItem {
    pub item_id: Uuid,
    pub expense_id: Uuid,
    pub supplier_id: Uuid,
    pub supplier_name: String,
    pub raw_label: String,
    pub quantity: Option<BigDecimal>,
    pub unit_price: Option<BigDecimal>,
    pub line_total: BigDecimal,
    pub purchased_at: DateTime<Utc>,
}

/// Unmapped items sharing one supplier phrasing
#[derive(Debug, Clone, Serialize)]
pub struct UnmappedGroup {
    pub supplier_id: Uuid,
    pub supplier_name: String,
    pub normalized_label: String,
    pub sample_label: String,
    pub item_ids: Vec<Uuid>,
}

/// Resolution result for one raw label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "article_id", rename_all = "snake_case")]
pub enum Resolution {
    Alias(Uuid),
    ExactMatch(Uuid),
    Unmapped,
}

impl Resolution {
    pub fn article_id(&self) -> Option<Uuid> {
        match self {
            Resolution::Alias(id) | Resolution::ExactMatch(id) => Some(*id),
            Resolution::Unmapped => None,
        }
    }
}
