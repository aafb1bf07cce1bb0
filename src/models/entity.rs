//! Local entity records
//!
//! Marketplace records are stored keyed by `(account_id, external_id)`.
//! Fields the engine does not model are kept in `extra` so that schema
//! additions on the remote side are not lost.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::account::OperationType;

/// A marketplace offer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfferRecord {
    /// Owning account
    pub account_id: String,
    /// Remote identifier (natural key)
    pub external_id: String,
    /// Seller SKU
    pub sku: String,
    /// Listing title
    pub title: String,
    /// Unit price
    pub price: f64,
    /// Available quantity
    pub stock: i64,
    /// Remote listing status
    pub status: String,
    /// Unmodelled remote fields
    #[serde(default)]
    pub extra: Map<String, Value>,
}

/// A marketplace order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRecord {
    /// Owning account
    pub account_id: String,
    /// Remote identifier (natural key)
    pub external_id: String,
    /// Remote order status
    pub status: String,
    /// Order total
    pub total_amount: f64,
    /// Currency code
    pub currency: String,
    /// Buyer display name
    pub buyer_name: String,
    /// Number of line items
    pub item_count: i64,
    /// Remote creation timestamp, as sent
    pub placed_at: String,
    /// Unmodelled remote fields
    #[serde(default)]
    pub extra: Map<String, Value>,
}

/// Any record the pipeline can upsert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntityRecord {
    Offer(OfferRecord),
    Order(OrderRecord),
}

impl EntityRecord {
    /// Natural key
    pub fn external_id(&self) -> &str {
        match self {
            EntityRecord::Offer(o) => &o.external_id,
            EntityRecord::Order(o) => &o.external_id,
        }
    }

    /// Owning account
    pub fn account_id(&self) -> &str {
        match self {
            EntityRecord::Offer(o) => &o.account_id,
            EntityRecord::Order(o) => &o.account_id,
        }
    }

    /// Operation type the record belongs to
    pub fn operation_type(&self) -> OperationType {
        match self {
            EntityRecord::Offer(_) => OperationType::Offers,
            EntityRecord::Order(_) => OperationType::Orders,
        }
    }
}

/// Outcome of one chunked upsert
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertSummary {
    /// Rows inserted
    pub created: u64,
    /// Rows updated in place
    pub updated: u64,
    /// Records rejected by the store
    pub failed: u64,
    /// One message per rejected record
    pub errors: Vec<String>,
}

impl UpsertSummary {
    /// Rows committed
    pub fn committed(&self) -> u64 {
        self.created + self.updated
    }

    /// Fold another summary into this one
    pub fn merge(&mut self, other: UpsertSummary) {
        self.created += other.created;
        self.updated += other.updated;
        self.failed += other.failed;
        self.errors.extend(other.errors);
    }
}
