//! Bulk write models

use serde::{Deserialize, Serialize};

use crate::sync::rate_limiter::OperationClass;

/// Bulk write operation accepted by the marketplace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOperation {
    /// Full offer updates
    OfferUpdate,
    /// Price and stock only updates
    PriceStockUpdate,
    /// Order status transitions
    OrderStatusUpdate,
}

impl WriteOperation {
    /// Remote resource path, relative to the API base URL
    pub fn path(&self) -> &'static str {
        match self {
            WriteOperation::OfferUpdate => "offers/batch",
            WriteOperation::PriceStockUpdate => "offers/price-stock/batch",
            WriteOperation::OrderStatusUpdate => "orders/batch",
        }
    }

    /// Rate limit class guarding this operation
    pub fn rate_class(&self) -> OperationClass {
        match self {
            WriteOperation::OrderStatusUpdate => OperationClass::Orders,
            WriteOperation::OfferUpdate | WriteOperation::PriceStockUpdate => {
                OperationClass::Other
            }
        }
    }
}

impl std::fmt::Display for WriteOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriteOperation::OfferUpdate => write!(f, "offer_update"),
            WriteOperation::PriceStockUpdate => write!(f, "price_stock_update"),
            WriteOperation::OrderStatusUpdate => write!(f, "order_status_update"),
        }
    }
}

/// Aggregate outcome of one batch processing invocation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResult {
    pub total_items: usize,
    pub total_batches: usize,
    pub successful_batches: usize,
    pub failed_batches: usize,
    /// One entry per failed batch, in batch order
    pub errors: Vec<String>,
    /// Processing stopped early on cancellation
    pub cancelled: bool,
}

impl BatchResult {
    /// Every batch was attempted and succeeded
    pub fn is_success(&self) -> bool {
        !self.cancelled && self.failed_batches == 0 && self.successful_batches == self.total_batches
    }
}
