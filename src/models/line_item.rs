//! Invoice line item model.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Line item on an invoice. `usage_record_id` is set for usage-derived items
/// and `None` for manual ones.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct LineItem {
    pub line_item_id: Uuid,
    pub invoice_id: Uuid,
    pub usage_record_id: Option<Uuid>,
    pub resource_id: Option<Uuid>,
    pub description: String,
    pub quantity: Decimal,
    pub unit: Option<String>,
    pub unit_price: Decimal,
    pub amount: Decimal,
    pub sort_order: i32,
    pub created_utc: DateTime<Utc>,
}

/// A line item before it is attached to an invoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewLineItem {
    pub usage_record_id: Option<Uuid>,
    pub resource_id: Option<Uuid>,
    pub description: String,
    pub quantity: Decimal,
    pub unit: Option<String>,
    pub unit_price: Decimal,
    pub amount: Decimal,
}

/// Input for adding a manual charge or credit to a draft invoice.
#[derive(Debug, Clone)]
pub struct AddManualLineItem {
    pub invoice_id: Uuid,
    pub description: String,
    pub amount: Decimal,
    pub resource_id: Option<Uuid>,
}
