//! Shared resource model.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// How a resource is priced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PricingModel {
    FlatFee,
    PerUnit,
}

impl PricingModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            PricingModel::FlatFee => "flat_fee",
            PricingModel::PerUnit => "per_unit",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "per_unit" => PricingModel::PerUnit,
            _ => PricingModel::FlatFee,
        }
    }
}

/// Billable unit for per-unit pricing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PricingUnit {
    Hour,
    Day,
    Mile,
    Kilometer,
    Trip,
}

impl PricingUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            PricingUnit::Hour => "hour",
            PricingUnit::Day => "day",
            PricingUnit::Mile => "mile",
            PricingUnit::Kilometer => "kilometer",
            PricingUnit::Trip => "trip",
        }
    }

    /// Parse a stored unit string. Unknown values yield `None` so a bad row
    /// bills zero instead of something wrong.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "hour" => Some(PricingUnit::Hour),
            "day" => Some(PricingUnit::Day),
            "mile" => Some(PricingUnit::Mile),
            "kilometer" => Some(PricingUnit::Kilometer),
            "trip" => Some(PricingUnit::Trip),
            _ => None,
        }
    }

    /// Short label used on invoice line items.
    pub fn label(&self) -> &'static str {
        match self {
            PricingUnit::Hour => "hr",
            PricingUnit::Day => "day",
            PricingUnit::Mile => "mi",
            PricingUnit::Kilometer => "km",
            PricingUnit::Trip => "trip",
        }
    }
}

/// A shared resource members can check out (tool, vehicle, room).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Resource {
    pub resource_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub pricing_model: String,
    pub pricing_unit: Option<String>,
    pub rate: Decimal,
    pub active: bool,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Resource {
    pub fn pricing_model(&self) -> PricingModel {
        PricingModel::from_string(&self.pricing_model)
    }

    pub fn pricing_unit(&self) -> Option<PricingUnit> {
        self.pricing_unit.as_deref().and_then(PricingUnit::parse)
    }
}

/// Input for creating a resource.
#[derive(Debug, Clone)]
pub struct CreateResource {
    pub name: String,
    pub description: Option<String>,
    pub pricing_model: PricingModel,
    pub pricing_unit: Option<PricingUnit>,
    pub rate: Decimal,
}

/// Input for updating a resource.
#[derive(Debug, Clone, Default)]
pub struct UpdateResource {
    pub name: Option<String>,
    pub description: Option<String>,
    pub rate: Option<Decimal>,
    pub active: Option<bool>,
}

/// Filter parameters for listing resources.
#[derive(Debug, Clone, Default)]
pub struct ListResourcesFilter {
    pub active_only: bool,
    pub page_size: i32,
    pub page_token: Option<Uuid>,
}
