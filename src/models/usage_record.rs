//! Usage record model.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Usage record status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageStatus {
    CheckedOut,
    Completed,
    Disputed,
    Verified,
}

impl UsageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UsageStatus::CheckedOut => "checked_out",
            UsageStatus::Completed => "completed",
            UsageStatus::Disputed => "disputed",
            UsageStatus::Verified => "verified",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "completed" => UsageStatus::Completed,
            "disputed" => UsageStatus::Disputed,
            "verified" => UsageStatus::Verified,
            _ => UsageStatus::CheckedOut,
        }
    }

    /// Whether records in this status may be rolled onto an invoice.
    /// Disputed usage is held back until an admin resolves it.
    pub fn is_billable(&self) -> bool {
        matches!(self, UsageStatus::Completed | UsageStatus::Verified)
    }
}

/// One check-out/check-in session against a resource.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UsageRecord {
    pub usage_id: Uuid,
    pub resource_id: Uuid,
    pub user_id: Uuid,
    pub reservation_id: Option<Uuid>,
    pub status: String,
    pub checked_out_utc: DateTime<Utc>,
    pub checked_in_utc: Option<DateTime<Utc>>,
    pub start_reading: Option<Decimal>,
    pub end_reading: Option<Decimal>,
    pub duration_hours: Option<Decimal>,
    pub distance_units: Option<Decimal>,
    pub calculated_cost: Option<Decimal>,
    pub notes: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl UsageRecord {
    pub fn status(&self) -> UsageStatus {
        UsageStatus::from_string(&self.status)
    }
}

/// Input for checking a resource out.
#[derive(Debug, Clone)]
pub struct CheckOutResource {
    pub resource_id: Uuid,
    pub user_id: Uuid,
    pub reservation_id: Option<Uuid>,
    pub checked_out_utc: DateTime<Utc>,
    pub start_reading: Option<Decimal>,
    pub notes: Option<String>,
}

/// Input for checking a resource back in.
#[derive(Debug, Clone)]
pub struct CheckInResource {
    pub checked_in_utc: DateTime<Utc>,
    pub end_reading: Option<Decimal>,
    pub notes: Option<String>,
}

/// Input for correcting session data after the fact. Unset fields keep their
/// stored values; derived metrics are recomputed either way.
#[derive(Debug, Clone, Default)]
pub struct CorrectReadings {
    pub checked_out_utc: Option<DateTime<Utc>>,
    pub checked_in_utc: Option<DateTime<Utc>>,
    pub start_reading: Option<Decimal>,
    pub end_reading: Option<Decimal>,
}

/// Filter parameters for listing usage records.
#[derive(Debug, Clone, Default)]
pub struct ListUsageFilter {
    pub resource_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub status: Option<UsageStatus>,
    pub page_size: i32,
    pub page_token: Option<Uuid>,
}
