//! Invoice model and lifecycle rules.

use super::line_item::LineItem;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Invoice status.
///
/// Draft -> Sent -> Paid, with Sent -> Overdue -> Paid for late payers and
/// Voided reachable from anything except Paid. Paid and Voided are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    Sent,
    Paid,
    Overdue,
    Voided,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Draft => "draft",
            InvoiceStatus::Sent => "sent",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Overdue => "overdue",
            InvoiceStatus::Voided => "voided",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "sent" => InvoiceStatus::Sent,
            "paid" => InvoiceStatus::Paid,
            "overdue" => InvoiceStatus::Overdue,
            "voided" => InvoiceStatus::Voided,
            _ => InvoiceStatus::Draft,
        }
    }

    /// Only draft invoices accept item and adjustment changes.
    pub fn is_editable(&self) -> bool {
        matches!(self, InvoiceStatus::Draft)
    }

    pub fn can_be_sent(&self) -> bool {
        matches!(self, InvoiceStatus::Draft)
    }

    pub fn can_be_marked_paid(&self) -> bool {
        matches!(self, InvoiceStatus::Sent | InvoiceStatus::Overdue)
    }

    pub fn can_be_voided(&self) -> bool {
        matches!(
            self,
            InvoiceStatus::Draft | InvoiceStatus::Sent | InvoiceStatus::Overdue
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, InvoiceStatus::Paid | InvoiceStatus::Voided)
    }
}

/// Invoice for one member over one billing period.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Invoice {
    pub invoice_id: Uuid,
    pub user_id: Uuid,
    pub invoice_number: String,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub status: String,
    pub subtotal: Decimal,
    pub adjustments: Decimal,
    pub adjustment_reason: Option<String>,
    pub total: Decimal,
    pub due_date: NaiveDate,
    pub sent_utc: Option<DateTime<Utc>>,
    pub paid_utc: Option<DateTime<Utc>>,
    pub voided_utc: Option<DateTime<Utc>>,
    pub generated_by: Option<Uuid>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Invoice {
    pub fn status(&self) -> InvoiceStatus {
        InvoiceStatus::from_string(&self.status)
    }
}

/// An invoice together with its line items.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceWithItems {
    pub invoice: Invoice,
    pub items: Vec<LineItem>,
}

/// Aggregate over uninvoiced billable usage in a period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodSummary {
    pub user_count: i64,
    pub usage_count: i64,
    pub total_amount: Decimal,
}

/// Filter parameters for listing invoices.
#[derive(Debug, Clone, Default)]
pub struct ListInvoicesFilter {
    pub status: Option<InvoiceStatus>,
    pub user_id: Option<Uuid>,
    pub period_start_from: Option<NaiveDate>,
    pub period_start_to: Option<NaiveDate>,
    pub page_size: i32,
    pub page_token: Option<Uuid>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn draft_is_the_only_editable_status() {
        assert!(InvoiceStatus::Draft.is_editable());
        assert!(!InvoiceStatus::Sent.is_editable());
        assert!(!InvoiceStatus::Paid.is_editable());
        assert!(!InvoiceStatus::Overdue.is_editable());
        assert!(!InvoiceStatus::Voided.is_editable());
    }

    #[test]
    fn only_draft_can_be_sent() {
        assert!(InvoiceStatus::Draft.can_be_sent());
        assert!(!InvoiceStatus::Sent.can_be_sent());
        assert!(!InvoiceStatus::Paid.can_be_sent());
        assert!(!InvoiceStatus::Overdue.can_be_sent());
        assert!(!InvoiceStatus::Voided.can_be_sent());
    }

    #[test]
    fn sent_and_overdue_can_be_marked_paid() {
        assert!(InvoiceStatus::Sent.can_be_marked_paid());
        assert!(InvoiceStatus::Overdue.can_be_marked_paid());
        assert!(!InvoiceStatus::Draft.can_be_marked_paid());
        assert!(!InvoiceStatus::Paid.can_be_marked_paid());
        assert!(!InvoiceStatus::Voided.can_be_marked_paid());
    }

    #[test]
    fn paid_invoices_cannot_be_voided() {
        assert!(InvoiceStatus::Draft.can_be_voided());
        assert!(InvoiceStatus::Sent.can_be_voided());
        assert!(InvoiceStatus::Overdue.can_be_voided());
        assert!(!InvoiceStatus::Paid.can_be_voided());
        assert!(!InvoiceStatus::Voided.can_be_voided());
    }

    #[test]
    fn paid_and_voided_are_terminal() {
        assert!(InvoiceStatus::Paid.is_terminal());
        assert!(InvoiceStatus::Voided.is_terminal());
        assert!(!InvoiceStatus::Draft.is_terminal());
        assert!(!InvoiceStatus::Sent.is_terminal());
        assert!(!InvoiceStatus::Overdue.is_terminal());
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            InvoiceStatus::Draft,
            InvoiceStatus::Sent,
            InvoiceStatus::Paid,
            InvoiceStatus::Overdue,
            InvoiceStatus::Voided,
        ] {
            assert_eq!(InvoiceStatus::from_string(status.as_str()), status);
        }
    }

    #[test]
    fn unknown_status_string_falls_back_to_draft() {
        assert_eq!(InvoiceStatus::from_string("garbage"), InvoiceStatus::Draft);
    }
}
