//! Invoice generation engine.
//!
//! Turns a period's uninvoiced billable usage into draft invoices, one per
//! user, with at-most-once billing per usage record. Selection, preview, and
//! summary all run through the same queries and the same line builder, so a
//! dry run shows exactly what generation would produce.

use crate::error::AppError;
use crate::models::{
    AddManualLineItem, Invoice, InvoiceWithItems, LineItem, NewLineItem, PeriodSummary, Resource,
    UsageRecord,
};
use crate::services::clock::Clock;
use crate::services::database::Database;
use crate::services::line_items;
use crate::services::metrics::{
    record_error, record_generation_run, record_invoice_generated, record_line_items_created,
};
use chrono::{Datelike, Days, NaiveDate};
use rand::Rng;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::HashMap;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Conflicting attempts beyond the first before giving up. Covers both a
/// usage record billed by a concurrent run and an invoice number collision.
const MAX_GENERATION_RETRIES: u32 = 2;

/// First and last day of the calendar month before `today`.
pub fn previous_billing_period(today: NaiveDate) -> (NaiveDate, NaiveDate) {
    let period_end = today.with_day(1).unwrap_or(today) - Days::new(1);
    let period_start = period_end.with_day(1).unwrap_or(period_end);
    (period_start, period_end)
}

/// Random six-character suffix for invoice numbers.
fn generate_invoice_suffix() -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut rng = rand::thread_rng();
    (0..6)
        .map(|_| {
            let idx = rng.gen_range(0..CHARSET.len());
            CHARSET[idx] as char
        })
        .collect()
}

/// Invoice number of the form INV-YYYYMM-XXXXXX, globally unique by
/// constraint; a collision surfaces as a Conflict and generation retries
/// with a fresh suffix.
fn generate_invoice_number(period_start: NaiveDate) -> String {
    format!(
        "INV-{}-{}",
        period_start.format("%Y%m"),
        generate_invoice_suffix()
    )
}

/// Invoice generation engine.
#[derive(Clone)]
pub struct InvoiceGenerator {
    db: Database,
    clock: Clock,
    due_days: u64,
}

impl InvoiceGenerator {
    pub fn new(db: Database, clock: Clock, due_days: u64) -> Self {
        Self {
            db,
            clock,
            due_days,
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Build invoice lines for a batch of usage records, fetching each
    /// resource once.
    async fn build_line_items(
        &self,
        records: &[UsageRecord],
    ) -> Result<Vec<NewLineItem>, AppError> {
        let mut resources: HashMap<Uuid, Resource> = HashMap::new();
        let mut items = Vec::with_capacity(records.len());

        for record in records {
            if !resources.contains_key(&record.resource_id) {
                if let Some(resource) = self.db.get_resource(record.resource_id).await? {
                    resources.insert(record.resource_id, resource);
                }
            }
            match resources.get(&record.resource_id) {
                Some(resource) => items.push(line_items::from_usage(record, resource)),
                None => {
                    warn!(
                        usage_id = %record.usage_id,
                        resource_id = %record.resource_id,
                        "Skipping usage record with missing resource"
                    );
                }
            }
        }

        Ok(items)
    }

    /// Generate one draft invoice for a user's uninvoiced billable usage in
    /// the period. Returns `None` when there is nothing to bill.
    ///
    /// On a Conflict from the insert (usage billed by a concurrent run, or an
    /// invoice number collision) the selection is redone and the insert
    /// retried; a record billed in the meantime simply drops out of the
    /// fresh selection.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn generate_for_user(
        &self,
        user_id: Uuid,
        period_start: NaiveDate,
        period_end: NaiveDate,
        generated_by: Option<Uuid>,
    ) -> Result<Option<InvoiceWithItems>, AppError> {
        let trigger = if generated_by.is_some() {
            "manual"
        } else {
            "scheduled"
        };
        let due_date = period_end + Days::new(self.due_days);
        let mut attempts = 0;

        loop {
            let records = self
                .db
                .billable_usage_for_user(user_id, period_start, period_end)
                .await?;
            if records.is_empty() {
                return Ok(None);
            }

            let items = self.build_line_items(&records).await?;
            if items.is_empty() {
                return Ok(None);
            }

            let invoice_number = generate_invoice_number(period_start);

            match self
                .db
                .insert_invoice_with_items(
                    user_id,
                    &invoice_number,
                    period_start,
                    period_end,
                    due_date,
                    generated_by,
                    &items,
                )
                .await
            {
                Ok(created) => {
                    record_invoice_generated(
                        trigger,
                        created.invoice.total.to_f64().unwrap_or(0.0),
                    );
                    record_line_items_created("usage", created.items.len() as u64);
                    return Ok(Some(created));
                }
                Err(AppError::Conflict(e)) if attempts < MAX_GENERATION_RETRIES => {
                    attempts += 1;
                    warn!(
                        user_id = %user_id,
                        attempt = attempts,
                        error = %e,
                        "Generation conflict, retrying with fresh selection"
                    );
                }
                Err(e) => {
                    record_error("generation_failed", "generate_for_user");
                    return Err(e);
                }
            }
        }
    }

    /// Generate invoices for every user with uninvoiced billable usage in
    /// the period. A failure for one user is logged and does not stop the
    /// rest of the batch.
    #[instrument(skip(self))]
    pub async fn generate_for_all_users(
        &self,
        period_start: NaiveDate,
        period_end: NaiveDate,
        generated_by: Option<Uuid>,
    ) -> Result<Vec<InvoiceWithItems>, AppError> {
        let trigger = if generated_by.is_some() {
            "manual"
        } else {
            "scheduled"
        };

        let users = match self
            .db
            .users_with_billable_usage(period_start, period_end)
            .await
        {
            Ok(users) => users,
            Err(e) => {
                record_generation_run(trigger, "failed");
                return Err(e);
            }
        };

        let mut invoices = Vec::new();
        for user_id in users {
            match self
                .generate_for_user(user_id, period_start, period_end, generated_by)
                .await
            {
                Ok(Some(invoice)) => invoices.push(invoice),
                // Billed by a concurrent run between selection and here.
                Ok(None) => {}
                Err(e) => {
                    record_error("user_generation_failed", "generate_for_all_users");
                    error!(
                        user_id = %user_id,
                        error = %e,
                        "Failed to generate invoice for user, continuing"
                    );
                }
            }
        }

        record_generation_run(trigger, "completed");

        info!(
            period_start = %period_start,
            period_end = %period_end,
            invoice_count = invoices.len(),
            "Generation run completed"
        );

        Ok(invoices)
    }

    /// Generate invoices for the previous calendar month.
    #[instrument(skip(self))]
    pub async fn generate_monthly_invoices(
        &self,
        generated_by: Option<Uuid>,
    ) -> Result<Vec<InvoiceWithItems>, AppError> {
        let (period_start, period_end) = previous_billing_period(self.clock.today());
        info!(
            period_start = %period_start,
            period_end = %period_end,
            "Starting monthly invoice generation"
        );
        self.generate_for_all_users(period_start, period_end, generated_by)
            .await
    }

    /// The line items generation would produce for a user, without
    /// persisting anything.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn preview_for_user(
        &self,
        user_id: Uuid,
        period_start: NaiveDate,
        period_end: NaiveDate,
    ) -> Result<Vec<NewLineItem>, AppError> {
        let records = self
            .db
            .billable_usage_for_user(user_id, period_start, period_end)
            .await?;
        self.build_line_items(&records).await
    }

    /// Aggregate preview across all users in the period. Uses the same
    /// selection and line builder as generation, so the total here is the
    /// total generation would bill.
    #[instrument(skip(self))]
    pub async fn period_summary(
        &self,
        period_start: NaiveDate,
        period_end: NaiveDate,
    ) -> Result<PeriodSummary, AppError> {
        let users = self
            .db
            .users_with_billable_usage(period_start, period_end)
            .await?;

        let mut usage_count: i64 = 0;
        let mut total_amount = Decimal::ZERO;

        for user_id in &users {
            let records = self
                .db
                .billable_usage_for_user(*user_id, period_start, period_end)
                .await?;
            usage_count += records.len() as i64;
            for item in self.build_line_items(&records).await? {
                total_amount += item.amount;
            }
        }

        Ok(PeriodSummary {
            user_count: users.len() as i64,
            usage_count,
            total_amount,
        })
    }

    /// Users that still have uninvoiced billable usage in the period.
    pub async fn users_with_unbilled_usage(
        &self,
        period_start: NaiveDate,
        period_end: NaiveDate,
    ) -> Result<Vec<Uuid>, AppError> {
        self.db
            .users_with_billable_usage(period_start, period_end)
            .await
    }

    /// Whether a user still has uninvoiced billable usage in the period.
    pub async fn has_unbilled_usage(
        &self,
        user_id: Uuid,
        period_start: NaiveDate,
        period_end: NaiveDate,
    ) -> Result<bool, AppError> {
        self.db
            .has_billable_usage(user_id, period_start, period_end)
            .await
    }

    /// Add a manual line item to a draft invoice.
    pub async fn add_manual_item(&self, input: &AddManualLineItem) -> Result<LineItem, AppError> {
        let item = self.db.add_manual_line_item(input).await?;
        record_line_items_created("manual", 1);
        Ok(item)
    }

    /// Remove a line item from a draft invoice.
    pub async fn remove_item(
        &self,
        invoice_id: Uuid,
        line_item_id: Uuid,
    ) -> Result<bool, AppError> {
        self.db.remove_line_item(invoice_id, line_item_id).await
    }

    /// Set the adjustments amount and reason on a draft invoice.
    pub async fn set_adjustments(
        &self,
        invoice_id: Uuid,
        adjustments: Decimal,
        reason: Option<&str>,
    ) -> Result<Option<Invoice>, AppError> {
        self.db
            .set_invoice_adjustments(invoice_id, adjustments, reason)
            .await
    }

    /// Recompute a draft invoice's totals from its stored line items.
    pub async fn recalculate_totals(&self, invoice_id: Uuid) -> Result<Option<Invoice>, AppError> {
        self.db.recalculate_invoice_totals(invoice_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn previous_period_is_the_prior_calendar_month() {
        let (start, end) = previous_billing_period(date(2026, 4, 1));
        assert_eq!(start, date(2026, 3, 1));
        assert_eq!(end, date(2026, 3, 31));
    }

    #[test]
    fn previous_period_mid_month_still_covers_the_prior_month() {
        let (start, end) = previous_billing_period(date(2026, 4, 17));
        assert_eq!(start, date(2026, 3, 1));
        assert_eq!(end, date(2026, 3, 31));
    }

    #[test]
    fn previous_period_crosses_the_year_boundary() {
        let (start, end) = previous_billing_period(date(2026, 1, 5));
        assert_eq!(start, date(2025, 12, 1));
        assert_eq!(end, date(2025, 12, 31));
    }

    #[test]
    fn previous_period_handles_leap_february() {
        let (start, end) = previous_billing_period(date(2024, 3, 15));
        assert_eq!(start, date(2024, 2, 1));
        assert_eq!(end, date(2024, 2, 29));
    }

    #[test]
    fn invoice_numbers_carry_the_period_and_a_random_suffix() {
        let number = generate_invoice_number(date(2026, 3, 1));
        assert!(number.starts_with("INV-202603-"));
        assert_eq!(number.len(), "INV-202603-".len() + 6);
        let suffix = &number["INV-202603-".len()..];
        assert!(suffix
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
    }

    #[test]
    fn invoice_numbers_differ_between_calls() {
        let a = generate_invoice_number(date(2026, 3, 1));
        let b = generate_invoice_number(date(2026, 3, 1));
        // Six random alphanumerics; a collision here is a code bug, not luck.
        assert_ne!(a, b);
    }
}
