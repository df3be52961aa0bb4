//! Line item construction.
//!
//! Builders produce `NewLineItem` values; persistence happens in the
//! generator's transaction so an invoice and its items land together.

use crate::models::{NewLineItem, Resource, UsageRecord};
use crate::services::usage_metrics::round_money;
use rust_decimal::Decimal;
use uuid::Uuid;

/// Build a line item from a completed usage record.
///
/// Quantity prefers distance over duration and falls back to 1 (flat fees,
/// trips). The stored calculated cost wins when present and non-zero;
/// otherwise the amount is recomputed as quantity times unit price.
pub fn from_usage(record: &UsageRecord, resource: &Resource) -> NewLineItem {
    let quantity = record
        .distance_units
        .or(record.duration_hours)
        .unwrap_or(Decimal::ONE);

    let unit = resource.pricing_unit().map(|u| u.label().to_string());
    let unit_price = resource.rate;

    let amount = match record.calculated_cost {
        Some(cost) if !cost.is_zero() => cost,
        _ => round_money(quantity * unit_price),
    };

    NewLineItem {
        usage_record_id: Some(record.usage_id),
        resource_id: Some(resource.resource_id),
        description: format!(
            "{} ({})",
            resource.name,
            record.checked_out_utc.format("%Y-%m-%d")
        ),
        quantity,
        unit,
        unit_price,
        amount,
    }
}

/// Build a manual charge or credit line.
pub fn manual(description: &str, amount: Decimal, resource_id: Option<Uuid>) -> NewLineItem {
    let amount = round_money(amount);
    NewLineItem {
        usage_record_id: None,
        resource_id,
        description: description.to_string(),
        quantity: Decimal::ONE,
        unit: None,
        unit_price: amount,
        amount,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PricingModel, UsageStatus};
    use chrono::{TimeZone, Utc};

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn resource(model: PricingModel, unit: Option<&str>, rate: &str) -> Resource {
        let now = Utc::now();
        Resource {
            resource_id: Uuid::new_v4(),
            name: "Pickup truck".to_string(),
            description: None,
            pricing_model: model.as_str().to_string(),
            pricing_unit: unit.map(|u| u.to_string()),
            rate: dec(rate),
            active: true,
            created_utc: now,
            updated_utc: now,
        }
    }

    fn record(
        duration: Option<&str>,
        distance: Option<&str>,
        cost: Option<&str>,
    ) -> UsageRecord {
        let checked_out = Utc.with_ymd_and_hms(2026, 3, 14, 9, 0, 0).unwrap();
        UsageRecord {
            usage_id: Uuid::new_v4(),
            resource_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            reservation_id: None,
            status: UsageStatus::Completed.as_str().to_string(),
            checked_out_utc: checked_out,
            checked_in_utc: Some(checked_out + chrono::Duration::hours(4)),
            start_reading: None,
            end_reading: None,
            duration_hours: duration.map(dec),
            distance_units: distance.map(dec),
            calculated_cost: cost.map(dec),
            notes: None,
            created_utc: checked_out,
            updated_utc: checked_out,
        }
    }

    #[test]
    fn quantity_prefers_distance_over_duration() {
        let res = resource(PricingModel::PerUnit, Some("mile"), "0.50");
        let item = from_usage(&record(Some("4.00"), Some("52.30"), Some("26.15")), &res);
        assert_eq!(item.quantity, dec("52.30"));
        assert_eq!(item.unit.as_deref(), Some("mi"));
    }

    #[test]
    fn quantity_falls_back_to_duration_then_one() {
        let res = resource(PricingModel::PerUnit, Some("hour"), "10.00");
        let item = from_usage(&record(Some("4.00"), None, Some("40.00")), &res);
        assert_eq!(item.quantity, dec("4.00"));

        let flat = resource(PricingModel::FlatFee, None, "15.00");
        let item = from_usage(&record(None, None, Some("15.00")), &flat);
        assert_eq!(item.quantity, Decimal::ONE);
        assert_eq!(item.unit, None);
    }

    #[test]
    fn stored_cost_wins_when_present() {
        let res = resource(PricingModel::PerUnit, Some("hour"), "10.00");
        let item = from_usage(&record(Some("4.00"), None, Some("37.50")), &res);
        assert_eq!(item.amount, dec("37.50"));
    }

    #[test]
    fn missing_or_zero_cost_recomputes_from_quantity() {
        let res = resource(PricingModel::PerUnit, Some("hour"), "10.00");

        let item = from_usage(&record(Some("4.00"), None, None), &res);
        assert_eq!(item.amount, dec("40.00"));

        let item = from_usage(&record(Some("4.00"), None, Some("0.00")), &res);
        assert_eq!(item.amount, dec("40.00"));
    }

    #[test]
    fn description_names_the_resource_and_checkout_date() {
        let res = resource(PricingModel::PerUnit, Some("hour"), "10.00");
        let item = from_usage(&record(Some("4.00"), None, None), &res);
        assert_eq!(item.description, "Pickup truck (2026-03-14)");
    }

    #[test]
    fn usage_items_carry_their_record_and_resource() {
        let res = resource(PricingModel::PerUnit, Some("hour"), "10.00");
        let rec = record(Some("4.00"), None, None);
        let item = from_usage(&rec, &res);
        assert_eq!(item.usage_record_id, Some(rec.usage_id));
        assert_eq!(item.resource_id, Some(res.resource_id));
    }

    #[test]
    fn manual_items_are_single_quantity_at_the_amount() {
        let item = manual("Lost helmet replacement", dec("25.555"), None);
        assert_eq!(item.usage_record_id, None);
        assert_eq!(item.quantity, Decimal::ONE);
        assert_eq!(item.unit, None);
        assert_eq!(item.unit_price, dec("25.56"));
        assert_eq!(item.amount, dec("25.56"));
        assert_eq!(item.description, "Lost helmet replacement");
    }

    #[test]
    fn manual_credits_keep_their_sign() {
        let item = manual("Goodwill credit", dec("-10.00"), None);
        assert_eq!(item.amount, dec("-10.00"));
    }
}
