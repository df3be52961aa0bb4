//! Usage metric derivation and cost calculation.
//!
//! All money math runs on `Decimal` and rounds to 2 places half-up. Derived
//! quantities floor at zero so meter rollovers and corrected timestamps can
//! never produce a negative charge.

use crate::models::{PricingModel, PricingUnit, Resource, UsageRecord};
use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};

const MINUTES_PER_HOUR: i64 = 60;

/// Round a monetary value to 2 decimal places, half-up.
pub fn round_money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Duration of a session in hours, to 2 decimal places. Whole minutes only;
/// sub-minute remainders are dropped. `None` while still checked out.
pub fn duration_hours(
    checked_out: DateTime<Utc>,
    checked_in: Option<DateTime<Utc>>,
) -> Option<Decimal> {
    let checked_in = checked_in?;
    let minutes = (checked_in - checked_out).num_minutes().max(0);
    let hours = Decimal::from(minutes) / Decimal::from(MINUTES_PER_HOUR);
    Some(hours.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero))
}

/// Distance covered between two meter readings, floored at zero to absorb
/// meter rollover or swapped readings. `None` unless both readings exist.
pub fn distance_units(
    start_reading: Option<Decimal>,
    end_reading: Option<Decimal>,
) -> Option<Decimal> {
    let (start, end) = (start_reading?, end_reading?);
    let distance = (end - start).max(Decimal::ZERO);
    Some(distance.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero))
}

/// Cost of a session given its derived metrics.
///
/// A missing resource, or a per-unit resource whose stored unit no longer
/// parses, bills zero rather than failing the whole batch.
pub fn usage_cost(
    resource: Option<&Resource>,
    duration_hours: Option<Decimal>,
    distance_units: Option<Decimal>,
) -> Decimal {
    let Some(resource) = resource else {
        return round_money(Decimal::ZERO);
    };

    let amount = match resource.pricing_model() {
        PricingModel::FlatFee => resource.rate,
        PricingModel::PerUnit => match resource.pricing_unit() {
            Some(PricingUnit::Hour) => {
                resource.rate * duration_hours.unwrap_or(Decimal::ZERO)
            }
            Some(PricingUnit::Day) => {
                // Partial days bill as whole days.
                let days = (duration_hours.unwrap_or(Decimal::ZERO) / Decimal::from(24)).ceil();
                resource.rate * days
            }
            Some(PricingUnit::Mile) | Some(PricingUnit::Kilometer) => {
                resource.rate * distance_units.unwrap_or(Decimal::ZERO)
            }
            Some(PricingUnit::Trip) => resource.rate,
            None => Decimal::ZERO,
        },
    };

    round_money(amount)
}

/// Cost of a stored record, using its persisted metrics.
pub fn cost_for_record(record: &UsageRecord, resource: Option<&Resource>) -> Decimal {
    usage_cost(resource, record.duration_hours, record.distance_units)
}

/// Pre-usage estimate for a planned reservation window. Distance cannot be
/// projected, so distance-priced resources estimate zero.
pub fn estimate_cost(
    resource: &Resource,
    starts_at: DateTime<Utc>,
    ends_at: DateTime<Utc>,
) -> Decimal {
    let projected = duration_hours(starts_at, Some(ends_at));
    usage_cost(Some(resource), projected, None)
}
