//! Database service for commons-billing.

use crate::error::AppError;
use crate::models::{
    AddManualLineItem, CheckInResource, CheckOutResource, CorrectReadings, CreateResource, Invoice,
    InvoiceWithItems, LineItem, ListInvoicesFilter, ListResourcesFilter, ListUsageFilter,
    NewLineItem, PricingModel, Resource, UpdateResource, UsageRecord, UsageStatus,
};
use crate::services::line_items;
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::usage_metrics;
use chrono::{DateTime, Days, NaiveDate, NaiveTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

/// classid for the per-user generation locks taken with the two-key advisory
/// form, keeping them out of the single-key job lock keyspace.
const GENERATION_LOCK_CLASS: i32 = 0x0B11;

/// Maps a user to an advisory lock key. Two users hashing to the same key
/// merely serialize their generation runs; correctness is unaffected.
fn user_lock_key(user_id: Uuid) -> i32 {
    user_id.as_fields().0 as i32
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "commons-billing"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;
        Ok(())
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Resource Operations
    // -------------------------------------------------------------------------

    /// Create a new shared resource.
    #[instrument(skip(self, input), fields(name = %input.name))]
    pub async fn create_resource(&self, input: &CreateResource) -> Result<Resource, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_resource"])
            .start_timer();

        if input.pricing_model == PricingModel::PerUnit && input.pricing_unit.is_none() {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Per-unit pricing requires a pricing unit"
            )));
        }
        if input.rate < Decimal::ZERO {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Rate cannot be negative"
            )));
        }

        let resource_id = Uuid::new_v4();
        let resource = sqlx::query_as::<_, Resource>(
            r#"
            INSERT INTO resources (resource_id, name, description, pricing_model, pricing_unit, rate, active)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING resource_id, name, description, pricing_model, pricing_unit, rate, active, created_utc, updated_utc
            "#,
        )
        .bind(resource_id)
        .bind(&input.name)
        .bind(&input.description)
        .bind(input.pricing_model.as_str())
        .bind(input.pricing_unit.map(|u| u.as_str()))
        .bind(input.rate)
        .bind(true)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to create resource: {}", e)))?;

        timer.observe_duration();

        info!(resource_id = %resource.resource_id, name = %resource.name, "Resource created");

        Ok(resource)
    }

    /// Get a resource by ID.
    #[instrument(skip(self), fields(resource_id = %resource_id))]
    pub async fn get_resource(&self, resource_id: Uuid) -> Result<Option<Resource>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_resource"])
            .start_timer();

        let resource = sqlx::query_as::<_, Resource>(
            r#"
            SELECT resource_id, name, description, pricing_model, pricing_unit, rate, active, created_utc, updated_utc
            FROM resources
            WHERE resource_id = $1
            "#,
        )
        .bind(resource_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get resource: {}", e)))?;

        timer.observe_duration();

        Ok(resource)
    }

    /// List resources.
    #[instrument(skip(self, filter))]
    pub async fn list_resources(
        &self,
        filter: &ListResourcesFilter,
    ) -> Result<Vec<Resource>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_resources"])
            .start_timer();

        let limit = filter.page_size.clamp(1, 100) as i64;

        let resources = if let Some(cursor) = filter.page_token {
            sqlx::query_as::<_, Resource>(
                r#"
                SELECT resource_id, name, description, pricing_model, pricing_unit, rate, active, created_utc, updated_utc
                FROM resources
                WHERE ($1::bool = FALSE OR active = TRUE)
                  AND resource_id > $2
                ORDER BY resource_id
                LIMIT $3
                "#,
            )
            .bind(filter.active_only)
            .bind(cursor)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
        } else {
            sqlx::query_as::<_, Resource>(
                r#"
                SELECT resource_id, name, description, pricing_model, pricing_unit, rate, active, created_utc, updated_utc
                FROM resources
                WHERE ($1::bool = FALSE OR active = TRUE)
                ORDER BY resource_id
                LIMIT $2
                "#,
            )
            .bind(filter.active_only)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
        }
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list resources: {}", e)))?;

        timer.observe_duration();

        Ok(resources)
    }

    /// Update a resource.
    #[instrument(skip(self, input), fields(resource_id = %resource_id))]
    pub async fn update_resource(
        &self,
        resource_id: Uuid,
        input: &UpdateResource,
    ) -> Result<Option<Resource>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_resource"])
            .start_timer();

        if let Some(rate) = input.rate {
            if rate < Decimal::ZERO {
                return Err(AppError::BadRequest(anyhow::anyhow!(
                    "Rate cannot be negative"
                )));
            }
        }

        let resource = sqlx::query_as::<_, Resource>(
            r#"
            UPDATE resources
            SET name = COALESCE($2, name),
                description = COALESCE($3, description),
                rate = COALESCE($4, rate),
                active = COALESCE($5, active),
                updated_utc = NOW()
            WHERE resource_id = $1
            RETURNING resource_id, name, description, pricing_model, pricing_unit, rate, active, created_utc, updated_utc
            "#,
        )
        .bind(resource_id)
        .bind(&input.name)
        .bind(&input.description)
        .bind(input.rate)
        .bind(input.active)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to update resource: {}", e)))?;

        timer.observe_duration();

        if let Some(ref r) = resource {
            info!(resource_id = %r.resource_id, "Resource updated");
        }

        Ok(resource)
    }

    // -------------------------------------------------------------------------
    // Usage Record Operations
    // -------------------------------------------------------------------------

    /// Check a resource out to a member.
    #[instrument(skip(self, input), fields(resource_id = %input.resource_id, user_id = %input.user_id))]
    pub async fn check_out_resource(
        &self,
        input: &CheckOutResource,
    ) -> Result<UsageRecord, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["check_out_resource"])
            .start_timer();

        let resource = self.get_resource(input.resource_id).await?;
        match resource {
            Some(ref r) if r.active => {}
            Some(_) => {
                return Err(AppError::BadRequest(anyhow::anyhow!(
                    "Resource is not active"
                )))
            }
            None => return Err(AppError::NotFound(anyhow::anyhow!("Resource not found"))),
        };

        let usage_id = Uuid::new_v4();
        let record = sqlx::query_as::<_, UsageRecord>(
            r#"
            INSERT INTO usage_records (usage_id, resource_id, user_id, reservation_id, status, checked_out_utc, start_reading, notes)
            VALUES ($1, $2, $3, $4, 'checked_out', $5, $6, $7)
            RETURNING usage_id, resource_id, user_id, reservation_id, status, checked_out_utc, checked_in_utc,
                start_reading, end_reading, duration_hours, distance_units, calculated_cost, notes, created_utc, updated_utc
            "#,
        )
        .bind(usage_id)
        .bind(input.resource_id)
        .bind(input.user_id)
        .bind(input.reservation_id)
        .bind(input.checked_out_utc)
        .bind(input.start_reading)
        .bind(&input.notes)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to check out resource: {}", e)))?;

        timer.observe_duration();

        info!(
            usage_id = %record.usage_id,
            resource_id = %record.resource_id,
            user_id = %record.user_id,
            "Resource checked out"
        );

        Ok(record)
    }

    /// Check a resource back in, deriving duration, distance, and cost.
    #[instrument(skip(self, input), fields(usage_id = %usage_id))]
    pub async fn check_in_resource(
        &self,
        usage_id: Uuid,
        input: &CheckInResource,
    ) -> Result<Option<UsageRecord>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["check_in_resource"])
            .start_timer();

        let existing = self.get_usage_record(usage_id).await?;
        let record = match existing {
            Some(r) if r.status() == UsageStatus::CheckedOut => r,
            Some(_) => {
                return Err(AppError::BadRequest(anyhow::anyhow!(
                    "Usage record is already checked in"
                )))
            }
            None => return Ok(None),
        };

        if input.checked_in_utc < record.checked_out_utc {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Check-in time {} is before check-out time {}",
                input.checked_in_utc,
                record.checked_out_utc
            )));
        }

        let resource = self.get_resource(record.resource_id).await?;
        let duration = usage_metrics::duration_hours(
            record.checked_out_utc,
            Some(input.checked_in_utc),
        );
        let distance = usage_metrics::distance_units(record.start_reading, input.end_reading);
        let cost = usage_metrics::usage_cost(resource.as_ref(), duration, distance);

        let record = sqlx::query_as::<_, UsageRecord>(
            r#"
            UPDATE usage_records
            SET status = 'completed',
                checked_in_utc = $2,
                end_reading = $3,
                notes = COALESCE($4, notes),
                duration_hours = $5,
                distance_units = $6,
                calculated_cost = $7,
                updated_utc = NOW()
            WHERE usage_id = $1 AND status = 'checked_out'
            RETURNING usage_id, resource_id, user_id, reservation_id, status, checked_out_utc, checked_in_utc,
                start_reading, end_reading, duration_hours, distance_units, calculated_cost, notes, created_utc, updated_utc
            "#,
        )
        .bind(usage_id)
        .bind(input.checked_in_utc)
        .bind(input.end_reading)
        .bind(&input.notes)
        .bind(duration)
        .bind(distance)
        .bind(cost)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to check in resource: {}", e)))?;

        timer.observe_duration();

        if let Some(ref r) = record {
            info!(
                usage_id = %r.usage_id,
                cost = %cost,
                "Resource checked in"
            );
        }

        Ok(record)
    }

    /// Correct timestamps or readings on a finished session and recompute
    /// its derived metrics.
    #[instrument(skip(self, input), fields(usage_id = %usage_id))]
    pub async fn correct_usage_readings(
        &self,
        usage_id: Uuid,
        input: &CorrectReadings,
    ) -> Result<Option<UsageRecord>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["correct_usage_readings"])
            .start_timer();

        let existing = self.get_usage_record(usage_id).await?;
        let record = match existing {
            Some(r) if r.status() != UsageStatus::CheckedOut => r,
            Some(_) => {
                return Err(AppError::BadRequest(anyhow::anyhow!(
                    "Usage record has not been checked in yet"
                )))
            }
            None => return Ok(None),
        };

        let checked_out = input.checked_out_utc.unwrap_or(record.checked_out_utc);
        let checked_in = input.checked_in_utc.or(record.checked_in_utc);
        let start_reading = input.start_reading.or(record.start_reading);
        let end_reading = input.end_reading.or(record.end_reading);

        if let Some(checked_in) = checked_in {
            if checked_in < checked_out {
                return Err(AppError::BadRequest(anyhow::anyhow!(
                    "Check-in time {} is before check-out time {}",
                    checked_in,
                    checked_out
                )));
            }
        }

        let resource = self.get_resource(record.resource_id).await?;
        let duration = usage_metrics::duration_hours(checked_out, checked_in);
        let distance = usage_metrics::distance_units(start_reading, end_reading);
        let cost = usage_metrics::usage_cost(resource.as_ref(), duration, distance);

        let record = sqlx::query_as::<_, UsageRecord>(
            r#"
            UPDATE usage_records
            SET checked_out_utc = $2,
                checked_in_utc = $3,
                start_reading = $4,
                end_reading = $5,
                duration_hours = $6,
                distance_units = $7,
                calculated_cost = $8,
                updated_utc = NOW()
            WHERE usage_id = $1
            RETURNING usage_id, resource_id, user_id, reservation_id, status, checked_out_utc, checked_in_utc,
                start_reading, end_reading, duration_hours, distance_units, calculated_cost, notes, created_utc, updated_utc
            "#,
        )
        .bind(usage_id)
        .bind(checked_out)
        .bind(checked_in)
        .bind(start_reading)
        .bind(end_reading)
        .bind(duration)
        .bind(distance)
        .bind(cost)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to correct usage readings: {}", e))
        })?;

        timer.observe_duration();

        if let Some(ref r) = record {
            info!(usage_id = %r.usage_id, cost = %cost, "Usage readings corrected");
        }

        Ok(record)
    }

    /// Move a finished session between completed, disputed, and verified.
    #[instrument(skip(self), fields(usage_id = %usage_id, status = %new_status.as_str()))]
    pub async fn update_usage_status(
        &self,
        usage_id: Uuid,
        new_status: UsageStatus,
    ) -> Result<Option<UsageRecord>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_usage_status"])
            .start_timer();

        if new_status == UsageStatus::CheckedOut {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Cannot move a usage record back to checked_out"
            )));
        }

        let existing = self.get_usage_record(usage_id).await?;
        match existing {
            Some(ref r) if r.status() != UsageStatus::CheckedOut => {}
            Some(_) => {
                return Err(AppError::BadRequest(anyhow::anyhow!(
                    "Usage record must be checked in before its status can change"
                )))
            }
            None => return Ok(None),
        };

        let record = sqlx::query_as::<_, UsageRecord>(
            r#"
            UPDATE usage_records
            SET status = $2,
                updated_utc = NOW()
            WHERE usage_id = $1
            RETURNING usage_id, resource_id, user_id, reservation_id, status, checked_out_utc, checked_in_utc,
                start_reading, end_reading, duration_hours, distance_units, calculated_cost, notes, created_utc, updated_utc
            "#,
        )
        .bind(usage_id)
        .bind(new_status.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to update usage status: {}", e))
        })?;

        timer.observe_duration();

        if let Some(ref r) = record {
            info!(usage_id = %r.usage_id, status = %r.status, "Usage status updated");
        }

        Ok(record)
    }

    /// Recompute and persist derived metrics from the stored session data.
    /// Used after rate or pricing changes on the resource.
    #[instrument(skip(self), fields(usage_id = %usage_id))]
    pub async fn recalculate_usage_metrics(
        &self,
        usage_id: Uuid,
    ) -> Result<Option<UsageRecord>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["recalculate_usage_metrics"])
            .start_timer();

        let existing = self.get_usage_record(usage_id).await?;
        let record = match existing {
            Some(r) => r,
            None => return Ok(None),
        };

        let resource = self.get_resource(record.resource_id).await?;
        let duration = usage_metrics::duration_hours(record.checked_out_utc, record.checked_in_utc);
        let distance = usage_metrics::distance_units(record.start_reading, record.end_reading);
        let cost = usage_metrics::usage_cost(resource.as_ref(), duration, distance);

        let record = sqlx::query_as::<_, UsageRecord>(
            r#"
            UPDATE usage_records
            SET duration_hours = $2,
                distance_units = $3,
                calculated_cost = $4,
                updated_utc = NOW()
            WHERE usage_id = $1
            RETURNING usage_id, resource_id, user_id, reservation_id, status, checked_out_utc, checked_in_utc,
                start_reading, end_reading, duration_hours, distance_units, calculated_cost, notes, created_utc, updated_utc
            "#,
        )
        .bind(usage_id)
        .bind(duration)
        .bind(distance)
        .bind(cost)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to recalculate usage metrics: {}", e))
        })?;

        timer.observe_duration();

        Ok(record)
    }

    /// Get a usage record by ID.
    #[instrument(skip(self), fields(usage_id = %usage_id))]
    pub async fn get_usage_record(&self, usage_id: Uuid) -> Result<Option<UsageRecord>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_usage_record"])
            .start_timer();

        let record = sqlx::query_as::<_, UsageRecord>(
            r#"
            SELECT usage_id, resource_id, user_id, reservation_id, status, checked_out_utc, checked_in_utc,
                start_reading, end_reading, duration_hours, distance_units, calculated_cost, notes, created_utc, updated_utc
            FROM usage_records
            WHERE usage_id = $1
            "#,
        )
        .bind(usage_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get usage record: {}", e)))?;

        timer.observe_duration();

        Ok(record)
    }

    /// List usage records.
    #[instrument(skip(self, filter))]
    pub async fn list_usage_records(
        &self,
        filter: &ListUsageFilter,
    ) -> Result<Vec<UsageRecord>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_usage_records"])
            .start_timer();

        let limit = filter.page_size.clamp(1, 100) as i64;
        let status_str = filter.status.map(|s| s.as_str().to_string());

        let records = if let Some(cursor) = filter.page_token {
            sqlx::query_as::<_, UsageRecord>(
                r#"
                SELECT usage_id, resource_id, user_id, reservation_id, status, checked_out_utc, checked_in_utc,
                    start_reading, end_reading, duration_hours, distance_units, calculated_cost, notes, created_utc, updated_utc
                FROM usage_records
                WHERE ($1::uuid IS NULL OR resource_id = $1)
                  AND ($2::uuid IS NULL OR user_id = $2)
                  AND ($3::varchar IS NULL OR status = $3)
                  AND usage_id > $4
                ORDER BY usage_id
                LIMIT $5
                "#,
            )
            .bind(filter.resource_id)
            .bind(filter.user_id)
            .bind(&status_str)
            .bind(cursor)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
        } else {
            sqlx::query_as::<_, UsageRecord>(
                r#"
                SELECT usage_id, resource_id, user_id, reservation_id, status, checked_out_utc, checked_in_utc,
                    start_reading, end_reading, duration_hours, distance_units, calculated_cost, notes, created_utc, updated_utc
                FROM usage_records
                WHERE ($1::uuid IS NULL OR resource_id = $1)
                  AND ($2::uuid IS NULL OR user_id = $2)
                  AND ($3::varchar IS NULL OR status = $3)
                ORDER BY usage_id
                LIMIT $4
                "#,
            )
            .bind(filter.resource_id)
            .bind(filter.user_id)
            .bind(&status_str)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
        }
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to list usage records: {}", e))
        })?;

        timer.observe_duration();

        Ok(records)
    }

    // -------------------------------------------------------------------------
    // Billing Selection
    // -------------------------------------------------------------------------
    //
    // Every query below uses the same predicate: completed or verified usage,
    // checked in inside the period, with no invoice line item yet. Generation,
    // preview, and summary must agree on what is billable.

    /// UTC bounds for an inclusive date period.
    fn period_bounds(
        period_start: NaiveDate,
        period_end: NaiveDate,
    ) -> (DateTime<Utc>, DateTime<Utc>) {
        let start = period_start.and_time(NaiveTime::MIN).and_utc();
        let end = (period_end + Days::new(1)).and_time(NaiveTime::MIN).and_utc();
        (start, end)
    }

    /// Uninvoiced billable usage for one user in a period, oldest first.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn billable_usage_for_user(
        &self,
        user_id: Uuid,
        period_start: NaiveDate,
        period_end: NaiveDate,
    ) -> Result<Vec<UsageRecord>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["billable_usage_for_user"])
            .start_timer();

        let (start, end) = Self::period_bounds(period_start, period_end);

        let records = sqlx::query_as::<_, UsageRecord>(
            r#"
            SELECT u.usage_id, u.resource_id, u.user_id, u.reservation_id, u.status, u.checked_out_utc, u.checked_in_utc,
                u.start_reading, u.end_reading, u.duration_hours, u.distance_units, u.calculated_cost, u.notes, u.created_utc, u.updated_utc
            FROM usage_records u
            WHERE u.user_id = $1
              AND u.status IN ('completed', 'verified')
              AND u.checked_in_utc IS NOT NULL
              AND u.checked_in_utc >= $2
              AND u.checked_in_utc < $3
              AND NOT EXISTS (
                  SELECT 1 FROM invoice_line_items li WHERE li.usage_record_id = u.usage_id
              )
            ORDER BY u.checked_in_utc
            "#,
        )
        .bind(user_id)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to select billable usage: {}", e))
        })?;

        timer.observe_duration();

        Ok(records)
    }

    /// Distinct users with at least one uninvoiced billable record in a period.
    #[instrument(skip(self))]
    pub async fn users_with_billable_usage(
        &self,
        period_start: NaiveDate,
        period_end: NaiveDate,
    ) -> Result<Vec<Uuid>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["users_with_billable_usage"])
            .start_timer();

        let (start, end) = Self::period_bounds(period_start, period_end);

        let users = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT DISTINCT u.user_id
            FROM usage_records u
            WHERE u.status IN ('completed', 'verified')
              AND u.checked_in_utc IS NOT NULL
              AND u.checked_in_utc >= $1
              AND u.checked_in_utc < $2
              AND NOT EXISTS (
                  SELECT 1 FROM invoice_line_items li WHERE li.usage_record_id = u.usage_id
              )
            ORDER BY u.user_id
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to list billable users: {}", e))
        })?;

        timer.observe_duration();

        Ok(users)
    }

    /// Whether a user has any uninvoiced billable usage in a period.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn has_billable_usage(
        &self,
        user_id: Uuid,
        period_start: NaiveDate,
        period_end: NaiveDate,
    ) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["has_billable_usage"])
            .start_timer();

        let (start, end) = Self::period_bounds(period_start, period_end);

        let exists = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS(
                SELECT 1
                FROM usage_records u
                WHERE u.user_id = $1
                  AND u.status IN ('completed', 'verified')
                  AND u.checked_in_utc IS NOT NULL
                  AND u.checked_in_utc >= $2
                  AND u.checked_in_utc < $3
                  AND NOT EXISTS (
                      SELECT 1 FROM invoice_line_items li WHERE li.usage_record_id = u.usage_id
                  )
            )
            "#,
        )
        .bind(user_id)
        .bind(start)
        .bind(end)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to check billable usage: {}", e))
        })?;

        timer.observe_duration();

        Ok(exists)
    }

    // -------------------------------------------------------------------------
    // Invoice Generation
    // -------------------------------------------------------------------------

    /// Insert an invoice and its line items in one transaction.
    ///
    /// A per-user transaction-scoped advisory lock serializes concurrent
    /// generation runs for the same user. The unique constraint on
    /// usage_record_id is the last line of defense: if another run billed one
    /// of these records first, the whole transaction rolls back with a
    /// Conflict and the caller re-selects.
    #[instrument(skip(self, items), fields(user_id = %user_id, invoice_number = %invoice_number))]
    #[allow(clippy::too_many_arguments)]
    pub async fn insert_invoice_with_items(
        &self,
        user_id: Uuid,
        invoice_number: &str,
        period_start: NaiveDate,
        period_end: NaiveDate,
        due_date: NaiveDate,
        generated_by: Option<Uuid>,
        items: &[NewLineItem],
    ) -> Result<InvoiceWithItems, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_invoice_with_items"])
            .start_timer();

        if items.is_empty() {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Cannot create an invoice without line items"
            )));
        }

        let subtotal: Decimal = items.iter().map(|i| i.amount).sum();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        sqlx::query("SELECT pg_advisory_xact_lock($1, $2)")
            .bind(GENERATION_LOCK_CLASS)
            .bind(user_lock_key(user_id))
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to acquire user lock: {}", e))
            })?;

        let invoice_id = Uuid::new_v4();
        let header = sqlx::query_as::<_, Invoice>(
            r#"
            INSERT INTO invoices (
                invoice_id, user_id, invoice_number, period_start, period_end, status,
                subtotal, adjustments, total, due_date, generated_by
            )
            VALUES ($1, $2, $3, $4, $5, 'draft', $6, 0, $6, $7, $8)
            RETURNING invoice_id, user_id, invoice_number, period_start, period_end, status,
                subtotal, adjustments, adjustment_reason, total, due_date,
                sent_utc, paid_utc, voided_utc, generated_by, created_utc, updated_utc
            "#,
        )
        .bind(invoice_id)
        .bind(user_id)
        .bind(invoice_number)
        .bind(period_start)
        .bind(period_end)
        .bind(subtotal)
        .bind(due_date)
        .bind(generated_by)
        .fetch_one(&mut *tx)
        .await;

        let invoice = match header {
            Ok(invoice) => invoice,
            Err(sqlx::Error::Database(ref db_err)) if db_err.is_unique_violation() => {
                tx.rollback().await.ok();
                return Err(AppError::Conflict(anyhow::anyhow!(
                    "Invoice number {} already exists",
                    invoice_number
                )));
            }
            Err(e) => {
                return Err(AppError::DatabaseError(anyhow::anyhow!(
                    "Failed to insert invoice: {}",
                    e
                )));
            }
        };

        let mut inserted_items = Vec::with_capacity(items.len());

        for (i, item) in items.iter().enumerate() {
            let line_item_id = Uuid::new_v4();
            let result = sqlx::query_as::<_, LineItem>(
                r#"
                INSERT INTO invoice_line_items (
                    line_item_id, invoice_id, usage_record_id, resource_id,
                    description, quantity, unit, unit_price, amount, sort_order
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                RETURNING line_item_id, invoice_id, usage_record_id, resource_id,
                    description, quantity, unit, unit_price, amount, sort_order, created_utc
                "#,
            )
            .bind(line_item_id)
            .bind(invoice.invoice_id)
            .bind(item.usage_record_id)
            .bind(item.resource_id)
            .bind(&item.description)
            .bind(item.quantity)
            .bind(&item.unit)
            .bind(item.unit_price)
            .bind(item.amount)
            .bind(i as i32)
            .fetch_one(&mut *tx)
            .await;

            match result {
                Ok(inserted) => inserted_items.push(inserted),
                Err(sqlx::Error::Database(ref db_err)) if db_err.is_unique_violation() => {
                    // A concurrent run billed one of these records first.
                    tx.rollback().await.ok();
                    return Err(AppError::Conflict(anyhow::anyhow!(
                        "A usage record in this batch is already billed"
                    )));
                }
                Err(e) => {
                    return Err(AppError::DatabaseError(anyhow::anyhow!(
                        "Failed to insert line item: {}",
                        e
                    )));
                }
            }
        }

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        timer.observe_duration();

        info!(
            invoice_id = %invoice.invoice_id,
            invoice_number = %invoice.invoice_number,
            user_id = %invoice.user_id,
            item_count = inserted_items.len(),
            total = %invoice.total,
            "Invoice generated"
        );

        Ok(InvoiceWithItems {
            invoice,
            items: inserted_items,
        })
    }

    // -------------------------------------------------------------------------
    // Invoice Operations
    // -------------------------------------------------------------------------

    /// Get an invoice by ID.
    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    pub async fn get_invoice(&self, invoice_id: Uuid) -> Result<Option<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_invoice"])
            .start_timer();

        let invoice = sqlx::query_as::<_, Invoice>(
            r#"
            SELECT invoice_id, user_id, invoice_number, period_start, period_end, status,
                subtotal, adjustments, adjustment_reason, total, due_date,
                sent_utc, paid_utc, voided_utc, generated_by, created_utc, updated_utc
            FROM invoices
            WHERE invoice_id = $1
            "#,
        )
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get invoice: {}", e)))?;

        timer.observe_duration();

        Ok(invoice)
    }

    /// Get an invoice together with its line items.
    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    pub async fn get_invoice_with_items(
        &self,
        invoice_id: Uuid,
    ) -> Result<Option<InvoiceWithItems>, AppError> {
        let invoice = match self.get_invoice(invoice_id).await? {
            Some(invoice) => invoice,
            None => return Ok(None),
        };
        let items = self.get_line_items(invoice_id).await?;
        Ok(Some(InvoiceWithItems { invoice, items }))
    }

    /// List invoices.
    #[instrument(skip(self, filter))]
    pub async fn list_invoices(
        &self,
        filter: &ListInvoicesFilter,
    ) -> Result<Vec<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_invoices"])
            .start_timer();

        let limit = filter.page_size.clamp(1, 100) as i64;
        let status_str = filter.status.map(|s| s.as_str().to_string());

        let invoices = if let Some(cursor) = filter.page_token {
            sqlx::query_as::<_, Invoice>(
                r#"
                SELECT invoice_id, user_id, invoice_number, period_start, period_end, status,
                    subtotal, adjustments, adjustment_reason, total, due_date,
                    sent_utc, paid_utc, voided_utc, generated_by, created_utc, updated_utc
                FROM invoices
                WHERE ($1::varchar IS NULL OR status = $1)
                  AND ($2::uuid IS NULL OR user_id = $2)
                  AND ($3::date IS NULL OR period_start >= $3)
                  AND ($4::date IS NULL OR period_start <= $4)
                  AND invoice_id > $5
                ORDER BY invoice_id
                LIMIT $6
                "#,
            )
            .bind(&status_str)
            .bind(filter.user_id)
            .bind(filter.period_start_from)
            .bind(filter.period_start_to)
            .bind(cursor)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
        } else {
            sqlx::query_as::<_, Invoice>(
                r#"
                SELECT invoice_id, user_id, invoice_number, period_start, period_end, status,
                    subtotal, adjustments, adjustment_reason, total, due_date,
                    sent_utc, paid_utc, voided_utc, generated_by, created_utc, updated_utc
                FROM invoices
                WHERE ($1::varchar IS NULL OR status = $1)
                  AND ($2::uuid IS NULL OR user_id = $2)
                  AND ($3::date IS NULL OR period_start >= $3)
                  AND ($4::date IS NULL OR period_start <= $4)
                ORDER BY invoice_id
                LIMIT $5
                "#,
            )
            .bind(&status_str)
            .bind(filter.user_id)
            .bind(filter.period_start_from)
            .bind(filter.period_start_to)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
        }
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list invoices: {}", e)))?;

        timer.observe_duration();

        Ok(invoices)
    }

    /// Get line items for an invoice.
    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    pub async fn get_line_items(&self, invoice_id: Uuid) -> Result<Vec<LineItem>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_line_items"])
            .start_timer();

        let items = sqlx::query_as::<_, LineItem>(
            r#"
            SELECT line_item_id, invoice_id, usage_record_id, resource_id,
                description, quantity, unit, unit_price, amount, sort_order, created_utc
            FROM invoice_line_items
            WHERE invoice_id = $1
            ORDER BY sort_order, created_utc
            "#,
        )
        .bind(invoice_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get line items: {}", e)))?;

        timer.observe_duration();

        Ok(items)
    }

    // -------------------------------------------------------------------------
    // Draft Invoice Mutations
    // -------------------------------------------------------------------------

    /// Add a manual line item to a draft invoice and recompute its totals.
    #[instrument(skip(self, input), fields(invoice_id = %input.invoice_id))]
    pub async fn add_manual_line_item(
        &self,
        input: &AddManualLineItem,
    ) -> Result<LineItem, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["add_manual_line_item"])
            .start_timer();

        let invoice = self.get_invoice(input.invoice_id).await?;
        match invoice {
            Some(ref inv) if inv.status().is_editable() => {}
            Some(_) => {
                return Err(AppError::BadRequest(anyhow::anyhow!(
                    "Can only add line items to draft invoices"
                )))
            }
            None => {
                return Err(AppError::NotFound(anyhow::anyhow!("Invoice not found")));
            }
        };

        let item = line_items::manual(&input.description, input.amount, input.resource_id);

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let line_item_id = Uuid::new_v4();
        let line_item = sqlx::query_as::<_, LineItem>(
            r#"
            INSERT INTO invoice_line_items (
                line_item_id, invoice_id, usage_record_id, resource_id,
                description, quantity, unit, unit_price, amount, sort_order
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9,
                (SELECT COALESCE(MAX(sort_order) + 1, 0) FROM invoice_line_items WHERE invoice_id = $2))
            RETURNING line_item_id, invoice_id, usage_record_id, resource_id,
                description, quantity, unit, unit_price, amount, sort_order, created_utc
            "#,
        )
        .bind(line_item_id)
        .bind(input.invoice_id)
        .bind(item.usage_record_id)
        .bind(item.resource_id)
        .bind(&item.description)
        .bind(item.quantity)
        .bind(&item.unit)
        .bind(item.unit_price)
        .bind(item.amount)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to add line item: {}", e)))?;

        Self::recalculate_totals_on(&mut tx, input.invoice_id).await?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        timer.observe_duration();

        info!(
            line_item_id = %line_item.line_item_id,
            invoice_id = %line_item.invoice_id,
            amount = %line_item.amount,
            "Manual line item added"
        );

        Ok(line_item)
    }

    /// Remove a line item from a draft invoice and recompute its totals.
    #[instrument(skip(self), fields(invoice_id = %invoice_id, line_item_id = %line_item_id))]
    pub async fn remove_line_item(
        &self,
        invoice_id: Uuid,
        line_item_id: Uuid,
    ) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["remove_line_item"])
            .start_timer();

        let invoice = self.get_invoice(invoice_id).await?;
        match invoice {
            Some(ref inv) if inv.status().is_editable() => {}
            Some(_) => {
                return Err(AppError::BadRequest(anyhow::anyhow!(
                    "Can only remove line items from draft invoices"
                )))
            }
            None => return Ok(false),
        };

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let result = sqlx::query(
            r#"
            DELETE FROM invoice_line_items
            WHERE invoice_id = $1 AND line_item_id = $2
            "#,
        )
        .bind(invoice_id)
        .bind(line_item_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to remove line item: {}", e))
        })?;

        if result.rows_affected() == 0 {
            tx.rollback().await.ok();
            return Ok(false);
        }

        Self::recalculate_totals_on(&mut tx, invoice_id).await?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        timer.observe_duration();

        info!(line_item_id = %line_item_id, invoice_id = %invoice_id, "Line item removed");

        Ok(true)
    }

    /// Set the adjustments amount and reason on a draft invoice.
    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    pub async fn set_invoice_adjustments(
        &self,
        invoice_id: Uuid,
        adjustments: Decimal,
        reason: Option<&str>,
    ) -> Result<Option<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["set_invoice_adjustments"])
            .start_timer();

        let existing = self.get_invoice(invoice_id).await?;
        match existing {
            Some(ref inv) if inv.status().is_editable() => {}
            Some(_) => {
                return Err(AppError::BadRequest(anyhow::anyhow!(
                    "Can only adjust draft invoices"
                )))
            }
            None => return Ok(None),
        };

        let adjustments = usage_metrics::round_money(adjustments);

        let invoice = sqlx::query_as::<_, Invoice>(
            r#"
            UPDATE invoices
            SET adjustments = $2,
                adjustment_reason = $3,
                total = subtotal + $2,
                updated_utc = NOW()
            WHERE invoice_id = $1 AND status = 'draft'
            RETURNING invoice_id, user_id, invoice_number, period_start, period_end, status,
                subtotal, adjustments, adjustment_reason, total, due_date,
                sent_utc, paid_utc, voided_utc, generated_by, created_utc, updated_utc
            "#,
        )
        .bind(invoice_id)
        .bind(adjustments)
        .bind(reason)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to set adjustments: {}", e))
        })?;

        timer.observe_duration();

        if let Some(ref inv) = invoice {
            info!(
                invoice_id = %inv.invoice_id,
                adjustments = %inv.adjustments,
                total = %inv.total,
                "Invoice adjustments set"
            );
        }

        Ok(invoice)
    }

    /// Recompute subtotal and total for a draft invoice from its line items.
    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    pub async fn recalculate_invoice_totals(
        &self,
        invoice_id: Uuid,
    ) -> Result<Option<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["recalculate_invoice_totals"])
            .start_timer();

        let existing = self.get_invoice(invoice_id).await?;
        match existing {
            Some(ref inv) if inv.status().is_editable() => {}
            Some(_) => {
                return Err(AppError::BadRequest(anyhow::anyhow!(
                    "Can only recalculate draft invoices"
                )))
            }
            None => return Ok(None),
        };

        let invoice = sqlx::query_as::<_, Invoice>(
            r#"
            UPDATE invoices
            SET subtotal = COALESCE((SELECT SUM(amount) FROM invoice_line_items WHERE invoice_id = $1), 0),
                total = COALESCE((SELECT SUM(amount) FROM invoice_line_items WHERE invoice_id = $1), 0) + adjustments,
                updated_utc = NOW()
            WHERE invoice_id = $1 AND status = 'draft'
            RETURNING invoice_id, user_id, invoice_number, period_start, period_end, status,
                subtotal, adjustments, adjustment_reason, total, due_date,
                sent_utc, paid_utc, voided_utc, generated_by, created_utc, updated_utc
            "#,
        )
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to recalculate totals: {}", e))
        })?;

        timer.observe_duration();

        Ok(invoice)
    }

    /// Totals recomputation shared by the item mutations, running on their
    /// transaction so item change and totals land together.
    async fn recalculate_totals_on(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        invoice_id: Uuid,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE invoices
            SET subtotal = COALESCE((SELECT SUM(amount) FROM invoice_line_items WHERE invoice_id = $1), 0),
                total = COALESCE((SELECT SUM(amount) FROM invoice_line_items WHERE invoice_id = $1), 0) + adjustments,
                updated_utc = NOW()
            WHERE invoice_id = $1
            "#,
        )
        .bind(invoice_id)
        .execute(&mut **tx)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to recalculate totals: {}", e))
        })?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Invoice Lifecycle
    // -------------------------------------------------------------------------

    /// Mark a draft invoice as sent.
    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    pub async fn mark_invoice_sent(&self, invoice_id: Uuid) -> Result<Option<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["mark_invoice_sent"])
            .start_timer();

        let existing = self.get_invoice(invoice_id).await?;
        match existing {
            Some(ref inv) if inv.status().can_be_sent() => {}
            Some(_) => {
                return Err(AppError::BadRequest(anyhow::anyhow!(
                    "Only draft invoices can be sent"
                )))
            }
            None => return Ok(None),
        };

        let invoice = sqlx::query_as::<_, Invoice>(
            r#"
            UPDATE invoices
            SET status = 'sent',
                sent_utc = NOW(),
                updated_utc = NOW()
            WHERE invoice_id = $1 AND status = 'draft'
            RETURNING invoice_id, user_id, invoice_number, period_start, period_end, status,
                subtotal, adjustments, adjustment_reason, total, due_date,
                sent_utc, paid_utc, voided_utc, generated_by, created_utc, updated_utc
            "#,
        )
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to send invoice: {}", e)))?;

        timer.observe_duration();

        if let Some(ref inv) = invoice {
            info!(invoice_id = %inv.invoice_id, invoice_number = %inv.invoice_number, "Invoice sent");
        }

        Ok(invoice)
    }

    /// Mark a sent or overdue invoice as paid.
    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    pub async fn mark_invoice_paid(&self, invoice_id: Uuid) -> Result<Option<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["mark_invoice_paid"])
            .start_timer();

        let existing = self.get_invoice(invoice_id).await?;
        match existing {
            Some(ref inv) if inv.status().can_be_marked_paid() => {}
            Some(_) => {
                return Err(AppError::BadRequest(anyhow::anyhow!(
                    "Only sent or overdue invoices can be marked paid"
                )))
            }
            None => return Ok(None),
        };

        let invoice = sqlx::query_as::<_, Invoice>(
            r#"
            UPDATE invoices
            SET status = 'paid',
                paid_utc = NOW(),
                updated_utc = NOW()
            WHERE invoice_id = $1 AND status IN ('sent', 'overdue')
            RETURNING invoice_id, user_id, invoice_number, period_start, period_end, status,
                subtotal, adjustments, adjustment_reason, total, due_date,
                sent_utc, paid_utc, voided_utc, generated_by, created_utc, updated_utc
            "#,
        )
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to mark invoice paid: {}", e))
        })?;

        timer.observe_duration();

        if let Some(ref inv) = invoice {
            info!(invoice_id = %inv.invoice_id, total = %inv.total, "Invoice paid");
        }

        Ok(invoice)
    }

    /// Void an invoice. Allowed from draft, sent, or overdue.
    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    pub async fn void_invoice(&self, invoice_id: Uuid) -> Result<Option<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["void_invoice"])
            .start_timer();

        let existing = self.get_invoice(invoice_id).await?;
        match existing {
            Some(ref inv) if inv.status().can_be_voided() => {}
            Some(_) => {
                return Err(AppError::BadRequest(anyhow::anyhow!(
                    "Only draft, sent, or overdue invoices can be voided"
                )))
            }
            None => return Ok(None),
        };

        let invoice = sqlx::query_as::<_, Invoice>(
            r#"
            UPDATE invoices
            SET status = 'voided',
                voided_utc = NOW(),
                updated_utc = NOW()
            WHERE invoice_id = $1 AND status IN ('draft', 'sent', 'overdue')
            RETURNING invoice_id, user_id, invoice_number, period_start, period_end, status,
                subtotal, adjustments, adjustment_reason, total, due_date,
                sent_utc, paid_utc, voided_utc, generated_by, created_utc, updated_utc
            "#,
        )
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to void invoice: {}", e)))?;

        timer.observe_duration();

        if let Some(ref inv) = invoice {
            info!(invoice_id = %inv.invoice_id, "Invoice voided");
        }

        Ok(invoice)
    }

    /// Move every sent invoice whose due date has passed to overdue.
    /// Idempotent: a second sweep finds nothing to move.
    #[instrument(skip(self))]
    pub async fn mark_overdue_invoices(&self, today: NaiveDate) -> Result<Vec<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["mark_overdue_invoices"])
            .start_timer();

        let invoices = sqlx::query_as::<_, Invoice>(
            r#"
            UPDATE invoices
            SET status = 'overdue',
                updated_utc = NOW()
            WHERE status = 'sent' AND due_date < $1
            RETURNING invoice_id, user_id, invoice_number, period_start, period_end, status,
                subtotal, adjustments, adjustment_reason, total, due_date,
                sent_utc, paid_utc, voided_utc, generated_by, created_utc, updated_utc
            "#,
        )
        .bind(today)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to mark overdue invoices: {}", e))
        })?;

        timer.observe_duration();

        if !invoices.is_empty() {
            info!(count = invoices.len(), "Invoices marked overdue");
        }

        Ok(invoices)
    }
}
