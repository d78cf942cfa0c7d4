//! Guest course purchase repository

use async_trait::async_trait;
use common::error::{DatabaseError, DatabaseResult};
use sqlx::{PgPool, Row, postgres::PgRow};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::PurchaseStore;
use crate::models::{
    NewPurchase, PaymentStatus, Purchase, PurchaseFilter, PurchaseStats, StatusChange,
    TransitionOutcome,
};

const PURCHASE_COLUMNS: &str = "id, course_id, customer_name, customer_email, customer_phone, \
     payment_status, payment_method, transaction_id, access_code, user_id, \
     credentials_pending, fulfillment_claimed_at, fulfilled_at, created_at, updated_at";

const RETURNING_COLUMNS: &str = "p.id, p.course_id, p.customer_name, p.customer_email, \
     p.customer_phone, p.payment_status, p.payment_method, p.transaction_id, p.access_code, \
     p.user_id, p.credentials_pending, p.fulfillment_claimed_at, p.fulfilled_at, p.created_at, p.updated_at";

/// Postgres-backed purchase repository
#[derive(Clone)]
pub struct PurchaseRepository {
    pool: PgPool,
}

impl PurchaseRepository {
    /// Create a new purchase repository
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn parse_status(value: String) -> Result<PaymentStatus, sqlx::Error> {
    value
        .parse::<PaymentStatus>()
        .map_err(|e| sqlx::Error::Decode(Box::new(e)))
}

fn purchase_from_row(row: &PgRow) -> Result<Purchase, sqlx::Error> {
    Ok(Purchase {
        id: row.try_get("id")?,
        course_id: row.try_get("course_id")?,
        customer_name: row.try_get("customer_name")?,
        customer_email: row.try_get("customer_email")?,
        customer_phone: row.try_get("customer_phone")?,
        payment_status: parse_status(row.try_get("payment_status")?)?,
        payment_method: row.try_get("payment_method")?,
        transaction_id: row.try_get("transaction_id")?,
        access_code: row.try_get("access_code")?,
        user_id: row.try_get("user_id")?,
        credentials_pending: row.try_get("credentials_pending")?,
        fulfillment_claimed_at: row.try_get("fulfillment_claimed_at")?,
        fulfilled_at: row.try_get("fulfilled_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn purchases_from_rows(rows: &[PgRow]) -> DatabaseResult<Vec<Purchase>> {
    rows.iter()
        .map(purchase_from_row)
        .collect::<Result<Vec<_>, _>>()
        .map_err(DatabaseError::Query)
}

#[async_trait]
impl PurchaseStore for PurchaseRepository {
    async fn insert(&self, purchase: &NewPurchase) -> DatabaseResult<Purchase> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO guest_course_purchases
                (id, course_id, customer_name, customer_email, customer_phone, access_code,
                 payment_status)
            VALUES ($1, $2, $3, $4, $5, $6, 'PENDING')
            RETURNING {PURCHASE_COLUMNS}
            "#
        ))
        .bind(purchase.id)
        .bind(purchase.course_id)
        .bind(&purchase.customer_name)
        .bind(&purchase.customer_email)
        .bind(&purchase.customer_phone)
        .bind(&purchase.access_code)
        .fetch_one(&self.pool)
        .await
        .map_err(DatabaseError::from_query)?;

        purchase_from_row(&row).map_err(DatabaseError::Query)
    }

    async fn find_by_id(&self, id: Uuid) -> DatabaseResult<Option<Purchase>> {
        let row = sqlx::query(&format!(
            "SELECT {PURCHASE_COLUMNS} FROM guest_course_purchases WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_query)?;

        row.as_ref()
            .map(purchase_from_row)
            .transpose()
            .map_err(DatabaseError::Query)
    }

    async fn find_by_access_code(&self, access_code: &str) -> DatabaseResult<Option<Purchase>> {
        let row = sqlx::query(&format!(
            "SELECT {PURCHASE_COLUMNS} FROM guest_course_purchases WHERE access_code = $1"
        ))
        .bind(access_code)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_query)?;

        row.as_ref()
            .map(purchase_from_row)
            .transpose()
            .map_err(DatabaseError::Query)
    }

    async fn list_by_email(&self, email: &str) -> DatabaseResult<Vec<Purchase>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {PURCHASE_COLUMNS}
            FROM guest_course_purchases
            WHERE customer_email = $1
            ORDER BY created_at DESC
            "#
        ))
        .bind(email)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_query)?;

        purchases_from_rows(&rows)
    }

    async fn list(&self, filter: &PurchaseFilter) -> DatabaseResult<(Vec<Purchase>, i64)> {
        let status = filter.status.map(|s| s.as_str());

        let rows = sqlx::query(&format!(
            r#"
            SELECT {PURCHASE_COLUMNS}
            FROM guest_course_purchases
            WHERE ($1::TEXT IS NULL OR payment_status = $1)
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            "#
        ))
        .bind(status)
        .bind(filter.limit)
        .bind(filter.offset)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_query)?;

        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM guest_course_purchases WHERE ($1::TEXT IS NULL OR payment_status = $1)",
        )
        .bind(status)
        .fetch_one(&self.pool)
        .await
        .map_err(DatabaseError::from_query)?;

        Ok((purchases_from_rows(&rows)?, total))
    }

    async fn stats(&self) -> DatabaseResult<PurchaseStats> {
        let rows = sqlx::query(
            r#"
            SELECT payment_status, COUNT(*) AS count
            FROM guest_course_purchases
            GROUP BY payment_status
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_query)?;

        let mut stats = PurchaseStats::default();
        for row in &rows {
            let status = row
                .try_get::<String, _>("payment_status")
                .and_then(parse_status)
                .map_err(DatabaseError::Query)?;
            let count: i64 = row.try_get("count").map_err(DatabaseError::Query)?;
            stats.record(status, count);
        }

        stats.fulfilled = sqlx::query_scalar(
            "SELECT COUNT(*) FROM guest_course_purchases WHERE fulfilled_at IS NOT NULL",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(DatabaseError::from_query)?;

        Ok(stats)
    }

    async fn delete(&self, id: Uuid) -> DatabaseResult<bool> {
        let result = sqlx::query("DELETE FROM guest_course_purchases WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(DatabaseError::from_query)?;

        Ok(result.rows_affected() > 0)
    }

    async fn transition_status(
        &self,
        id: Uuid,
        change: &StatusChange,
    ) -> DatabaseResult<TransitionOutcome> {
        let allowed: Vec<String> = change
            .to
            .allowed_predecessors()
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();

        // The row lock serializes concurrent writers; the predecessor check
        // runs against the locked value.
        let row = sqlx::query(&format!(
            r#"
            WITH locked AS (
                SELECT id, payment_status, transaction_id
                FROM guest_course_purchases
                WHERE id = $1
                FOR UPDATE
            )
            UPDATE guest_course_purchases p
            SET payment_status = $2,
                payment_method = COALESCE($3, p.payment_method),
                transaction_id = CASE
                    WHEN locked.payment_status = $2 AND locked.transaction_id IS NOT NULL
                        THEN locked.transaction_id
                    ELSE COALESCE($4, locked.transaction_id)
                END,
                updated_at = NOW()
            FROM locked
            WHERE p.id = locked.id AND locked.payment_status = ANY($5)
            RETURNING {RETURNING_COLUMNS}, locked.payment_status AS previous_status,
                locked.transaction_id AS previous_transaction_id
            "#
        ))
        .bind(id)
        .bind(change.to.as_str())
        .bind(&change.payment_method)
        .bind(&change.transaction_id)
        .bind(&allowed)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_query)?;

        if let Some(row) = row {
            let purchase = purchase_from_row(&row).map_err(DatabaseError::Query)?;
            let previous = row
                .try_get::<String, _>("previous_status")
                .and_then(parse_status)
                .map_err(DatabaseError::Query)?;
            let previous_transaction_id: Option<String> = row
                .try_get("previous_transaction_id")
                .map_err(DatabaseError::Query)?;
            if previous == change.to {
                if let (Some(kept), Some(offered)) =
                    (&previous_transaction_id, &change.transaction_id)
                {
                    if kept != offered {
                        warn!(
                            purchase_id = %id,
                            kept_transaction_id = %kept,
                            offered_transaction_id = %offered,
                            "Repeated status write carried a different transaction id; keeping the stored one"
                        );
                    }
                }
            }
            debug!(purchase_id = %id, %previous, to = %change.to, "Payment status written");
            return Ok(TransitionOutcome::Applied { purchase, previous });
        }

        Ok(match self.find_by_id(id).await? {
            Some(current) => TransitionOutcome::Rejected { current },
            None => TransitionOutcome::NotFound,
        })
    }

    async fn claim_fulfillment(
        &self,
        id: Uuid,
        lease: Duration,
    ) -> DatabaseResult<Option<Purchase>> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE guest_course_purchases
            SET fulfillment_claimed_at = NOW()
            WHERE id = $1
              AND payment_status = 'PAID'
              AND fulfilled_at IS NULL
              AND (fulfillment_claimed_at IS NULL
                   OR fulfillment_claimed_at < NOW() - make_interval(secs => $2))
            RETURNING {PURCHASE_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(lease.as_secs_f64())
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_query)?;

        row.as_ref()
            .map(purchase_from_row)
            .transpose()
            .map_err(DatabaseError::Query)
    }

    async fn complete_fulfillment(&self, id: Uuid, user_id: Uuid) -> DatabaseResult<Purchase> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE guest_course_purchases
            SET user_id = $2,
                credentials_pending = FALSE,
                fulfilled_at = NOW(),
                fulfillment_claimed_at = NULL,
                updated_at = NOW()
            WHERE id = $1
            RETURNING {PURCHASE_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(DatabaseError::from_query)?;

        info!(purchase_id = %id, %user_id, "Purchase fulfilled");
        purchase_from_row(&row).map_err(DatabaseError::Query)
    }

    async fn record_created_account(&self, id: Uuid, user_id: Uuid) -> DatabaseResult<()> {
        sqlx::query(
            r#"
            UPDATE guest_course_purchases
            SET user_id = $2,
                credentials_pending = TRUE,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(user_id)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_query)?;

        Ok(())
    }

    async fn release_fulfillment(&self, id: Uuid) -> DatabaseResult<()> {
        sqlx::query(
            r#"
            UPDATE guest_course_purchases
            SET fulfillment_claimed_at = NULL
            WHERE id = $1 AND fulfilled_at IS NULL
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_query)?;

        Ok(())
    }

    async fn list_unfulfilled_paid(
        &self,
        lease: Duration,
        limit: i64,
    ) -> DatabaseResult<Vec<Purchase>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {PURCHASE_COLUMNS}
            FROM guest_course_purchases
            WHERE payment_status = 'PAID'
              AND fulfilled_at IS NULL
              AND (fulfillment_claimed_at IS NULL
                   OR fulfillment_claimed_at < NOW() - make_interval(secs => $1))
            ORDER BY updated_at
            LIMIT $2
            "#
        ))
        .bind(lease.as_secs_f64())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_query)?;

        purchases_from_rows(&rows)
    }

    async fn has_other_paid_purchase(
        &self,
        user_id: Uuid,
        course_id: Uuid,
        excluding: Uuid,
    ) -> DatabaseResult<bool> {
        sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM guest_course_purchases
                WHERE user_id = $1 AND course_id = $2 AND id <> $3
                  AND payment_status = 'PAID'
            )
            "#,
        )
        .bind(user_id)
        .bind(course_id)
        .bind(excluding)
        .fetch_one(&self.pool)
        .await
        .map_err(DatabaseError::from_query)
    }
}
