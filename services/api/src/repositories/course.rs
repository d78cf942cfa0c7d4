//! Course and enrollment repository

use async_trait::async_trait;
use common::error::{DatabaseError, DatabaseResult};
use sqlx::{PgPool, Row, postgres::PgRow};
use tracing::info;
use uuid::Uuid;

use super::CourseCatalog;
use crate::models::Course;

/// Enrollment source recorded for purchases made through the guest flow
const ENROLLMENT_SOURCE: &str = "guest_purchase";

/// Postgres-backed course catalog
#[derive(Clone)]
pub struct CourseRepository {
    pool: PgPool,
}

impl CourseRepository {
    /// Create a new course repository
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn course_from_row(row: &PgRow) -> Result<Course, sqlx::Error> {
    Ok(Course {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        price: row.try_get("price")?,
        currency: row.try_get("currency")?,
        is_published: row.try_get("is_published")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl CourseCatalog for CourseRepository {
    async fn find_course(&self, id: Uuid) -> DatabaseResult<Option<Course>> {
        let row = sqlx::query(
            r#"
            SELECT id, title, price, currency, is_published, created_at, updated_at
            FROM courses
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_query)?;

        row.as_ref()
            .map(course_from_row)
            .transpose()
            .map_err(DatabaseError::Query)
    }

    async fn grant_enrollment(&self, user_id: Uuid, course_id: Uuid) -> DatabaseResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO enrollments (user_id, course_id, source)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id, course_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(course_id)
        .bind(ENROLLMENT_SOURCE)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_query)?;

        let created = result.rows_affected() > 0;
        if created {
            info!(%user_id, %course_id, "Enrollment granted");
        }
        Ok(created)
    }

    async fn revoke_enrollment(&self, user_id: Uuid, course_id: Uuid) -> DatabaseResult<bool> {
        let result = sqlx::query("DELETE FROM enrollments WHERE user_id = $1 AND course_id = $2")
            .bind(user_id)
            .bind(course_id)
            .execute(&self.pool)
            .await
            .map_err(DatabaseError::from_query)?;

        let removed = result.rows_affected() > 0;
        if removed {
            info!(%user_id, %course_id, "Enrollment revoked");
        }
        Ok(removed)
    }
}
