//! Repositories for database operations

use async_trait::async_trait;
use common::error::DatabaseResult;
use std::time::Duration;
use uuid::Uuid;

use crate::models::{
    Course, NewPurchase, Purchase, PurchaseFilter, PurchaseStats, StatusChange, TransitionOutcome,
};

pub mod course;
pub mod purchase;

pub use course::CourseRepository;
pub use purchase::PurchaseRepository;

/// Persistence of guest course purchases.
///
/// Status writes go through [`PurchaseStore::transition_status`], which
/// applies a change only when the stored status is one of
/// `change.to.allowed_predecessors()`, atomically with respect to other
/// writers of the same row.
#[async_trait]
pub trait PurchaseStore: Send + Sync {
    /// Insert a new PENDING purchase. A taken access code is reported as
    /// a unique violation.
    async fn insert(&self, purchase: &NewPurchase) -> DatabaseResult<Purchase>;

    async fn find_by_id(&self, id: Uuid) -> DatabaseResult<Option<Purchase>>;

    async fn find_by_access_code(&self, access_code: &str) -> DatabaseResult<Option<Purchase>>;

    /// All purchases for a normalized email, newest first
    async fn list_by_email(&self, email: &str) -> DatabaseResult<Vec<Purchase>>;

    /// A page of purchases, newest first, with the unpaged total
    async fn list(&self, filter: &PurchaseFilter) -> DatabaseResult<(Vec<Purchase>, i64)>;

    async fn stats(&self) -> DatabaseResult<PurchaseStats>;

    async fn delete(&self, id: Uuid) -> DatabaseResult<bool>;

    async fn transition_status(
        &self,
        id: Uuid,
        change: &StatusChange,
    ) -> DatabaseResult<TransitionOutcome>;

    /// Take the fulfillment lease on a PAID, unfulfilled purchase.
    ///
    /// Returns `None` when the purchase is not PAID, is already fulfilled,
    /// or another worker holds a lease younger than `lease`.
    async fn claim_fulfillment(&self, id: Uuid, lease: Duration)
    -> DatabaseResult<Option<Purchase>>;

    /// Link the purchase to an account it just created, flagging the
    /// password as not yet delivered
    async fn record_created_account(&self, id: Uuid, user_id: Uuid) -> DatabaseResult<()>;

    /// Link the purchase to its account, mark it fulfilled and clear the
    /// pending credentials flag
    async fn complete_fulfillment(&self, id: Uuid, user_id: Uuid) -> DatabaseResult<Purchase>;

    /// Drop a lease after a failed fulfillment so it can be retried
    async fn release_fulfillment(&self, id: Uuid) -> DatabaseResult<()>;

    /// PAID purchases without fulfillment and without a live lease
    async fn list_unfulfilled_paid(
        &self,
        lease: Duration,
        limit: i64,
    ) -> DatabaseResult<Vec<Purchase>>;

    /// Whether `user_id` holds a PAID purchase of `course_id` other than `excluding`
    async fn has_other_paid_purchase(
        &self,
        user_id: Uuid,
        course_id: Uuid,
        excluding: Uuid,
    ) -> DatabaseResult<bool>;
}

/// Read access to courses and write access to enrollments
#[async_trait]
pub trait CourseCatalog: Send + Sync {
    async fn find_course(&self, id: Uuid) -> DatabaseResult<Option<Course>>;

    /// Enroll the user; returns false when the enrollment already existed
    async fn grant_enrollment(&self, user_id: Uuid, course_id: Uuid) -> DatabaseResult<bool>;

    /// Remove the enrollment; returns false when there was none
    async fn revoke_enrollment(&self, user_id: Uuid, course_id: Uuid) -> DatabaseResult<bool>;
}
