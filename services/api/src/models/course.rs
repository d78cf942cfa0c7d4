//! Course catalog models

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy, prelude::ToPrimitive};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Course row as needed by the purchase workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Course {
    pub id: Uuid,
    pub title: String,
    /// Price in major currency units, e.g. 49.99
    pub price: Decimal,
    /// ISO 4217 code, lowercase as the payment provider expects
    pub currency: String,
    pub is_published: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Course {
    /// Price in minor units (cents), rounded half away from zero.
    ///
    /// Returns `None` for prices that do not fit an `i64`.
    pub fn price_in_minor_units(&self) -> Option<i64> {
        (self.price * Decimal::ONE_HUNDRED)
            .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
            .to_i64()
    }
}

/// Public view of a course returned alongside a purchase
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseSummary {
    pub id: Uuid,
    pub title: String,
    pub price: Decimal,
    pub currency: String,
}

impl From<&Course> for CourseSummary {
    fn from(course: &Course) -> Self {
        Self {
            id: course.id,
            title: course.title.clone(),
            price: course.price,
            currency: course.currency.clone(),
        }
    }
}
