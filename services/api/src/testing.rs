//! In-memory doubles for the purchase workflow's seams

use async_trait::async_trait;
use chrono::Utc;
use common::error::{DatabaseError, DatabaseResult};
use common::jwt::{Claims, TokenType};
use common::testing::InMemoryUserStore;
use common::users::UserRole;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use crate::config::PurchaseConfig;
use crate::credentials::CredentialIssuer;
use crate::models::{
    Course, CreatePurchaseRequest, NewPurchase, PaymentStatus, Purchase, PurchaseFilter,
    PurchaseStats, StatusChange, TransitionOutcome,
};
use crate::notifier::{EmailMessage, Notifier};
use crate::payments::{GatewayError, PaymentGateway, PaymentIntent, PaymentIntentRequest};
use crate::purchases::PurchaseService;
use crate::repositories::{CourseCatalog, PurchaseStore};

fn lease_expired(claimed_at: Option<chrono::DateTime<Utc>>, lease: Duration) -> bool {
    match claimed_at {
        None => true,
        Some(at) => chrono::Duration::from_std(lease).is_ok_and(|lease| at + lease <= Utc::now()),
    }
}

/// Purchase store mirroring the conditional writes of the Postgres repository
#[derive(Default)]
pub struct InMemoryPurchaseStore {
    purchases: Mutex<Vec<Purchase>>,
    collide_access_codes: AtomicUsize,
    fail_transitions: AtomicBool,
}

impl InMemoryPurchaseStore {
    /// Report the next `n` inserts as access code collisions
    pub fn collide_next_access_codes(&self, n: usize) {
        self.collide_access_codes.store(n, Ordering::SeqCst);
    }

    /// Make every status write fail as if the database were unreachable
    pub fn fail_transitions(&self) {
        self.fail_transitions.store(true, Ordering::SeqCst);
    }

    pub fn transition_writes_fail(&self) -> bool {
        self.fail_transitions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PurchaseStore for InMemoryPurchaseStore {
    async fn insert(&self, new: &NewPurchase) -> DatabaseResult<Purchase> {
        let collide = self
            .collide_access_codes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let mut purchases = self.purchases.lock().unwrap();
        if collide || purchases.iter().any(|p| p.access_code == new.access_code) {
            return Err(DatabaseError::UniqueViolation {
                constraint: "guest_course_purchases_access_code_key".to_string(),
            });
        }

        let now = Utc::now();
        let purchase = Purchase {
            id: new.id,
            course_id: new.course_id,
            customer_name: new.customer_name.clone(),
            customer_email: new.customer_email.clone(),
            customer_phone: new.customer_phone.clone(),
            payment_status: PaymentStatus::Pending,
            payment_method: None,
            transaction_id: None,
            access_code: new.access_code.clone(),
            user_id: None,
            credentials_pending: false,
            fulfillment_claimed_at: None,
            fulfilled_at: None,
            created_at: now,
            updated_at: now,
        };
        purchases.push(purchase.clone());
        Ok(purchase)
    }

    async fn find_by_id(&self, id: Uuid) -> DatabaseResult<Option<Purchase>> {
        Ok(self
            .purchases
            .lock()
            .unwrap()
            .iter()
            .find(|p| p.id == id)
            .cloned())
    }

    async fn find_by_access_code(&self, access_code: &str) -> DatabaseResult<Option<Purchase>> {
        Ok(self
            .purchases
            .lock()
            .unwrap()
            .iter()
            .find(|p| p.access_code == access_code)
            .cloned())
    }

    async fn list_by_email(&self, email: &str) -> DatabaseResult<Vec<Purchase>> {
        Ok(self
            .purchases
            .lock()
            .unwrap()
            .iter()
            .rev()
            .filter(|p| p.customer_email == email)
            .cloned()
            .collect())
    }

    async fn list(&self, filter: &PurchaseFilter) -> DatabaseResult<(Vec<Purchase>, i64)> {
        let purchases = self.purchases.lock().unwrap();
        let matching: Vec<&Purchase> = purchases
            .iter()
            .rev()
            .filter(|p| filter.status.is_none_or(|s| p.payment_status == s))
            .collect();
        let total = matching.len() as i64;
        let page = matching
            .into_iter()
            .skip(filter.offset as usize)
            .take(filter.limit as usize)
            .cloned()
            .collect();
        Ok((page, total))
    }

    async fn stats(&self) -> DatabaseResult<PurchaseStats> {
        let mut stats = PurchaseStats::default();
        for purchase in self.purchases.lock().unwrap().iter() {
            stats.record(purchase.payment_status, 1);
            if purchase.fulfilled_at.is_some() {
                stats.fulfilled += 1;
            }
        }
        Ok(stats)
    }

    async fn delete(&self, id: Uuid) -> DatabaseResult<bool> {
        let mut purchases = self.purchases.lock().unwrap();
        let before = purchases.len();
        purchases.retain(|p| p.id != id);
        Ok(purchases.len() != before)
    }

    async fn transition_status(
        &self,
        id: Uuid,
        change: &StatusChange,
    ) -> DatabaseResult<TransitionOutcome> {
        if self.transition_writes_fail() {
            return Err(DatabaseError::Query(sqlx::Error::PoolTimedOut));
        }

        let mut purchases = self.purchases.lock().unwrap();
        let Some(purchase) = purchases.iter_mut().find(|p| p.id == id) else {
            return Ok(TransitionOutcome::NotFound);
        };

        let previous = purchase.payment_status;
        if !previous.can_transition_to(change.to) {
            return Ok(TransitionOutcome::Rejected {
                current: purchase.clone(),
            });
        }

        purchase.payment_status = change.to;
        if change.payment_method.is_some() {
            purchase.payment_method = change.payment_method.clone();
        }
        let keep_transaction_id = previous == change.to && purchase.transaction_id.is_some();
        if change.transaction_id.is_some() && !keep_transaction_id {
            purchase.transaction_id = change.transaction_id.clone();
        }
        purchase.updated_at = Utc::now();

        Ok(TransitionOutcome::Applied {
            purchase: purchase.clone(),
            previous,
        })
    }

    async fn claim_fulfillment(
        &self,
        id: Uuid,
        lease: Duration,
    ) -> DatabaseResult<Option<Purchase>> {
        let mut purchases = self.purchases.lock().unwrap();
        let Some(purchase) = purchases.iter_mut().find(|p| p.id == id) else {
            return Ok(None);
        };
        let claimable = purchase.payment_status == PaymentStatus::Paid
            && purchase.fulfilled_at.is_none()
            && lease_expired(purchase.fulfillment_claimed_at, lease);
        if !claimable {
            return Ok(None);
        }
        purchase.fulfillment_claimed_at = Some(Utc::now());
        Ok(Some(purchase.clone()))
    }

    async fn complete_fulfillment(&self, id: Uuid, user_id: Uuid) -> DatabaseResult<Purchase> {
        let mut purchases = self.purchases.lock().unwrap();
        let purchase = purchases
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or(DatabaseError::Query(sqlx::Error::RowNotFound))?;
        let now = Utc::now();
        purchase.user_id = Some(user_id);
        purchase.credentials_pending = false;
        purchase.fulfilled_at = Some(now);
        purchase.fulfillment_claimed_at = None;
        purchase.updated_at = now;
        Ok(purchase.clone())
    }

    async fn record_created_account(&self, id: Uuid, user_id: Uuid) -> DatabaseResult<()> {
        let mut purchases = self.purchases.lock().unwrap();
        let purchase = purchases
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or(DatabaseError::Query(sqlx::Error::RowNotFound))?;
        purchase.user_id = Some(user_id);
        purchase.credentials_pending = true;
        purchase.updated_at = Utc::now();
        Ok(())
    }

    async fn release_fulfillment(&self, id: Uuid) -> DatabaseResult<()> {
        if let Some(purchase) = self
            .purchases
            .lock()
            .unwrap()
            .iter_mut()
            .find(|p| p.id == id && p.fulfilled_at.is_none())
        {
            purchase.fulfillment_claimed_at = None;
        }
        Ok(())
    }

    async fn list_unfulfilled_paid(
        &self,
        lease: Duration,
        limit: i64,
    ) -> DatabaseResult<Vec<Purchase>> {
        Ok(self
            .purchases
            .lock()
            .unwrap()
            .iter()
            .filter(|p| {
                p.payment_status == PaymentStatus::Paid
                    && p.fulfilled_at.is_none()
                    && lease_expired(p.fulfillment_claimed_at, lease)
            })
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn has_other_paid_purchase(
        &self,
        user_id: Uuid,
        course_id: Uuid,
        excluding: Uuid,
    ) -> DatabaseResult<bool> {
        Ok(self.purchases.lock().unwrap().iter().any(|p| {
            p.id != excluding
                && p.user_id == Some(user_id)
                && p.course_id == course_id
                && p.payment_status == PaymentStatus::Paid
        }))
    }
}

/// Course catalog with an enrollment set
#[derive(Default)]
pub struct InMemoryCatalog {
    courses: Mutex<HashMap<Uuid, Course>>,
    enrollments: Mutex<HashSet<(Uuid, Uuid)>>,
    fail_next_grant: AtomicBool,
}

impl InMemoryCatalog {
    pub fn add_course(&self, title: &str, price: Decimal, is_published: bool) -> Course {
        let course = Course {
            id: Uuid::new_v4(),
            title: title.to_string(),
            price,
            currency: "usd".to_string(),
            is_published,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        self.courses
            .lock()
            .unwrap()
            .insert(course.id, course.clone());
        course
    }

    pub fn fail_next_grant(&self) {
        self.fail_next_grant.store(true, Ordering::SeqCst);
    }

    pub fn is_enrolled(&self, user_id: Uuid, course_id: Uuid) -> bool {
        self.enrollments
            .lock()
            .unwrap()
            .contains(&(user_id, course_id))
    }
}

#[async_trait]
impl CourseCatalog for InMemoryCatalog {
    async fn find_course(&self, id: Uuid) -> DatabaseResult<Option<Course>> {
        Ok(self.courses.lock().unwrap().get(&id).cloned())
    }

    async fn grant_enrollment(&self, user_id: Uuid, course_id: Uuid) -> DatabaseResult<bool> {
        if self.fail_next_grant.swap(false, Ordering::SeqCst) {
            return Err(DatabaseError::Query(sqlx::Error::PoolTimedOut));
        }
        Ok(self
            .enrollments
            .lock()
            .unwrap()
            .insert((user_id, course_id)))
    }

    async fn revoke_enrollment(&self, user_id: Uuid, course_id: Uuid) -> DatabaseResult<bool> {
        Ok(self
            .enrollments
            .lock()
            .unwrap()
            .remove(&(user_id, course_id)))
    }
}

/// Payment intent as the provider would return it
pub fn test_intent(id: &str, purchase_id: Uuid, status: &str) -> PaymentIntent {
    serde_json::from_value(serde_json::json!({
        "id": id,
        "amount": 4999,
        "currency": "usd",
        "status": status,
        "client_secret": format!("{id}_secret"),
        "metadata": { "purchase_id": purchase_id.to_string() },
    }))
    .unwrap()
}

/// Gateway that records requests and serves canned intents
#[derive(Default)]
pub struct MockGateway {
    created: Mutex<Vec<PaymentIntentRequest>>,
    intents: Mutex<HashMap<String, PaymentIntent>>,
    reject_next_create: AtomicBool,
}

impl MockGateway {
    pub fn created(&self) -> Vec<PaymentIntentRequest> {
        self.created.lock().unwrap().clone()
    }

    pub fn put_intent(&self, intent: PaymentIntent) {
        self.intents
            .lock()
            .unwrap()
            .insert(intent.id.clone(), intent);
    }

    pub fn reject_next_create(&self) {
        self.reject_next_create.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    fn provider_name(&self) -> &'static str {
        "stripe"
    }

    async fn create_payment_intent(
        &self,
        request: &PaymentIntentRequest,
    ) -> Result<PaymentIntent, GatewayError> {
        if self.reject_next_create.swap(false, Ordering::SeqCst) {
            return Err(GatewayError::Rejected {
                status: 402,
                code: "card_declined".to_string(),
                message: "Your card was declined.".to_string(),
            });
        }
        let mut created = self.created.lock().unwrap();
        created.push(request.clone());
        let id = format!("pi_test_{}", created.len());
        let mut intent = test_intent(&id, request.purchase_id, "requires_payment_method");
        intent.amount = request.amount;
        intent.currency = request.currency.clone();
        Ok(intent)
    }

    async fn retrieve_payment_intent(&self, intent_id: &str) -> Result<PaymentIntent, GatewayError> {
        self.intents
            .lock()
            .unwrap()
            .get(intent_id)
            .cloned()
            .ok_or_else(|| GatewayError::Rejected {
                status: 404,
                code: "resource_missing".to_string(),
                message: format!("No such payment_intent: '{intent_id}'"),
            })
    }
}

/// Notifier that keeps every message it is asked to send
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<EmailMessage>>,
    fail: AtomicBool,
}

impl RecordingNotifier {
    pub fn fail_all(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<EmailMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn count_with_subject(&self, subject: &str) -> usize {
        self.sent().iter().filter(|m| m.subject == subject).count()
    }

    /// Password from the most recent credentials email to `to`
    pub fn emailed_password(&self, to: &str) -> Option<String> {
        self.sent()
            .iter()
            .rev()
            .filter(|m| m.to == to)
            .find_map(|m| {
                m.body_text
                    .lines()
                    .find_map(|line| line.trim().strip_prefix("Password: "))
                    .map(str::to_string)
            })
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, message: &EmailMessage) -> anyhow::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("smtp relay unavailable");
        }
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }
}

/// A [`PurchaseService`] wired to in-memory doubles
pub struct TestHarness {
    pub purchases: Arc<InMemoryPurchaseStore>,
    pub catalog: Arc<InMemoryCatalog>,
    pub gateway: Arc<MockGateway>,
    pub users: Arc<InMemoryUserStore>,
    pub notifier: Arc<RecordingNotifier>,
    pub service: Arc<PurchaseService>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(PurchaseConfig::default())
    }

    pub fn with_config(config: PurchaseConfig) -> Self {
        let purchases = Arc::new(InMemoryPurchaseStore::default());
        let catalog = Arc::new(InMemoryCatalog::default());
        let gateway = Arc::new(MockGateway::default());
        let users = Arc::new(InMemoryUserStore::new());
        let notifier = Arc::new(RecordingNotifier::default());

        let service = Arc::new(PurchaseService::new(
            purchases.clone(),
            catalog.clone(),
            gateway.clone(),
            CredentialIssuer::new(users.clone()),
            notifier.clone(),
            PurchaseConfig {
                mail_timeout: Duration::from_secs(2),
                ..config
            },
        ));

        Self {
            purchases,
            catalog,
            gateway,
            users,
            notifier,
            service,
        }
    }

    /// Create a PENDING purchase of `course` for `email`
    pub async fn purchase(&self, course: &Course, email: &str) -> Purchase {
        self.service
            .create_purchase(CreatePurchaseRequest {
                course_id: course.id.to_string(),
                customer_name: "Ada Lovelace".to_string(),
                customer_email: email.to_string(),
                customer_phone: None,
            })
            .await
            .unwrap()
    }

    pub fn claims(&self, email: &str, role: UserRole) -> Claims {
        let now = Utc::now().timestamp() as u64;
        Claims {
            sub: Uuid::new_v4(),
            email: email.to_string(),
            role,
            iat: now,
            exp: now + 900,
            token_type: TokenType::Access,
        }
    }
}
