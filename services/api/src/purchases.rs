//! Guest course purchase workflow
//!
//! A purchase is created PENDING with a unique access code, paid through a
//! provider payment intent, and moved between statuses by the webhook
//! receiver, the buyer's sync call or an admin. The first time a purchase is
//! seen PAID it is fulfilled: the buyer's account is found or created, the
//! course enrollment is granted and the confirmation (plus credentials for a
//! new account) is emailed.

use async_trait::async_trait;
use common::{
    jwt::Claims,
    validation::{normalize_email, validate_email, validate_person_name, validate_phone},
};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::PurchaseConfig;
use crate::credentials::{CredentialIssuer, IssuedCredentials};
use crate::error::{ApiError, ApiResult};
use crate::models::{
    Course, CourseSummary, CreatePaymentIntentRequest, CreatePurchaseRequest, ListPurchasesQuery,
    NewPurchase, PaymentIntentResponse, PaymentStatus, Purchase, PurchaseAccess, PurchaseFilter,
    PurchaseListResponse, PurchaseStats, PurchasedCourse, ResendCredentialsResponse, StatusChange,
    SyncPaymentRequest, TransitionOutcome,
};
use crate::notifier::{Notifier, send_best_effort, templates};
use crate::payments::{PaymentGateway, PaymentIntentRequest};
use crate::repositories::{CourseCatalog, PurchaseStore};
use crate::webhook::PaymentStatusUpdater;

/// Characters used in access codes; 0/O and 1/I are left out
const ACCESS_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
pub const ACCESS_CODE_LENGTH: usize = 10;
const ACCESS_CODE_ATTEMPTS: usize = 5;

const DEFAULT_PAGE_SIZE: u32 = 20;
const MAX_PAGE_SIZE: u32 = 100;

/// Random access code, 50 bits of entropy
pub fn generate_access_code() -> String {
    let mut rng = rand::thread_rng();
    (0..ACCESS_CODE_LENGTH)
        .map(|_| ACCESS_CODE_ALPHABET[rng.gen_range(0..ACCESS_CODE_ALPHABET.len())] as char)
        .collect()
}

/// Canonical form of a user-typed access code, or `None` if it cannot be one
pub fn normalize_access_code(code: &str) -> Option<String> {
    let code = code.trim().to_ascii_uppercase();
    let well_formed = code.len() == ACCESS_CODE_LENGTH
        && code.bytes().all(|b| ACCESS_CODE_ALPHABET.contains(&b));
    well_formed.then_some(code)
}

/// Parse an identifier from a path or body field
pub fn parse_id(value: &str, field: &str) -> ApiResult<Uuid> {
    Uuid::parse_str(value.trim())
        .map_err(|_| ApiError::Validation(format!("{field} must be a valid identifier")))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Orchestrates the guest purchase lifecycle
pub struct PurchaseService {
    purchases: Arc<dyn PurchaseStore>,
    catalog: Arc<dyn CourseCatalog>,
    gateway: Arc<dyn PaymentGateway>,
    issuer: CredentialIssuer,
    notifier: Arc<dyn Notifier>,
    config: PurchaseConfig,
}

impl PurchaseService {
    pub fn new(
        purchases: Arc<dyn PurchaseStore>,
        catalog: Arc<dyn CourseCatalog>,
        gateway: Arc<dyn PaymentGateway>,
        issuer: CredentialIssuer,
        notifier: Arc<dyn Notifier>,
        config: PurchaseConfig,
    ) -> Self {
        Self {
            purchases,
            catalog,
            gateway,
            issuer,
            notifier,
            config,
        }
    }

    pub fn config(&self) -> &PurchaseConfig {
        &self.config
    }

    /// Validate the buyer's details and record a PENDING purchase
    pub async fn create_purchase(&self, request: CreatePurchaseRequest) -> ApiResult<Purchase> {
        let course_id = parse_id(&request.course_id, "courseId")?;

        let customer_name = request.customer_name.trim().to_string();
        validate_person_name(&customer_name).map_err(ApiError::Validation)?;

        let customer_email = normalize_email(&request.customer_email);
        validate_email(&customer_email).map_err(ApiError::Validation)?;

        let customer_phone = non_empty(request.customer_phone);
        if let Some(phone) = &customer_phone {
            validate_phone(phone).map_err(ApiError::Validation)?;
        }

        let course = self
            .catalog
            .find_course(course_id)
            .await?
            .ok_or_else(|| ApiError::NotFound("Course not found".to_string()))?;
        if !course.is_published {
            return Err(ApiError::Validation(
                "Course is not available for purchase".to_string(),
            ));
        }

        let mut new_purchase = NewPurchase {
            id: Uuid::new_v4(),
            course_id,
            customer_name,
            customer_email,
            customer_phone,
            access_code: String::new(),
        };

        for attempt in 1..=ACCESS_CODE_ATTEMPTS {
            new_purchase.access_code = generate_access_code();
            match self.purchases.insert(&new_purchase).await {
                Ok(purchase) => {
                    info!(
                        purchase_id = %purchase.id,
                        %course_id,
                        email = %purchase.customer_email,
                        "Guest purchase created"
                    );
                    return Ok(purchase);
                }
                Err(e) if e.is_unique_violation() => {
                    warn!(attempt, "Access code collision, regenerating");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(ApiError::Duplicate(
            "Could not allocate a unique access code".to_string(),
        ))
    }

    /// Open a provider payment intent for the course price
    pub async fn create_payment_intent(
        &self,
        request: CreatePaymentIntentRequest,
    ) -> ApiResult<PaymentIntentResponse> {
        let purchase_id = parse_id(&request.purchase_id, "purchaseId")?;
        let purchase = self.get_purchase(purchase_id).await?;

        let status = purchase.payment_status;
        if status == PaymentStatus::Paid || !status.can_transition_to(PaymentStatus::Paid) {
            return Err(ApiError::Validation(format!(
                "Purchase is already {}",
                purchase.payment_status
            )));
        }

        let course = self.course_for(&purchase).await?;
        let amount = course
            .price_in_minor_units()
            .ok_or_else(|| ApiError::Validation("Course price is out of range".to_string()))?;

        let intent = self
            .gateway
            .create_payment_intent(&PaymentIntentRequest {
                amount,
                currency: course.currency.to_lowercase(),
                purchase_id,
                course_id: course.id,
                receipt_email: purchase.customer_email.clone(),
                description: course.title.clone(),
            })
            .await?;

        info!(%purchase_id, intent_id = %intent.id, amount, "Payment intent created");
        Ok(PaymentIntentResponse {
            client_secret: intent.client_secret,
            payment_intent_id: intent.id,
            amount: intent.amount,
            currency: intent.currency,
        })
    }

    /// Apply a status write and run its side effects.
    ///
    /// Writes not allowed from the current status fail with
    /// [`ApiError::InvalidTransition`] and leave the purchase untouched.
    pub async fn update_payment_status(
        &self,
        purchase_id: Uuid,
        change: StatusChange,
    ) -> ApiResult<Purchase> {
        let change = StatusChange {
            to: change.to,
            payment_method: non_empty(change.payment_method),
            transaction_id: non_empty(change.transaction_id),
        };

        let (purchase, previous) = match self
            .purchases
            .transition_status(purchase_id, &change)
            .await?
        {
            TransitionOutcome::Applied { purchase, previous } => (purchase, previous),
            TransitionOutcome::Rejected { current } => {
                warn!(
                    %purchase_id,
                    from = %current.payment_status,
                    to = %change.to,
                    "Payment status change rejected"
                );
                return Err(ApiError::InvalidTransition {
                    from: current.payment_status,
                    to: change.to,
                });
            }
            TransitionOutcome::NotFound => {
                return Err(ApiError::NotFound("Purchase not found".to_string()));
            }
        };

        if previous != purchase.payment_status {
            info!(%purchase_id, from = %previous, to = %purchase.payment_status, "Payment status changed");
        }

        match purchase.payment_status {
            PaymentStatus::Paid if purchase.fulfilled_at.is_none() => {
                Ok(self.fulfill(purchase_id).await?.unwrap_or(purchase))
            }
            PaymentStatus::Refunded if previous == PaymentStatus::Paid => {
                self.revoke_access(&purchase).await?;
                Ok(purchase)
            }
            _ => Ok(purchase),
        }
    }

    /// Fulfill a PAID purchase if no other worker is doing it.
    ///
    /// Returns `None` when the purchase is already fulfilled or claimed.
    async fn fulfill(&self, purchase_id: Uuid) -> ApiResult<Option<Purchase>> {
        let Some(claimed) = self
            .purchases
            .claim_fulfillment(purchase_id, self.config.fulfillment_lease)
            .await?
        else {
            debug!(%purchase_id, "Fulfillment already done or in progress");
            return Ok(None);
        };

        match self.provision(&claimed).await {
            Ok((fulfilled, course, issued)) => {
                self.send_fulfillment_emails(&fulfilled, &course, &issued)
                    .await;
                Ok(Some(fulfilled))
            }
            Err(e) => {
                error!(%purchase_id, "Fulfillment failed: {}", e);
                if let Err(release_err) = self.purchases.release_fulfillment(purchase_id).await {
                    error!(%purchase_id, "Failed to release fulfillment lease: {}", release_err);
                }
                Err(e)
            }
        }
    }

    async fn provision(
        &self,
        purchase: &Purchase,
    ) -> ApiResult<(Purchase, Course, IssuedCredentials)> {
        let course = self.course_for(purchase).await?;
        let mut issued = self
            .issuer
            .find_or_create_user_for_purchase(&purchase.customer_email, &purchase.customer_name)
            .await?;

        if issued.plaintext_password.is_some() {
            self.purchases
                .record_created_account(purchase.id, issued.user_id)
                .await?;
        } else if purchase.credentials_pending && purchase.user_id == Some(issued.user_id) {
            // An earlier attempt created the account and lost its password
            info!(purchase_id = %purchase.id, "Reissuing credentials from an interrupted fulfillment");
            issued = self
                .issuer
                .reissue_credentials(&purchase.customer_email)
                .await?;
        }

        self.catalog
            .grant_enrollment(issued.user_id, purchase.course_id)
            .await?;
        let fulfilled = self
            .purchases
            .complete_fulfillment(purchase.id, issued.user_id)
            .await?;
        Ok((fulfilled, course, issued))
    }

    async fn send_fulfillment_emails(
        &self,
        purchase: &Purchase,
        course: &Course,
        issued: &IssuedCredentials,
    ) {
        let timeout = self.config.mail_timeout;

        let confirmation = templates::purchase_confirmation(
            &purchase.customer_email,
            &purchase.customer_name,
            &course.title,
            &purchase.access_code,
        );
        send_best_effort(self.notifier.as_ref(), &confirmation, timeout).await;

        if let Some(password) = &issued.plaintext_password {
            let credentials = templates::credentials(
                &issued.email,
                &purchase.customer_name,
                password,
                &self.config.login_url,
            );
            send_best_effort(self.notifier.as_ref(), &credentials, timeout).await;
        }

        if let Some(inbox) = &self.config.sales_notification_email {
            let sale = templates::sale_notification(
                inbox,
                &course.title,
                &purchase.customer_name,
                &purchase.customer_email,
            );
            send_best_effort(self.notifier.as_ref(), &sale, timeout).await;
        }
    }

    async fn revoke_access(&self, purchase: &Purchase) -> ApiResult<()> {
        let Some(user_id) = purchase.user_id else {
            return Ok(());
        };
        let still_owned = self
            .purchases
            .has_other_paid_purchase(user_id, purchase.course_id, purchase.id)
            .await?;
        if still_owned {
            info!(purchase_id = %purchase.id, "Refund leaves access granted by another purchase");
            return Ok(());
        }
        self.catalog
            .revoke_enrollment(user_id, purchase.course_id)
            .await?;
        Ok(())
    }

    async fn course_for(&self, purchase: &Purchase) -> ApiResult<Course> {
        self.catalog
            .find_course(purchase.course_id)
            .await?
            .ok_or_else(|| ApiError::NotFound("Course not found".to_string()))
    }

    /// Look up a purchase by access code; unknown codes yield `None`
    pub async fn get_purchase_by_access_code(&self, code: &str) -> ApiResult<Option<Purchase>> {
        let Some(code) = normalize_access_code(code) else {
            return Ok(None);
        };
        Ok(self.purchases.find_by_access_code(&code).await?)
    }

    /// Purchase and course unlocked by an access code
    pub async fn get_access(&self, code: &str) -> ApiResult<Option<PurchaseAccess>> {
        let Some(purchase) = self.get_purchase_by_access_code(code).await? else {
            return Ok(None);
        };
        let course = self
            .catalog
            .find_course(purchase.course_id)
            .await?
            .as_ref()
            .map(CourseSummary::from);
        let has_access = purchase.payment_status == PaymentStatus::Paid;
        Ok(Some(PurchaseAccess {
            purchase,
            course,
            has_access,
        }))
    }

    pub async fn get_purchase(&self, purchase_id: Uuid) -> ApiResult<Purchase> {
        self.purchases
            .find_by_id(purchase_id)
            .await?
            .ok_or_else(|| ApiError::NotFound("Purchase not found".to_string()))
    }

    /// Purchases made with `email`; callers may only list their own unless admin
    pub async fn list_purchases_for_email(
        &self,
        caller: &Claims,
        email: &str,
    ) -> ApiResult<Vec<Purchase>> {
        let email = normalize_email(email);
        if !caller.is_admin() && normalize_email(&caller.email) != email {
            return Err(ApiError::Forbidden(
                "You can only view your own purchases".to_string(),
            ));
        }
        Ok(self.purchases.list_by_email(&email).await?)
    }

    /// Paid courses bought with the caller's email
    pub async fn my_purchased_courses(&self, caller: &Claims) -> ApiResult<Vec<PurchasedCourse>> {
        let purchases = self
            .purchases
            .list_by_email(&normalize_email(&caller.email))
            .await?;

        let mut titles: HashMap<Uuid, Option<String>> = HashMap::new();
        let mut courses = Vec::new();
        for purchase in purchases
            .into_iter()
            .filter(|p| p.payment_status == PaymentStatus::Paid)
        {
            let title = match titles.get(&purchase.course_id) {
                Some(title) => title.clone(),
                None => {
                    let title = self
                        .catalog
                        .find_course(purchase.course_id)
                        .await?
                        .map(|c| c.title);
                    titles.insert(purchase.course_id, title.clone());
                    title
                }
            };
            let Some(course_title) = title else {
                warn!(purchase_id = %purchase.id, "Paid purchase references a missing course");
                continue;
            };
            courses.push(PurchasedCourse {
                purchase_id: purchase.id,
                course_id: purchase.course_id,
                course_title,
                access_code: purchase.access_code,
                purchased_at: purchase.created_at,
            });
        }
        Ok(courses)
    }

    pub async fn list_purchases(&self, query: ListPurchasesQuery) -> ApiResult<PurchaseListResponse> {
        let page = query.page.unwrap_or(1).max(1);
        let limit = query
            .limit
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE);
        let status = match non_empty(query.status) {
            Some(status) => Some(status.to_ascii_uppercase().parse::<PaymentStatus>()?),
            None => None,
        };

        let filter = PurchaseFilter {
            status,
            limit: i64::from(limit),
            offset: i64::from(page - 1) * i64::from(limit),
        };
        let (items, total) = self.purchases.list(&filter).await?;

        Ok(PurchaseListResponse {
            items,
            page,
            limit,
            total,
        })
    }

    pub async fn stats(&self) -> ApiResult<PurchaseStats> {
        Ok(self.purchases.stats().await?)
    }

    pub async fn delete_purchase(&self, purchase_id: Uuid) -> ApiResult<()> {
        if !self.purchases.delete(purchase_id).await? {
            return Err(ApiError::NotFound("Purchase not found".to_string()));
        }
        info!(%purchase_id, "Purchase deleted");
        Ok(())
    }

    /// Generate a new password for the buyer's account and email it
    pub async fn resend_credentials(
        &self,
        purchase_id: Uuid,
    ) -> ApiResult<ResendCredentialsResponse> {
        let purchase = self.get_purchase(purchase_id).await?;
        if purchase.payment_status != PaymentStatus::Paid {
            return Err(ApiError::Validation(
                "Credentials can only be sent for paid purchases".to_string(),
            ));
        }

        let issued = self
            .issuer
            .reissue_credentials(&purchase.customer_email)
            .await?;
        let Some(password) = issued.plaintext_password.as_deref() else {
            return Err(ApiError::Internal(
                "reissued credentials carry no password".to_string(),
            ));
        };

        let message = templates::credentials(
            &issued.email,
            &purchase.customer_name,
            password,
            &self.config.login_url,
        );
        let email_sent =
            send_best_effort(self.notifier.as_ref(), &message, self.config.mail_timeout).await;

        Ok(ResendCredentialsResponse {
            email: issued.email,
            email_sent,
        })
    }

    /// Pull the intent status from the provider and apply it.
    ///
    /// Intents still in flight leave the purchase unchanged, as do stale
    /// results the transition table rejects.
    pub async fn sync_payment_status(
        &self,
        purchase_id: Uuid,
        request: SyncPaymentRequest,
    ) -> ApiResult<Purchase> {
        let purchase = self.get_purchase(purchase_id).await?;
        let intent = self
            .gateway
            .retrieve_payment_intent(request.payment_intent_id.trim())
            .await?;

        if intent.purchase_id() != Some(purchase_id.to_string().as_str()) {
            return Err(ApiError::Validation(
                "Payment intent does not belong to this purchase".to_string(),
            ));
        }

        let Some(status) = intent.settled_status() else {
            debug!(%purchase_id, intent_id = %intent.id, "Payment intent not settled yet");
            return Ok(purchase);
        };

        let change = StatusChange {
            to: status,
            payment_method: Some(self.gateway.provider_name().to_string()),
            transaction_id: Some(intent.id),
        };
        match self.update_payment_status(purchase_id, change).await {
            Err(ApiError::InvalidTransition { .. }) => self.get_purchase(purchase_id).await,
            other => other,
        }
    }

    /// Retry fulfillment of PAID purchases left unfulfilled.
    ///
    /// Returns the number of purchases fulfilled in this run.
    pub async fn reconcile_fulfillments(&self) -> ApiResult<usize> {
        let pending = self
            .purchases
            .list_unfulfilled_paid(
                self.config.fulfillment_lease,
                self.config.reconcile_batch_size,
            )
            .await?;

        let mut fulfilled = 0;
        for purchase in pending {
            match self.fulfill(purchase.id).await {
                Ok(Some(_)) => fulfilled += 1,
                Ok(None) => {}
                Err(e) => warn!(purchase_id = %purchase.id, "Reconciliation attempt failed: {}", e),
            }
        }

        if fulfilled > 0 {
            info!(fulfilled, "Reconciled unfulfilled purchases");
        }
        Ok(fulfilled)
    }
}

#[async_trait]
impl PaymentStatusUpdater for PurchaseService {
    async fn update_payment_status(
        &self,
        purchase_id: Uuid,
        change: StatusChange,
    ) -> ApiResult<Purchase> {
        PurchaseService::update_payment_status(self, purchase_id, change).await
    }
}
