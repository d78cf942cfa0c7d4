//! Account provisioning for paid purchases

use common::{
    password::{generate_password, hash_password},
    users::{NewUser, User, UserRole, UserStore, split_full_name},
    validation::normalize_email,
};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};

/// Account resolved for a purchase
#[derive(Debug, Clone)]
pub struct IssuedCredentials {
    pub user_id: Uuid,
    pub email: String,
    pub role: UserRole,
    /// Present only when a new secret was generated in this call
    pub plaintext_password: Option<String>,
}

/// Finds or creates the login account behind a purchase email
#[derive(Clone)]
pub struct CredentialIssuer {
    users: Arc<dyn UserStore>,
}

impl CredentialIssuer {
    pub fn new(users: Arc<dyn UserStore>) -> Self {
        Self { users }
    }

    /// Resolve the account for `email`, creating a STUDENT account with a
    /// fresh password when none exists.
    ///
    /// Existing accounts keep their password. A GUEST account is upgraded to
    /// STUDENT; other roles are never changed.
    pub async fn find_or_create_user_for_purchase(
        &self,
        email: &str,
        full_name: &str,
    ) -> ApiResult<IssuedCredentials> {
        let email = normalize_email(email);

        if let Some(user) = self.users.find_by_email(&email).await? {
            let role = self.upgrade_guest(&user).await?;
            return Ok(IssuedCredentials {
                user_id: user.id,
                email: user.email,
                role,
                plaintext_password: None,
            });
        }

        let plaintext = generate_password();
        let password_hash = hash_in_background(plaintext.clone()).await?;
        let (first_name, last_name) = split_full_name(full_name);

        let new_user = NewUser {
            email: email.clone(),
            password_hash,
            first_name,
            last_name,
            role: UserRole::Student,
        };

        match self.users.insert(&new_user).await {
            Ok(user) => {
                info!(user_id = %user.id, "Created student account for purchase");
                Ok(IssuedCredentials {
                    user_id: user.id,
                    email: user.email,
                    role: user.role,
                    plaintext_password: Some(plaintext),
                })
            }
            Err(e) if e.is_unique_violation() => {
                // A concurrent purchase created the account first
                warn!("Account creation raced with another request; reusing existing account");
                let user = self.users.find_by_email(&email).await?.ok_or_else(|| {
                    ApiError::Internal("account vanished after unique violation".to_string())
                })?;
                let role = self.upgrade_guest(&user).await?;
                Ok(IssuedCredentials {
                    user_id: user.id,
                    email: user.email,
                    role,
                    plaintext_password: None,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Replace the password of an existing account and return the new one.
    pub async fn reissue_credentials(&self, email: &str) -> ApiResult<IssuedCredentials> {
        let email = normalize_email(email);
        let user = self
            .users
            .find_by_email(&email)
            .await?
            .ok_or_else(|| ApiError::NotFound("No account exists for this email".to_string()))?;

        let plaintext = generate_password();
        let password_hash = hash_in_background(plaintext.clone()).await?;
        self.users.update_password(user.id, &password_hash).await?;
        let role = self.upgrade_guest(&user).await?;

        info!(user_id = %user.id, "Credentials reissued");
        Ok(IssuedCredentials {
            user_id: user.id,
            email: user.email,
            role,
            plaintext_password: Some(plaintext),
        })
    }

    async fn upgrade_guest(&self, user: &User) -> ApiResult<UserRole> {
        if user.role != UserRole::Guest {
            return Ok(user.role);
        }
        self.users.update_role(user.id, UserRole::Student).await?;
        info!(user_id = %user.id, "Upgraded guest account to student");
        Ok(UserRole::Student)
    }
}

/// Hash on the blocking pool
async fn hash_in_background(plaintext: String) -> ApiResult<String> {
    tokio::task::spawn_blocking(move || hash_password(&plaintext))
        .await
        .map_err(|e| ApiError::Internal(format!("password hashing task failed: {e}")))?
        .map_err(|e| ApiError::Internal(format!("password hashing failed: {e}")))
}
