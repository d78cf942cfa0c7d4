//! Test doubles shared across the workspace

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use uuid::Uuid;

use crate::error::{DatabaseError, DatabaseResult};
use crate::jwt::{JwtConfig, JwtService};
use crate::users::{NewUser, User, UserRole, UserStore};

pub const TEST_JWT_PRIVATE_KEY: &str = include_str!("../testdata/jwt_test_private.pem");
pub const TEST_JWT_PUBLIC_KEY: &str = include_str!("../testdata/jwt_test_public.pem");

/// A signing JWT service over the fixed test key pair
pub fn test_jwt_service() -> JwtService {
    JwtService::new(JwtConfig {
        private_key: Some(TEST_JWT_PRIVATE_KEY.to_string()),
        public_key: TEST_JWT_PUBLIC_KEY.to_string(),
        access_token_expiry: 900,
        refresh_token_expiry: 604_800,
    })
    .expect("test keys are valid")
}

/// In-memory [`UserStore`] enforcing the unique email constraint
#[derive(Default)]
pub struct InMemoryUserStore {
    users: Mutex<Vec<User>>,
    inserts: AtomicUsize,
    lose_next_insert_race: AtomicBool,
}

impl InMemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an account directly, bypassing `insert` accounting
    pub fn seed(&self, email: &str, password_hash: &str, role: UserRole) -> User {
        let user = User {
            id: Uuid::new_v4(),
            email: email.to_string(),
            password_hash: password_hash.to_string(),
            first_name: "Seeded".to_string(),
            last_name: "User".to_string(),
            role,
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        self.users.lock().unwrap().push(user.clone());
        user
    }

    /// Make the next `insert` behave as if a concurrent request created the
    /// same email first: the row is stored by "the other request" and the
    /// call fails with a unique violation.
    pub fn lose_next_insert_race(&self) {
        self.lose_next_insert_race.store(true, Ordering::SeqCst);
    }

    pub fn deactivate(&self, id: Uuid) {
        if let Some(user) = self.users.lock().unwrap().iter_mut().find(|u| u.id == id) {
            user.is_active = false;
        }
    }

    /// Number of rows created through `insert`
    pub fn insert_count(&self) -> usize {
        self.inserts.load(Ordering::SeqCst)
    }

    pub fn all(&self) -> Vec<User> {
        self.users.lock().unwrap().clone()
    }
}

#[async_trait]
impl UserStore for InMemoryUserStore {
    async fn find_by_email(&self, email: &str) -> DatabaseResult<Option<User>> {
        Ok(self
            .users
            .lock()
            .unwrap()
            .iter()
            .find(|u| u.email == email)
            .cloned())
    }

    async fn find_by_id(&self, id: Uuid) -> DatabaseResult<Option<User>> {
        Ok(self
            .users
            .lock()
            .unwrap()
            .iter()
            .find(|u| u.id == id)
            .cloned())
    }

    async fn insert(&self, new_user: &NewUser) -> DatabaseResult<User> {
        let mut users = self.users.lock().unwrap();
        let user = User {
            id: Uuid::new_v4(),
            email: new_user.email.clone(),
            password_hash: new_user.password_hash.clone(),
            first_name: new_user.first_name.clone(),
            last_name: new_user.last_name.clone(),
            role: new_user.role,
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        if self.lose_next_insert_race.swap(false, Ordering::SeqCst) {
            users.push(user);
            self.inserts.fetch_add(1, Ordering::SeqCst);
            return Err(DatabaseError::UniqueViolation {
                constraint: "users_email_key".to_string(),
            });
        }

        if users.iter().any(|u| u.email == new_user.email) {
            return Err(DatabaseError::UniqueViolation {
                constraint: "users_email_key".to_string(),
            });
        }

        users.push(user.clone());
        self.inserts.fetch_add(1, Ordering::SeqCst);
        Ok(user)
    }

    async fn update_password(&self, id: Uuid, password_hash: &str) -> DatabaseResult<()> {
        if let Some(user) = self.users.lock().unwrap().iter_mut().find(|u| u.id == id) {
            user.password_hash = password_hash.to_string();
            user.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn update_role(&self, id: Uuid, role: UserRole) -> DatabaseResult<()> {
        if let Some(user) = self.users.lock().unwrap().iter_mut().find(|u| u.id == id) {
            user.role = role;
            user.updated_at = Utc::now();
        }
        Ok(())
    }
}
