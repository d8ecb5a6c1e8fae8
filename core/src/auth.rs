/// Auth provider interface and the bundled local credential store
use crate::error::{ChatError, Result};
use crate::store::ChatStore;
use crate::types::{Presence, UserProfile};
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;
use uuid::Uuid;

const AUTH_CHANNEL_CAPACITY: usize = 16;

/// Sign-in credentials.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

/// Registration form data.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub firstname: String,
    pub lastname: String,
    pub email: String,
    pub password: String,
}

/// Identity of a signed-in user as issued by the auth provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    pub user_id: String,
    pub email: String,
    pub firstname: String,
    pub lastname: String,
}

/// `Some(identity)` after sign-in, `None` after sign-out.
pub type AuthState = Option<UserIdentity>;

pub trait AuthProvider: Send + Sync {
    fn sign_up(&self, new_user: NewUser) -> Result<UserIdentity>;
    fn sign_in(&self, credentials: &Credentials) -> Result<UserIdentity>;
    fn sign_out(&self, user_id: &str) -> Result<()>;
    /// Auth-state change notifications.
    fn subscribe(&self) -> broadcast::Receiver<AuthState>;
}

#[derive(Debug, Serialize, Deserialize)]
struct AccountRecordV1 {
    version: u8,
    user_id: String,
    email: String,
    firstname: String,
    lastname: String,
    salt_b64: String,
    password_digest_b64: String,
    created_at: DateTime<Utc>,
}

/// Credential store backed by a sled tree, keyed by email. Registration
/// also places the user's profile into the chat store so the directory
/// sees them immediately.
pub struct LocalAuthProvider {
    accounts: sled::Tree,
    store: Arc<dyn ChatStore>,
    state: broadcast::Sender<AuthState>,
}

impl LocalAuthProvider {
    pub fn open(data_dir: &Path, store: Arc<dyn ChatStore>) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .map_err(|e| ChatError::Storage(format!("create data dir: {}", e)))?;
        let db = sled::open(data_dir.join("accounts.db"))
            .map_err(|e| ChatError::Storage(format!("open accounts DB: {}", e)))?;
        Self::from_db(db, store)
    }

    /// Throwaway credential store (backing files removed on drop).
    pub fn temporary(store: Arc<dyn ChatStore>) -> Result<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| ChatError::Storage(format!("open temporary accounts DB: {}", e)))?;
        Self::from_db(db, store)
    }

    fn from_db(db: sled::Db, store: Arc<dyn ChatStore>) -> Result<Self> {
        let accounts = db
            .open_tree("accounts")
            .map_err(|e| ChatError::Storage(format!("open tree accounts: {}", e)))?;
        let (state, _) = broadcast::channel(AUTH_CHANNEL_CAPACITY);
        Ok(Self {
            accounts,
            store,
            state,
        })
    }

    fn get_account(&self, email: &str) -> Result<Option<AccountRecordV1>> {
        match self
            .accounts
            .get(email.as_bytes())
            .map_err(|e| ChatError::Storage(format!("get account: {}", e)))?
        {
            Some(raw) => {
                let record: AccountRecordV1 = serde_json::from_slice(&raw)?;
                if record.version != 1 {
                    return Err(ChatError::Auth(format!(
                        "unsupported account record version: {}",
                        record.version
                    )));
                }
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }
}

fn digest_password(salt: &[u8], password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    general_purpose::STANDARD.encode(hasher.finalize())
}

fn identity_of(record: &AccountRecordV1) -> UserIdentity {
    UserIdentity {
        user_id: record.user_id.clone(),
        email: record.email.clone(),
        firstname: record.firstname.clone(),
        lastname: record.lastname.clone(),
    }
}

impl AuthProvider for LocalAuthProvider {
    fn sign_up(&self, new_user: NewUser) -> Result<UserIdentity> {
        if new_user.email.trim().is_empty() {
            return Err(ChatError::InvalidInput("email is required".to_string()));
        }
        if new_user.password.is_empty() {
            return Err(ChatError::InvalidInput("password is required".to_string()));
        }

        let salt: [u8; 16] = rand::thread_rng().gen();
        let now = Utc::now();
        let record = AccountRecordV1 {
            version: 1,
            user_id: Uuid::new_v4().to_string(),
            email: new_user.email.clone(),
            firstname: new_user.firstname.clone(),
            lastname: new_user.lastname.clone(),
            salt_b64: general_purpose::STANDARD.encode(salt),
            password_digest_b64: digest_password(&salt, &new_user.password),
            created_at: now,
        };
        let encoded = serde_json::to_vec(&record)?;

        // The email key is the unique constraint; a concurrent duplicate
        // registration loses the swap
        let created = self
            .accounts
            .compare_and_swap(
                new_user.email.as_bytes(),
                None as Option<&[u8]>,
                Some(encoded),
            )
            .map_err(|e| ChatError::Storage(format!("create account: {}", e)))?;
        if created.is_err() {
            return Err(ChatError::Auth(format!(
                "an account already exists for {}",
                new_user.email
            )));
        }

        self.store.upsert_user(&UserProfile {
            user_id: record.user_id.clone(),
            firstname: record.firstname.clone(),
            lastname: record.lastname.clone(),
            email: record.email.clone(),
            presence: Presence::Offline,
            last_seen: now,
            created_at: now,
        })?;

        info!("Registered {}", record.email);
        Ok(identity_of(&record))
    }

    fn sign_in(&self, credentials: &Credentials) -> Result<UserIdentity> {
        let record = self
            .get_account(&credentials.email)?
            .ok_or_else(|| ChatError::Auth("unknown email or wrong password".to_string()))?;

        let salt = general_purpose::STANDARD
            .decode(&record.salt_b64)
            .map_err(|e| ChatError::Auth(format!("corrupt account record: {}", e)))?;
        if digest_password(&salt, &credentials.password) != record.password_digest_b64 {
            return Err(ChatError::Auth(
                "unknown email or wrong password".to_string(),
            ));
        }

        let identity = identity_of(&record);
        info!("Signed in {}", identity.email);
        let _ = self.state.send(Some(identity.clone()));
        Ok(identity)
    }

    fn sign_out(&self, user_id: &str) -> Result<()> {
        info!("Signed out {}", user_id);
        let _ = self.state.send(None);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<AuthState> {
        self.state.subscribe()
    }
}
