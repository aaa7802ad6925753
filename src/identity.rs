//! Identity provider abstraction and the local email/password implementation.
//!
//! The rest of the crate only ever reads identity: a [`User`] scopes every
//! storage path, and sign-in state changes are observed through
//! [`IdentityProvider::subscribe`] (a `tokio::sync::watch` channel standing in
//! for an `onAuthStateChanged` callback).
//!
//! [`LocalIdentityProvider`] keeps an email → user table with salted
//! SHA-256 password hashes, optionally persisted as JSON so accounts survive
//! restarts.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;
use tokio::sync::{watch, Mutex};

use crate::config::IdentityConfig;
use crate::error::AuthError;
use crate::models::{User, UserId};

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Register a new account and sign it in.
    async fn sign_up(&self, email: &str, password: &str) -> Result<User, AuthError>;

    async fn sign_in(&self, email: &str, password: &str) -> Result<User, AuthError>;

    async fn sign_out(&self) -> Result<(), AuthError>;

    fn current_user(&self) -> Option<User>;

    /// Receiver that yields the current user on every sign-in state change.
    fn subscribe(&self) -> watch::Receiver<Option<User>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UserRecord {
    uid: String,
    email: String,
    salt: String,
    password_hash: String,
}

impl UserRecord {
    fn to_user(&self) -> User {
        User {
            uid: UserId::new(self.uid.clone()),
            email: self.email.clone(),
        }
    }
}

pub struct LocalIdentityProvider {
    users: RwLock<HashMap<String, UserRecord>>,
    state: watch::Sender<Option<User>>,
    users_file: Option<PathBuf>,
    /// Held from snapshotting the table until the file is replaced.
    persist_lock: Mutex<()>,
    min_password_len: usize,
}

impl LocalIdentityProvider {
    /// In-memory provider with no persisted accounts.
    pub fn new(min_password_len: usize) -> Self {
        let (state, _) = watch::channel(None);
        Self {
            users: RwLock::new(HashMap::new()),
            state,
            users_file: None,
            persist_lock: Mutex::new(()),
            min_password_len,
        }
    }

    /// Provider backed by `identity.users_file` when configured.
    pub fn from_config(config: &IdentityConfig) -> anyhow::Result<Self> {
        let mut provider = Self::new(config.min_password_len);
        if let Some(ref path) = config.users_file {
            if path.exists() {
                let content = std::fs::read_to_string(path).map_err(|e| {
                    anyhow::anyhow!("Failed to read users file {}: {}", path.display(), e)
                })?;
                let records: Vec<UserRecord> = serde_json::from_str(&content).map_err(|e| {
                    anyhow::anyhow!("Failed to parse users file {}: {}", path.display(), e)
                })?;
                let users = records
                    .into_iter()
                    .map(|r| (normalize_email(&r.email), r))
                    .collect();
                provider.users = RwLock::new(users);
            }
            provider.users_file = Some(path.clone());
        }
        Ok(provider)
    }

    async fn persist(&self) -> Result<(), AuthError> {
        let Some(ref path) = self.users_file else {
            return Ok(());
        };
        let io_err = |e: std::io::Error| AuthError::Other(format!("{}: {}", path.display(), e));

        let _guard = self.persist_lock.lock().await;
        let json = {
            let users = self.users.read().unwrap();
            let mut records: Vec<&UserRecord> = users.values().collect();
            records.sort_by(|a, b| a.email.cmp(&b.email));
            serde_json::to_string_pretty(&records).map_err(|e| AuthError::Other(e.to_string()))?
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }

        let tmp = path.with_extension(format!("json.tmp-{}", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, json).await.map_err(io_err)?;
        if let Err(e) = tokio::fs::rename(&tmp, path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(io_err(e));
        }
        Ok(())
    }

    /// Register an account with a known uid without signing it in.
    ///
    /// Used to seed accounts; no password-strength check is applied.
    pub fn add_user(&self, uid: UserId, email: &str, password: &str) -> Result<User, AuthError> {
        if !is_valid_email(email) {
            return Err(AuthError::InvalidEmail);
        }
        self.insert(uid, email, password)
    }

    fn insert(&self, uid: UserId, email: &str, password: &str) -> Result<User, AuthError> {
        let key = normalize_email(email);
        let mut users = self.users.write().unwrap();
        if users.contains_key(&key) {
            return Err(AuthError::EmailInUse);
        }
        let salt = uuid::Uuid::new_v4().simple().to_string();
        let record = UserRecord {
            uid: uid.as_str().to_string(),
            email: email.trim().to_string(),
            password_hash: hash_password(&salt, password),
            salt,
        };
        users.insert(key, record.clone());
        Ok(record.to_user())
    }

    fn set_current(&self, user: Option<User>) {
        self.state.send_replace(user);
    }
}

#[async_trait]
impl IdentityProvider for LocalIdentityProvider {
    async fn sign_up(&self, email: &str, password: &str) -> Result<User, AuthError> {
        if !is_valid_email(email) {
            return Err(AuthError::InvalidEmail);
        }
        if password.chars().count() < self.min_password_len {
            return Err(AuthError::WeakPassword {
                min_len: self.min_password_len,
            });
        }

        let uid = UserId::new(uuid::Uuid::new_v4().simple().to_string());
        let user = self.insert(uid, email, password)?;
        self.persist().await?;

        tracing::info!(uid = %user.uid, "registered new user");
        self.set_current(Some(user.clone()));
        Ok(user)
    }

    async fn sign_in(&self, email: &str, password: &str) -> Result<User, AuthError> {
        if !is_valid_email(email) {
            return Err(AuthError::InvalidEmail);
        }
        let user = {
            let users = self.users.read().unwrap();
            let record = users
                .get(&normalize_email(email))
                .ok_or(AuthError::UserNotFound)?;
            if hash_password(&record.salt, password) != record.password_hash {
                return Err(AuthError::WrongPassword);
            }
            record.to_user()
        };
        tracing::info!(uid = %user.uid, "signed in");
        self.set_current(Some(user.clone()));
        Ok(user)
    }

    async fn sign_out(&self) -> Result<(), AuthError> {
        if self.state.borrow().is_none() {
            return Err(AuthError::NotSignedIn);
        }
        self.set_current(None);
        Ok(())
    }

    fn current_user(&self) -> Option<User> {
        self.state.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<Option<User>> {
        self.state.subscribe()
    }
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

fn is_valid_email(email: &str) -> bool {
    let email = email.trim();
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !email.contains(char::is_whitespace)
}

fn hash_password(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}
