//! Sessions and accounts.
//!
//! A [`SessionStore`] owns account records and server-held sessions. The
//! storage primitives live behind [`SessionBackend`] so database drivers can
//! be swapped without touching TTL, renewal or password logic; an attached
//! [`cache::SessionCache`] moves session persistence out of the backend
//! entirely (including the sealed-token variant, where the token itself is
//! the session).

pub mod cache;
pub mod file;
pub mod memory;

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use toto_lib::envelope::SessionInfo;
use toto_lib::error::{
    TotoError, ERROR_INVALID_USER_ID, ERROR_USER_ID_EXISTS, ERROR_USER_NOT_FOUND,
};

use crate::secret;
use cache::SessionCache;

pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock before epoch")
        .as_secs_f64()
}

/// A random 22 character URL-safe session id (16 bytes, unpadded base64).
pub fn generate_session_id() -> String {
    URL_SAFE_NO_PAD.encode(uuid::Uuid::new_v4().into_bytes())
}

/// One account row. Extra columns beyond the fixed pair flatten into
/// `properties`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub user_id: String,
    pub password_hash: String,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub properties: Map<String, Value>,
}

/// The full persisted state of one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub user_id: String,
    pub expires: f64,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub state: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl SessionRecord {
    pub fn is_anonymous(&self) -> bool {
        self.user_id.is_empty()
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.session_id.clone(),
            expires: self.expires,
            user_id: self.user_id.clone(),
        }
    }

    /// Sign `data` with this session's dedicated key.
    pub fn hmac(&self, data: &[u8]) -> Result<String, TotoError> {
        let key = self.key.as_deref().ok_or_else(TotoError::invalid_hmac)?;
        Ok(secret::sign(key.as_bytes(), data))
    }

    /// Verify a signature produced by [`SessionRecord::hmac`]. State may only
    /// be mutated on behalf of a caller that holds the signing key.
    pub fn verify(&self, mac: &str, data: &[u8]) -> Result<(), TotoError> {
        if mac.is_empty() || self.hmac(data)? != mac {
            return Err(TotoError::invalid_hmac());
        }
        Ok(())
    }
}

/// Session lifetime and renewal configuration, in seconds.
///
/// A renewal window of zero means "the full TTL", which renews the session
/// on every retrieval.
#[derive(Debug, Clone, Copy)]
pub struct SessionTtls {
    pub session_ttl: f64,
    pub anon_session_ttl: f64,
    pub session_renew: f64,
    pub anon_session_renew: f64,
}

impl Default for SessionTtls {
    fn default() -> Self {
        SessionTtls {
            session_ttl: 365.0 * 24.0 * 60.0 * 60.0,
            anon_session_ttl: 24.0 * 60.0 * 60.0,
            session_renew: 0.0,
            anon_session_renew: 0.0,
        }
    }
}

impl SessionTtls {
    fn ttl(&self, anonymous: bool) -> f64 {
        if anonymous {
            if self.anon_session_ttl > 0.0 {
                self.anon_session_ttl
            } else {
                self.session_ttl
            }
        } else {
            self.session_ttl
        }
    }

    fn renew_window(&self, anonymous: bool) -> f64 {
        let window = if anonymous {
            self.anon_session_renew
        } else {
            self.session_renew
        };
        if window > 0.0 {
            window
        } else {
            self.ttl(anonymous)
        }
    }
}

/// Storage primitives a concrete session/account database must provide.
///
/// `load_session` must not return expired records; everything above that
/// (renewal, caching, password verification) is handled by [`SessionStore`].
pub trait SessionBackend: Send + Sync {
    fn get_account(&self, user_id: &str) -> Option<Account>;
    fn store_account(&self, account: Account);
    fn update_password(&self, user_id: &str, password_hash: &str);
    fn load_session(&self, session_id: &str) -> Option<SessionRecord>;
    fn store_session(&self, record: &SessionRecord);
    fn remove_session(&self, session_id: &str);
    fn remove_sessions_for(&self, user_id: &str);
}

pub struct SessionStore {
    backend: Box<dyn SessionBackend>,
    cache: Option<Arc<dyn SessionCache>>,
    ttls: SessionTtls,
}

impl SessionStore {
    pub fn new(backend: impl SessionBackend + 'static, ttls: SessionTtls) -> Self {
        SessionStore {
            backend: Box::new(backend),
            cache: None,
            ttls,
        }
    }

    /// Attach a cache that takes over session persistence from the backend.
    pub fn with_cache(mut self, cache: Arc<dyn SessionCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn create_account(
        &self,
        user_id: &str,
        password: &str,
        properties: Map<String, Value>,
    ) -> Result<(), TotoError> {
        if user_id.is_empty() {
            return Err(TotoError::new(ERROR_INVALID_USER_ID, "Invalid user ID."));
        }
        let user_id = user_id.to_lowercase();
        if self.backend.get_account(&user_id).is_some() {
            return Err(TotoError::new(
                ERROR_USER_ID_EXISTS,
                "User ID already in use.",
            ));
        }
        self.backend.store_account(Account {
            user_id,
            password_hash: secret::password_hash(password)?,
            properties,
        });
        Ok(())
    }

    /// Create a session, anonymous when `user_id` is empty. Password
    /// verification can be skipped for alternative authentication flows.
    pub fn create_session(
        &self,
        user_id: Option<&str>,
        password: Option<&str>,
        verify_password: bool,
        key: Option<String>,
    ) -> Result<SessionRecord, TotoError> {
        let user_id = user_id.unwrap_or_default().to_lowercase();
        if !user_id.is_empty() {
            let account = self.backend.get_account(&user_id);
            let verified = account.as_ref().is_some_and(|account| {
                !verify_password
                    || secret::verify_password(password.unwrap_or_default(), &account.password_hash)
            });
            if !verified {
                return Err(TotoError::user_not_found());
            }
        }
        let anonymous = user_id.is_empty();
        let mut record = SessionRecord {
            session_id: generate_session_id(),
            user_id,
            expires: unix_now() + self.ttls.ttl(anonymous),
            state: Map::new(),
            key,
        };
        self.persist(&mut record)?;
        Ok(record)
    }

    /// Load a live session, sliding `expires` forward when it has entered
    /// the renewal window. Missing and expired sessions are both `None`.
    pub fn retrieve_session(&self, session_id: &str) -> Result<Option<SessionRecord>, TotoError> {
        let loaded = match &self.cache {
            Some(cache) => cache.load_session(session_id)?,
            None => self.backend.load_session(session_id),
        };
        let Some(mut record) = loaded else {
            return Ok(None);
        };
        if record.expires <= unix_now() {
            return Ok(None);
        }
        let renewed = unix_now() + self.ttls.renew_window(record.is_anonymous());
        if record.expires < renewed {
            record.expires = renewed;
            self.persist(&mut record)?;
        }
        Ok(Some(record))
    }

    /// Persist session state mutated by a method.
    pub fn save_session(&self, record: &mut SessionRecord) -> Result<(), TotoError> {
        self.persist(record)
    }

    pub fn remove_session(&self, session_id: &str) {
        match &self.cache {
            Some(cache) => cache.remove_session(session_id),
            None => self.backend.remove_session(session_id),
        }
    }

    /// Invalidate every session belonging to `user_id`. Sessions held by a
    /// cache cannot be enumerated and are left to expire.
    pub fn clear_sessions(&self, user_id: &str) {
        self.backend.remove_sessions_for(&user_id.to_lowercase());
    }

    pub fn change_password(
        &self,
        user_id: &str,
        password: &str,
        new_password: &str,
    ) -> Result<(), TotoError> {
        let user_id = user_id.to_lowercase();
        let account = self
            .backend
            .get_account(&user_id)
            .filter(|account| secret::verify_password(password, &account.password_hash))
            .ok_or_else(TotoError::user_not_found)?;
        self.backend
            .update_password(&account.user_id, &secret::password_hash(new_password)?);
        self.clear_sessions(&user_id);
        Ok(())
    }

    /// Replace the account's password with a generated one and return it.
    pub fn generate_password(&self, user_id: &str) -> Result<String, TotoError> {
        let user_id = user_id.to_lowercase();
        if self.backend.get_account(&user_id).is_none() {
            return Err(TotoError::new(ERROR_USER_NOT_FOUND, "Invalid user ID"));
        }
        let new_password = secret::generate_password();
        self.backend
            .update_password(&user_id, &secret::password_hash(&new_password)?);
        Ok(new_password)
    }

    pub fn get_account(&self, user_id: &str) -> Option<Account> {
        self.backend.get_account(&user_id.to_lowercase())
    }

    fn persist(&self, record: &mut SessionRecord) -> Result<(), TotoError> {
        match &self.cache {
            Some(cache) => {
                // A cache may rewrite the id (the sealed-token cache always
                // does: the token is the session).
                if let Some(new_id) = cache.store_session(record)? {
                    record.session_id = new_id;
                }
            }
            None => self.backend.store_session(record),
        }
        Ok(())
    }
}
