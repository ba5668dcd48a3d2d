//! In-process account and session storage.
//!
//! The default backend for tests and single-process deployments; everything
//! lives in two maps behind one lock.

use std::collections::HashMap;

use parking_lot::RwLock;

use super::{unix_now, Account, SessionBackend, SessionRecord};

#[derive(Default)]
pub struct MemoryBackend {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    accounts: HashMap<String, Account>,
    sessions: HashMap<String, SessionRecord>,
}

impl SessionBackend for MemoryBackend {
    fn get_account(&self, user_id: &str) -> Option<Account> {
        self.inner.read().accounts.get(user_id).cloned()
    }

    fn store_account(&self, account: Account) {
        self.inner
            .write()
            .accounts
            .insert(account.user_id.clone(), account);
    }

    fn update_password(&self, user_id: &str, password_hash: &str) {
        if let Some(account) = self.inner.write().accounts.get_mut(user_id) {
            account.password_hash = password_hash.to_owned();
        }
    }

    fn load_session(&self, session_id: &str) -> Option<SessionRecord> {
        self.inner
            .read()
            .sessions
            .get(session_id)
            .filter(|record| record.expires > unix_now())
            .cloned()
    }

    fn store_session(&self, record: &SessionRecord) {
        self.inner
            .write()
            .sessions
            .insert(record.session_id.clone(), record.clone());
    }

    fn remove_session(&self, session_id: &str) {
        self.inner.write().sessions.remove(session_id);
    }

    fn remove_sessions_for(&self, user_id: &str) {
        self.inner
            .write()
            .sessions
            .retain(|_, record| record.user_id != user_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    #[test]
    fn expired_sessions_do_not_load() {
        let backend = MemoryBackend::default();
        let record = SessionRecord {
            session_id: "sid".into(),
            user_id: "u".into(),
            expires: unix_now() - 1.0,
            state: Map::new(),
            key: None,
        };
        backend.store_session(&record);
        assert!(backend.load_session("sid").is_none());
    }
}
