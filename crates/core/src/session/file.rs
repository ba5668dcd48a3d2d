//! JSON-file backed account and session storage.
//!
//! Suitable for development and small single-node deployments: state loads
//! once at open and every mutation rewrites the file.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::{unix_now, Account, SessionBackend, SessionRecord};

pub struct FileBackend {
    path: PathBuf,
    inner: Mutex<Inner>,
}

#[derive(Default, Serialize, Deserialize)]
struct Inner {
    accounts: HashMap<String, Account>,
    sessions: HashMap<String, SessionRecord>,
}

impl FileBackend {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_owned();
        let inner = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Inner::default(),
            Err(e) => return Err(e),
        };
        Ok(FileBackend {
            path,
            inner: Mutex::new(inner),
        })
    }

    fn flush(&self, inner: &Inner) {
        let bytes = match serde_json::to_vec_pretty(inner) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error!("failed to serialize session db: {e}");
                return;
            }
        };
        // Write-then-rename keeps a crash from truncating the database.
        let tmp = self.path.with_extension("tmp");
        if let Err(e) = std::fs::write(&tmp, bytes).and_then(|()| std::fs::rename(&tmp, &self.path))
        {
            log::error!("failed to write session db {}: {e}", self.path.display());
        }
    }
}

impl SessionBackend for FileBackend {
    fn get_account(&self, user_id: &str) -> Option<Account> {
        self.inner.lock().accounts.get(user_id).cloned()
    }

    fn store_account(&self, account: Account) {
        let mut inner = self.inner.lock();
        inner.accounts.insert(account.user_id.clone(), account);
        self.flush(&inner);
    }

    fn update_password(&self, user_id: &str, password_hash: &str) {
        let mut inner = self.inner.lock();
        if let Some(account) = inner.accounts.get_mut(user_id) {
            account.password_hash = password_hash.to_owned();
        }
        self.flush(&inner);
    }

    fn load_session(&self, session_id: &str) -> Option<SessionRecord> {
        self.inner
            .lock()
            .sessions
            .get(session_id)
            .filter(|record| record.expires > unix_now())
            .cloned()
    }

    fn store_session(&self, record: &SessionRecord) {
        let mut inner = self.inner.lock();
        inner
            .sessions
            .insert(record.session_id.clone(), record.clone());
        self.flush(&inner);
    }

    fn remove_session(&self, session_id: &str) {
        let mut inner = self.inner.lock();
        inner.sessions.remove(session_id);
        self.flush(&inner);
    }

    fn remove_sessions_for(&self, user_id: &str) {
        let mut inner = self.inner.lock();
        inner.sessions.retain(|_, record| record.user_id != user_id);
        self.flush(&inner);
    }
}
