//! Session caches: storage fronts that take over session persistence.
//!
//! Two variants ship. [`MemorySessionCache`] keeps serialized records keyed
//! by id with a TTL, the shape a remote KV cache (redis, memcached) takes
//! behind the same trait. [`ClientCache`] keeps no server state at all: the
//! encrypted, MAC-sealed session payload *is* the session id handed to the
//! client.

use std::collections::HashMap;

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use parking_lot::Mutex;
use rand::RngCore;
use subtle::ConstantTimeEq;

use toto_lib::error::{TotoError, ERROR_INVALID_SESSION_ID};
use toto_lib::wire::WireFormat;

use super::{unix_now, SessionRecord};
use crate::secret;

/// Random bytes prepended to the plaintext before encryption so equal
/// sessions never produce equal tokens.
const PREFIX_PADDING_SIZE: usize = 16;
const HMAC_SIZE: usize = 20;
const AES_BLOCK_SIZE: usize = 16;

pub trait SessionCache: Send + Sync {
    /// Store a session record. A cache may assign the session a new id by
    /// returning it; the caller must adopt it.
    fn store_session(&self, record: &SessionRecord) -> Result<Option<String>, TotoError>;
    fn load_session(&self, session_id: &str) -> Result<Option<SessionRecord>, TotoError>;
    fn remove_session(&self, session_id: &str);
}

/// Serialized records with a TTL of `expires - now`, keyed by session id.
#[derive(Default)]
pub struct MemorySessionCache {
    format: WireFormat,
    entries: Mutex<HashMap<String, (f64, Vec<u8>)>>,
}

impl MemorySessionCache {
    pub fn new(format: WireFormat) -> Self {
        MemorySessionCache {
            format,
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl SessionCache for MemorySessionCache {
    fn store_session(&self, record: &SessionRecord) -> Result<Option<String>, TotoError> {
        let bytes = self
            .format
            .encode(record)
            .map_err(|e| TotoError::server(e.to_string()))?;
        self.entries
            .lock()
            .insert(record.session_id.clone(), (record.expires, bytes));
        Ok(None)
    }

    fn load_session(&self, session_id: &str) -> Result<Option<SessionRecord>, TotoError> {
        let mut entries = self.entries.lock();
        let Some((expires, bytes)) = entries.get(session_id) else {
            return Ok(None);
        };
        if *expires <= unix_now() {
            entries.remove(session_id);
            return Ok(None);
        }
        let record = self
            .format
            .decode(bytes)
            .map_err(|e| TotoError::server(e.to_string()))?;
        Ok(Some(record))
    }

    fn remove_session(&self, session_id: &str) {
        self.entries.lock().remove(session_id);
    }
}

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

/// Reusable AES-128-CBC cipher with a fixed key and IV.
///
/// The key and IV may be supplied as one 32-byte blob, in which case the
/// last block is the IV. Identical configuration across servers lets any
/// node open any token.
#[derive(Clone)]
pub struct AesCbcCipher {
    key: [u8; AES_BLOCK_SIZE],
    iv: [u8; AES_BLOCK_SIZE],
}

impl AesCbcCipher {
    pub fn new(key: &[u8], iv: &[u8]) -> Result<Self, TotoError> {
        let key = key
            .try_into()
            .map_err(|_| TotoError::server("AES key must be 16 bytes"))?;
        let iv = iv
            .try_into()
            .map_err(|_| TotoError::server("AES IV must be 16 bytes"))?;
        Ok(AesCbcCipher { key, iv })
    }

    pub fn from_combined(key_iv: &[u8]) -> Result<Self, TotoError> {
        if key_iv.len() != 2 * AES_BLOCK_SIZE {
            return Err(TotoError::server("combined AES key+IV must be 32 bytes"));
        }
        Self::new(&key_iv[..AES_BLOCK_SIZE], &key_iv[AES_BLOCK_SIZE..])
    }

    fn encrypt(&self, data: &[u8]) -> Vec<u8> {
        Aes128CbcEnc::new(&self.key.into(), &self.iv.into()).encrypt_padded_vec_mut::<Pkcs7>(data)
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, TotoError> {
        Aes128CbcDec::new(&self.key.into(), &self.iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(data)
            .map_err(|_| invalid_session_id())
    }
}

/// The sealed-token cache: all session state travels with the client.
///
/// `store` seals the serialized record and the returned token becomes the
/// session id; `load` verifies and unseals it, then rewrites `session_id`
/// to the presented token so refreshed sessions keep their identity.
/// `remove` is a no-op since there is nothing server-side to remove.
pub struct ClientCache {
    cipher: AesCbcCipher,
    hmac_key: Vec<u8>,
    format: WireFormat,
}

impl ClientCache {
    pub fn new(cipher: AesCbcCipher, hmac_key: impl Into<Vec<u8>>) -> Self {
        ClientCache {
            cipher,
            hmac_key: hmac_key.into(),
            format: WireFormat::default(),
        }
    }
}

impl SessionCache for ClientCache {
    fn store_session(&self, record: &SessionRecord) -> Result<Option<String>, TotoError> {
        let payload = self
            .format
            .encode(record)
            .map_err(|e| TotoError::server(e.to_string()))?;
        let mut plain = vec![0u8; PREFIX_PADDING_SIZE];
        rand::thread_rng().fill_bytes(&mut plain);
        plain.extend_from_slice(&payload);
        let mut sealed = self.cipher.encrypt(&plain);
        let mac = secret::hmac_sha1(&self.hmac_key, &sealed);
        sealed.extend_from_slice(&mac);
        Ok(Some(URL_SAFE.encode(sealed)))
    }

    fn load_session(&self, session_id: &str) -> Result<Option<SessionRecord>, TotoError> {
        let raw = URL_SAFE
            .decode(session_id)
            .map_err(|_| invalid_session_id())?;
        if raw.len() <= HMAC_SIZE {
            return Err(invalid_session_id());
        }
        let (sealed, mac) = raw.split_at(raw.len() - HMAC_SIZE);
        let expected = secret::hmac_sha1(&self.hmac_key, sealed);
        if expected.ct_eq(mac).unwrap_u8() != 1 {
            return Err(TotoError::new(
                toto_lib::error::ERROR_INVALID_HMAC,
                "Invalid session HMAC",
            ));
        }
        let plain = self.cipher.decrypt(sealed)?;
        if plain.len() < PREFIX_PADDING_SIZE {
            return Err(invalid_session_id());
        }
        let mut record: SessionRecord = self
            .format
            .decode(&plain[PREFIX_PADDING_SIZE..])
            .map_err(|_| invalid_session_id())?;
        record.session_id = session_id.to_owned();
        Ok(Some(record))
    }

    fn remove_session(&self, _session_id: &str) {}
}

fn invalid_session_id() -> TotoError {
    TotoError::new(ERROR_INVALID_SESSION_ID, "Invalid session ID")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;
    use toto_lib::error::{ERROR_INVALID_HMAC, ERROR_INVALID_SESSION_ID};

    fn sample_record() -> SessionRecord {
        let mut state = Map::new();
        state.insert("count".into(), serde_json::json!(3));
        SessionRecord {
            session_id: super::super::generate_session_id(),
            user_id: "u".into(),
            expires: unix_now() + 60.0,
            state,
            key: Some("signing-key".into()),
        }
    }

    fn client_cache() -> ClientCache {
        let cipher = AesCbcCipher::from_combined(b"0123456789abcdef0123456789abcdef").unwrap();
        ClientCache::new(cipher, *b"hmac-key")
    }

    #[test]
    fn sealed_token_round_trip() {
        let cache = client_cache();
        let record = sample_record();
        let token = cache.store_session(&record).unwrap().unwrap();
        let loaded = cache.load_session(&token).unwrap().unwrap();
        assert_eq!(loaded.session_id, token);
        assert_eq!(loaded.user_id, record.user_id);
        assert_eq!(loaded.expires, record.expires);
        assert_eq!(loaded.state, record.state);
        assert_eq!(loaded.key, record.key);
    }

    #[test]
    fn equal_sessions_produce_distinct_tokens() {
        let cache = client_cache();
        let record = sample_record();
        let a = cache.store_session(&record).unwrap().unwrap();
        let b = cache.store_session(&record).unwrap().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn tampered_token_fails_the_mac() {
        let cache = client_cache();
        let token = cache.store_session(&sample_record()).unwrap().unwrap();
        let mut raw = URL_SAFE.decode(&token).unwrap();
        raw[0] ^= 0x01;
        let tampered = URL_SAFE.encode(raw);
        let err = cache.load_session(&tampered).unwrap_err();
        assert_eq!(err.code, ERROR_INVALID_HMAC);
    }

    #[test]
    fn malformed_token_is_invalid_session() {
        let cache = client_cache();
        assert_eq!(
            cache.load_session("!!not-base64!!").unwrap_err().code,
            ERROR_INVALID_SESSION_ID
        );
        assert_eq!(
            cache.load_session("c2hvcnQ=").unwrap_err().code,
            ERROR_INVALID_SESSION_ID
        );
    }

    #[test]
    fn memory_cache_honors_ttl() {
        let cache = MemorySessionCache::new(WireFormat::Json);
        let mut record = sample_record();
        cache.store_session(&record).unwrap();
        assert!(cache
            .load_session(&record.session_id)
            .unwrap()
            .is_some());

        record.expires = unix_now() - 1.0;
        cache.store_session(&record).unwrap();
        assert!(cache.load_session(&record.session_id).unwrap().is_none());
    }
}
