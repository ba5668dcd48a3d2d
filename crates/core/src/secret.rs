//! Password hashing and message signing.
//!
//! Passwords are stored as PBKDF2 PHC strings with the salt and cost
//! embedded, so hashes remain verifiable across configuration changes.
//! Request and response integrity uses base64-encoded HMAC-SHA1 to stay
//! wire compatible with existing clients.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use pbkdf2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use pbkdf2::Pbkdf2;
use rand::Rng;
use sha1::Sha1;

use toto_lib::error::{TotoError, ERROR_SERVER};

type HmacSha1 = Hmac<Sha1>;

/// Length of a generated fallback password, matching the original account
/// recovery flow.
const GENERATED_PASSWORD_LEN: usize = 10;

pub fn password_hash(password: &str) -> Result<String, TotoError> {
    let salt = SaltString::generate(&mut rand_core::OsRng);
    Pbkdf2
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| TotoError::new(ERROR_SERVER, format!("Password hashing failed: {e}")))
}

/// Re-runs the KDF on the candidate and compares in constant time. A
/// malformed stored hash verifies as false rather than erroring.
pub fn verify_password(candidate: &str, stored: &str) -> bool {
    match PasswordHash::new(stored) {
        Ok(parsed) => Pbkdf2.verify_password(candidate.as_bytes(), &parsed).is_ok(),
        Err(_) => false,
    }
}

/// A fresh random alphanumeric password for "forgot password" flows.
pub fn generate_password() -> String {
    const CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..GENERATED_PASSWORD_LEN)
        .map(|_| CHARS[rng.gen_range(0..CHARS.len())] as char)
        .collect()
}

/// `base64(HMAC-SHA1(key, data))`, the signature carried in `x-toto-hmac`
/// headers and on sealed session tokens.
pub fn sign(key: &[u8], data: &[u8]) -> String {
    STANDARD.encode(hmac_sha1(key, data))
}

pub fn hmac_sha1(key: &[u8], data: &[u8]) -> [u8; 20] {
    // HMAC accepts keys of any length.
    let mut mac = HmacSha1::new_from_slice(key).expect("hmac key");
    mac.update(data);
    mac.finalize().into_bytes().into()
}
