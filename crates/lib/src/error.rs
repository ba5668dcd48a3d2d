use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Generic failure inside a method or the surrounding infrastructure.
pub const ERROR_SERVER: i32 = 1000;
/// The requested method path does not resolve to a registered method.
pub const ERROR_INVALID_METHOD: i32 = 1001;
/// Neither the URL nor the request body named a method.
pub const ERROR_MISSING_METHOD: i32 = 1002;
/// A method marked required parameters that the request did not carry.
pub const ERROR_MISSING_PARAMS: i32 = 1003;
/// The method requires a session and none was presented.
pub const ERROR_NOT_AUTHORIZED: i32 = 1004;
/// Unknown user id, or the password did not verify.
pub const ERROR_USER_NOT_FOUND: i32 = 1005;
/// An account with this user id already exists.
pub const ERROR_USER_ID_EXISTS: i32 = 1006;
/// The presented session id is malformed.
pub const ERROR_INVALID_SESSION_ID: i32 = 1007;
/// The request or token MAC did not verify.
pub const ERROR_INVALID_HMAC: i32 = 1008;
/// An empty or otherwise unusable user id.
pub const ERROR_INVALID_USER_ID: i32 = 1009;

/// A structured protocol error.
///
/// The codes above cover the framework itself; user methods are free to fail
/// with any other integer code, which travels to the client untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("toto error {code}: {value}")]
pub struct TotoError {
    pub code: i32,
    pub value: Value,
}

impl TotoError {
    pub fn new(code: i32, value: impl Into<String>) -> Self {
        TotoError {
            code,
            value: Value::String(value.into()),
        }
    }

    pub fn with_value(code: i32, value: Value) -> Self {
        TotoError { code, value }
    }

    pub fn server(value: impl Into<String>) -> Self {
        TotoError::new(ERROR_SERVER, value)
    }

    pub fn invalid_method(path: &str) -> Self {
        TotoError::new(ERROR_INVALID_METHOD, format!("Cannot call '{path}'."))
    }

    pub fn missing_method() -> Self {
        TotoError::new(ERROR_MISSING_METHOD, "Missing method.")
    }

    pub fn missing_params(missing: &[String]) -> Self {
        TotoError::new(
            ERROR_MISSING_PARAMS,
            format!("Missing parameters: {}", missing.join(", ")),
        )
    }

    pub fn not_authorized() -> Self {
        TotoError::new(ERROR_NOT_AUTHORIZED, "Not authorized")
    }

    pub fn user_not_found() -> Self {
        TotoError::new(ERROR_USER_NOT_FOUND, "Invalid user ID or password")
    }

    pub fn invalid_hmac() -> Self {
        TotoError::new(ERROR_INVALID_HMAC, "Invalid HMAC")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_as_code_value() {
        let err = TotoError::missing_method();
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"code": 1002, "value": "Missing method."})
        );
    }

    #[test]
    fn preserves_custom_codes() {
        let err = TotoError::new(4242, "Test Toto Exception");
        assert_eq!(err.code, 4242);
        let back: TotoError = serde_json::from_value(serde_json::to_value(&err).unwrap()).unwrap();
        assert_eq!(back, err);
    }
}
