use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::TotoError;

/// A single RPC request as carried on the wire.
///
/// `method` is a dotted path into the method registry. A request may instead
/// carry `batch`, a map of caller-chosen keys to nested envelopes that are
/// dispatched independently.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch: Option<HashMap<String, Envelope>>,
}

impl Envelope {
    pub fn call(method: impl Into<String>, parameters: Map<String, Value>) -> Self {
        Envelope {
            method: Some(method.into()),
            parameters,
            batch: None,
        }
    }
}

/// The session summary attached to responses that created or refreshed a
/// session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub expires: f64,
    pub user_id: String,
}

/// An RPC response: exactly one of `result` or `error`, or a `batch` map of
/// single responses keyed like the request batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Response {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TotoError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch: Option<HashMap<String, Response>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionInfo>,
}

impl Response {
    pub fn result(value: Value) -> Self {
        Response {
            result: Some(value),
            ..Default::default()
        }
    }

    pub fn error(err: TotoError) -> Self {
        Response {
            error: Some(err),
            ..Default::default()
        }
    }

    pub fn batch(entries: HashMap<String, Response>) -> Self {
        Response {
            batch: Some(entries),
            ..Default::default()
        }
    }
}

impl From<Result<Value, TotoError>> for Response {
    fn from(result: Result<Value, TotoError>) -> Self {
        match result {
            Ok(value) => Response::result(value),
            Err(err) => Response::error(err),
        }
    }
}
