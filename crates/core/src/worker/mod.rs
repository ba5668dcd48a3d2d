//! The worker dispatch fabric.
//!
//! [`connection::WorkerConnection`] is the client side: it round-robins
//! invocations across a set of worker endpoints, tracks each in-flight
//! request by id, and owns per-call timeouts and retries.
//! [`service::WorkerService`] is the server side, dispatching requests into
//! the method registry. [`balancer::WorkerBalancer`] is the optional router
//! process in front of a worker pool.
//!
//! Wire discipline on the message-queue binding: length-delimited frames of
//! `request_id(16) ++ payload`; a reply frame with no payload is the early
//! acknowledgement for methods that respond out of band.

pub mod balancer;
pub mod connection;
pub mod service;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use toto_lib::error::TotoError;
use toto_lib::wire::{Compression, WireFormat};

pub(crate) const REQUEST_ID_LEN: usize = 16;
pub(crate) const RECONNECT_DELAY: std::time::Duration = std::time::Duration::from_secs(1);

/// The request body carried inside a worker frame or HTTP POST.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub method: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

/// Serializer + compressor + deadline defaults for one fabric edge.
#[derive(Debug, Clone, Copy)]
pub struct WorkerWire {
    pub format: WireFormat,
    pub compression: Compression,
}

impl Default for WorkerWire {
    fn default() -> Self {
        WorkerWire {
            format: WireFormat::Json,
            compression: Compression::Zlib,
        }
    }
}

impl WorkerWire {
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Bytes, TotoError> {
        let bytes = self
            .format
            .encode(value)
            .map_err(|e| TotoError::server(e.to_string()))?;
        let packed = self
            .compression
            .compress(&bytes)
            .map_err(|e| TotoError::server(e.to_string()))?;
        Ok(Bytes::from(packed))
    }

    pub fn decode<T: serde::de::DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, TotoError> {
        let bytes = self
            .compression
            .decompress(bytes)
            .map_err(|e| TotoError::server(e.to_string()))?;
        self.format
            .decode(&bytes)
            .map_err(|e| TotoError::server(e.to_string()))
    }
}

pub(crate) fn encode_frame(request_id: Uuid, payload: Option<&[u8]>) -> Bytes {
    let mut frame =
        BytesMut::with_capacity(REQUEST_ID_LEN + payload.map(<[u8]>::len).unwrap_or(0));
    frame.extend_from_slice(request_id.as_bytes());
    if let Some(payload) = payload {
        frame.extend_from_slice(payload);
    }
    frame.freeze()
}

pub(crate) fn split_frame(frame: &[u8]) -> Option<(Uuid, Option<&[u8]>)> {
    if frame.len() < REQUEST_ID_LEN {
        return None;
    }
    let request_id = Uuid::from_slice(&frame[..REQUEST_ID_LEN]).ok()?;
    let payload = (frame.len() > REQUEST_ID_LEN).then(|| &frame[REQUEST_ID_LEN..]);
    Some((request_id, payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_round_trip() {
        let id = Uuid::new_v4();
        let frame = encode_frame(id, Some(b"payload"));
        let (back, payload) = split_frame(&frame).unwrap();
        assert_eq!(back, id);
        assert_eq!(payload, Some(&b"payload"[..]));
    }

    #[test]
    fn ack_frames_have_no_payload() {
        let id = Uuid::new_v4();
        let frame = encode_frame(id, None);
        let (back, payload) = split_frame(&frame).unwrap();
        assert_eq!(back, id);
        assert_eq!(payload, None);
        assert!(split_frame(&frame[..10]).is_none());
    }

    #[test]
    fn wire_round_trips_requests() {
        let wire = WorkerWire::default();
        let mut parameters = Map::new();
        parameters.insert("arg1".into(), 1.into());
        let bytes = wire
            .encode(&WorkerRequest {
                method: "return_value".into(),
                parameters,
            })
            .unwrap();
        let back: WorkerRequest = wire.decode(&bytes).unwrap();
        assert_eq!(back.method, "return_value");
        assert_eq!(back.parameters["arg1"], 1);
    }
}
