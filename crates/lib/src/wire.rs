use std::io::{Read, Write};

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Failure while encoding or decoding a wire payload.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("msgpack encode: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),
    #[error("msgpack decode: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),
    #[error("compression: {0}")]
    Compression(#[from] std::io::Error),
}

/// The serialization strategy for a wire surface.
///
/// JSON is the default everywhere; MessagePack is accepted on surfaces that
/// have it enabled and is the usual choice for worker traffic.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    #[default]
    Json,
    MsgPack,
}

impl WireFormat {
    pub fn mime(self) -> &'static str {
        match self {
            WireFormat::Json => "application/json",
            WireFormat::MsgPack => "application/msgpack",
        }
    }

    /// Match a `Content-Type` header value, ignoring parameters.
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        if content_type.starts_with("application/json") {
            Some(WireFormat::Json)
        } else if content_type.starts_with("application/msgpack") {
            Some(WireFormat::MsgPack)
        } else {
            None
        }
    }

    pub fn encode<T: Serialize>(self, value: &T) -> Result<Vec<u8>, WireError> {
        match self {
            WireFormat::Json => Ok(serde_json::to_vec(value)?),
            // Named-field encoding keeps msgpack payloads readable as maps,
            // matching what non-Rust peers produce.
            WireFormat::MsgPack => Ok(rmp_serde::to_vec_named(value)?),
        }
    }

    pub fn decode<T: DeserializeOwned>(self, bytes: &[u8]) -> Result<T, WireError> {
        match self {
            WireFormat::Json => Ok(serde_json::from_slice(bytes)?),
            WireFormat::MsgPack => Ok(rmp_serde::from_slice(bytes)?),
        }
    }
}

impl std::str::FromStr for WireFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(WireFormat::Json),
            "msgpack" => Ok(WireFormat::MsgPack),
            other => Err(format!("unknown wire format: {other}")),
        }
    }
}

/// The compression strategy applied after serialization.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Zlib,
}

impl Compression {
    pub fn compress(self, bytes: &[u8]) -> Result<Vec<u8>, WireError> {
        match self {
            Compression::None => Ok(bytes.to_vec()),
            Compression::Zlib => {
                let mut encoder =
                    flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
                encoder.write_all(bytes)?;
                Ok(encoder.finish()?)
            }
        }
    }

    pub fn decompress(self, bytes: &[u8]) -> Result<Vec<u8>, WireError> {
        match self {
            Compression::None => Ok(bytes.to_vec()),
            Compression::Zlib => {
                let mut decoder = flate2::read::ZlibDecoder::new(bytes);
                let mut out = Vec::new();
                decoder.read_to_end(&mut out)?;
                Ok(out)
            }
        }
    }
}

impl std::str::FromStr for Compression {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Compression::None),
            "zlib" => Ok(Compression::Zlib),
            other => Err(format!("unknown compression: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Envelope;

    #[test]
    fn json_round_trip() {
        let env = Envelope::call("a.b", serde_json::Map::new());
        let bytes = WireFormat::Json.encode(&env).unwrap();
        let back: Envelope = WireFormat::Json.decode(&bytes).unwrap();
        assert_eq!(back.method.as_deref(), Some("a.b"));
    }

    #[test]
    fn msgpack_carries_dynamic_values() {
        let value = serde_json::json!({"method": "x", "parameters": {"n": 1, "s": "two"}});
        let bytes = WireFormat::MsgPack.encode(&value).unwrap();
        let back: serde_json::Value = WireFormat::MsgPack.decode(&bytes).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn zlib_round_trip() {
        let data = b"the same bytes come back".repeat(16);
        let packed = Compression::Zlib.compress(&data).unwrap();
        assert!(packed.len() < data.len());
        assert_eq!(Compression::Zlib.decompress(&packed).unwrap(), data);
    }

    #[test]
    fn content_type_matching_ignores_parameters() {
        assert_eq!(
            WireFormat::from_content_type("application/json; charset=utf-8"),
            Some(WireFormat::Json)
        );
        assert_eq!(WireFormat::from_content_type("text/plain"), None);
    }
}
