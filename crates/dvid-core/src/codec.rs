//! Two-level CBOR framing for the dvid frontend protocol.
//!
//! The outer envelope is `{type, payload?, error?}`. The payload is an
//! independently encoded CBOR message whose concrete type is resolved by the
//! discriminator; this layer treats it as opaque bytes. The transport
//! delivers discrete messages, so there is no length prefix.

use serde::{Deserialize, Serialize};
use std::io::Cursor;

use crate::error::{DvidError, DvidResult};
use crate::messages::ErrorCode;

/// Client → gateway envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Upstream {
    #[serde(rename = "type")]
    pub msg_type: u32,
    #[serde(default, with = "crate::bytes")]
    pub payload: Vec<u8>,
}

/// Gateway → client envelope: a response or a push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Downstream {
    #[serde(rename = "type")]
    pub msg_type: u32,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "crate::bytes::option"
    )]
    pub payload: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<DownstreamError>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownstreamError {
    pub code: ErrorCode,
    #[serde(default)]
    pub desc: String,
}

impl DownstreamError {
    pub fn new(code: ErrorCode, desc: impl Into<String>) -> Self {
        Self {
            code,
            desc: desc.into(),
        }
    }
}

impl Downstream {
    /// Whether this envelope reports a failure.
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Serialize a value to CBOR bytes.
pub fn cbor_encode<T: Serialize>(value: &T) -> DvidResult<Vec<u8>> {
    let mut out = Vec::new();
    ciborium::into_writer(value, &mut out)?;
    Ok(out)
}

/// Decode a CBOR payload into a typed value.
pub fn cbor_decode<T: serde::de::DeserializeOwned>(data: &[u8]) -> DvidResult<T> {
    let cursor = Cursor::new(data);
    let value: T = ciborium::from_reader(cursor)?;
    Ok(value)
}

/// Encode an inner payload message.
pub fn encode_payload<T: Serialize>(value: &T) -> DvidResult<Vec<u8>> {
    cbor_encode(value)
}

/// Decode an inner payload message. Zero bytes decode as an empty map.
pub fn decode_payload<T: serde::de::DeserializeOwned>(data: &[u8]) -> DvidResult<T> {
    const EMPTY_MAP: [u8; 1] = [0xa0];
    if data.is_empty() {
        cbor_decode(&EMPTY_MAP)
    } else {
        cbor_decode(data)
    }
}

/// Encode a client request envelope.
pub fn encode_upstream(msg_type: u32, payload: &[u8]) -> DvidResult<Vec<u8>> {
    cbor_encode(&Upstream {
        msg_type,
        payload: payload.to_vec(),
    })
}

/// Decode a client request envelope.
pub fn decode_upstream(data: &[u8]) -> DvidResult<Upstream> {
    cbor_decode(data).map_err(|e| DvidError::MalformedEnvelope(e.to_string()))
}

/// Encode a gateway envelope.
///
/// When `error` carries a real code the payload is dropped, whatever the
/// caller passed. An error with code `None` is treated as absent.
pub fn encode_downstream(
    msg_type: u32,
    payload: Option<Vec<u8>>,
    error: Option<DownstreamError>,
) -> DvidResult<Vec<u8>> {
    let error = error.filter(|e| e.code != ErrorCode::None);
    let payload = if error.is_some() { None } else { payload };
    cbor_encode(&Downstream {
        msg_type,
        payload,
        error,
    })
}

/// Decode a gateway envelope.
pub fn decode_downstream(data: &[u8]) -> DvidResult<Downstream> {
    let mut downstream: Downstream =
        cbor_decode(data).map_err(|e| DvidError::MalformedEnvelope(e.to_string()))?;
    if downstream.error.is_some() {
        downstream.payload = None;
    }
    Ok(downstream)
}
