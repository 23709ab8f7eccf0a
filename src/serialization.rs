// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Body Serialization
//!
//! This module encodes and decodes message bodies according to the AMQP
//! `content-type` and `content-encoding` properties, and marshals error
//! values across process boundaries. Inbound decoding never fails: a body
//! that cannot be parsed resolves to a `{"err": ...}` sentinel so the
//! router keeps running.

use crate::errors::TransportError;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::io::{Read, Write};

/// Content type for JSON-encoded bodies
pub const CONTENT_TYPE_JSON: &str = "application/json";
/// Content type for utf-8 string bodies, also JSON-encoded on the wire
pub const CONTENT_TYPE_UTF8: &str = "string/utf8";
/// Content encoding for uncompressed bodies
pub const ENCODING_PLAIN: &str = "plain";
/// Content encoding for gzip-compressed bodies
pub const ENCODING_GZIP: &str = "gzip";

/// Wire shape of an error crossing process boundaries.
///
/// Local errors are flattened into this record before publishing; inbound
/// records are revived into `TransportError` values, preserving the remote
/// kind, code, and stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    /// Kind-specific payload, e.g. the death trail of a DLX error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl WireError {
    /// Flattens a transport error into its wire shape.
    ///
    /// Message-only kinds carry their bare message so revival restores
    /// them verbatim; field-bearing kinds stash their fields in `data`.
    pub fn from_error(err: &TransportError) -> Self {
        match err {
            TransportError::Validation(message) => WireError::plain("ValidationError", message),
            TransportError::InvalidOperation(message) => {
                WireError::plain("InvalidOperationError", message)
            }
            TransportError::Parse(message) => WireError::plain("ParseError", message),
            TransportError::Argument(message) => WireError::plain("ArgumentError", message),
            TransportError::Connection { reason, reply_code } => WireError {
                kind: "ConnectionError".to_owned(),
                message: reason.clone(),
                code: None,
                stack: None,
                data: reply_code.map(|code| json!({ "reply_code": code })),
            },
            TransportError::NotPermitted { correlation_id } => WireError {
                kind: "NotPermittedError".to_owned(),
                message: err.to_string(),
                code: None,
                stack: None,
                data: Some(json!({ "correlation_id": correlation_id })),
            },
            TransportError::Timeout { route, timeout_ms } => WireError {
                kind: "TimeoutError".to_owned(),
                message: err.to_string(),
                code: None,
                stack: None,
                data: Some(json!({ "route": route, "timeout_ms": timeout_ms })),
            },
            TransportError::Dlx { reason, trail } => WireError {
                kind: "AmqpDLXError".to_owned(),
                message: reason.clone(),
                code: None,
                stack: None,
                data: serde_json::to_value(trail).ok(),
            },
            TransportError::Remote {
                kind,
                message,
                code,
                stack,
                ..
            } => WireError {
                kind: kind.clone(),
                message: message.clone(),
                code: code.clone(),
                stack: stack.clone(),
                data: None,
            },
        }
    }

    fn plain(kind: &str, message: &str) -> WireError {
        WireError {
            kind: kind.to_owned(),
            message: message.to_owned(),
            code: None,
            stack: None,
            data: None,
        }
    }

    /// Rebuilds a typed error from its wire shape.
    ///
    /// Known kinds revive into their matching variant, reading their
    /// fields back out of `data`; a known kind whose required fields are
    /// missing (a foreign peer's shape), and every unknown kind, becomes a
    /// `Remote` error keeping the original kind tag. The AMQP headers of
    /// the reply that carried the error travel on the `Remote` fallback so
    /// the caller can still read them.
    pub fn revive(self, reply_headers: Option<Value>) -> TransportError {
        let kind = self.kind.clone();
        match kind.as_str() {
            "ValidationError" => TransportError::Validation(self.message),
            "InvalidOperationError" => TransportError::InvalidOperation(self.message),
            "ParseError" => TransportError::Parse(self.message),
            "ArgumentError" => TransportError::Argument(self.message),
            "ConnectionError" => {
                let reply_code = self
                    .data
                    .as_ref()
                    .and_then(|data| data.get("reply_code"))
                    .and_then(Value::as_u64)
                    .map(|code| code as u16);
                TransportError::Connection {
                    reason: self.message,
                    reply_code,
                }
            }
            "NotPermittedError" => {
                let correlation_id = self
                    .data
                    .as_ref()
                    .and_then(|data| data.get("correlation_id"))
                    .and_then(Value::as_str)
                    .map(str::to_owned);
                match correlation_id {
                    Some(correlation_id) => TransportError::NotPermitted { correlation_id },
                    None => remote_error(self, reply_headers),
                }
            }
            "TimeoutError" => {
                let fields = self.data.as_ref().and_then(|data| {
                    let route = data.get("route")?.as_str()?.to_owned();
                    let timeout_ms = data.get("timeout_ms")?.as_u64()?;
                    Some((route, timeout_ms))
                });
                match fields {
                    Some((route, timeout_ms)) => TransportError::Timeout { route, timeout_ms },
                    None => remote_error(self, reply_headers),
                }
            }
            "AmqpDLXError" => {
                let trail = self
                    .data
                    .and_then(|v| serde_json::from_value(v).ok())
                    .unwrap_or_default();
                TransportError::Dlx {
                    reason: self.message,
                    trail,
                }
            }
            _ => remote_error(self, reply_headers),
        }
    }
}

fn remote_error(wire: WireError, reply_headers: Option<Value>) -> TransportError {
    TransportError::Remote {
        kind: wire.kind,
        message: wire.message,
        code: wire.code,
        stack: wire.stack,
        reply_headers,
    }
}

/// Encodes an outbound body.
///
/// JSON content types pass through `serde_json`; gzip content encoding
/// compresses the encoded bytes. Anything else is refused up front so the
/// broker never sees a body the consuming side cannot negotiate.
pub fn serialize(
    body: &Value,
    content_type: &str,
    content_encoding: &str,
) -> Result<Vec<u8>, TransportError> {
    let bytes = match content_type {
        CONTENT_TYPE_JSON | CONTENT_TYPE_UTF8 => serde_json::to_vec(body)
            .map_err(|err| TransportError::Validation(format!("failed to encode body: {err}")))?,
        other => {
            return Err(TransportError::Validation(format!(
                "invalid content-type `{other}`"
            )))
        }
    };

    match content_encoding {
        ENCODING_PLAIN => Ok(bytes),
        ENCODING_GZIP => gzip(&bytes),
        other => Err(TransportError::Validation(format!(
            "invalid content-encoding `{other}`"
        ))),
    }
}

/// Decodes an inbound body. Never fails: undecodable input resolves to the
/// `{"err": ...}` sentinel described in the module docs.
pub fn deserialize(
    data: &[u8],
    content_type: Option<&str>,
    content_encoding: Option<&str>,
) -> Value {
    let plain = match content_encoding {
        None | Some(ENCODING_PLAIN) => data.to_vec(),
        Some(ENCODING_GZIP) => match gunzip(data) {
            Ok(bytes) => bytes,
            Err(err) => return parse_sentinel(err.to_string()),
        },
        Some(other) => {
            return parse_sentinel(format!("unsupported content-encoding `{other}`"));
        }
    };

    match content_type {
        Some(CONTENT_TYPE_JSON) | Some(CONTENT_TYPE_UTF8) => {
            match serde_json::from_slice(&plain) {
                Ok(value) => value,
                Err(err) => parse_sentinel(err.to_string()),
            }
        }
        // Unknown content types pass the raw bytes through untouched
        _ => Value::String(String::from_utf8_lossy(&plain).into_owned()),
    }
}

/// The `{"err": ...}` value handed to handlers when decoding fails.
pub fn parse_sentinel(reason: String) -> Value {
    let err = WireError::from_error(&TransportError::Parse(reason));
    json!({ "err": err })
}

fn gzip(bytes: &[u8]) -> Result<Vec<u8>, TransportError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(bytes)
        .and_then(|_| encoder.finish())
        .map_err(|err| TransportError::Validation(format!("failed to gzip body: {err}")))
}

fn gunzip(bytes: &[u8]) -> Result<Vec<u8>, std::io::Error> {
    let mut decoder = GzDecoder::new(bytes);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_round_trip() {
        let body = json!({"a": 1, "b": ["x", null]});
        let bytes = serialize(&body, CONTENT_TYPE_JSON, ENCODING_PLAIN).unwrap();
        assert_eq!(
            deserialize(&bytes, Some(CONTENT_TYPE_JSON), Some(ENCODING_PLAIN)),
            body
        );
    }

    #[test]
    fn gzip_round_trip() {
        let body = json!({"payload": "z".repeat(4096)});
        let bytes = serialize(&body, CONTENT_TYPE_JSON, ENCODING_GZIP).unwrap();
        assert!(bytes.len() < 4096);
        assert_eq!(
            deserialize(&bytes, Some(CONTENT_TYPE_JSON), Some(ENCODING_GZIP)),
            body
        );
    }

    #[test]
    fn invalid_content_type_is_refused() {
        let err = serialize(&json!(1), "application/xml", ENCODING_PLAIN).unwrap_err();
        assert!(matches!(err, TransportError::Validation(_)));
    }

    #[test]
    fn broken_json_resolves_to_sentinel() {
        let value = deserialize(b"{oops", Some(CONTENT_TYPE_JSON), None);
        let err = value.get("err").expect("sentinel present");
        assert_eq!(err.get("type").unwrap(), "ParseError");
    }

    #[test]
    fn unknown_encoding_resolves_to_sentinel() {
        let value = deserialize(b"{}", Some(CONTENT_TYPE_JSON), Some("zstd"));
        assert!(value.get("err").is_some());
    }

    #[test]
    fn unknown_content_type_passes_bytes_through() {
        let value = deserialize(b"plain text", Some("text/plain"), None);
        assert_eq!(value, Value::String("plain text".to_owned()));
    }

    #[test]
    fn error_shape_round_trip() {
        let original = TransportError::Validation("bad".to_owned());
        let wire = WireError::from_error(&original);
        let encoded = serde_json::to_value(&wire).unwrap();
        assert_eq!(encoded.get("type").unwrap(), "ValidationError");
        assert_eq!(encoded.get("message").unwrap(), "bad");

        let revived: WireError = serde_json::from_value(encoded).unwrap();
        assert_eq!(revived.revive(None), original);
    }

    #[test]
    fn known_kinds_revive_to_their_variant() {
        let cases = [
            TransportError::Validation("bad".to_owned()),
            TransportError::InvalidOperation("connect while open".to_owned()),
            TransportError::Parse("trailing garbage".to_owned()),
            TransportError::Argument("handler shape".to_owned()),
            TransportError::Connection {
                reason: "NOT_FOUND".to_owned(),
                reply_code: Some(404),
            },
            TransportError::NotPermitted {
                correlation_id: "corr-9".to_owned(),
            },
            TransportError::Timeout {
                route: "echo".to_owned(),
                timeout_ms: 200,
            },
        ];

        for original in cases {
            let revived = WireError::from_error(&original).revive(None);
            assert_eq!(revived, original);
        }
    }

    #[test]
    fn unknown_kind_revives_to_remote_with_headers() {
        let wire = WireError {
            kind: "HttpStatusError".to_owned(),
            message: "upstream said no".to_owned(),
            code: Some("418".to_owned()),
            stack: None,
            data: None,
        };

        match wire.revive(Some(json!({"x-request": "1"}))) {
            TransportError::Remote {
                kind,
                message,
                code,
                reply_headers,
                ..
            } => {
                assert_eq!(kind, "HttpStatusError");
                assert_eq!(message, "upstream said no");
                assert_eq!(code.as_deref(), Some("418"));
                assert_eq!(reply_headers.unwrap().get("x-request").unwrap(), "1");
            }
            other => panic!("unexpected revival: {other:?}"),
        }
    }

    #[test]
    fn known_kind_without_required_data_falls_back_to_remote() {
        // A foreign peer may stamp the kind without our data payload.
        let wire = WireError {
            kind: "TimeoutError".to_owned(),
            message: "took too long".to_owned(),
            code: None,
            stack: None,
            data: None,
        };

        match wire.revive(None) {
            TransportError::Remote { kind, .. } => assert_eq!(kind, "TimeoutError"),
            other => panic!("unexpected revival: {other:?}"),
        }
    }

    #[test]
    fn dlx_error_revives_with_trail() {
        let original = TransportError::Dlx {
            reason: "expired".to_owned(),
            trail: vec![crate::errors::DeathRecord {
                queue: "echo".to_owned(),
                reason: "expired".to_owned(),
                exchange: "amq.topic".to_owned(),
                routing_keys: vec!["echo".to_owned()],
                count: 1,
            }],
        };
        let wire = WireError::from_error(&original);
        match wire.revive(None) {
            TransportError::Dlx { trail, .. } => {
                assert_eq!(trail[0].queue, "echo");
                assert_eq!(trail[0].reason, "expired");
            }
            other => panic!("unexpected revival: {other:?}"),
        }
    }
}
