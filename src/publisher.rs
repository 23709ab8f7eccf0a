// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publishing Pipeline
//!
//! This module turns a caller's message and options into bytes on the
//! wire: it encodes the body, enriches the AMQP properties (`appId`,
//! timeout header, trace context, correlation plumbing), and performs the
//! publish, waiting for the broker acknowledgement when asked to.

use crate::errors::TransportError;
use crate::options::PublishOptions;
use crate::properties::{json_to_amqp_value, HEADER_TIMEOUT};
use crate::serialization::{self, CONTENT_TYPE_JSON, ENCODING_GZIP, ENCODING_PLAIN};
use crate::otel;
use lapin::{
    options::BasicPublishOptions,
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties, Channel,
};
use opentelemetry::Context;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::error;

/// A fully prepared outbound message.
pub(crate) struct OutboundMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub properties: BasicProperties,
    pub confirm: bool,
    pub mandatory: bool,
    pub immediate: bool,
}

/// Encodes the message body per the call options.
///
/// `skip_serialize` transmits string payloads byte-for-byte; any other
/// payload shape still goes through the JSON encoder since there is no
/// raw-bytes spelling for it.
pub(crate) fn encode_body(
    message: &Value,
    options: &PublishOptions,
) -> Result<Vec<u8>, TransportError> {
    if options.skip_serialize {
        if let Value::String(raw) = message {
            return Ok(raw.clone().into_bytes());
        }
    }

    let content_type = options.content_type.as_deref().unwrap_or(CONTENT_TYPE_JSON);
    let content_encoding = resolved_encoding(options);
    serialization::serialize(message, content_type, content_encoding)
}

pub(crate) fn resolved_encoding(options: &PublishOptions) -> &'static str {
    if options.gzip.unwrap_or(false) {
        ENCODING_GZIP
    } else {
        ENCODING_PLAIN
    }
}

/// Builds the enriched AMQP properties for an outbound message.
///
/// Caller headers come first, then the `timeout` header and the trace
/// context are merged in, so the transport-owned fields always win.
#[allow(clippy::too_many_arguments)]
pub(crate) fn build_properties(
    ctx: &Context,
    app_id: &str,
    options: &PublishOptions,
    timeout_ms: u64,
    correlation_id: Option<&str>,
    reply_to: Option<&str>,
    expiration_ms: Option<u64>,
) -> BasicProperties {
    let mut headers: BTreeMap<ShortString, AMQPValue> = options
        .headers
        .iter()
        .map(|(key, value)| (ShortString::from(key.as_str()), json_to_amqp_value(value)))
        .collect();

    headers.insert(
        ShortString::from(HEADER_TIMEOUT),
        AMQPValue::LongLongInt(timeout_ms as i64),
    );
    otel::inject_context(ctx, &mut headers);

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    let mut properties = BasicProperties::default()
        .with_content_type(ShortString::from(
            options.content_type.as_deref().unwrap_or(CONTENT_TYPE_JSON),
        ))
        .with_content_encoding(ShortString::from(resolved_encoding(options)))
        .with_app_id(ShortString::from(app_id))
        .with_timestamp(timestamp)
        .with_headers(FieldTable::from(headers));

    if let Some(correlation_id) = correlation_id {
        properties = properties.with_correlation_id(ShortString::from(correlation_id));
    }
    if let Some(reply_to) = reply_to {
        properties = properties.with_reply_to(ShortString::from(reply_to));
    }
    if let Some(expiration_ms) = expiration_ms {
        properties = properties.with_expiration(ShortString::from(expiration_ms.to_string()));
    }

    properties
}

/// Publishes a prepared message, waiting for the broker acknowledgement
/// when the caller opted into confirms.
pub(crate) async fn publish_message(
    channel: &Channel,
    message: OutboundMessage,
) -> Result<(), TransportError> {
    let confirm = match channel
        .basic_publish(
            &message.exchange,
            &message.routing_key,
            BasicPublishOptions {
                mandatory: message.mandatory,
                immediate: message.immediate,
            },
            &message.body,
            message.properties,
        )
        .await
    {
        Ok(confirm) => confirm,
        Err(err) => {
            error!(error = err.to_string(), "error publishing message");
            return Err(TransportError::from_lapin(&err));
        }
    };

    if message.confirm {
        match confirm.await {
            Ok(Confirmation::Nack(_)) => {
                return Err(TransportError::Connection {
                    reason: "broker nacked the publish".to_owned(),
                    reply_code: None,
                })
            }
            Ok(_) => {}
            Err(err) => {
                error!(error = err.to_string(), "error awaiting publisher confirm");
                return Err(TransportError::from_lapin(&err));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn body_defaults_to_plain_json() {
        let body = encode_body(&json!({"a": 1}), &PublishOptions::new()).unwrap();
        assert_eq!(body, br#"{"a":1}"#);
    }

    #[test]
    fn gzip_option_compresses() {
        let options = PublishOptions::new().with_gzip();
        let body = encode_body(&json!({"a": "b".repeat(2048)}), &options).unwrap();
        assert!(body.len() < 2048);
        // gzip magic bytes
        assert_eq!(&body[..2], &[0x1f, 0x8b]);
    }

    #[test]
    fn skip_serialize_passes_strings_through() {
        let options = PublishOptions::new().skip_serialize();
        let body = encode_body(&json!("raw payload"), &options).unwrap();
        assert_eq!(body, b"raw payload");
    }

    #[test]
    fn properties_carry_timeout_and_identity() {
        let options = PublishOptions::new().with_header("team", json!("core"));
        let properties = build_properties(
            &Context::new(),
            r#"{"name":"calculator"}"#,
            &options,
            5000,
            Some("corr-1"),
            Some("replies"),
            Some(4500),
        );

        assert_eq!(
            properties.correlation_id().as_ref().unwrap().as_str(),
            "corr-1"
        );
        assert_eq!(properties.reply_to().as_ref().unwrap().as_str(), "replies");
        assert_eq!(properties.expiration().as_ref().unwrap().as_str(), "4500");
        assert_eq!(
            properties.content_type().as_ref().unwrap().as_str(),
            CONTENT_TYPE_JSON
        );

        let headers = properties.headers().as_ref().unwrap();
        assert_eq!(
            headers.inner().get(HEADER_TIMEOUT),
            Some(&AMQPValue::LongLongInt(5000))
        );
        assert_eq!(
            headers.inner().get("team"),
            Some(&AMQPValue::LongString("core".into()))
        );
    }
}
