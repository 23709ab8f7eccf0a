// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Properties
//!
//! This module owns the property vocabulary of the transport: the `appId`
//! identity stamped on outbound messages, the enriched properties record
//! handed to consumer handlers, conversions between AMQP field tables and
//! JSON values, and extraction of the broker's `x-death` trail.

use crate::config::TransportConfig;
use crate::errors::DeathRecord;
use lapin::message::Delivery;
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Header the broker appends each time it dead-letters a message
pub const AMQP_HEADERS_X_DEATH: &str = "x-death";
/// Header carrying the RPC timeout so consumers can budget their work
pub const HEADER_TIMEOUT: &str = "timeout";
/// Header the DLX headers exchange matches reply routing on
pub const HEADER_REPLY_TO: &str = "reply-to";
/// Header the optional headers exchange matches literal routes on
pub const HEADER_ROUTING_KEY: &str = "routing-key";

/// Identity of the publishing process, JSON-encoded into the `appId`
/// message property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppId {
    pub name: String,
    pub host: String,
    pub pid: u32,
    pub utils_version: String,
    pub version: String,
}

impl AppId {
    pub fn new(config: &TransportConfig) -> AppId {
        AppId {
            name: config.name.clone(),
            host: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_owned()),
            pid: std::process::id(),
            utils_version: env!("CARGO_PKG_VERSION").to_owned(),
            version: config.version.clone(),
        }
    }

    /// Serialized form for the `appId` property.
    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Parses an inbound `appId` property. Foreign publishers may stamp
    /// anything here, so failures just yield `None`.
    pub fn parse(raw: &str) -> Option<AppId> {
        serde_json::from_str(raw).ok()
    }
}

/// Enriched properties handed to consumer handlers: the AMQP message
/// properties overlaid with the delivery metadata of the raw frame.
#[derive(Debug, Clone, Default)]
pub struct DeliveryProperties {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub expiration: Option<String>,
    pub app_id: Option<AppId>,
    pub headers: Map<String, Value>,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    pub weight: u16,
    /// Set by handlers to attach AMQP headers to the reply; forwarded
    /// verbatim under the reserved `reply-headers` contract
    pub reply_headers: Option<Map<String, Value>>,
}

impl DeliveryProperties {
    /// Builds the enriched record from a raw delivery.
    pub fn from_delivery(delivery: &Delivery) -> DeliveryProperties {
        let props = &delivery.properties;
        DeliveryProperties {
            content_type: props.content_type().as_ref().map(|v| v.to_string()),
            content_encoding: props.content_encoding().as_ref().map(|v| v.to_string()),
            correlation_id: props.correlation_id().as_ref().map(|v| v.to_string()),
            reply_to: props.reply_to().as_ref().map(|v| v.to_string()),
            expiration: props.expiration().as_ref().map(|v| v.to_string()),
            app_id: props
                .app_id()
                .as_ref()
                .and_then(|raw| AppId::parse(raw.as_str())),
            headers: props
                .headers()
                .as_ref()
                .map(field_table_to_json)
                .unwrap_or_default(),
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
            exchange: delivery.exchange.to_string(),
            routing_key: delivery.routing_key.to_string(),
            weight: 0,
            reply_headers: None,
        }
    }
}

/// Converts a field table into a JSON object.
pub fn field_table_to_json(table: &FieldTable) -> Map<String, Value> {
    table
        .inner()
        .iter()
        .map(|(key, value)| (key.to_string(), amqp_value_to_json(value)))
        .collect()
}

/// Converts a JSON object into a field table.
pub fn json_map_to_field_table(map: &Map<String, Value>) -> FieldTable {
    let entries: BTreeMap<ShortString, AMQPValue> = map
        .iter()
        .map(|(key, value)| (ShortString::from(key.as_str()), json_to_amqp_value(value)))
        .collect();
    FieldTable::from(entries)
}

pub fn amqp_value_to_json(value: &AMQPValue) -> Value {
    match value {
        AMQPValue::Boolean(b) => Value::Bool(*b),
        AMQPValue::ShortShortInt(n) => Value::from(*n),
        AMQPValue::ShortShortUInt(n) => Value::from(*n),
        AMQPValue::ShortInt(n) => Value::from(*n),
        AMQPValue::ShortUInt(n) => Value::from(*n),
        AMQPValue::LongInt(n) => Value::from(*n),
        AMQPValue::LongUInt(n) => Value::from(*n),
        AMQPValue::LongLongInt(n) => Value::from(*n),
        AMQPValue::Float(n) => Value::from(*n),
        AMQPValue::Double(n) => Value::from(*n),
        AMQPValue::ShortString(s) => Value::String(s.to_string()),
        AMQPValue::LongString(s) => {
            Value::String(String::from_utf8_lossy(s.as_bytes()).into_owned())
        }
        AMQPValue::Timestamp(n) => Value::from(*n),
        AMQPValue::FieldArray(items) => {
            Value::Array(items.as_slice().iter().map(amqp_value_to_json).collect())
        }
        AMQPValue::FieldTable(table) => Value::Object(field_table_to_json(table)),
        AMQPValue::ByteArray(bytes) => {
            Value::String(String::from_utf8_lossy(bytes.as_slice()).into_owned())
        }
        AMQPValue::DecimalValue(d) => Value::String(format!("{d:?}")),
        AMQPValue::Void => Value::Null,
    }
}

pub fn json_to_amqp_value(value: &Value) -> AMQPValue {
    match value {
        Value::Null => AMQPValue::Void,
        Value::Bool(b) => AMQPValue::Boolean(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                AMQPValue::LongLongInt(i)
            } else {
                AMQPValue::Double(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => AMQPValue::LongString(LongString::from(s.as_str())),
        Value::Array(items) => {
            AMQPValue::FieldArray(items.iter().map(json_to_amqp_value).collect::<Vec<_>>().into())
        }
        Value::Object(map) => AMQPValue::FieldTable(json_map_to_field_table(map)),
    }
}

/// Extracts the `x-death` trail from message headers. Returns an empty
/// trail when the message never passed through a dead-letter exchange.
pub fn death_trail(headers: &FieldTable) -> Vec<DeathRecord> {
    let Some(value) = headers.inner().get(AMQP_HEADERS_X_DEATH) else {
        return Vec::new();
    };
    let Some(records) = value.as_array() else {
        return Vec::new();
    };

    records
        .as_slice()
        .iter()
        .filter_map(|record| {
            let table = record.as_field_table()?;
            let fields = table.inner();
            let get_str = |key: &str| {
                fields
                    .get(key)
                    .and_then(|v| v.as_long_string())
                    .map(|s| String::from_utf8_lossy(s.as_bytes()).into_owned())
                    .unwrap_or_default()
            };
            let routing_keys = fields
                .get("routing-keys")
                .and_then(|v| v.as_array())
                .map(|keys| {
                    keys.as_slice()
                        .iter()
                        .filter_map(|k| k.as_long_string())
                        .map(|s| String::from_utf8_lossy(s.as_bytes()).into_owned())
                        .collect()
                })
                .unwrap_or_default();

            Some(DeathRecord {
                queue: get_str("queue"),
                reason: get_str("reason"),
                exchange: get_str("exchange"),
                routing_keys,
                count: fields
                    .get("count")
                    .and_then(|v| v.as_long_long_int())
                    .unwrap_or(0),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn app_id_round_trip() {
        let config = TransportConfig {
            name: "calculator".to_owned(),
            version: "1.2.3".to_owned(),
            ..TransportConfig::default()
        };
        let app_id = AppId::new(&config);
        let parsed = AppId::parse(&app_id.encode()).unwrap();
        assert_eq!(parsed.name, "calculator");
        assert_eq!(parsed.version, "1.2.3");
        assert_eq!(parsed.pid, std::process::id());
    }

    #[test]
    fn unparsable_app_id_is_none() {
        assert_eq!(AppId::parse("not json"), None);
    }

    #[test]
    fn json_field_table_round_trip() {
        let map = json!({
            "timeout": 5000,
            "x-match": "any",
            "nested": { "flag": true },
            "tags": ["a", "b"]
        });
        let Value::Object(map) = map else { unreachable!() };

        let table = json_map_to_field_table(&map);
        let back = field_table_to_json(&table);
        assert_eq!(back["timeout"], json!(5000));
        assert_eq!(back["x-match"], json!("any"));
        assert_eq!(back["nested"]["flag"], json!(true));
        assert_eq!(back["tags"], json!(["a", "b"]));
    }

    #[test]
    fn death_trail_extracts_records() {
        let mut death = BTreeMap::new();
        death.insert(
            ShortString::from("queue"),
            AMQPValue::LongString(LongString::from("echo")),
        );
        death.insert(
            ShortString::from("reason"),
            AMQPValue::LongString(LongString::from("expired")),
        );
        death.insert(
            ShortString::from("exchange"),
            AMQPValue::LongString(LongString::from("amq.topic")),
        );
        death.insert(
            ShortString::from("count"),
            AMQPValue::LongLongInt(2),
        );
        death.insert(
            ShortString::from("routing-keys"),
            AMQPValue::FieldArray(
                vec![AMQPValue::LongString(LongString::from("echo"))].into(),
            ),
        );

        let mut headers = BTreeMap::new();
        headers.insert(
            ShortString::from(AMQP_HEADERS_X_DEATH),
            AMQPValue::FieldArray(
                vec![AMQPValue::FieldTable(FieldTable::from(death))].into(),
            ),
        );

        let trail = death_trail(&FieldTable::from(headers));
        assert_eq!(trail.len(), 1);
        assert_eq!(trail[0].queue, "echo");
        assert_eq!(trail[0].reason, "expired");
        assert_eq!(trail[0].count, 2);
        assert_eq!(trail[0].routing_keys, vec!["echo"]);
    }

    #[test]
    fn missing_x_death_yields_empty_trail() {
        assert!(death_trail(&FieldTable::default()).is_empty());
    }
}
