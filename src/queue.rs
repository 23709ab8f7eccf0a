// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Management
//!
//! This module provides types for defining the queues the transport
//! declares: named worker queues, server-named queues, and the private
//! reply queue. Definitions carry the declaration flags and arguments,
//! including the dead-letter routing the DLX contract requires.

use crate::config::QueueOpts;
use crate::properties::json_to_amqp_value;
use lapin::options::QueueDeclareOptions;
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use std::collections::BTreeMap;

/// Argument for routing dead-lettered messages to an exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";

/// Definition of a queue with its declaration parameters.
///
/// Named queues default to durable and long-lived; unnamed queues are
/// server-named, auto-deleted, and non-durable, which is what short-lived
/// reply consumers want.
#[derive(Debug, Clone, Default)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) auto_delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) passive: bool,
    pub(crate) no_wait: bool,
    pub(crate) arguments: BTreeMap<ShortString, AMQPValue>,
}

impl QueueDefinition {
    /// A durable, non-auto-delete queue with the given name. An empty name
    /// falls back to the server-named rules.
    pub fn named(name: &str) -> QueueDefinition {
        if name.is_empty() {
            return QueueDefinition::anonymous();
        }
        QueueDefinition {
            name: name.to_owned(),
            durable: true,
            ..QueueDefinition::default()
        }
    }

    /// A server-named queue: auto-delete and non-durable.
    pub fn anonymous() -> QueueDefinition {
        QueueDefinition {
            auto_delete: true,
            ..QueueDefinition::default()
        }
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }

    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    pub fn argument(mut self, key: &str, value: AMQPValue) -> Self {
        self.arguments.insert(ShortString::from(key), value);
        self
    }

    /// Routes messages the broker expires or rejects to the given
    /// dead-letter exchange.
    pub fn with_dead_letter_exchange(self, exchange: &str) -> Self {
        self.argument(
            AMQP_HEADERS_DEAD_LETTER_EXCHANGE,
            AMQPValue::LongString(LongString::from(exchange)),
        )
    }

    /// Overlays partial settings from the configuration onto this
    /// definition. Explicit per-call settings stay untouched only for
    /// fields the overlay leaves unset.
    pub fn apply_opts(mut self, opts: &QueueOpts) -> Self {
        if let Some(durable) = opts.durable {
            self.durable = durable;
        }
        if let Some(auto_delete) = opts.auto_delete {
            self.auto_delete = auto_delete;
        }
        if let Some(exclusive) = opts.exclusive {
            self.exclusive = exclusive;
        }
        if let Some(passive) = opts.passive {
            self.passive = passive;
        }
        for (key, value) in &opts.arguments {
            self.arguments
                .insert(ShortString::from(key.as_str()), json_to_amqp_value(value));
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn declare_options(&self) -> QueueDeclareOptions {
        QueueDeclareOptions {
            passive: self.passive,
            durable: self.durable,
            exclusive: self.exclusive,
            auto_delete: self.auto_delete,
            nowait: self.no_wait,
        }
    }

    pub(crate) fn declare_arguments(&self) -> FieldTable {
        FieldTable::from(self.arguments.clone())
    }
}

/// Association of a queue to an exchange under a routing key.
#[derive(Debug, Clone)]
pub struct QueueBinding {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
}

impl QueueBinding {
    pub fn new(queue: &str, exchange: &str, routing_key: &str) -> QueueBinding {
        QueueBinding {
            queue: queue.to_owned(),
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn named_queues_are_durable() {
        let def = QueueDefinition::named("tasks");
        assert!(def.declare_options().durable);
        assert!(!def.declare_options().auto_delete);
    }

    #[test]
    fn unnamed_queues_are_transient() {
        let def = QueueDefinition::named("");
        assert!(!def.declare_options().durable);
        assert!(def.declare_options().auto_delete);
    }

    #[test]
    fn dead_letter_argument_is_set() {
        let def = QueueDefinition::named("tasks").with_dead_letter_exchange("amq.headers");
        let value = def
            .arguments
            .get(&ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE))
            .unwrap();
        assert_eq!(
            value,
            &AMQPValue::LongString(LongString::from("amq.headers"))
        );
    }

    #[test]
    fn config_opts_overlay() {
        let opts: QueueOpts = serde_json::from_value(json!({
            "durable": false,
            "arguments": { "x-max-length": 1000 }
        }))
        .unwrap();

        let def = QueueDefinition::named("tasks").apply_opts(&opts);
        assert!(!def.declare_options().durable);
        assert!(def
            .arguments
            .contains_key(&ShortString::from("x-max-length")));
    }
}
