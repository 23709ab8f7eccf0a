// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Management
//!
//! This module provides types for defining the exchanges the transport
//! manages: the default topic exchange messages fan out on, the optional
//! headers exchange used for literal-route bindings, and the dead-letter
//! exchange expired requests return through.

use crate::config::ExchangeArgs;
use crate::errors::TransportError;
use lapin::types::{AMQPValue, FieldTable, ShortString};
use std::collections::BTreeMap;

/// Exchange types the transport declares.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExchangeKind {
    Direct,
    Fanout,
    #[default]
    Topic,
    Headers,
}

impl ExchangeKind {
    /// Parses the configuration spelling of an exchange type.
    pub fn parse(kind: &str) -> Result<ExchangeKind, TransportError> {
        match kind {
            "direct" => Ok(ExchangeKind::Direct),
            "fanout" => Ok(ExchangeKind::Fanout),
            "topic" => Ok(ExchangeKind::Topic),
            "headers" => Ok(ExchangeKind::Headers),
            other => Err(TransportError::Validation(format!(
                "unknown exchange type `{other}`"
            ))),
        }
    }
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> lapin::ExchangeKind {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
        }
    }
}

/// Definition of an exchange with its declaration parameters.
#[derive(Debug, Clone, Default)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) durable: bool,
    pub(crate) auto_delete: bool,
    pub(crate) internal: bool,
    pub(crate) passive: bool,
    pub(crate) no_wait: bool,
    pub(crate) params: BTreeMap<ShortString, AMQPValue>,
}

impl ExchangeDefinition {
    /// Creates a topic exchange definition with the given name.
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            ..ExchangeDefinition::default()
        }
    }

    /// Builds a definition from a configured name and argument block.
    pub fn from_args(name: &str, args: &ExchangeArgs) -> Result<ExchangeDefinition, TransportError> {
        let mut def = ExchangeDefinition::new(name).kind(ExchangeKind::parse(&args.kind)?);
        def.durable = args.durable;
        def.auto_delete = args.auto_delete;
        Ok(def)
    }

    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    pub fn param(mut self, key: ShortString, value: AMQPValue) -> Self {
        self.params.insert(key, value);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn declare_options(&self) -> lapin::options::ExchangeDeclareOptions {
        lapin::options::ExchangeDeclareOptions {
            passive: self.passive,
            durable: self.durable,
            auto_delete: self.auto_delete,
            internal: self.internal,
            nowait: self.no_wait,
        }
    }

    pub(crate) fn arguments(&self) -> FieldTable {
        FieldTable::from(self.params.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_configured_kinds() {
        assert_eq!(ExchangeKind::parse("topic").unwrap(), ExchangeKind::Topic);
        assert_eq!(
            ExchangeKind::parse("headers").unwrap(),
            ExchangeKind::Headers
        );
        assert!(ExchangeKind::parse("x-delayed-message").is_err());
    }

    #[test]
    fn from_args_carries_flags() {
        let args = ExchangeArgs {
            kind: "headers".to_owned(),
            durable: true,
            auto_delete: false,
        };
        let def = ExchangeDefinition::from_args("amq.match", &args).unwrap();
        assert_eq!(def.kind, ExchangeKind::Headers);
        assert!(def.declare_options().durable);
        assert!(!def.declare_options().auto_delete);
    }
}
