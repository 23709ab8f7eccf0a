// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the AMQP Transport
//!
//! This module provides the error taxonomy for the transport. The
//! `TransportError` enum covers every failure kind the transport surfaces:
//! caller mistakes, lifecycle misuse, recoverable broker failures, RPC
//! timeouts, dead-lettered requests, and errors revived from remote peers.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single entry of the broker's `x-death` header, recorded each time a
/// message is dead-lettered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeathRecord {
    /// Queue the message was dead-lettered from
    pub queue: String,
    /// Why the broker dead-lettered it (`expired`, `rejected`, `maxlen`)
    pub reason: String,
    /// Exchange the message was originally published to
    pub exchange: String,
    /// Routing keys the message carried
    pub routing_keys: Vec<String>,
    /// How many times this queue dead-lettered the message
    pub count: i64,
}

/// Represents errors that can occur while operating the transport.
///
/// Recoverable variants (`Connection` with a benign reply code, consumer
/// cancellation) drive backoff-delayed re-establishment; the remaining
/// variants reach the caller that owns the failed operation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    /// Bad caller input: missing `reply_to`/`correlation_id` on a reply,
    /// unsupported content type, malformed route
    #[error("validation failure: {0}")]
    Validation(String),

    /// A lifecycle method was called in the wrong state
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// A lower-level declare/bind/publish/consume failure the transport
    /// will retry where re-establishment applies
    #[error("connection failure: {reason}")]
    Connection {
        reason: String,
        /// AMQP reply code when the broker reported one
        reply_code: Option<u16>,
    },

    /// A reply arrived for a correlation id we cannot route back
    #[error("no recipient for correlation id `{correlation_id}`")]
    NotPermitted { correlation_id: String },

    /// The RPC deadline elapsed before a reply arrived
    #[error("no response within {timeout_ms}ms on route `{route}`")]
    Timeout { route: String, timeout_ms: u64 },

    /// The request came back through the dead-letter exchange
    #[error("request dead-lettered: {reason}")]
    Dlx {
        reason: String,
        /// The broker's `x-death` trail, newest record first
        trail: Vec<DeathRecord>,
    },

    /// Payload deserialization failed; surfaced as data, never thrown
    /// across the router
    #[error("failure to parse payload: {0}")]
    Parse(String),

    /// Bad handler or listen shape
    #[error("bad argument: {0}")]
    Argument(String),

    /// An error returned by a remote handler, revived from its wire shape
    #[error("{kind}: {message}")]
    Remote {
        /// The remote error kind name, e.g. `ValidationError`
        kind: String,
        message: String,
        code: Option<String>,
        /// The remote stack, when the peer attached one
        stack: Option<String>,
        /// AMQP headers of the reply that carried this error
        reply_headers: Option<serde_json::Value>,
    },
}

impl TransportError {
    /// The AMQP reply code attached to this error, if any.
    pub fn reply_code(&self) -> Option<u16> {
        match self {
            TransportError::Connection { reply_code, .. } => *reply_code,
            _ => None,
        }
    }

    /// Whether re-establishment machinery should retry after this error.
    ///
    /// Declaration conflicts (406) are benign and not retried; caller
    /// mistakes and terminal RPC outcomes are never retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Connection { reply_code, .. } => *reply_code != Some(406),
            TransportError::Validation(_)
            | TransportError::InvalidOperation(_)
            | TransportError::NotPermitted { .. }
            | TransportError::Timeout { .. }
            | TransportError::Dlx { .. }
            | TransportError::Parse(_)
            | TransportError::Argument(_)
            | TransportError::Remote { .. } => false,
        }
    }

    /// Builds a `Connection` error from a lapin failure, preserving the
    /// broker reply code when the failure carries one.
    pub fn from_lapin(err: &lapin::Error) -> Self {
        TransportError::Connection {
            reason: err.to_string(),
            reply_code: amqp_reply_code(err),
        }
    }
}

/// Extracts the numeric AMQP reply code from a lapin error, when the error
/// is a protocol-level failure reported by the broker.
pub fn amqp_reply_code(err: &lapin::Error) -> Option<u16> {
    match err {
        lapin::Error::ProtocolError(amqp) => Some(amqp.get_id()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_error_carries_reply_code() {
        let err = TransportError::Connection {
            reason: "NOT_FOUND - no queue 'echo'".to_owned(),
            reply_code: Some(404),
        };
        assert_eq!(err.reply_code(), Some(404));
        assert!(err.is_retryable());
    }

    #[test]
    fn precondition_failed_is_not_retryable() {
        let err = TransportError::Connection {
            reason: "PRECONDITION_FAILED".to_owned(),
            reply_code: Some(406),
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn terminal_outcomes_are_not_retryable() {
        let timeout = TransportError::Timeout {
            route: "echo".to_owned(),
            timeout_ms: 200,
        };
        let dlx = TransportError::Dlx {
            reason: "expired".to_owned(),
            trail: vec![],
        };
        assert!(!timeout.is_retryable());
        assert!(!dlx.is_retryable());
        assert_eq!(timeout.reply_code(), None);
    }
}
