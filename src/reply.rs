// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Reply Storage
//!
//! This module owns the registry of in-flight RPC calls. Each entry pairs a
//! correlation id with a oneshot resolver and an armed timer; whichever of
//! reply arrival, timer expiry, or transport shutdown happens first settles
//! the entry, and settling removes it. After every operation a correlation
//! id is either present with an armed timer or absent with none.

use crate::errors::TransportError;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

/// What a settled RPC call resolves to: the shaped response value, or the
/// error that terminated it.
pub type ReplyOutcome = Result<Value, TransportError>;

/// Per-call bookkeeping recorded at publish time and consulted when the
/// reply arrives.
#[derive(Debug, Clone)]
pub struct ReplyOptions {
    /// Routing key the request went out on
    pub route: String,
    /// Full RPC deadline
    pub timeout: Duration,
    /// Resolve with the payload only, or the full `{headers, data}` record
    pub simple_response: bool,
    /// Cache key when the caller opted into caching
    pub cache_key: Option<u64>,
}

/// An in-flight RPC call: resolver plus its timer.
pub struct PendingReply {
    resolver: oneshot::Sender<ReplyOutcome>,
    timer: tokio::task::JoinHandle<()>,
    pub options: ReplyOptions,
}

impl PendingReply {
    /// Settles the call successfully. The value must already be shaped per
    /// `options.simple_response`.
    pub fn resolve(self, value: Value) {
        self.timer.abort();
        let _ = self.resolver.send(Ok(value));
    }

    /// Settles the call with an error.
    pub fn reject(self, err: TransportError) {
        self.timer.abort();
        let _ = self.resolver.send(Err(err));
    }
}

/// Registry of pending RPC futures keyed by correlation id.
#[derive(Clone, Default)]
pub struct ReplyStorage {
    pending: Arc<Mutex<HashMap<String, PendingReply>>>,
}

impl ReplyStorage {
    pub fn new() -> Self {
        ReplyStorage::default()
    }

    /// Inserts a pending entry and arms its timer. When the timer fires the
    /// entry is rejected with a timeout error and removed. Fails if the
    /// correlation id is already pending.
    pub fn push(
        &self,
        correlation_id: &str,
        options: ReplyOptions,
    ) -> Result<oneshot::Receiver<ReplyOutcome>, TransportError> {
        let (resolver, receiver) = oneshot::channel();

        let mut pending = self.pending.lock().expect("reply storage lock poisoned");
        if pending.contains_key(correlation_id) {
            return Err(TransportError::Validation(format!(
                "correlation id `{correlation_id}` is already pending"
            )));
        }

        let timer = tokio::spawn({
            let storage = self.clone();
            let correlation_id = correlation_id.to_owned();
            let route = options.route.clone();
            let timeout = options.timeout;
            async move {
                tokio::time::sleep(timeout).await;
                debug!(correlation_id, route, "rpc deadline elapsed");
                storage.reject(
                    &correlation_id,
                    TransportError::Timeout {
                        route,
                        timeout_ms: timeout.as_millis() as u64,
                    },
                );
            }
        });

        pending.insert(
            correlation_id.to_owned(),
            PendingReply {
                resolver,
                timer,
                options,
            },
        );

        Ok(receiver)
    }

    /// Atomically removes and returns the entry, cancelling its timer.
    pub fn pop(&self, correlation_id: &str) -> Option<PendingReply> {
        let entry = self
            .pending
            .lock()
            .expect("reply storage lock poisoned")
            .remove(correlation_id)?;
        entry.timer.abort();
        Some(entry)
    }

    /// Rejects the entry with the given error. Does nothing if the id is
    /// not pending.
    pub fn reject(&self, correlation_id: &str, err: TransportError) {
        if let Some(entry) = self.pop(correlation_id) {
            entry.reject(err);
        }
    }

    /// Rejects every pending entry. Used when the transport closes.
    pub fn reject_all(&self, err: TransportError) {
        let drained: Vec<(String, PendingReply)> = {
            let mut pending = self.pending.lock().expect("reply storage lock poisoned");
            pending.drain().collect()
        };
        for (correlation_id, entry) in drained {
            debug!(correlation_id, "rejecting pending reply on shutdown");
            entry.reject(err.clone());
        }
    }

    /// Number of currently pending calls.
    pub fn len(&self) -> usize {
        self.pending.lock().expect("reply storage lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn options(timeout: Duration) -> ReplyOptions {
        ReplyOptions {
            route: "echo".to_owned(),
            timeout,
            simple_response: true,
            cache_key: None,
        }
    }

    #[tokio::test]
    async fn duplicate_correlation_id_is_refused() {
        let storage = ReplyStorage::new();
        let _rx = storage
            .push("id-1", options(Duration::from_secs(5)))
            .unwrap();

        let err = storage
            .push("id-1", options(Duration::from_secs(5)))
            .unwrap_err();
        assert!(matches!(err, TransportError::Validation(_)));
        assert_eq!(storage.len(), 1);
    }

    #[tokio::test]
    async fn pop_and_resolve_settles_the_future() {
        let storage = ReplyStorage::new();
        let rx = storage
            .push("id-1", options(Duration::from_secs(5)))
            .unwrap();

        let entry = storage.pop("id-1").unwrap();
        assert!(entry.options.simple_response);
        entry.resolve(json!({"a": 1}));

        assert_eq!(rx.await.unwrap().unwrap(), json!({"a": 1}));
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn timer_rejects_with_timeout_and_removes_entry() {
        let storage = ReplyStorage::new();
        let rx = storage
            .push("id-1", options(Duration::from_millis(50)))
            .unwrap();

        let outcome = rx.await.unwrap();
        match outcome {
            Err(TransportError::Timeout { route, timeout_ms }) => {
                assert_eq!(route, "echo");
                assert_eq!(timeout_ms, 50);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn pop_cancels_the_timer() {
        let storage = ReplyStorage::new();
        let rx = storage
            .push("id-1", options(Duration::from_millis(50)))
            .unwrap();

        let entry = storage.pop("id-1").unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        // The timer must not have fired; the entry settles however we
        // decide, not with a timeout.
        entry.resolve(json!("late but fine"));
        assert_eq!(rx.await.unwrap().unwrap(), json!("late but fine"));
    }

    #[tokio::test]
    async fn reject_is_idempotent_when_absent() {
        let storage = ReplyStorage::new();
        storage.reject(
            "ghost",
            TransportError::Timeout {
                route: "echo".to_owned(),
                timeout_ms: 1,
            },
        );
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn reject_all_settles_every_pending_call() {
        let storage = ReplyStorage::new();
        let rx1 = storage
            .push("id-1", options(Duration::from_secs(5)))
            .unwrap();
        let rx2 = storage
            .push("id-2", options(Duration::from_secs(5)))
            .unwrap();

        storage.reject_all(TransportError::Connection {
            reason: "transport closed".to_owned(),
            reply_code: None,
        });

        assert!(matches!(
            rx1.await.unwrap(),
            Err(TransportError::Connection { .. })
        ));
        assert!(matches!(
            rx2.await.unwrap(),
            Err(TransportError::Connection { .. })
        ));
        assert!(storage.is_empty());
    }
}
