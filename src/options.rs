// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Per-Call Publish Options
//!
//! Options recognized on every publish/send. Unset fields fall back to the
//! transport-wide defaults from the configuration (`default_opts`), which
//! use the same type; `overlay` performs that merge.

use serde::Deserialize;
use serde_json::{Map, Value};

/// Options for a single publish, send, or RPC call.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PublishOptions {
    /// Override the default exchange for this call
    pub exchange: Option<String>,
    /// Wait for the broker ack before resolving the publish
    pub confirm: Option<bool>,
    /// AMQP `mandatory` publish flag
    pub mandatory: Option<bool>,
    /// AMQP `immediate` publish flag
    pub immediate: Option<bool>,
    /// RPC timeout in milliseconds; also written into the headers
    pub timeout: Option<u64>,
    /// Cache TTL in seconds; enables cache read and write for this call
    pub cache: Option<u64>,
    /// Force gzip content encoding
    pub gzip: Option<bool>,
    /// Transmit the payload as-is, skipping serialization
    pub skip_serialize: bool,
    /// Reuse a specific correlation id instead of generating one
    pub correlation_id: Option<String>,
    /// Override the reply queue name
    pub reply_to: Option<String>,
    /// Resolve with the payload only (default), or `{headers, data}`
    pub simple_response: Option<bool>,
    /// Caller-supplied AMQP headers; timeout and tracing fields are merged
    /// in at publish time
    pub headers: Map<String, Value>,
    /// Override the content type for this call
    pub content_type: Option<String>,
}

impl PublishOptions {
    pub fn new() -> Self {
        PublishOptions::default()
    }

    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = Some(exchange.into());
        self
    }

    pub fn with_confirm(mut self) -> Self {
        self.confirm = Some(true);
        self
    }

    pub fn with_mandatory(mut self) -> Self {
        self.mandatory = Some(true);
        self
    }

    pub fn with_immediate(mut self) -> Self {
        self.immediate = Some(true);
        self
    }

    /// RPC timeout in milliseconds.
    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout = Some(timeout_ms);
        self
    }

    /// Cache TTL in seconds.
    pub fn with_cache(mut self, ttl_secs: u64) -> Self {
        self.cache = Some(ttl_secs);
        self
    }

    pub fn with_gzip(mut self) -> Self {
        self.gzip = Some(true);
        self
    }

    pub fn skip_serialize(mut self) -> Self {
        self.skip_serialize = true;
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_reply_to(mut self, queue: impl Into<String>) -> Self {
        self.reply_to = Some(queue.into());
        self
    }

    pub fn with_simple_response(mut self, simple: bool) -> Self {
        self.simple_response = Some(simple);
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: Value) -> Self {
        self.headers.insert(key.into(), value);
        self
    }

    /// Fills every unset field from `base` and unions headers, keeping
    /// this call's entries on conflict.
    pub fn overlay(mut self, base: &PublishOptions) -> Self {
        self.exchange = self.exchange.or_else(|| base.exchange.clone());
        self.confirm = self.confirm.or(base.confirm);
        self.mandatory = self.mandatory.or(base.mandatory);
        self.immediate = self.immediate.or(base.immediate);
        self.timeout = self.timeout.or(base.timeout);
        self.cache = self.cache.or(base.cache);
        self.gzip = self.gzip.or(base.gzip);
        self.skip_serialize = self.skip_serialize || base.skip_serialize;
        self.correlation_id = self.correlation_id.or_else(|| base.correlation_id.clone());
        self.reply_to = self.reply_to.or_else(|| base.reply_to.clone());
        self.simple_response = self.simple_response.or(base.simple_response);
        self.content_type = self.content_type.or_else(|| base.content_type.clone());
        for (key, value) in &base.headers {
            self.headers
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        self
    }

    /// Whether the caller wants the payload-only response shape.
    pub fn wants_simple_response(&self) -> bool {
        self.simple_response.unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn overlay_prefers_call_site_values() {
        let base = PublishOptions::new()
            .with_timeout(10_000)
            .with_confirm()
            .with_header("team", json!("core"));
        let merged = PublishOptions::new()
            .with_timeout(500)
            .with_header("team", json!("edge"))
            .overlay(&base);

        assert_eq!(merged.timeout, Some(500));
        assert_eq!(merged.confirm, Some(true));
        assert_eq!(merged.headers["team"], json!("edge"));
    }

    #[test]
    fn simple_response_defaults_to_true() {
        assert!(PublishOptions::new().wants_simple_response());
        assert!(!PublishOptions::new()
            .with_simple_response(false)
            .wants_simple_response());
    }
}
