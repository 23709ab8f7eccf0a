// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Transport
//!
//! An opinionated AMQP 0-9-1 transport for microservices: fire-and-forget
//! publishing, request/response RPC with correlation ids and a private
//! reply queue, and long-running consumers that re-establish themselves
//! after broker failures. Connection lifecycle, queue and exchange
//! declaration, serialization, trace propagation, dead-letter demotion,
//! and response caching are handled under the hood.

mod consumer;
mod otel;
mod publisher;

pub mod backoff;
pub mod cache;
pub mod channel;
pub mod config;
pub mod errors;
pub mod events;
pub mod exchange;
pub mod options;
pub mod properties;
pub mod queue;
pub mod reply;
pub mod serialization;
pub mod transport;

pub use crate::channel::ConnectionState;
pub use crate::config::TransportConfig;
pub use crate::consumer::MessageHandler;
pub use crate::errors::TransportError;
pub use crate::events::TransportEvent;
pub use crate::options::PublishOptions;
pub use crate::properties::DeliveryProperties;
pub use crate::transport::AmqpTransport;
