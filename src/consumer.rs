// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Routing Adapter
//!
//! This module turns raw deliveries into handler invocations. For every
//! inbound message it starts the server-side span, decodes the body,
//! enriches the properties with the delivery metadata, and dispatches the
//! user handler on a fresh task so handler work never runs on the I/O
//! callback. The handler's outcome either becomes a reply (when the
//! message asked for one) or an `after` audit event.

use crate::errors::TransportError;
use crate::events::TransportEvent;
use crate::otel;
use crate::properties::DeliveryProperties;
use crate::serialization;
use crate::transport::AmqpTransport;
use async_trait::async_trait;
use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicNackOptions};
use opentelemetry::trace::{Span, Status};
use serde_json::Value;
use std::borrow::Cow;
use std::sync::Arc;
use tracing::error;

/// User-side seam for consumed queues.
///
/// The returned value becomes the reply payload when the inbound message
/// carried `reply_to` and `correlation_id`; a returned error crosses the
/// wire in its marshaled form. Handlers may set
/// `properties.reply_headers` to attach AMQP headers to the reply.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(
        &self,
        message: Value,
        properties: &mut DeliveryProperties,
    ) -> Result<Value, TransportError>;
}

/// Routes one delivery through span creation, decoding, enrichment, and
/// handler dispatch.
pub(crate) fn consume(
    transport: AmqpTransport,
    delivery: Delivery,
    handler: Arc<dyn MessageHandler>,
    manual_ack: bool,
) {
    let properties = DeliveryProperties::from_delivery(&delivery);
    let routing_key = properties.routing_key.clone();

    transport.emit(TransportEvent::Pre {
        routing_key: routing_key.clone(),
    });

    let (_ctx, span) = otel::consumer_span(
        &delivery.properties,
        transport.tracer(),
        &routing_key,
        properties.app_id.as_ref(),
    );

    let message = serialization::deserialize(
        &delivery.data,
        properties.content_type.as_deref(),
        properties.content_encoding.as_deref(),
    );

    // Fresh task: the consumer stream loop moves on to the next delivery
    // while the handler runs.
    tokio::spawn(async move {
        let mut span = span;
        let mut properties = properties;
        let result = handler.handle(message, &mut properties).await;
        let failed = result.is_err();

        if properties.reply_to.is_some() && properties.correlation_id.is_some() {
            if let Err(err) = transport.reply(&properties, result).await {
                error!(
                    error = err.to_string(),
                    routing_key = properties.routing_key,
                    "error publishing reply"
                );
                span.set_status(Status::Error {
                    description: Cow::from("error to publish reply"),
                });
            }
        } else {
            transport.emit(TransportEvent::After {
                routing_key: properties.routing_key.clone(),
                correlation_id: properties.correlation_id.clone(),
            });
        }

        if manual_ack {
            if failed {
                if let Err(e) = delivery
                    .nack(BasicNackOptions {
                        multiple: false,
                        requeue: false,
                    })
                    .await
                {
                    error!("error whiling nack msg");
                    span.record_error(&e);
                }
            } else if let Err(e) = delivery.ack(BasicAckOptions { multiple: false }).await {
                error!("error whiling ack msg");
                span.record_error(&e);
            }
        }

        if failed {
            span.set_status(Status::Error {
                description: Cow::from("handler failed"),
            });
        } else {
            span.set_status(Status::Ok);
        }
        span.end();
    });
}
