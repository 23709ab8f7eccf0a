// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Transport Core
//!
//! This module owns the connection lifecycle and everything that hangs off
//! it: the private reply queue RPC replies arrive on, the registry of
//! consumed queues that re-establish themselves after broker failures, the
//! publish/send surface, and the correlation machinery that turns a
//! publish into an awaitable response.
//!
//! All transport state (connection handles, the reply queue tri-state, the
//! consumer registry) is mutated under short-lived locks that are never
//! held across suspension points; user handlers always run outside them.

use crate::backoff::BackoffPolicy;
use crate::cache::{CachedResponse, ResponseCache};
use crate::channel::{new_amqp_channel, ConnectionState};
use crate::config::{QueueOpts, TransportConfig};
use crate::consumer::{self, MessageHandler};
use crate::errors::{amqp_reply_code, TransportError};
use crate::events::{EventBus, TransportEvent};
use crate::exchange::ExchangeDefinition;
use crate::options::PublishOptions;
use crate::properties::{
    death_trail, AppId, DeliveryProperties, HEADER_REPLY_TO, HEADER_ROUTING_KEY,
};
use crate::publisher::{self, OutboundMessage};
use crate::queue::QueueDefinition;
use crate::reply::{ReplyOptions, ReplyStorage};
use crate::serialization::{self, WireError};
use futures_util::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicCancelOptions, BasicConsumeOptions, BasicQosOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{Channel, Connection};
use opentelemetry::global::BoxedTracer;
use opentelemetry::Context;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Prefix of generated private reply queue names
const PRIVATE_QUEUE_PREFIX: &str = "microfleet";

/// State of the private reply queue.
///
/// `Unknown` means nobody asked for it yet, `Pending` means creation is in
/// flight, and `Ready` carries the queue name RPC callers publish their
/// `reply_to` with.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ReplyTo {
    Unknown,
    Pending,
    Ready(String),
}

/// Private queue bookkeeping, mutated as one unit: the tri-state callers
/// gate on, and whether a creation task is currently alive. Tracking the
/// creator separately keeps a stale `Pending` (set when a connection
/// failure invalidates the queue) from masking the need to re-create it.
struct PrivateQueueState {
    reply_to: ReplyTo,
    creating: bool,
}

struct Handles {
    connection: Arc<Connection>,
    channel: Arc<Channel>,
}

/// A registered consumed queue: everything needed to re-run its
/// establishment after a broker failure.
struct ConsumerBinding {
    queue: QueueDefinition,
    routes: Vec<String>,
    handler: Arc<dyn MessageHandler>,
    neck: Option<u16>,
    consumer_tag: Option<String>,
    queue_name: Option<String>,
    attempt: u32,
}

/// Result of `create_queue`.
pub struct CreatedQueue {
    pub queue: String,
    pub consumer_tag: Option<String>,
}

struct TransportInner {
    config: TransportConfig,
    app_id: String,
    tracer: BoxedTracer,
    state: Mutex<ConnectionState>,
    handles: Mutex<Option<Handles>>,
    private_queue: Mutex<PrivateQueueState>,
    /// Private queue name remembered across reconnects
    private_name: Mutex<Option<String>>,
    replies: ReplyStorage,
    cache: ResponseCache,
    events: EventBus,
    bindings: Mutex<HashMap<u64, ConsumerBinding>>,
    next_binding_id: AtomicU64,
    lifecycle_tx: mpsc::UnboundedSender<lapin::Error>,
    lifecycle_rx: Mutex<Option<mpsc::UnboundedReceiver<lapin::Error>>>,
    watcher_started: AtomicBool,
}

/// The AMQP transport: fire-and-forget publishing, correlated RPC, and
/// self-healing consumers over one broker connection.
#[derive(Clone)]
pub struct AmqpTransport {
    inner: Arc<TransportInner>,
}

impl AmqpTransport {
    pub fn new(config: TransportConfig) -> AmqpTransport {
        let app_id = AppId::new(&config).encode();
        let cache = ResponseCache::new(config.cache);
        let (lifecycle_tx, lifecycle_rx) = mpsc::unbounded_channel();

        AmqpTransport {
            inner: Arc::new(TransportInner {
                app_id,
                cache,
                config,
                tracer: opentelemetry::global::tracer("amqp-transport"),
                state: Mutex::new(ConnectionState::Closed),
                handles: Mutex::new(None),
                private_queue: Mutex::new(PrivateQueueState {
                    reply_to: ReplyTo::Unknown,
                    creating: false,
                }),
                private_name: Mutex::new(None),
                replies: ReplyStorage::new(),
                events: EventBus::default(),
                bindings: Mutex::new(HashMap::new()),
                next_binding_id: AtomicU64::new(1),
                lifecycle_tx,
                lifecycle_rx: Mutex::new(Some(lifecycle_rx)),
                watcher_started: AtomicBool::new(false),
            }),
        }
    }

    /// Subscribes to transport events.
    pub fn events(&self) -> tokio::sync::broadcast::Receiver<TransportEvent> {
        self.inner.events.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock().expect("state lock poisoned")
    }

    pub(crate) fn emit(&self, event: TransportEvent) {
        self.inner.events.emit(event);
    }

    pub(crate) fn tracer(&self) -> &BoxedTracer {
        &self.inner.tracer
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Dials the broker and wires the lifecycle handlers.
    ///
    /// Refuses to run while a connection is opening, open, or being
    /// re-established. When the configuration asks for a private queue, or
    /// a prior reply queue name is remembered, its creation starts
    /// immediately after the connection opens.
    pub async fn connect(&self) -> Result<(), TransportError> {
        {
            let mut state = self.inner.state.lock().expect("state lock poisoned");
            match *state {
                ConnectionState::Closed => *state = ConnectionState::Opening,
                current => {
                    return Err(TransportError::InvalidOperation(format!(
                        "connect called while {current:?}"
                    )))
                }
            }
        }

        match new_amqp_channel(&self.inner.config).await {
            Ok((connection, channel)) => {
                self.install_connection(connection, channel);
                self.set_state(ConnectionState::Open);
                info!("amqp transport connected");
                self.emit(TransportEvent::Ready);
                self.after_open();
                Ok(())
            }
            Err(err) => {
                self.set_state(ConnectionState::Closed);
                Err(err)
            }
        }
    }

    /// Closes the transport: every pending RPC is rejected with a
    /// connection error, consumers are cancelled, and the broker
    /// connection is shut down.
    pub async fn close(&self) -> Result<(), TransportError> {
        {
            let mut state = self.inner.state.lock().expect("state lock poisoned");
            if *state == ConnectionState::Closed {
                return Err(TransportError::InvalidOperation(
                    "close called while closed".to_owned(),
                ));
            }
            *state = ConnectionState::Closed;
        }

        self.inner.replies.reject_all(TransportError::Connection {
            reason: "transport closed".to_owned(),
            reply_code: None,
        });

        let tags: Vec<String> = {
            let mut bindings = self.inner.bindings.lock().expect("bindings lock poisoned");
            let tags = bindings
                .values()
                .filter_map(|binding| binding.consumer_tag.clone())
                .collect();
            bindings.clear();
            tags
        };

        let handles = self
            .inner
            .handles
            .lock()
            .expect("handles lock poisoned")
            .take();
        if let Some(handles) = handles {
            for tag in tags {
                let _ = handles
                    .channel
                    .basic_cancel(&tag, BasicCancelOptions::default())
                    .await;
            }
            if let Err(err) = handles.connection.close(200, "").await {
                debug!(error = err.to_string(), "error closing connection");
            }
        }

        self.inner
            .private_queue
            .lock()
            .expect("private queue lock poisoned")
            .reply_to = ReplyTo::Unknown;
        *self
            .inner
            .private_name
            .lock()
            .expect("private_name lock poisoned") = None;

        self.emit(TransportEvent::Close { error: None });
        Ok(())
    }

    fn set_state(&self, state: ConnectionState) {
        *self.inner.state.lock().expect("state lock poisoned") = state;
    }

    fn install_connection(&self, connection: Arc<Connection>, channel: Arc<Channel>) {
        let lifecycle_tx = self.inner.lifecycle_tx.clone();
        connection.on_error(move |err| {
            let _ = lifecycle_tx.send(err);
        });

        *self.inner.handles.lock().expect("handles lock poisoned") = Some(Handles {
            connection,
            channel,
        });

        if !self.inner.watcher_started.swap(true, Ordering::SeqCst) {
            let rx = self
                .inner
                .lifecycle_rx
                .lock()
                .expect("lifecycle lock poisoned")
                .take();
            if let Some(mut rx) = rx {
                let transport = self.clone();
                tokio::spawn(async move {
                    while let Some(err) = rx.recv().await {
                        transport.handle_connection_failure(err).await;
                    }
                });
            }
        }
    }

    /// Post-connect work shared by first connect and reconnects: private
    /// queue re-creation and one `establish_consumer` run per binding.
    fn after_open(&self) {
        let wants_private = self.inner.config.private
            || self
                .inner
                .private_name
                .lock()
                .expect("private_name lock poisoned")
                .is_some();
        if wants_private {
            self.request_private_queue();
        }

        let ids: Vec<u64> = self
            .inner
            .bindings
            .lock()
            .expect("bindings lock poisoned")
            .keys()
            .copied()
            .collect();
        for id in ids {
            let transport = self.clone();
            tokio::spawn(async move {
                transport.establish_with_retry(id, 0).await;
            });
        }
    }

    async fn handle_connection_failure(&self, err: lapin::Error) {
        {
            let mut state = self.inner.state.lock().expect("state lock poisoned");
            if *state != ConnectionState::Open {
                return;
            }
            *state = ConnectionState::Reconnecting;
        }
        error!(error = err.to_string(), "amqp connection failure");
        self.emit(TransportEvent::Close {
            error: Some(err.to_string()),
        });

        {
            let mut private = self
                .inner
                .private_queue
                .lock()
                .expect("private queue lock poisoned");
            if matches!(private.reply_to, ReplyTo::Ready(_)) {
                private.reply_to = ReplyTo::Pending;
            }
        }

        let policy = self.inner.config.recovery.consumed;
        let mut attempt: u32 = 1;
        loop {
            tokio::time::sleep(policy.delay(attempt)).await;
            if self.state() != ConnectionState::Reconnecting {
                return;
            }

            match new_amqp_channel(&self.inner.config).await {
                Ok((connection, channel)) => {
                    self.install_connection(connection, channel);
                    self.set_state(ConnectionState::Open);
                    info!(attempt, "amqp transport reconnected");
                    self.emit(TransportEvent::Ready);
                    self.after_open();
                    return;
                }
                Err(err) => {
                    warn!(
                        error = err.to_string(),
                        attempt, "reconnect attempt failed"
                    );
                    attempt += 1;
                }
            }
        }
    }

    fn channel(&self) -> Result<Arc<Channel>, TransportError> {
        self.inner
            .handles
            .lock()
            .expect("handles lock poisoned")
            .as_ref()
            .map(|handles| handles.channel.clone())
            .ok_or_else(|| TransportError::InvalidOperation("transport is not connected".to_owned()))
    }

    /// Opens a replacement channel on the live connection. Needed after a
    /// declaration conflict, which closes the channel it happened on.
    async fn recreate_channel(&self) -> Result<Arc<Channel>, TransportError> {
        let connection = self
            .inner
            .handles
            .lock()
            .expect("handles lock poisoned")
            .as_ref()
            .map(|handles| handles.connection.clone())
            .ok_or_else(|| {
                TransportError::InvalidOperation("transport is not connected".to_owned())
            })?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|err| TransportError::from_lapin(&err))?;
        channel
            .confirm_select(lapin::options::ConfirmSelectOptions::default())
            .await
            .map_err(|err| TransportError::from_lapin(&err))?;

        let channel = Arc::new(channel);
        if let Some(handles) = self
            .inner
            .handles
            .lock()
            .expect("handles lock poisoned")
            .as_mut()
        {
            handles.channel = channel.clone();
        }
        Ok(channel)
    }

    // ------------------------------------------------------------------
    // Declarations
    // ------------------------------------------------------------------

    /// Declares a queue, tolerating a definition conflict: on 406 the
    /// server's existing queue wins and is used as-is.
    async fn declare_queue(&self, definition: &QueueDefinition) -> Result<String, TransportError> {
        let channel = self.channel()?;
        match channel
            .queue_declare(
                definition.name(),
                definition.declare_options(),
                definition.declare_arguments(),
            )
            .await
        {
            Ok(queue) => Ok(queue.name().to_string()),
            Err(err) if amqp_reply_code(&err) == Some(406) => {
                warn!(
                    error = err.to_string(),
                    queue = definition.name(),
                    "queue already exists with a different definition, using the server's"
                );
                let channel = self.recreate_channel().await?;
                let queue = channel
                    .queue_declare(
                        definition.name(),
                        QueueDeclareOptions {
                            passive: true,
                            ..QueueDeclareOptions::default()
                        },
                        FieldTable::default(),
                    )
                    .await
                    .map_err(|err| TransportError::from_lapin(&err))?;
                Ok(queue.name().to_string())
            }
            Err(err) => Err(TransportError::from_lapin(&err)),
        }
    }

    /// Declares an exchange with the same conflict tolerance as
    /// `declare_queue`. A 403 means a broker-reserved name (`amq.*`);
    /// those exchanges exist on every broker, so the declaration is
    /// skipped and the exchange used as-is.
    async fn declare_exchange(
        &self,
        definition: &ExchangeDefinition,
    ) -> Result<(), TransportError> {
        let channel = self.channel()?;
        match channel
            .exchange_declare(
                definition.name(),
                definition.kind.into(),
                definition.declare_options(),
                definition.arguments(),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(err) if matches!(amqp_reply_code(&err), Some(403) | Some(406)) => {
                warn!(
                    error = err.to_string(),
                    exchange = definition.name(),
                    "exchange declaration refused, using the server's definition"
                );
                self.recreate_channel().await?;
                Ok(())
            }
            Err(err) => Err(TransportError::from_lapin(&err)),
        }
    }

    /// Declares a queue and optionally opens a consumer on it.
    ///
    /// Unnamed definitions come back with the server-generated name. The
    /// DLX argument and configured queue defaults are merged in before
    /// declaration.
    pub async fn create_queue(
        &self,
        definition: QueueDefinition,
        handler: Option<Arc<dyn MessageHandler>>,
        neck: Option<u16>,
    ) -> Result<CreatedQueue, TransportError> {
        let definition = self.finalize_queue(definition);
        let queue = self.declare_queue(&definition).await?;

        let consumer_tag = match handler {
            Some(handler) => Some(self.open_consumer(&queue, handler, neck, None).await?),
            None => None,
        };

        Ok(CreatedQueue {
            queue,
            consumer_tag,
        })
    }

    fn finalize_queue(&self, definition: QueueDefinition) -> QueueDefinition {
        let mut definition = definition.apply_opts(&self.inner.config.default_queue_opts);
        if self.inner.config.dlx.enabled {
            definition =
                definition.with_dead_letter_exchange(&self.inner.config.dlx.params.exchange);
        }
        definition
    }

    async fn open_consumer(
        &self,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
        neck: Option<u16>,
        binding_id: Option<u64>,
    ) -> Result<String, TransportError> {
        let channel = self.channel()?;
        if let Some(prefetch) = neck {
            channel
                .basic_qos(prefetch, BasicQosOptions::default())
                .await
                .map_err(|err| TransportError::from_lapin(&err))?;
        }

        let tag = format!("{}-{}", self.inner.config.name, Uuid::new_v4());
        let consumer = channel
            .basic_consume(
                queue,
                &tag,
                BasicConsumeOptions {
                    no_ack: neck.is_none(),
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| TransportError::from_lapin(&err))?;

        self.spawn_consumer_loop(binding_id, consumer, tag.clone(), handler, neck.is_some());
        Ok(tag)
    }

    // ------------------------------------------------------------------
    // Consumed queues
    // ------------------------------------------------------------------

    /// Registers a long-running consumer and establishes it.
    ///
    /// The binding survives broker failures: every `ready` of the
    /// connection re-runs establishment, rebinding all remembered routes.
    /// Establishment failures retry in the background with the `consumed`
    /// backoff; caller mistakes (a wildcard route in headers-binding mode,
    /// a definition conflict) fail here.
    pub async fn create_consumed_queue(
        &self,
        handler: Arc<dyn MessageHandler>,
        routes: Vec<String>,
        overrides: Option<QueueOpts>,
    ) -> Result<u64, TransportError> {
        let routes = if routes.is_empty() {
            self.inner.config.listen.clone()
        } else {
            routes
        };
        if routes.is_empty() {
            return Err(TransportError::Argument(
                "a consumed queue needs at least one route".to_owned(),
            ));
        }
        if self.inner.config.bind_persistent_queue_to_headers_exchange {
            validate_literal_routes(&routes)?;
        }

        let mut definition = QueueDefinition::named(&self.inner.config.queue);
        if let Some(overrides) = overrides {
            definition = definition.apply_opts(&overrides);
        }

        let id = self.inner.next_binding_id.fetch_add(1, Ordering::SeqCst);
        self.inner
            .bindings
            .lock()
            .expect("bindings lock poisoned")
            .insert(
                id,
                ConsumerBinding {
                    queue: definition,
                    routes: dedup_routes(routes),
                    handler,
                    neck: self.inner.config.neck,
                    consumer_tag: None,
                    queue_name: None,
                    attempt: 0,
                },
            );

        match self.establish_consumer(id).await {
            Ok(()) => Ok(id),
            Err(err) if err.is_retryable() => {
                warn!(
                    error = err.to_string(),
                    binding = id,
                    "initial consumer establishment failed, retrying in the background"
                );
                let transport = self.clone();
                tokio::spawn(async move {
                    transport.establish_with_retry(id, 1).await;
                });
                Ok(id)
            }
            Err(err) => {
                self.inner
                    .bindings
                    .lock()
                    .expect("bindings lock poisoned")
                    .remove(&id);
                Err(err)
            }
        }
    }

    /// Adds routes to an existing consumed queue. New routes are bound
    /// immediately when a consumer is live and are remembered, so every
    /// re-establishment rebinds them too.
    pub async fn add_routes(
        &self,
        binding_id: u64,
        routes: Vec<String>,
    ) -> Result<(), TransportError> {
        if self.inner.config.bind_persistent_queue_to_headers_exchange {
            validate_literal_routes(&routes)?;
        }

        let (added, queue_name) = {
            let mut bindings = self.inner.bindings.lock().expect("bindings lock poisoned");
            let binding = bindings.get_mut(&binding_id).ok_or_else(|| {
                TransportError::InvalidOperation(format!("unknown binding {binding_id}"))
            })?;
            let mut added = Vec::new();
            for route in routes {
                if !binding.routes.contains(&route) {
                    binding.routes.push(route.clone());
                    added.push(route);
                }
            }
            (added, binding.queue_name.clone())
        };

        if added.is_empty() {
            return Ok(());
        }

        if let Some(queue_name) = queue_name {
            let channel = self.channel()?;
            for route in &added {
                channel
                    .queue_bind(
                        &queue_name,
                        &self.inner.config.exchange,
                        route,
                        QueueBindOptions::default(),
                        FieldTable::default(),
                    )
                    .await
                    .map_err(|err| TransportError::from_lapin(&err))?;
            }
        }
        Ok(())
    }

    /// One establishment run for a binding: close the predecessor, declare
    /// the queue and exchanges, bind every remembered route, and open the
    /// consumer.
    async fn establish_consumer(&self, binding_id: u64) -> Result<(), TransportError> {
        let (definition, routes, handler, neck, prior_tag) = {
            let mut bindings = self.inner.bindings.lock().expect("bindings lock poisoned");
            let binding = bindings.get_mut(&binding_id).ok_or_else(|| {
                TransportError::InvalidOperation(format!("unknown binding {binding_id}"))
            })?;
            let prior_tag = binding.consumer_tag.take();
            (
                self.finalize_queue(binding.queue.clone()),
                binding.routes.clone(),
                binding.handler.clone(),
                binding.neck,
                prior_tag,
            )
        };

        // Replacement is atomic with closure of the predecessor: the tag is
        // already cleared, so its loop exits silently once cancelled.
        if let Some(tag) = prior_tag {
            if let Ok(channel) = self.channel() {
                let _ = channel
                    .basic_cancel(&tag, BasicCancelOptions::default())
                    .await;
            }
        }

        let queue_name = self.declare_queue(&definition).await?;

        let exchange = ExchangeDefinition::from_args(
            &self.inner.config.exchange,
            &self.inner.config.exchange_args,
        )?;
        self.declare_exchange(&exchange).await?;

        let channel = self.channel()?;
        for route in &routes {
            channel
                .queue_bind(
                    &queue_name,
                    &self.inner.config.exchange,
                    route,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|err| TransportError::from_lapin(&err))?;
        }

        if self.inner.config.bind_persistent_queue_to_headers_exchange {
            validate_literal_routes(&routes)?;
            let headers_exchange = ExchangeDefinition::from_args(
                &self.inner.config.headers_exchange.exchange,
                &self.inner.config.headers_exchange.args,
            )?;
            self.declare_exchange(&headers_exchange).await?;

            let channel = self.channel()?;
            for route in &routes {
                let mut arguments: BTreeMap<ShortString, AMQPValue> = BTreeMap::new();
                arguments.insert(
                    ShortString::from("x-match"),
                    AMQPValue::LongString(LongString::from("any")),
                );
                arguments.insert(
                    ShortString::from(HEADER_ROUTING_KEY),
                    AMQPValue::LongString(LongString::from(route.as_str())),
                );
                channel
                    .queue_bind(
                        &queue_name,
                        &self.inner.config.headers_exchange.exchange,
                        route,
                        QueueBindOptions::default(),
                        FieldTable::from(arguments),
                    )
                    .await
                    .map_err(|err| TransportError::from_lapin(&err))?;
            }
        }

        let tag = self
            .open_consumer(&queue_name, handler, neck, Some(binding_id))
            .await?;

        {
            let mut bindings = self.inner.bindings.lock().expect("bindings lock poisoned");
            if let Some(binding) = bindings.get_mut(&binding_id) {
                binding.consumer_tag = Some(tag.clone());
                binding.queue_name = Some(queue_name.clone());
                binding.attempt = 0;
            }
        }

        debug!(queue = queue_name, consumer_tag = tag, "consumer established");
        self.emit(TransportEvent::ConsumedQueueReconnected {
            queue: queue_name,
            consumer_tag: tag,
        });
        Ok(())
    }

    /// Retries establishment with the `consumed` backoff until it succeeds,
    /// the binding disappears, or the transport closes.
    async fn establish_with_retry(&self, binding_id: u64, starting_attempt: u32) {
        let policy = self.inner.config.recovery.consumed;
        let mut attempt = starting_attempt;
        loop {
            tokio::time::sleep(policy.delay(attempt)).await;
            if self.state() == ConnectionState::Closed {
                return;
            }
            if !self
                .inner
                .bindings
                .lock()
                .expect("bindings lock poisoned")
                .contains_key(&binding_id)
            {
                return;
            }

            match self.establish_consumer(binding_id).await {
                Ok(()) => return,
                Err(err) if err.is_retryable() => {
                    attempt += 1;
                    if let Some(binding) = self
                        .inner
                        .bindings
                        .lock()
                        .expect("bindings lock poisoned")
                        .get_mut(&binding_id)
                    {
                        binding.attempt = attempt;
                    }
                    warn!(
                        error = err.to_string(),
                        binding = binding_id,
                        attempt,
                        "consumer establishment failed, backing off"
                    );
                }
                Err(err) => {
                    error!(
                        error = err.to_string(),
                        binding = binding_id,
                        "consumer establishment failed terminally"
                    );
                    self.emit(TransportEvent::Error {
                        message: err.to_string(),
                    });
                    return;
                }
            }
        }
    }

    fn spawn_consumer_loop(
        &self,
        binding_id: Option<u64>,
        mut stream: lapin::Consumer,
        tag: String,
        handler: Arc<dyn MessageHandler>,
        manual_ack: bool,
    ) {
        let transport = self.clone();
        tokio::spawn(async move {
            let mut failure: Option<lapin::Error> = None;
            while let Some(result) = stream.next().await {
                match result {
                    Ok(delivery) => {
                        consumer::consume(
                            transport.clone(),
                            delivery,
                            handler.clone(),
                            manual_ack,
                        );
                    }
                    Err(err) => {
                        match amqp_reply_code(&err) {
                            // Soft notifications the broker sends without
                            // tearing anything down
                            Some(311) | Some(313) => {
                                warn!(error = err.to_string(), consumer_tag = tag, "broker notice");
                                continue;
                            }
                            _ => {
                                failure = Some(err);
                                break;
                            }
                        }
                    }
                }
            }
            transport.on_consumer_end(binding_id, &tag, failure).await;
        });
    }

    /// Consumer stream termination: deliberate replacement exits quietly,
    /// everything else schedules re-establishment.
    async fn on_consumer_end(
        &self,
        binding_id: Option<u64>,
        tag: &str,
        failure: Option<lapin::Error>,
    ) {
        self.emit(TransportEvent::ConsumerClose {
            consumer_tag: tag.to_owned(),
        });

        let Some(binding_id) = binding_id else { return };
        if self.state() == ConnectionState::Closed {
            return;
        }

        let (still_current, queue_name) = {
            let bindings = self.inner.bindings.lock().expect("bindings lock poisoned");
            match bindings.get(&binding_id) {
                Some(binding) => (
                    binding.consumer_tag.as_deref() == Some(tag),
                    binding.queue_name.clone(),
                ),
                None => return,
            }
        };
        if !still_current {
            return;
        }

        match failure {
            Some(err) if amqp_reply_code(&err) == Some(404) => {
                let ours = queue_name
                    .as_deref()
                    .map(|name| err.to_string().contains(name))
                    .unwrap_or(false);
                if ours {
                    warn!(
                        error = err.to_string(),
                        queue = queue_name.as_deref().unwrap_or(""),
                        "consumed queue disappeared, rebinding"
                    );
                } else {
                    warn!(error = err.to_string(), "consumer failed with 404, rebinding");
                }
            }
            Some(err) => {
                warn!(error = err.to_string(), "consumer failed, rebinding");
            }
            None => {
                warn!(consumer_tag = tag, "consumer cancelled, rebinding");
            }
        }

        let resume_attempt = {
            let mut bindings = self.inner.bindings.lock().expect("bindings lock poisoned");
            match bindings.get_mut(&binding_id) {
                Some(binding) => {
                    binding.consumer_tag = None;
                    binding.attempt.max(1)
                }
                None => return,
            }
        };

        let transport = self.clone();
        tokio::spawn(async move {
            transport
                .establish_with_retry(binding_id, resume_attempt)
                .await;
        });
    }

    // ------------------------------------------------------------------
    // Private reply queue
    // ------------------------------------------------------------------

    /// Marks the private queue as pending and makes sure a creation task
    /// is running. A `Pending` left behind by a connection failure does
    /// not count as creation in flight; only a live creator does, so a
    /// reconnect always re-arms re-creation.
    fn request_private_queue(&self) {
        {
            let mut private = self
                .inner
                .private_queue
                .lock()
                .expect("private queue lock poisoned");
            if matches!(private.reply_to, ReplyTo::Ready(_)) {
                return;
            }
            private.reply_to = ReplyTo::Pending;
            if private.creating {
                return;
            }
            private.creating = true;
        }
        let transport = self.clone();
        tokio::spawn(async move {
            transport.create_private_queue().await;
        });
    }

    /// Creates (or re-creates) the private reply queue, retrying
    /// indefinitely with the `private` backoff. The queue name, once
    /// minted, is reused across reconnects so in-flight `reply_to`
    /// addresses stay valid.
    async fn create_private_queue(&self) {
        let policy: BackoffPolicy = self.inner.config.recovery.private;
        let mut attempt: u32 = 0;
        loop {
            if self.state() == ConnectionState::Closed {
                self.inner
                    .private_queue
                    .lock()
                    .expect("private queue lock poisoned")
                    .creating = false;
                return;
            }

            match self.try_create_private_queue().await {
                Ok(queue) => {
                    {
                        let mut name = self
                            .inner
                            .private_name
                            .lock()
                            .expect("private_name lock poisoned");
                        *name = Some(queue.clone());
                    }
                    {
                        let mut private = self
                            .inner
                            .private_queue
                            .lock()
                            .expect("private queue lock poisoned");
                        private.reply_to = ReplyTo::Ready(queue.clone());
                        private.creating = false;
                    }
                    info!(queue, "private queue ready");
                    self.emit(TransportEvent::PrivateQueueReady { queue });
                    return;
                }
                Err(err) => {
                    attempt += 1;
                    warn!(
                        error = err.to_string(),
                        attempt, "failed to create the private queue, backing off"
                    );
                    tokio::time::sleep(policy.delay(attempt)).await;
                }
            }
        }
    }

    async fn try_create_private_queue(&self) -> Result<String, TransportError> {
        let name = self
            .inner
            .private_name
            .lock()
            .expect("private_name lock poisoned")
            .clone()
            .unwrap_or_else(|| format!("{}.{}", PRIVATE_QUEUE_PREFIX, Uuid::new_v4()));

        let definition = QueueDefinition::named(&name)
            .durable(false)
            .auto_delete(true)
            .apply_opts(&self.inner.config.private_queue_opts);
        let definition = self.finalize_queue(definition);
        let queue = self.declare_queue(&definition).await?;

        // DLX demotion: broker-expired requests from this caller come back
        // here, keyed on the reply-to header.
        if self.inner.config.dlx.enabled {
            let dlx = ExchangeDefinition::from_args(
                &self.inner.config.dlx.params.exchange,
                &self.inner.config.dlx.params.args,
            )?;
            self.declare_exchange(&dlx).await?;

            let mut arguments: BTreeMap<ShortString, AMQPValue> = BTreeMap::new();
            arguments.insert(
                ShortString::from("x-match"),
                AMQPValue::LongString(LongString::from("any")),
            );
            arguments.insert(
                ShortString::from(HEADER_REPLY_TO),
                AMQPValue::LongString(LongString::from(queue.as_str())),
            );
            self.channel()?
                .queue_bind(
                    &queue,
                    &self.inner.config.dlx.params.exchange,
                    "",
                    QueueBindOptions::default(),
                    FieldTable::from(arguments),
                )
                .await
                .map_err(|err| TransportError::from_lapin(&err))?;
        }

        let channel = self.channel()?;
        let tag = format!("{}-private-{}", self.inner.config.name, Uuid::new_v4());
        let stream = channel
            .basic_consume(
                &queue,
                &tag,
                BasicConsumeOptions {
                    no_ack: true,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| TransportError::from_lapin(&err))?;

        self.spawn_private_loop(stream, tag, queue.clone());
        Ok(queue)
    }

    fn spawn_private_loop(&self, mut stream: lapin::Consumer, tag: String, queue: String) {
        let transport = self.clone();
        tokio::spawn(async move {
            let mut rebind = false;
            while let Some(result) = stream.next().await {
                match result {
                    Ok(delivery) => transport.on_private_delivery(delivery).await,
                    Err(err) => match amqp_reply_code(&err) {
                        Some(311) | Some(313) => {
                            warn!(error = err.to_string(), "broker notice on private consumer");
                            continue;
                        }
                        Some(404) if err.to_string().contains(&queue) => {
                            warn!(queue, "private queue disappeared, re-creating");
                            rebind = true;
                            break;
                        }
                        _ => {
                            error!(
                                error = err.to_string(),
                                "unexpected error on the private consumer"
                            );
                            transport.emit(TransportEvent::Error {
                                message: err.to_string(),
                            });
                            break;
                        }
                    },
                }
            }
            transport.emit(TransportEvent::ConsumerClose { consumer_tag: tag });

            if rebind && transport.state() != ConnectionState::Closed {
                transport
                    .inner
                    .private_queue
                    .lock()
                    .expect("private queue lock poisoned")
                    .reply_to = ReplyTo::Pending;
                let policy = transport.inner.config.recovery.private;
                tokio::time::sleep(policy.delay(1)).await;
                transport.request_private_queue();
            }
        });
    }

    /// Resolves the private reply queue name, creating the queue first if
    /// nobody has yet.
    async fn ensure_private_queue(&self) -> Result<String, TransportError> {
        loop {
            if self.state() == ConnectionState::Closed {
                return Err(TransportError::InvalidOperation(
                    "transport is not connected".to_owned(),
                ));
            }

            // Subscribe before reading the state so a ready signal firing
            // in between is not missed.
            let mut events = self.inner.events.subscribe();
            {
                let private = self
                    .inner
                    .private_queue
                    .lock()
                    .expect("private queue lock poisoned");
                if let ReplyTo::Ready(name) = &private.reply_to {
                    return Ok(name.clone());
                }
            }
            self.request_private_queue();

            loop {
                match events.recv().await {
                    Ok(TransportEvent::PrivateQueueReady { .. }) => break,
                    Ok(TransportEvent::Close { .. }) => {
                        if self.state() == ConnectionState::Closed {
                            return Err(TransportError::Connection {
                                reason: "transport closed".to_owned(),
                                reply_code: None,
                            });
                        }
                    }
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
        }
    }

    /// Private queue router: matches replies to their pending calls and
    /// demotes dead-lettered requests into typed errors.
    async fn on_private_delivery(&self, delivery: Delivery) {
        let properties = DeliveryProperties::from_delivery(&delivery);
        let trail = delivery
            .properties
            .headers()
            .as_ref()
            .map(death_trail)
            .unwrap_or_default();

        let Some(correlation_id) = properties.correlation_id.clone() else {
            debug!("reply without a correlation id, dropping");
            return;
        };

        let Some(entry) = self.inner.replies.pop(&correlation_id) else {
            if trail.is_empty() {
                debug!(correlation_id, "reply with no pending caller, dropping");
                return;
            }

            // A dead-lettered request we did not originate: push the
            // failure to whoever did, so their call settles before their
            // timer fires.
            warn!(correlation_id, "dead-lettered message with no pending caller");
            let ours = self
                .inner
                .private_name
                .lock()
                .expect("private_name lock poisoned")
                .clone();
            match properties.reply_to.as_deref() {
                Some(reply_to) if Some(reply_to) != ours.as_deref() => {
                    let err = TransportError::Dlx {
                        reason: dlx_reason(&trail),
                        trail,
                    };
                    let body = json!({ "error": WireError::from_error(&err), "data": null });
                    if let Err(err) = self
                        .publish_prepared(
                            &Context::current(),
                            "",
                            reply_to,
                            &body,
                            &PublishOptions::new(),
                            Some(&correlation_id),
                            None,
                            None,
                        )
                        .await
                    {
                        error!(
                            error = err.to_string(),
                            correlation_id, "failed to forward dead-letter error"
                        );
                    }
                }
                _ => {
                    let err = TransportError::NotPermitted { correlation_id };
                    warn!(error = err.to_string(), "dropping dead-lettered message");
                }
            }
            return;
        };

        if !trail.is_empty() {
            entry.reject(TransportError::Dlx {
                reason: dlx_reason(&trail),
                trail,
            });
            return;
        }

        let body = serialization::deserialize(
            &delivery.data,
            properties.content_type.as_deref(),
            properties.content_encoding.as_deref(),
        );
        let headers = Value::Object(properties.headers.clone());

        if let Some(error_value) = body.get("error").filter(|value| !value.is_null()) {
            let wire: WireError =
                serde_json::from_value(error_value.clone()).unwrap_or_else(|_| WireError {
                    kind: "Error".to_owned(),
                    message: error_value.to_string(),
                    code: None,
                    stack: None,
                    data: None,
                });
            entry.reject(wire.revive(Some(headers)));
            return;
        }

        let data = match &body {
            Value::Object(map) if map.contains_key("data") || map.contains_key("error") => {
                map.get("data").cloned().unwrap_or(Value::Null)
            }
            other => other.clone(),
        };

        let response = CachedResponse { headers, data };
        self.inner
            .cache
            .set(entry.options.cache_key, response.clone());
        let simple = entry.options.simple_response;
        entry.resolve(shape_response(response, simple));
    }

    // ------------------------------------------------------------------
    // Publishing
    // ------------------------------------------------------------------

    /// Fire-and-forget publish to the configured exchange.
    pub async fn publish(
        &self,
        ctx: &Context,
        route: &str,
        message: &Value,
        options: PublishOptions,
    ) -> Result<(), TransportError> {
        let options = options.overlay(&self.inner.config.default_opts);
        let exchange = options
            .exchange
            .clone()
            .unwrap_or_else(|| self.inner.config.exchange.clone());
        self.publish_prepared(ctx, &exchange, route, message, &options, None, None, None)
            .await
    }

    /// Fire-and-forget send to a queue on the default exchange.
    pub async fn send(
        &self,
        ctx: &Context,
        queue: &str,
        message: &Value,
        options: PublishOptions,
    ) -> Result<(), TransportError> {
        let options = options.overlay(&self.inner.config.default_opts);
        self.publish_prepared(ctx, "", queue, message, &options, None, None, None)
            .await
    }

    /// RPC over the configured exchange: publishes with a correlation id
    /// and the private reply queue, and resolves when the reply arrives,
    /// the request times out, or the broker dead-letters it.
    pub async fn publish_and_wait(
        &self,
        ctx: &Context,
        route: &str,
        message: &Value,
        options: PublishOptions,
    ) -> Result<Value, TransportError> {
        let options = options.overlay(&self.inner.config.default_opts);
        let exchange = options
            .exchange
            .clone()
            .unwrap_or_else(|| self.inner.config.exchange.clone());
        self.rpc_call(ctx, &exchange, route, message, options).await
    }

    /// RPC straight to a queue on the default exchange.
    pub async fn send_and_wait(
        &self,
        ctx: &Context,
        queue: &str,
        message: &Value,
        options: PublishOptions,
    ) -> Result<Value, TransportError> {
        let options = options.overlay(&self.inner.config.default_opts);
        self.rpc_call(ctx, "", queue, message, options).await
    }

    async fn rpc_call(
        &self,
        ctx: &Context,
        exchange: &str,
        route: &str,
        message: &Value,
        options: PublishOptions,
    ) -> Result<Value, TransportError> {
        let reply_queue = self.ensure_private_queue().await?;

        let cache_key = options
            .cache
            .map(|_| ResponseCache::fingerprint(message, route));
        if let (Some(ttl), Some(key)) = (options.cache, cache_key) {
            if let Some(hit) = self.inner.cache.get(key, Duration::from_secs(ttl)) {
                debug!(route, "rpc served from cache");
                return Ok(shape_response(hit, options.wants_simple_response()));
            }
        }

        let correlation_id = options
            .correlation_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let timeout_ms = options.timeout.unwrap_or(self.inner.config.timeout);
        let reply_to = options.reply_to.clone().unwrap_or(reply_queue);

        let receiver = self.inner.replies.push(
            &correlation_id,
            ReplyOptions {
                route: route.to_owned(),
                timeout: Duration::from_millis(timeout_ms),
                simple_response: options.wants_simple_response(),
                cache_key,
            },
        )?;

        // The broker expires the in-flight request before our timer fires,
        // so with DLX enabled the caller sees the death trail instead of a
        // bare timeout.
        let expiration_ms = dlx_expiration(timeout_ms);

        if let Err(err) = self
            .publish_prepared(
                ctx,
                exchange,
                route,
                message,
                &options,
                Some(&correlation_id),
                Some(&reply_to),
                Some(expiration_ms),
            )
            .await
        {
            self.inner.replies.reject(&correlation_id, err);
        }

        match receiver.await {
            Ok(outcome) => outcome,
            Err(_) => Err(TransportError::Connection {
                reason: "reply resolver dropped".to_owned(),
                reply_code: None,
            }),
        }
    }

    /// Publishes an already-reply-routed reply (§ reply contract): fails
    /// early without `reply_to` and `correlation_id`, forwards the
    /// handler-attached reply headers, and emits `after` once settled.
    pub(crate) async fn reply(
        &self,
        properties: &DeliveryProperties,
        result: Result<Value, TransportError>,
    ) -> Result<(), TransportError> {
        let (Some(reply_to), Some(correlation_id)) =
            (properties.reply_to.as_ref(), properties.correlation_id.as_ref())
        else {
            return Err(TransportError::Validation(
                "a reply needs both reply_to and correlation_id".to_owned(),
            ));
        };

        let body = match result {
            Ok(data) => json!({ "error": null, "data": data }),
            Err(err) => json!({ "error": WireError::from_error(&err), "data": null }),
        };

        let mut options = PublishOptions::new();
        if let Some(reply_headers) = &properties.reply_headers {
            options.headers = reply_headers.clone();
        }

        let outcome = self
            .publish_prepared(
                &Context::current(),
                "",
                reply_to,
                &body,
                &options,
                Some(correlation_id),
                None,
                None,
            )
            .await;

        self.emit(TransportEvent::After {
            routing_key: properties.routing_key.clone(),
            correlation_id: Some(correlation_id.clone()),
        });
        outcome
    }

    /// The shared publish pipeline: encode, enrich, write, announce.
    #[allow(clippy::too_many_arguments)]
    async fn publish_prepared(
        &self,
        ctx: &Context,
        exchange: &str,
        routing_key: &str,
        message: &Value,
        options: &PublishOptions,
        correlation_id: Option<&str>,
        reply_to: Option<&str>,
        expiration_ms: Option<u64>,
    ) -> Result<(), TransportError> {
        let channel = self.channel()?;
        let body = publisher::encode_body(message, options)?;
        let timeout_ms = options.timeout.unwrap_or(self.inner.config.timeout);
        let properties = publisher::build_properties(
            ctx,
            &self.inner.app_id,
            options,
            timeout_ms,
            correlation_id,
            reply_to,
            expiration_ms,
        );

        publisher::publish_message(
            &channel,
            OutboundMessage {
                exchange: exchange.to_owned(),
                routing_key: routing_key.to_owned(),
                body,
                properties,
                confirm: options.confirm.unwrap_or(false),
                mandatory: options.mandatory.unwrap_or(false),
                immediate: options.immediate.unwrap_or(false),
            },
        )
        .await?;

        self.emit(TransportEvent::Publish {
            routing_key: routing_key.to_owned(),
            message: message.clone(),
        });
        Ok(())
    }
}

/// Shapes a response for the caller: the payload alone, or the full
/// `{headers, data}` record.
fn shape_response(response: CachedResponse, simple: bool) -> Value {
    if simple {
        response.data
    } else {
        json!({ "headers": response.headers, "data": response.data })
    }
}

/// AMQP expiration for an RPC request: the broker gets nine tenths of the
/// caller's budget, rounded up, so DLX demotion beats the local timer.
fn dlx_expiration(timeout_ms: u64) -> u64 {
    (timeout_ms * 9).div_ceil(10)
}

fn dlx_reason(trail: &[crate::errors::DeathRecord]) -> String {
    trail
        .first()
        .map(|record| format!("{} from queue `{}`", record.reason, record.queue))
        .unwrap_or_else(|| "dead-lettered".to_owned())
}

/// Headers-exchange bindings match literally, so topic wildcards cannot be
/// honored there.
fn validate_literal_routes(routes: &[String]) -> Result<(), TransportError> {
    for route in routes {
        if route.contains('*') || route.contains('#') {
            return Err(TransportError::Validation(format!(
                "route `{route}` contains topic wildcards and cannot bind on a headers exchange"
            )));
        }
    }
    Ok(())
}

fn dedup_routes(routes: Vec<String>) -> Vec<String> {
    let mut seen = Vec::with_capacity(routes.len());
    for route in routes {
        if !seen.contains(&route) {
            seen.push(route);
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Echo;

    #[async_trait]
    impl MessageHandler for Echo {
        async fn handle(
            &self,
            message: Value,
            _properties: &mut DeliveryProperties,
        ) -> Result<Value, TransportError> {
            Ok(message)
        }
    }

    #[test]
    fn expiration_is_ninety_percent_rounded_up() {
        assert_eq!(dlx_expiration(200), 180);
        assert_eq!(dlx_expiration(1000), 900);
        assert_eq!(dlx_expiration(999), 900);
        assert_eq!(dlx_expiration(1), 1);
    }

    #[test]
    fn wildcard_routes_are_rejected_for_headers_binding() {
        let routes = vec!["a.b".to_owned(), "c.*".to_owned()];
        assert!(validate_literal_routes(&routes).is_err());
        assert!(validate_literal_routes(&routes[..1].to_vec()).is_ok());
    }

    #[test]
    fn routes_are_deduplicated_in_order() {
        let routes = vec![
            "a.b".to_owned(),
            "c.d".to_owned(),
            "a.b".to_owned(),
        ];
        assert_eq!(dedup_routes(routes), vec!["a.b", "c.d"]);
    }

    #[test]
    fn responses_shape_by_option() {
        let response = CachedResponse {
            headers: json!({"h": 1}),
            data: json!({"a": 1}),
        };
        assert_eq!(shape_response(response.clone(), true), json!({"a": 1}));
        assert_eq!(
            shape_response(response, false),
            json!({"headers": {"h": 1}, "data": {"a": 1}})
        );
    }

    #[tokio::test]
    async fn close_requires_an_open_transport() {
        let transport = AmqpTransport::new(TransportConfig::default());
        let err = transport.close().await.unwrap_err();
        assert!(matches!(err, TransportError::InvalidOperation(_)));
    }

    #[tokio::test]
    async fn rpc_on_a_closed_transport_is_refused() {
        let transport = AmqpTransport::new(TransportConfig::default());
        let err = transport
            .publish_and_wait(
                &Context::new(),
                "echo",
                &json!({"a": 1}),
                PublishOptions::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::InvalidOperation(_)));
    }

    #[tokio::test]
    async fn reconnect_rearms_private_queue_creation() {
        let transport = AmqpTransport::new(TransportConfig::default());
        // A broker failure leaves the tri-state Pending with no creator
        // alive; a later ready must still be able to re-create the queue.
        *transport.inner.state.lock().unwrap() = ConnectionState::Open;
        *transport.inner.private_name.lock().unwrap() = Some("microfleet.prior".to_owned());
        {
            let mut private = transport.inner.private_queue.lock().unwrap();
            private.reply_to = ReplyTo::Pending;
            private.creating = false;
        }

        transport.request_private_queue();

        let private = transport.inner.private_queue.lock().unwrap();
        assert!(
            private.creating,
            "pending without a live creator must re-arm creation"
        );
        assert_eq!(private.reply_to, ReplyTo::Pending);
    }

    #[tokio::test]
    async fn request_leaves_a_ready_queue_alone() {
        let transport = AmqpTransport::new(TransportConfig::default());
        *transport.inner.state.lock().unwrap() = ConnectionState::Open;
        transport.inner.private_queue.lock().unwrap().reply_to =
            ReplyTo::Ready("microfleet.live".to_owned());

        transport.request_private_queue();

        let private = transport.inner.private_queue.lock().unwrap();
        assert_eq!(private.reply_to, ReplyTo::Ready("microfleet.live".to_owned()));
        assert!(!private.creating);
    }

    #[tokio::test]
    async fn consumed_queue_registration_requires_routes() {
        let transport = AmqpTransport::new(TransportConfig::default());
        let err = transport
            .create_consumed_queue(Arc::new(Echo), Vec::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Argument(_)));
    }

    #[tokio::test]
    async fn consumed_queue_rejects_wildcards_in_headers_mode() {
        let config = TransportConfig {
            bind_persistent_queue_to_headers_exchange: true,
            ..TransportConfig::default()
        };
        let transport = AmqpTransport::new(config);
        let err = transport
            .create_consumed_queue(Arc::new(Echo), vec!["math.*".to_owned()], None)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Validation(_)));
    }
}
