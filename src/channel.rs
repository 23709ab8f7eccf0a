// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection and Channel Management
//!
//! This module handles the creation of AMQP connections and channels. It
//! dials the broker using the transport configuration and hands back a
//! connection/channel pair ready for declarations, publishing, and
//! consuming. Lifecycle ownership (reconnects, state transitions) lives in
//! the transport core; this is the dialing edge.

use crate::config::TransportConfig;
use crate::errors::TransportError;
use lapin::{options::ConfirmSelectOptions, types::LongString, Channel, Connection, ConnectionProperties};
use std::sync::Arc;
use tracing::{debug, error};

/// Lifecycle state of the transport's broker connection.
///
/// Mutated only by lifecycle events: `connect` moves Closed → Opening →
/// Open, a broker failure moves Open → Reconnecting, and `close` returns
/// to Closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Opening,
    Open,
    Reconnecting,
}

/// Dials the broker and opens a channel on the fresh connection.
///
/// The connection is named after the configured service so it can be told
/// apart in the broker's management UI. Publisher confirms are enabled on
/// the channel up front; publishes that do not ask for confirmation simply
/// ignore theirs.
pub async fn new_amqp_channel(
    config: &TransportConfig,
) -> Result<(Arc<Connection>, Arc<Channel>), TransportError> {
    debug!("creating amqp connection...");
    let options = ConnectionProperties::default()
        .with_connection_name(LongString::from(config.name.clone()));

    let uri = format!(
        "{}?heartbeat={}&frame_max={}",
        config.amqp_uri(),
        config.connection.heartbeat,
        config.connection.frame_max
    );

    let conn = match Connection::connect(&uri, options).await {
        Ok(c) => Ok(c),
        Err(err) => {
            error!(error = err.to_string(), "failure to connect");
            Err(TransportError::from_lapin(&err))
        }
    }?;
    debug!("amqp connected");

    debug!("creating amqp channel...");
    let channel = match conn.create_channel().await {
        Ok(c) => Ok(c),
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            Err(TransportError::from_lapin(&err))
        }
    }?;

    if let Err(err) = channel
        .confirm_select(ConfirmSelectOptions::default())
        .await
    {
        error!(error = err.to_string(), "error to enable publisher confirms");
        return Err(TransportError::from_lapin(&err));
    }

    debug!("channel created");
    Ok((Arc::new(conn), Arc::new(channel)))
}
