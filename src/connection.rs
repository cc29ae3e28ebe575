// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection Management
//!
//! This module owns the single broker connection of the process and its two channels,
//! one for publishing and one for consuming. Both channels are opened together on every
//! connect and swapped wholesale on reconnect: a channel obtained before a reconnect is
//! permanently broken and must be fetched again.
//!
//! Broker-side closures are reported as `CloseNotice`s tagged with the generation of
//! the connection that failed, so the recovery supervisor can ignore notices of
//! connections that were already replaced. Notices raised before anyone took the
//! notification stream are dropped.

use crate::{
    config::Settings, errors::AmqpError, publisher::ChannelPublisher, recovery::Reconnect,
};
use async_trait::async_trait;
use lapin::{
    options::BasicPublishOptions, types::LongString, BasicProperties, Channel, Connection,
    ConnectionProperties,
};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex as SyncMutex,
};
use tokio::sync::{
    mpsc::{self, UnboundedReceiver, UnboundedSender},
    RwLock,
};
use tracing::{debug, error, info, warn};

const REPLY_SUCCESS: u16 = 200;

/// Broker-side closure of the connection with the given generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseNotice {
    pub generation: u64,
    pub reason: String,
}

struct ConnectionState {
    generation: u64,
    connection: Arc<Connection>,
    produce: Arc<Channel>,
    consume: Arc<Channel>,
}

/// Owner of the broker connection, shared via `Arc` by every component.
pub struct ConnectionManager {
    uri: String,
    name: String,
    state: RwLock<Option<ConnectionState>>,
    generation: AtomicU64,
    /// Shared with the error callback of every connection; emptied by `close`.
    notifier: Arc<SyncMutex<Option<UnboundedSender<CloseNotice>>>>,
    handed_out: AtomicBool,
}

impl ConnectionManager {
    /// Creates a manager for the broker described by `cfg`. Nothing is dialed yet.
    pub fn new(cfg: &Settings) -> Arc<ConnectionManager> {
        Self::from_uri(&cfg.rabbitmq.uri(), &cfg.app.name)
    }

    /// Creates a manager for an explicit AMQP URI; `name` is the connection name shown
    /// by the broker.
    pub fn from_uri(uri: &str, name: &str) -> Arc<ConnectionManager> {
        Arc::new(ConnectionManager {
            uri: uri.to_owned(),
            name: name.to_owned(),
            state: RwLock::new(None),
            generation: AtomicU64::new(0),
            notifier: Arc::new(SyncMutex::new(None)),
            handed_out: AtomicBool::new(false),
        })
    }

    /// Dials the broker and opens the produce and consume channels.
    ///
    /// Fails fast: the error of the first step that fails is returned and nothing is
    /// retried. On success any previous connection is replaced and closed.
    pub async fn connect(&self) -> Result<(), AmqpError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.name.clone()));

        let conn = match Connection::connect(&self.uri, options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }?;
        debug!("amqp connected");

        let (produce, consume) = match Self::open_channels(&conn).await {
            Ok(channels) => channels,
            Err(err) => {
                Self::close_quietly(&conn).await;
                return Err(err);
            }
        };

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let notifier = self.notifier.clone();
        conn.on_error(move |err| {
            warn!(error = err.to_string(), generation, "amqp connection closed");
            send_notice(&notifier, generation, err.to_string());
        });

        let previous = self.state.write().await.replace(ConnectionState {
            generation,
            connection: Arc::new(conn),
            produce: Arc::new(produce),
            consume: Arc::new(consume),
        });

        if let Some(previous) = previous {
            Self::close_quietly(&previous.connection).await;
        }

        info!(generation, "amqp connection established");
        Ok(())
    }

    /// Same as `connect`, called once a closure was detected.
    pub async fn reconnect(&self) -> Result<(), AmqpError> {
        info!("reconnecting to amqp...");
        self.connect().await
    }

    async fn open_channels(conn: &Connection) -> Result<(Channel, Channel), AmqpError> {
        debug!("creating amqp channels...");
        let mut channels = Vec::with_capacity(2);
        for _ in 0..2 {
            match conn.create_channel().await {
                Ok(c) => channels.push(c),
                Err(err) => {
                    error!(error = err.to_string(), "error to create the channel");
                    return Err(AmqpError::ChannelError(err.to_string()));
                }
            }
        }
        debug!("channels created");

        match (channels.pop(), channels.pop()) {
            (Some(consume), Some(produce)) => Ok((produce, consume)),
            _ => Err(AmqpError::InternalError),
        }
    }

    async fn close_quietly(conn: &Connection) {
        if let Err(err) = conn.close(REPLY_SUCCESS, "closing").await {
            debug!(error = err.to_string(), "connection already closed");
        }
    }

    /// Generation of the current connection, 0 before the first connect.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub async fn connection(&self) -> Result<Arc<Connection>, AmqpError> {
        match self.state.read().await.as_ref() {
            Some(state) => Ok(state.connection.clone()),
            None => Err(AmqpError::NotConnected),
        }
    }

    /// Channel used for publishing and topology declaration.
    pub async fn channel_produce(&self) -> Result<Arc<Channel>, AmqpError> {
        match self.state.read().await.as_ref() {
            Some(state) => Ok(state.produce.clone()),
            None => Err(AmqpError::NotConnected),
        }
    }

    /// Channel used by every consumer subscription.
    pub async fn channel_consume(&self) -> Result<Arc<Channel>, AmqpError> {
        match self.state.read().await.as_ref() {
            Some(state) => Ok(state.consume.clone()),
            None => Err(AmqpError::NotConnected),
        }
    }

    /// Reports a failure of the connection with `generation` detected outside the
    /// broker client, e.g. a consumer stream ending with a channel error.
    pub fn notify_closed(&self, generation: u64, reason: &str) {
        send_notice(&self.notifier, generation, reason.to_owned());
    }

    /// Hands out the close notification stream. Only the first caller gets it, and
    /// nobody once the manager was closed.
    pub async fn close_notifications(&self) -> Option<UnboundedReceiver<CloseNotice>> {
        if self.handed_out.swap(true, Ordering::SeqCst) {
            return None;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        match self.notifier.lock() {
            Ok(mut slot) => {
                slot.replace(tx);
                Some(rx)
            }
            Err(_) => None,
        }
    }

    async fn produce_state(&self) -> Result<(Arc<Channel>, u64), AmqpError> {
        match self.state.read().await.as_ref() {
            Some(state) => Ok((state.produce.clone(), state.generation)),
            None => Err(AmqpError::NotConnected),
        }
    }

    /// Consume channel together with the generation of the connection owning it.
    pub(crate) async fn consume_state(&self) -> Result<(Arc<Channel>, u64), AmqpError> {
        match self.state.read().await.as_ref() {
            Some(state) => Ok((state.consume.clone(), state.generation)),
            None => Err(AmqpError::NotConnected),
        }
    }

    /// Reports the connection when a publish failed because its channel is gone.
    /// Lapin only signals connection-level errors, a channel closed by the broker
    /// (unknown exchange, precondition failed) stays silent otherwise.
    fn escalate_publish_failure(&self, generation: u64, err: &lapin::Error, connected: bool) {
        if is_channel_failure(err, connected) {
            warn!(error = err.to_string(), generation, "produce channel unusable");
            self.notify_closed(generation, &format!("produce channel unusable: {err}"));
        }
    }

    /// Closes the connection and the close notification stream.
    ///
    /// Deliveries stop, collectors and workers of every subscription drain and exit,
    /// and a supervisor listening on the notifications terminates.
    pub async fn close(&self) -> Result<(), AmqpError> {
        self.handed_out.store(true, Ordering::SeqCst);
        if let Ok(mut slot) = self.notifier.lock() {
            slot.take();
        }

        let state = self.state.write().await.take();
        if let Some(state) = state {
            info!("closing amqp connection");
            if let Err(err) = state.connection.close(REPLY_SUCCESS, "shutdown").await {
                error!(error = err.to_string(), "error to close the connection");
                return Err(AmqpError::ConnectionClosed(err.to_string()));
            }
        }

        Ok(())
    }
}

fn send_notice(
    notifier: &SyncMutex<Option<UnboundedSender<CloseNotice>>>,
    generation: u64,
    reason: String,
) {
    let sent = match notifier.lock() {
        Ok(slot) => slot
            .as_ref()
            .is_some_and(|tx| tx.send(CloseNotice { generation, reason }).is_ok()),
        Err(_) => false,
    };

    if !sent {
        debug!(generation, "close notification dropped, nobody is listening");
    }
}

fn is_channel_failure(err: &lapin::Error, connected: bool) -> bool {
    !connected
        || matches!(
            err,
            lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidConnectionState(_)
        )
}

#[async_trait]
impl ChannelPublisher for ConnectionManager {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        let (channel, generation) = self.produce_state().await?;

        let confirm = match channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), exchange, "error publishing message");
                self.escalate_publish_failure(generation, &err, channel.status().connected());
                Err(AmqpError::PublishingError(exchange.to_owned()))
            }
            Ok(confirm) => Ok(confirm),
        }?;

        match confirm.await {
            Err(err) => {
                error!(error = err.to_string(), exchange, "message was not confirmed");
                self.escalate_publish_failure(generation, &err, channel.status().connected());
                Err(AmqpError::PublishingError(exchange.to_owned()))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl Reconnect for ConnectionManager {
    async fn reconnect(&self) -> Result<(), AmqpError> {
        ConnectionManager::reconnect(self).await
    }

    fn generation(&self) -> u64 {
        ConnectionManager::generation(self)
    }
}
