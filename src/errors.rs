// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the RabbitMQ Reliability Layer
//!
//! This module provides the error type shared by every component of the crate.
//! The `AmqpError` enum covers connection lifecycle failures, topology declaration,
//! publishing, per-message processing and the recovery supervisor.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Broker and channel failures carry the name of the resource or the underlying
/// lapin error text. Per-message failures (`ParsePayloadError`, `HandlerError`) are
/// handled inside the consumer pipeline and never reach the publishing caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    #[error("internal error")]
    InternalError,

    #[error("invalid configuration: {0}")]
    ConfigError(String),

    // Connection lifecycle
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// A channel or the connection was requested before `connect` succeeded.
    #[error("not connected")]
    NotConnected,

    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// The close notification stream ended; the recovery supervisor cannot go on.
    #[error("connection close notifications stopped")]
    NotificationChannelClosed,

    // Topology, carrying the resource names
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    // Publishing
    /// Returned without contacting the broker.
    #[error("can't publish a message to `{0}`: message class is disabled")]
    DisabledMessageClass(String),

    #[error("failure to serialize payload: {0}")]
    SerializePayloadError(String),

    #[error("failure to publish: {0}")]
    PublishingError(String),

    #[error("failure to publish to junk `{0}`")]
    PublishingToJunkError(String),

    // Per-message processing
    #[error("failure to parse payload: {0}")]
    ParsePayloadError(String),

    #[error("failure to handle message: {0}")]
    HandlerError(String),

    #[error("failure to ack message")]
    AckMessageError,

    #[error("failure to nack message")]
    NackMessageError,

    #[error("failure to consume message `{0}`")]
    ConsumerError(String),
}
