// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivered Messages
//!
//! `Envelope` is the unit the consumer pipeline works on: the payload, the headers
//! needed to count retries and an `Acknowledger` bound to the channel the message
//! was delivered on.

use crate::errors::AmqpError;
use async_trait::async_trait;
use lapin::{
    acker::Acker,
    message::Delivery,
    options::{BasicAckOptions, BasicNackOptions},
    types::FieldTable,
};
use tracing::error;

/// Settles a delivery on the broker.
///
/// An acknowledger belongs to the channel the message arrived on. After a reconnect
/// that channel is gone and every call fails, the message is then redelivered by the
/// broker to the new subscription.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Removes the message from the queue.
    async fn ack(&self) -> Result<(), AmqpError>;

    /// Rejects the message; with `requeue = false` it is dead-lettered.
    async fn nack(&self, requeue: bool) -> Result<(), AmqpError>;
}

#[async_trait]
impl Acknowledger for Acker {
    async fn ack(&self) -> Result<(), AmqpError> {
        Acker::ack(self, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        Acker::nack(
            self,
            BasicNackOptions {
                multiple: false,
                requeue,
            },
        )
        .await
        .map_err(|err| {
            error!(error = err.to_string(), "error whiling nack msg");
            AmqpError::NackMessageError
        })
    }
}

/// A message delivered to a subscription.
pub struct Envelope<A> {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub headers: FieldTable,
    pub data: Vec<u8>,
    pub(crate) acker: A,
}

impl<A: Acknowledger> Envelope<A> {
    pub fn new(data: Vec<u8>, headers: FieldTable, acker: A) -> Envelope<A> {
        Envelope {
            delivery_tag: 0,
            exchange: String::new(),
            routing_key: String::new(),
            redelivered: false,
            headers,
            data,
            acker,
        }
    }

    pub async fn ack(&self) -> Result<(), AmqpError> {
        self.acker.ack().await
    }

    pub async fn nack(&self) -> Result<(), AmqpError> {
        self.acker.nack(false).await
    }
}

impl From<Delivery> for Envelope<Acker> {
    fn from(delivery: Delivery) -> Envelope<Acker> {
        Envelope {
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange.to_string(),
            routing_key: delivery.routing_key.to_string(),
            redelivered: delivery.redelivered,
            headers: delivery.properties.headers().clone().unwrap_or_default(),
            data: delivery.data,
            acker: delivery.acker,
        }
    }
}
