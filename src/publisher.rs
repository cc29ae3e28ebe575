// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! This module provides functionality for publishing messages of a message class:
//! to its delayed direct exchange (first attempt or manual resubmission with a growing
//! delay) or straight to its junk exchange. Every publish is persistent, JSON typed and
//! carries the current OpenTelemetry context in its headers.

use crate::{config::MessageClassConfig, errors::AmqpError, otel};
use async_trait::async_trait;
use lapin::{
    types::{AMQPValue, FieldTable, LongLongInt, ShortString},
    BasicProperties,
};
use serde::Serialize;
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error, info};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// Header read by the delayed message exchange, in milliseconds
pub const AMQP_HEADERS_DELAY: &str = "x-delay";
/// AMQP delivery mode surviving broker restarts
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Low level publish on the current produce channel.
///
/// Implemented by the connection manager; implementations must be safe to call from
/// many tasks at once.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChannelPublisher: Send + Sync {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError>;
}

/// Byte-oriented publishing operations of a message class.
///
/// Every operation fails with `AmqpError::DisabledMessageClass` when the class is
/// disabled, without contacting the broker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Producer: Send + Sync {
    /// Publishes to the direct exchange with `x-delay` set to the class delay.
    async fn send_to_direct(&self, cfg: &MessageClassConfig, message: &[u8])
        -> Result<(), AmqpError>;

    /// Publishes to the direct exchange with an explicit `x-delay` in milliseconds.
    async fn send_to_direct_with_delay(
        &self,
        cfg: &MessageClassConfig,
        message: &[u8],
        delay: i64,
    ) -> Result<(), AmqpError>;

    /// Publishes to the junk exchange, bypassing the retry cycle.
    async fn send_to_junk(&self, cfg: &MessageClassConfig, message: &[u8])
        -> Result<(), AmqpError>;
}

/// JSON variants of the `Producer` operations, available on every producer.
///
/// Payloads are encoded before anything is published; an encoding failure is returned
/// as `AmqpError::SerializePayloadError` and nothing reaches the broker.
#[async_trait]
pub trait ProducerExt: Producer {
    async fn send_to_direct_json<T>(
        &self,
        cfg: &MessageClassConfig,
        message: &T,
    ) -> Result<(), AmqpError>
    where
        T: Serialize + Sync + ?Sized,
    {
        let payload = to_json(message)?;
        self.send_to_direct(cfg, &payload).await
    }

    /// Publishes with `x-delay = cfg.delay * increment_delay`, letting callers back off
    /// across manual resubmissions (e.g. `increment_delay` = attempt number).
    async fn send_to_direct_json_with_increment_delay<T>(
        &self,
        cfg: &MessageClassConfig,
        message: &T,
        increment_delay: i64,
    ) -> Result<(), AmqpError>
    where
        T: Serialize + Sync + ?Sized,
    {
        if !cfg.enabled {
            return Err(AmqpError::DisabledMessageClass(cfg.queue_direct.clone()));
        }

        let payload = to_json(message)?;
        self.send_to_direct_with_delay(cfg, &payload, cfg.delay.saturating_mul(increment_delay))
            .await
    }

    async fn send_to_junk_json<T>(&self, cfg: &MessageClassConfig, message: &T) -> Result<(), AmqpError>
    where
        T: Serialize + Sync + ?Sized,
    {
        let payload = to_json(message)?;
        self.send_to_junk(cfg, &payload).await
    }
}

impl<P: Producer + ?Sized> ProducerExt for P {}

fn to_json<T: Serialize + ?Sized>(message: &T) -> Result<Vec<u8>, AmqpError> {
    serde_json::to_vec(message).map_err(|err| {
        error!(error = err.to_string(), "failed converting data to json");
        AmqpError::SerializePayloadError(err.to_string())
    })
}

/// RabbitMQ implementation of the Producer trait.
pub struct RabbitMQProducer {
    channel: Arc<dyn ChannelPublisher>,
}

impl RabbitMQProducer {
    /// Creates a new RabbitMQ producer.
    ///
    /// # Parameters
    /// * `channel` - Publishes on the current produce channel, usually the connection manager
    ///
    /// # Returns
    /// An Arc-wrapped RabbitMQProducer instance for thread-safe sharing
    pub fn new(channel: Arc<dyn ChannelPublisher>) -> Arc<RabbitMQProducer> {
        Arc::new(RabbitMQProducer { channel })
    }

    fn properties(mut headers: BTreeMap<ShortString, AMQPValue>) -> BasicProperties {
        otel::inject_current(&mut headers);

        BasicProperties::default()
            .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
            .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
            .with_headers(FieldTable::from(headers))
    }
}

#[async_trait]
impl Producer for RabbitMQProducer {
    async fn send_to_direct(
        &self,
        cfg: &MessageClassConfig,
        message: &[u8],
    ) -> Result<(), AmqpError> {
        self.send_to_direct_with_delay(cfg, message, cfg.delay).await
    }

    async fn send_to_direct_with_delay(
        &self,
        cfg: &MessageClassConfig,
        message: &[u8],
        delay: i64,
    ) -> Result<(), AmqpError> {
        if !cfg.enabled {
            return Err(AmqpError::DisabledMessageClass(cfg.queue_direct.clone()));
        }

        let mut headers = BTreeMap::new();
        headers.insert(
            ShortString::from(AMQP_HEADERS_DELAY),
            AMQPValue::LongLongInt(LongLongInt::from(delay)),
        );

        match self
            .channel
            .publish(
                &cfg.exchange_direct,
                &cfg.routing_key_direct,
                message,
                Self::properties(headers),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    exchange = %cfg.exchange_direct,
                    "failed to publish a message direct"
                );
                Err(err)
            }
            _ => {
                debug!(exchange = %cfg.exchange_direct, delay, "sent a message direct");
                Ok(())
            }
        }
    }

    async fn send_to_junk(
        &self,
        cfg: &MessageClassConfig,
        message: &[u8],
    ) -> Result<(), AmqpError> {
        if !cfg.enabled {
            return Err(AmqpError::DisabledMessageClass(cfg.queue_junk.clone()));
        }

        match self
            .channel
            .publish(
                &cfg.exchange_junk,
                &cfg.routing_key_junk,
                message,
                Self::properties(BTreeMap::new()),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    exchange = %cfg.exchange_junk,
                    "failed to publish a message junk"
                );
                Err(AmqpError::PublishingToJunkError(cfg.exchange_junk.clone()))
            }
            _ => {
                info!(exchange = %cfg.exchange_junk, "sent a message junk");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::ExchangeKind;

    fn class(enabled: bool) -> MessageClassConfig {
        MessageClassConfig {
            enabled,
            exchange_kind: ExchangeKind::Direct,
            exchange_direct: "exchange_direct".to_owned(),
            queue_direct: "queue_direct".to_owned(),
            routing_key_direct: "routing_key_direct".to_owned(),
            exchange_dlx: "exchange_dlx".to_owned(),
            queue_dlq: "queue_dlq".to_owned(),
            routing_key_dlx: "routing_key_dlx".to_owned(),
            exchange_junk: "exchange_junk".to_owned(),
            queue_junk: "queue_junk".to_owned(),
            routing_key_junk: "routing_key_junk".to_owned(),
            ttl: 10_000,
            delay: 5000,
            limit: 3,
        }
    }

    fn delay_of(properties: &BasicProperties) -> Option<i64> {
        properties
            .headers()
            .as_ref()
            .and_then(|h| h.inner().get(AMQP_HEADERS_DELAY).cloned())
            .and_then(|v| match v {
                AMQPValue::LongLongInt(d) => Some(d),
                _ => None,
            })
    }

    struct Unserializable;

    impl Serialize for Unserializable {
        fn serialize<S: serde::Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("unsupported value"))
        }
    }

    #[tokio::test]
    async fn send_to_direct_publishes_persistent_message_with_delay() {
        let mut channel = MockChannelPublisher::new();
        channel
            .expect_publish()
            .withf(|exchange, key, payload, props| {
                exchange == "exchange_direct"
                    && key == "routing_key_direct"
                    && payload == b"Test message"
                    && delay_of(props) == Some(5000)
                    && props.delivery_mode() == &Some(PERSISTENT_DELIVERY_MODE)
                    && props.content_type() == &Some(ShortString::from(JSON_CONTENT_TYPE))
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let producer = RabbitMQProducer::new(Arc::new(channel));
        producer
            .send_to_direct(&class(true), b"Test message")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn send_to_direct_propagates_publish_failure() {
        let mut channel = MockChannelPublisher::new();
        channel
            .expect_publish()
            .returning(|_, _, _, _| Err(AmqpError::PublishingError("closed".to_owned())));

        let producer = RabbitMQProducer::new(Arc::new(channel));
        let err = producer
            .send_to_direct(&class(true), b"Test message")
            .await
            .unwrap_err();

        assert_eq!(err, AmqpError::PublishingError("closed".to_owned()));
    }

    #[tokio::test]
    async fn disabled_class_never_touches_the_broker() {
        let mut channel = MockChannelPublisher::new();
        channel.expect_publish().never();

        let producer = RabbitMQProducer::new(Arc::new(channel));
        let cfg = class(false);

        assert!(matches!(
            producer.send_to_direct(&cfg, b"").await,
            Err(AmqpError::DisabledMessageClass(_))
        ));
        assert!(matches!(
            producer.send_to_junk(&cfg, b"").await,
            Err(AmqpError::DisabledMessageClass(_))
        ));
        assert!(matches!(
            producer.send_to_direct_json(&cfg, &42).await,
            Err(AmqpError::DisabledMessageClass(_))
        ));
        assert!(matches!(
            producer
                .send_to_direct_json_with_increment_delay(&cfg, &42, 2)
                .await,
            Err(AmqpError::DisabledMessageClass(_))
        ));
    }

    #[tokio::test]
    async fn increment_delay_multiplies_base_delay() {
        let mut channel = MockChannelPublisher::new();
        channel
            .expect_publish()
            .withf(|exchange, key, payload, props| {
                exchange == "exchange_direct"
                    && key == "routing_key_direct"
                    && payload == br#"{"employee_id":42}"#
                    && delay_of(props) == Some(5000 * 4)
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let producer = RabbitMQProducer::new(Arc::new(channel));
        producer
            .send_to_direct_json_with_increment_delay(
                &class(true),
                &serde_json::json!({"employee_id": 42}),
                4,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn serialize_failure_is_reported_before_publishing() {
        let mut channel = MockChannelPublisher::new();
        channel.expect_publish().never();

        let producer = RabbitMQProducer::new(Arc::new(channel));
        let cfg = class(true);

        assert!(matches!(
            producer.send_to_direct_json(&cfg, &Unserializable).await,
            Err(AmqpError::SerializePayloadError(_))
        ));
        assert!(matches!(
            producer
                .send_to_direct_json_with_increment_delay(&cfg, &Unserializable, 3)
                .await,
            Err(AmqpError::SerializePayloadError(_))
        ));
    }

    #[tokio::test]
    async fn send_to_junk_uses_junk_exchange_without_delay() {
        let mut channel = MockChannelPublisher::new();
        channel
            .expect_publish()
            .withf(|exchange, key, payload, props| {
                exchange == "exchange_junk"
                    && key == "routing_key_junk"
                    && payload == b"Test message"
                    && delay_of(props).is_none()
                    && props.delivery_mode() == &Some(PERSISTENT_DELIVERY_MODE)
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let producer = RabbitMQProducer::new(Arc::new(channel));
        producer
            .send_to_junk(&class(true), b"Test message")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn send_to_junk_failure_is_typed() {
        let mut channel = MockChannelPublisher::new();
        channel
            .expect_publish()
            .returning(|_, _, _, _| Err(AmqpError::PublishingError("closed".to_owned())));

        let producer = RabbitMQProducer::new(Arc::new(channel));
        assert_eq!(
            producer.send_to_junk(&class(true), b"x").await,
            Err(AmqpError::PublishingToJunkError("exchange_junk".to_owned()))
        );
    }
}
