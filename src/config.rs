// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Configuration
//!
//! Typed settings for the broker connection, the consumer pipeline and every message
//! class. Settings are read with the `config` crate from an optional file and
//! `APP__`-prefixed environment variables (`APP__RABBITMQ__HOST=rabbit`).

use crate::{errors::AmqpError, exchange::ExchangeKind};
use config::{builder::DefaultState, Config, ConfigBuilder, Environment, File};
use serde::Deserialize;
use std::{collections::BTreeMap, time::Duration};
use tracing::error;

/// Default QoS prefetch count when `consumer.prefetch_count` is unset.
pub const DEFAULT_PREFETCH_COUNT: u16 = 100;
/// Default capacity of the per-subscription task queue.
pub const DEFAULT_TASK_BUFFER: usize = 1000;
/// Default sleep between reconnection attempts, in seconds.
pub const DEFAULT_RECOVERY_INTERVAL_SECS: u64 = 30;

/// Root of the configuration tree.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub app: AppConfigs,
    pub rabbitmq: RabbitMQConfigs,
    #[serde(default)]
    pub consumer: ConsumerConfigs,
    #[serde(default)]
    pub message_classes: BTreeMap<String, MessageClassConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfigs {
    pub name: String,
}

/// Broker connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RabbitMQConfigs {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    #[serde(default)]
    pub vhost: String,
    #[serde(default = "default_recovery_interval")]
    pub recovery_interval_secs: u64,
    /// Extra leading segment of every exchange/queue/routing key name.
    #[serde(default)]
    pub namespace: Option<String>,
}

fn default_recovery_interval() -> u64 {
    DEFAULT_RECOVERY_INTERVAL_SECS
}

impl RabbitMQConfigs {
    /// Builds the AMQP URI, percent-encoding `/` in the vhost.
    pub fn uri(&self) -> String {
        let base = format!(
            "amqp://{}:{}@{}:{}",
            self.user, self.password, self.host, self.port
        );

        if self.vhost.is_empty() {
            base
        } else {
            format!("{}/{}", base, self.vhost.replace('/', "%2f"))
        }
    }

    pub fn recovery_interval(&self) -> Duration {
        Duration::from_secs(self.recovery_interval_secs)
    }
}

/// Consumer pipeline sizing. Unset values fall back to the defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConsumerConfigs {
    pub prefetch_count: Option<u16>,
    pub worker_count: Option<usize>,
    pub task_buffer: Option<usize>,
}

impl ConsumerConfigs {
    pub fn prefetch_count(&self) -> u16 {
        match self.prefetch_count {
            Some(count) if count > 0 => count,
            _ => DEFAULT_PREFETCH_COUNT,
        }
    }

    /// Worker pool size, defaulting to the available parallelism.
    pub fn worker_count(&self) -> usize {
        match self.worker_count {
            Some(count) if count > 0 => count,
            _ => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        }
    }

    pub fn task_buffer(&self) -> usize {
        match self.task_buffer {
            Some(size) if size > 0 => size,
            _ => DEFAULT_TASK_BUFFER,
        }
    }
}

/// Immutable descriptor of one logical message type and its topology.
///
/// `ttl` is how long a dead-lettered message waits in the DLQ before it is routed
/// back to the direct exchange, `delay` the `x-delay` of a direct publish and
/// `limit` the retry count at which a failing message is archived to junk.
/// All durations are milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct MessageClassConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub exchange_kind: ExchangeKind,

    pub exchange_direct: String,
    pub queue_direct: String,
    pub routing_key_direct: String,

    pub exchange_dlx: String,
    pub queue_dlq: String,
    pub routing_key_dlx: String,

    pub exchange_junk: String,
    pub queue_junk: String,
    pub routing_key_junk: String,

    #[serde(default)]
    pub ttl: i64,
    #[serde(default)]
    pub delay: i64,
    #[serde(default)]
    pub limit: i64,
}

impl MessageClassConfig {
    /// Returns a copy with every exchange, queue and routing key name prefixed.
    pub fn with_prefix(&self, prefix: &str) -> MessageClassConfig {
        let p = |name: &str| format!("{}{}", prefix, name);

        MessageClassConfig {
            exchange_direct: p(&self.exchange_direct),
            queue_direct: p(&self.queue_direct),
            routing_key_direct: p(&self.routing_key_direct),
            exchange_dlx: p(&self.exchange_dlx),
            queue_dlq: p(&self.queue_dlq),
            routing_key_dlx: p(&self.routing_key_dlx),
            exchange_junk: p(&self.exchange_junk),
            queue_junk: p(&self.queue_junk),
            routing_key_junk: p(&self.routing_key_junk),
            ..self.clone()
        }
    }
}

impl Settings {
    /// Loads settings from `path` (any format supported by `config`, extension
    /// optional, file optional) overlaid with `APP__` environment variables.
    pub fn load(path: &str) -> Result<Settings, AmqpError> {
        Self::build(Config::builder().add_source(File::with_name(path).required(false)))
    }

    pub(crate) fn build(builder: ConfigBuilder<DefaultState>) -> Result<Settings, AmqpError> {
        let cfg = match builder
            .add_source(Environment::with_prefix("APP").separator("__"))
            .build()
        {
            Err(err) => {
                error!(error = err.to_string(), "failure to read configuration");
                Err(AmqpError::ConfigError(err.to_string()))
            }
            Ok(c) => Ok(c),
        }?;

        cfg.try_deserialize().map_err(|err| {
            error!(error = err.to_string(), "failure to deserialize configuration");
            AmqpError::ConfigError(err.to_string())
        })
    }

    /// Prefix applied to every broker resource name of this application.
    pub fn name_prefix(&self) -> String {
        match &self.rabbitmq.namespace {
            Some(ns) if !ns.is_empty() => format!("{}-{}-", ns, self.app.name),
            _ => format!("{}-", self.app.name),
        }
    }

    /// Returns the named message class with prefixed resource names.
    pub fn message_class(&self, name: &str) -> Result<MessageClassConfig, AmqpError> {
        self.message_classes
            .get(name)
            .map(|cfg| cfg.with_prefix(&self.name_prefix()))
            .ok_or_else(|| AmqpError::ConfigError(format!("unknown message class `{}`", name)))
    }

    /// Every configured message class with prefixed resource names, in name order.
    pub fn message_classes(&self) -> Vec<MessageClassConfig> {
        let prefix = self.name_prefix();
        self.message_classes
            .values()
            .map(|cfg| cfg.with_prefix(&prefix))
            .collect()
    }
}
