// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Class Topology
//!
//! `ClassTopology` derives the retry cycle of a message class from its configuration;
//! `AmqpTopology` collects any number of them and declares the result on one channel.
//!
//! Redeclaring an exchange or queue with identical arguments is a no-op on the broker,
//! and so is binding an already bound queue.

use crate::{
    config::MessageClassConfig,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use lapin::{
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::FieldTable,
    Channel,
};
use std::sync::Arc;
use tracing::{debug, error};

/// The declared graph of one message class.
///
/// ```text
/// direct exchange (delayed) -> direct queue -(nack)-> DLX -> DLQ -(ttl)-> direct exchange
/// junk exchange -> junk queue
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ClassTopology {
    pub(crate) exchanges: Vec<ExchangeDefinition>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) bindings: Vec<QueueBinding>,
}

impl From<&MessageClassConfig> for ClassTopology {
    fn from(cfg: &MessageClassConfig) -> ClassTopology {
        let exchanges = vec![
            ExchangeDefinition::new(&cfg.exchange_direct)
                .delayed(cfg.exchange_kind)
                .durable(),
            ExchangeDefinition::new(&cfg.exchange_dlx)
                .kind(cfg.exchange_kind)
                .durable(),
            ExchangeDefinition::new(&cfg.exchange_junk)
                .kind(cfg.exchange_kind)
                .durable(),
        ];

        let queues = vec![
            QueueDefinition::new(&cfg.queue_direct)
                .durable()
                .dead_letter(&cfg.exchange_dlx, &cfg.routing_key_dlx),
            QueueDefinition::new(&cfg.queue_dlq)
                .durable()
                .dead_letter(&cfg.exchange_direct, &cfg.routing_key_direct)
                .ttl(cfg.ttl),
            QueueDefinition::new(&cfg.queue_junk).durable(),
        ];

        let bindings = vec![
            QueueBinding::new(&cfg.queue_direct)
                .exchange(&cfg.exchange_direct)
                .routing_key(&cfg.routing_key_direct),
            QueueBinding::new(&cfg.queue_dlq)
                .exchange(&cfg.exchange_dlx)
                .routing_key(&cfg.routing_key_dlx),
            QueueBinding::new(&cfg.queue_junk)
                .exchange(&cfg.exchange_junk)
                .routing_key(&cfg.routing_key_junk),
        ];

        ClassTopology {
            exchanges,
            queues,
            bindings,
        }
    }
}

#[async_trait]
pub trait Topology<'tp> {
    fn exchange(self, def: &'tp ExchangeDefinition) -> Self;

    fn queue(self, def: &'tp QueueDefinition) -> Self;

    fn queue_binding(self, binding: &'tp QueueBinding) -> Self;

    /// Collects every exchange, queue and binding of `class`.
    fn class(self, class: &'tp ClassTopology) -> Self;

    /// Declares exchanges, then queues, then bindings. Stops at the first failure.
    async fn install(&self) -> Result<(), AmqpError>;
}

/// Definitions collected for one installation, in insertion order. A definition whose
/// name was already collected is skipped, so classes sharing an exchange declare it once.
#[derive(Debug, Default)]
pub(crate) struct Declarations<'tp> {
    pub(crate) exchanges: Vec<&'tp ExchangeDefinition>,
    pub(crate) queues: Vec<&'tp QueueDefinition>,
    pub(crate) bindings: Vec<&'tp QueueBinding>,
}

impl<'tp> Declarations<'tp> {
    fn exchange(&mut self, def: &'tp ExchangeDefinition) {
        if !self.exchanges.iter().any(|e| e.name == def.name) {
            self.exchanges.push(def);
        }
    }

    fn queue(&mut self, def: &'tp QueueDefinition) {
        if !self.queues.iter().any(|q| q.name == def.name) {
            self.queues.push(def);
        }
    }

    fn binding(&mut self, binding: &'tp QueueBinding) {
        if !self.bindings.contains(&binding) {
            self.bindings.push(binding);
        }
    }

    fn class(&mut self, class: &'tp ClassTopology) {
        class.exchanges.iter().for_each(|def| self.exchange(def));
        class.queues.iter().for_each(|def| self.queue(def));
        class.bindings.iter().for_each(|binding| self.binding(binding));
    }
}

pub struct AmqpTopology<'tp> {
    channel: Arc<Channel>,
    declarations: Declarations<'tp>,
}

impl<'tp> AmqpTopology<'tp> {
    pub fn new(channel: Arc<Channel>) -> AmqpTopology<'tp> {
        AmqpTopology {
            channel,
            declarations: Declarations::default(),
        }
    }
}

#[async_trait]
impl<'tp> Topology<'tp> for AmqpTopology<'tp> {
    fn exchange(mut self, def: &'tp ExchangeDefinition) -> Self {
        self.declarations.exchange(def);
        self
    }

    fn queue(mut self, def: &'tp QueueDefinition) -> Self {
        self.declarations.queue(def);
        self
    }

    fn queue_binding(mut self, binding: &'tp QueueBinding) -> Self {
        self.declarations.binding(binding);
        self
    }

    fn class(mut self, class: &'tp ClassTopology) -> Self {
        self.declarations.class(class);
        self
    }

    async fn install(&self) -> Result<(), AmqpError> {
        self.install_exchange().await?;
        self.install_queue().await?;
        self.binding_queues().await
    }
}

impl<'tp> AmqpTopology<'tp> {
    async fn install_exchange(&self) -> Result<(), AmqpError> {
        for exch in &self.declarations.exchanges {
            debug!("creating exchange: {}", exch.name);

            match self
                .channel
                .exchange_declare(
                    &exch.name,
                    exch.declared_kind(),
                    ExchangeDeclareOptions {
                        passive: false,
                        durable: exch.durable,
                        auto_delete: false,
                        internal: false,
                        nowait: false,
                    },
                    exch.arguments(),
                )
                .await
            {
                Err(err) => {
                    error!(
                        error = err.to_string(),
                        name = %exch.name,
                        "error to declare the exchange"
                    );
                    Err(AmqpError::DeclareExchangeError(exch.name.clone()))
                }
                _ => Ok(()),
            }?;

            debug!("exchange: {} was created", exch.name);
        }

        Ok(())
    }

    async fn install_queue(&self) -> Result<(), AmqpError> {
        for def in &self.declarations.queues {
            debug!("creating queue: {}", def.name);

            match self
                .channel
                .queue_declare(
                    &def.name,
                    QueueDeclareOptions {
                        passive: false,
                        durable: def.durable,
                        exclusive: false,
                        auto_delete: false,
                        nowait: false,
                    },
                    def.arguments(),
                )
                .await
            {
                Err(err) => {
                    error!(
                        error = err.to_string(),
                        name = %def.name,
                        "error to declare the queue"
                    );
                    Err(AmqpError::DeclareQueueError(def.name.clone()))
                }
                _ => {
                    debug!("queue: {} was created", def.name);
                    Ok(())
                }
            }?;
        }

        Ok(())
    }

    async fn binding_queues(&self) -> Result<(), AmqpError> {
        for binding in &self.declarations.bindings {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                binding.queue_name, binding.exchange_name, binding.routing_key
            );

            match self
                .channel
                .queue_bind(
                    &binding.queue_name,
                    &binding.exchange_name,
                    &binding.routing_key,
                    QueueBindOptions { nowait: false },
                    FieldTable::default(),
                )
                .await
            {
                Err(err) => {
                    error!(error = err.to_string(), "error to bind queue to exchange");

                    Err(AmqpError::BindingExchangeToQueueError(
                        binding.exchange_name.clone(),
                        binding.queue_name.clone(),
                    ))
                }
                _ => Ok(()),
            }?;
        }

        debug!("queues were bound");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        exchange::{ExchangeKind, AMQP_HEADERS_DELAYED_EXCHANGE_TYPE},
        queue::{
            AMQP_HEADERS_DEAD_LETTER_EXCHANGE, AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY,
            AMQP_HEADERS_MESSAGE_TTL,
        },
    };
    use lapin::types::{AMQPValue, LongString};

    fn class() -> MessageClassConfig {
        MessageClassConfig {
            enabled: true,
            exchange_kind: ExchangeKind::Direct,
            exchange_direct: "direct-ex".to_owned(),
            queue_direct: "direct-q".to_owned(),
            routing_key_direct: "direct-rk".to_owned(),
            exchange_dlx: "dlx-ex".to_owned(),
            queue_dlq: "dlq-q".to_owned(),
            routing_key_dlx: "dlx-rk".to_owned(),
            exchange_junk: "junk-ex".to_owned(),
            queue_junk: "junk-q".to_owned(),
            routing_key_junk: "junk-rk".to_owned(),
            ttl: 30000,
            delay: 1000,
            limit: 3,
        }
    }

    fn long_string(value: &str) -> AMQPValue {
        AMQPValue::LongString(LongString::from(value))
    }

    #[test]
    fn class_topology_declares_delayed_direct_exchange() {
        let topology = ClassTopology::from(&class());

        let names: Vec<&str> = topology.exchanges.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["direct-ex", "dlx-ex", "junk-ex"]);

        let direct = &topology.exchanges[0];
        assert!(direct.delayed && direct.durable);
        assert_eq!(
            direct.params.get(AMQP_HEADERS_DELAYED_EXCHANGE_TYPE),
            Some(&long_string("direct"))
        );
        assert!(topology.exchanges[1..].iter().all(|e| !e.delayed && e.durable));
    }

    #[test]
    fn class_topology_builds_retry_cycle() {
        let topology = ClassTopology::from(&class());
        let names: Vec<&str> = topology.queues.iter().map(|q| q.name.as_str()).collect();
        assert_eq!(names, vec!["direct-q", "dlq-q", "junk-q"]);

        let direct = topology.queues[0].arguments();
        assert_eq!(
            direct.inner().get(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            Some(&long_string("dlx-ex"))
        );
        assert_eq!(
            direct.inner().get(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            Some(&long_string("dlx-rk"))
        );
        assert_eq!(direct.inner().get(AMQP_HEADERS_MESSAGE_TTL), None);

        let dlq = topology.queues[1].arguments();
        assert_eq!(
            dlq.inner().get(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            Some(&long_string("direct-ex"))
        );
        assert_eq!(
            dlq.inner().get(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            Some(&long_string("direct-rk"))
        );
        assert_eq!(
            dlq.inner().get(AMQP_HEADERS_MESSAGE_TTL),
            Some(&AMQPValue::LongLongInt(30000))
        );

        assert!(topology.queues[2].arguments().inner().is_empty());
    }

    #[test]
    fn class_topology_binds_each_queue_with_its_routing_key() {
        let topology = ClassTopology::from(&class());

        assert_eq!(
            topology.bindings,
            vec![
                QueueBinding::new("direct-q")
                    .exchange("direct-ex")
                    .routing_key("direct-rk"),
                QueueBinding::new("dlq-q").exchange("dlx-ex").routing_key("dlx-rk"),
                QueueBinding::new("junk-q")
                    .exchange("junk-ex")
                    .routing_key("junk-rk"),
            ]
        );
    }

    #[test]
    fn class_topology_is_deterministic() {
        assert_eq!(ClassTopology::from(&class()), ClassTopology::from(&class()));
    }

    #[test]
    fn classes_sharing_resources_declare_them_once() {
        let first = ClassTopology::from(&class());
        let second = ClassTopology::from(&MessageClassConfig {
            exchange_direct: "other-ex".to_owned(),
            queue_direct: "other-q".to_owned(),
            ..class()
        });

        let mut declarations = Declarations::default();
        declarations.class(&first);
        declarations.class(&second);
        declarations.class(&first);

        let exchanges: Vec<&str> = declarations.exchanges.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(exchanges, vec!["direct-ex", "dlx-ex", "junk-ex", "other-ex"]);

        let queues: Vec<&str> = declarations.queues.iter().map(|q| q.name.as_str()).collect();
        assert_eq!(queues, vec!["direct-q", "dlq-q", "junk-q", "other-q"]);

        assert_eq!(declarations.bindings.len(), 4);
        assert_eq!(
            declarations.bindings[3],
            &QueueBinding::new("other-q")
                .exchange("other-ex")
                .routing_key("direct-rk")
        );
    }
}
