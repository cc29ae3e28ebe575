// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Registries
//!
//! `ProducerRegistry` provisions the topology of every enabled message class on the
//! produce channel. `ConsumerRegistry` keeps one subscription per inbound. Both run at
//! startup and again, as `Restore` steps, after every reconnect.

use crate::{
    config::MessageClassConfig,
    connection::ConnectionManager,
    dispatcher::{Inbound, Subscription},
    errors::AmqpError,
    recovery::Restore,
    topology::{AmqpTopology, ClassTopology, Topology},
};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Topology registrar of the enabled message classes.
pub struct ProducerRegistry {
    manager: Arc<ConnectionManager>,
    classes: Vec<ClassTopology>,
}

impl ProducerRegistry {
    /// Disabled classes are skipped: no exchange or queue is declared for them.
    pub fn new(manager: Arc<ConnectionManager>, classes: &[MessageClassConfig]) -> ProducerRegistry {
        let classes = classes
            .iter()
            .filter(|cfg| {
                if !cfg.enabled {
                    debug!(queue = %cfg.queue_direct, "message class disabled, skipping topology");
                }
                cfg.enabled
            })
            .map(ClassTopology::from)
            .collect();

        ProducerRegistry { manager, classes }
    }

    pub fn classes(&self) -> &[ClassTopology] {
        &self.classes
    }

    /// Declares every exchange, queue and binding. Re-running it against a matching
    /// topology has no effect on the broker.
    pub async fn register(&self) -> Result<(), AmqpError> {
        let channel = self.manager.channel_produce().await?;

        let topology = self
            .classes
            .iter()
            .fold(AmqpTopology::new(channel), |topology, class| topology.class(class));

        topology.install().await?;
        info!(classes = self.classes.len(), "topology registered");
        Ok(())
    }
}

#[async_trait]
impl Restore for ProducerRegistry {
    fn name(&self) -> &str {
        "topology"
    }

    async fn restore(&self) -> Result<(), AmqpError> {
        self.register().await
    }
}

/// Holder of every consumer subscription of the process.
pub struct ConsumerRegistry {
    inbounds: Vec<Arc<dyn Inbound>>,
    active: Mutex<Vec<Subscription>>,
}

impl Default for ConsumerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsumerRegistry {
    pub fn new() -> ConsumerRegistry {
        ConsumerRegistry {
            inbounds: vec![],
            active: Mutex::new(vec![]),
        }
    }

    pub fn inbound(mut self, inbound: Arc<dyn Inbound>) -> Self {
        self.inbounds.push(inbound);
        self
    }

    /// Stops the current subscriptions and subscribes every inbound again.
    ///
    /// The first failing inbound aborts the registration; subscriptions opened before
    /// it stay active until the next call.
    pub async fn register(&self) -> Result<(), AmqpError> {
        let mut active = self.active.lock().await;
        Self::stop_all(&mut active).await;

        for inbound in &self.inbounds {
            if let Some(subscription) = inbound.subscribe().await? {
                active.push(subscription);
            }
        }

        info!(subscriptions = active.len(), "consumers registered");
        Ok(())
    }

    pub async fn active(&self) -> usize {
        self.active.lock().await.len()
    }

    /// Stops every subscription and waits for its workers.
    pub async fn shutdown(&self) {
        let mut active = self.active.lock().await;
        Self::stop_all(&mut active).await;
    }

    async fn stop_all(active: &mut Vec<Subscription>) {
        for subscription in active.drain(..) {
            subscription.stop().await;
            let queue = subscription.queue().to_owned();
            if let Err(err) = subscription.join().await {
                warn!(error = err.to_string(), queue = %queue, "subscription ended with error");
            }
        }
    }
}

#[async_trait]
impl Restore for ConsumerRegistry {
    fn name(&self) -> &str {
        "consumers"
    }

    async fn restore(&self) -> Result<(), AmqpError> {
        self.register().await
    }
}
