// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Dispatcher
//!
//! This module subscribes a message class handler to the direct queue of its class.
//! A subscription is made of:
//!
//! - a consumer on the shared consume channel, with a per-consumer QoS prefetch limit
//! - a collector task forwarding every delivery into a bounded task queue
//! - a `WorkerPool` pulling from that queue and running the consumer pipeline
//!
//! When the broker delivery stream ends (channel or connection closed) the collector
//! exits and closes the task queue, the workers then drain it and exit. A stream error
//! is reported to the connection manager as a close notice, and the subscription is
//! recreated by the `ConsumerRegistry` after the reconnect.

use crate::{
    config::{ConsumerConfigs, MessageClassConfig},
    connection::ConnectionManager,
    consumer::{consume, ConsumeContext},
    envelope::Envelope,
    errors::AmqpError,
    handler::ConsumerHandler,
    publisher::Producer,
    retry::{RetryCounter, XDeathCounter},
    worker::WorkerPool,
};
use async_trait::async_trait;
use futures_util::{pin_mut, Stream, StreamExt};
use lapin::{
    acker::Acker,
    options::{BasicCancelOptions, BasicConsumeOptions, BasicQosOptions},
    types::FieldTable,
    Channel,
};
use opentelemetry::global::{self, BoxedTracer};
use std::{fmt::Display, sync::Arc};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Anything the `ConsumerRegistry` can (re)subscribe.
#[async_trait]
pub trait Inbound: Send + Sync {
    /// Queue consumed by this inbound.
    fn queue(&self) -> &str;

    /// Opens a new subscription, `None` when the message class is disabled.
    async fn subscribe(&self) -> Result<Option<Subscription>, AmqpError>;
}

/// Consumer pipeline of one message class.
pub struct RetriableDispatcher<H: ConsumerHandler> {
    manager: Arc<ConnectionManager>,
    producer: Arc<dyn Producer>,
    cfg: Arc<MessageClassConfig>,
    consumer_cfg: ConsumerConfigs,
    handler: Arc<H>,
    retry_counter: Arc<dyn RetryCounter>,
}

impl<H: ConsumerHandler + 'static> RetriableDispatcher<H> {
    /// Creates a dispatcher counting retries from the `x-death` entries of the class
    /// direct queue.
    ///
    /// # Parameters
    /// * `manager` - Source of the consume channel
    /// * `producer` - Used to archive messages to the junk queue
    /// * `cfg` - Message class, with prefixed names
    /// * `consumer_cfg` - Prefetch, worker pool and task queue sizing
    /// * `handler` - Parser and handler of the class payload
    pub fn new(
        manager: Arc<ConnectionManager>,
        producer: Arc<dyn Producer>,
        cfg: MessageClassConfig,
        consumer_cfg: ConsumerConfigs,
        handler: Arc<H>,
    ) -> RetriableDispatcher<H> {
        let retry_counter = Arc::new(XDeathCounter::for_queue(&cfg.queue_direct));

        RetriableDispatcher {
            manager,
            producer,
            cfg: Arc::new(cfg),
            consumer_cfg,
            handler,
            retry_counter,
        }
    }

    pub fn with_retry_counter(mut self, retry_counter: Arc<dyn RetryCounter>) -> Self {
        self.retry_counter = retry_counter;
        self
    }

    /// Subscribes to the class direct queue and starts the worker pool.
    ///
    /// Returns `Ok(None)` for a disabled class. Fails if the consume channel is not
    /// open, or if the QoS or the consumer cannot be declared.
    pub async fn consume(&self) -> Result<Option<Subscription>, AmqpError> {
        if !self.cfg.enabled {
            warn!(queue = %self.cfg.queue_direct, "message class disabled, not consuming");
            return Ok(None);
        }

        let queue = self.cfg.queue_direct.clone();
        let (channel, generation) = self.manager.consume_state().await?;

        match channel
            .basic_qos(
                self.consumer_cfg.prefetch_count(),
                BasicQosOptions { global: false },
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), queue = %queue, "error to set the qos");
                Err(AmqpError::QoSDeclarationError(queue.clone()))
            }
            _ => Ok(()),
        }?;

        let tag = format!("{}-{}", queue, Uuid::new_v4());
        let consumer = match channel
            .basic_consume(
                &queue,
                &tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), queue = %queue, "error to create the consumer");
                Err(AmqpError::BindingConsumerError(queue.clone()))
            }
            Ok(c) => Ok(c),
        }?;

        let (tx, rx) = mpsc::channel(self.consumer_cfg.task_buffer());
        let collector = spawn_collector::<_, _, _, Envelope<Acker>>(
            self.manager.clone(),
            generation,
            consumer,
            tx,
        );

        let worker = Arc::new(Worker {
            tracer: global::tracer("amqp consumer"),
            cfg: self.cfg.clone(),
            handler: self.handler.clone(),
            producer: self.producer.clone(),
            retry_counter: self.retry_counter.clone(),
        });
        let pool = WorkerPool::spawn(self.consumer_cfg.worker_count(), rx, move |_, envelope| {
            let worker = worker.clone();
            async move { worker.process(envelope).await }
        });

        info!(
            queue = %queue,
            consumer_tag = %tag,
            workers = pool.size(),
            "consumer started"
        );

        Ok(Some(Subscription {
            queue,
            tag,
            channel,
            collector,
            pool,
        }))
    }
}

#[async_trait]
impl<H: ConsumerHandler + 'static> Inbound for RetriableDispatcher<H> {
    fn queue(&self) -> &str {
        &self.cfg.queue_direct
    }

    async fn subscribe(&self) -> Result<Option<Subscription>, AmqpError> {
        self.consume().await
    }
}

struct Worker<H: ConsumerHandler> {
    tracer: BoxedTracer,
    cfg: Arc<MessageClassConfig>,
    handler: Arc<H>,
    producer: Arc<dyn Producer>,
    retry_counter: Arc<dyn RetryCounter>,
}

impl<H: ConsumerHandler> Worker<H> {
    async fn process(&self, envelope: Envelope<Acker>) {
        let ctx = ConsumeContext {
            tracer: &self.tracer,
            cfg: self.cfg.as_ref(),
            handler: self.handler.as_ref(),
            producer: self.producer.as_ref(),
            retry_counter: self.retry_counter.as_ref(),
        };

        match consume(&ctx, envelope).await {
            Ok(outcome) => debug!(queue = %self.cfg.queue_direct, ?outcome, "message processed"),
            Err(err) => error!(error = err.to_string(), "error consume msg"),
        }
    }
}

/// Runs `forward` on its own task. A failure is reported as a close notice of the
/// connection `generation` the subscription was opened on.
pub(crate) fn spawn_collector<S, D, E, T>(
    manager: Arc<ConnectionManager>,
    generation: u64,
    deliveries: S,
    tasks: mpsc::Sender<T>,
) -> JoinHandle<Result<(), AmqpError>>
where
    S: Stream<Item = Result<D, E>> + Send + 'static,
    D: Into<T> + Send,
    E: Display + Send,
    T: Send + 'static,
{
    tokio::spawn(async move {
        let result = forward::<_, _, _, T>(deliveries, tasks).await;
        if let Err(err) = &result {
            manager.notify_closed(generation, &err.to_string());
        }
        result
    })
}

/// Forwards deliveries into the task queue until the stream ends.
///
/// A stream error ends the subscription, as does a task queue without workers.
/// Dropping `tasks` on return closes the queue for the workers.
pub(crate) async fn forward<S, D, E, T>(deliveries: S, tasks: mpsc::Sender<T>) -> Result<(), AmqpError>
where
    S: Stream<Item = Result<D, E>>,
    D: Into<T>,
    E: Display,
{
    pin_mut!(deliveries);

    while let Some(result) = deliveries.next().await {
        match result {
            Ok(delivery) => {
                if tasks.send(delivery.into()).await.is_err() {
                    warn!("task queue closed, stopping the collector");
                    return Err(AmqpError::ConsumerError("task queue closed".to_owned()));
                }
            }
            Err(err) => {
                error!(error = err.to_string(), "errors consume msg");
                return Err(AmqpError::ConsumerError(err.to_string()));
            }
        }
    }

    info!("delivery stream ended");
    Ok(())
}

/// A running consumer of one direct queue.
pub struct Subscription {
    queue: String,
    tag: String,
    channel: Arc<Channel>,
    collector: JoinHandle<Result<(), AmqpError>>,
    pool: WorkerPool,
}

impl Subscription {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn consumer_tag(&self) -> &str {
        &self.tag
    }

    /// Cancels the consumer and stops the workers after their current message.
    ///
    /// Messages still buffered are never acknowledged; the broker redelivers them once
    /// their channel is closed.
    pub async fn stop(&self) {
        if let Err(err) = self
            .channel
            .basic_cancel(&self.tag, BasicCancelOptions::default())
            .await
        {
            debug!(error = err.to_string(), tag = %self.tag, "consumer already gone");
        }

        self.collector.abort();
        self.pool.stop();
    }

    /// Waits until the collector and every worker exited.
    ///
    /// Returns the collector error when the delivery stream failed.
    pub async fn join(self) -> Result<(), AmqpError> {
        let collected = match self.collector.await {
            Ok(result) => result,
            Err(err) if err.is_cancelled() => Ok(()),
            Err(err) => {
                error!(error = err.to_string(), "collector panicked");
                Err(AmqpError::InternalError)
            }
        };

        self.pool.join().await?;
        collected
    }
}
