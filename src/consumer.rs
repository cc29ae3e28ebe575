// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! This module implements the processing of a single delivered message, including
//! parse failure handling, the dead-letter retry cycle and escalation to the junk
//! queue once the class retry limit is reached. Each message gets its own
//! OpenTelemetry consumer span.

use crate::{
    config::MessageClassConfig,
    envelope::{Acknowledger, Envelope},
    errors::AmqpError,
    handler::ConsumerHandler,
    otel,
    publisher::Producer,
    retry::RetryCounter,
};
use futures_util::FutureExt;
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
};
use std::{any::Any, borrow::Cow, panic::AssertUnwindSafe};
use tracing::{debug, error, warn};

/// What happened to a processed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Handler succeeded, message acknowledged
    Acked,
    /// Handler failed, message rejected into the dead-letter cycle
    Retried { retry_count: i64 },
    /// Body could not be parsed, message archived to junk
    Unparseable,
    /// Retry limit reached, message archived to junk
    Exhausted { retry_count: i64 },
}

/// Everything a worker needs to process messages of one class.
pub(crate) struct ConsumeContext<'c, H: ConsumerHandler> {
    pub(crate) tracer: &'c BoxedTracer,
    pub(crate) cfg: &'c MessageClassConfig,
    pub(crate) handler: &'c H,
    pub(crate) producer: &'c dyn Producer,
    pub(crate) retry_counter: &'c dyn RetryCounter,
}

/// Consumes and processes a message from RabbitMQ.
///
/// This function:
/// 1. Extracts the retry count from the delivery metadata
/// 2. Parses the body; on failure archives it to junk and acknowledges it
/// 3. Runs the handler and acknowledges on success
/// 4. On handler failure rejects the message into the dead-letter cycle, or archives
///    it to junk and acknowledges it once the retry count reached the class limit
///
/// Junk publishing happens before the acknowledgement so a failed junk publish never
/// loses the message: it is rejected into the retry cycle instead.
pub(crate) async fn consume<H, A>(
    ctx: &ConsumeContext<'_, H>,
    envelope: Envelope<A>,
) -> Result<Outcome, AmqpError>
where
    H: ConsumerHandler,
    A: Acknowledger,
{
    let cfg = ctx.cfg;
    let count = ctx
        .retry_counter
        .retry_count(&envelope.headers, envelope.redelivered);

    let (otel_ctx, mut span) = otel::new_span(&envelope.headers, ctx.tracer, &cfg.queue_direct);

    debug!(
        queue = %cfg.queue_direct,
        delivery_tag = envelope.delivery_tag,
        retry_count = count,
        "received message"
    );

    let data = match ctx.handler.parse_data(&envelope.data) {
        Ok(data) => data,
        Err(err) => {
            error!(
                error = err.to_string(),
                queue = %cfg.queue_direct,
                "failed to parse data, sending to junk"
            );
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("unparseable message"),
            });

            return archive(ctx, &envelope, &mut span).await.map(|_| Outcome::Unparseable);
        }
    };

    // A panicking handler is a failed attempt like any other
    let result = match AssertUnwindSafe(ctx.handler.exec(&otel_ctx, data))
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(panic) => Err(AmqpError::HandlerError(panic_message(panic.as_ref()))),
    };
    if result.is_ok() {
        debug!("message successfully processed");
        return match envelope.ack().await {
            Err(e) => {
                span.record_error(&e);
                span.set_status(Status::Error {
                    description: Cow::from("error to ack msg"),
                });
                Err(e)
            }
            _ => {
                span.set_status(Status::Ok);
                Ok(Outcome::Acked)
            }
        };
    }

    if let Err(err) = &result {
        warn!(
            error = err.to_string(),
            queue = %cfg.queue_direct,
            retry_count = count,
            "failed to process message"
        );
        span.record_error(err);
    }

    // Reject into the DLX -> DLQ -> (ttl) -> direct exchange cycle while retries remain
    if count < cfg.limit {
        span.set_status(Status::Error {
            description: Cow::from("requeuing msg for latter"),
        });
        return match envelope.nack().await {
            Err(e) => {
                span.record_error(&e);
                Err(e)
            }
            _ => Ok(Outcome::Retried { retry_count: count }),
        };
    }

    error!(
        queue = %cfg.queue_direct,
        retry_count = count,
        limit = cfg.limit,
        "too many attempts, sending to junk"
    );
    span.set_status(Status::Error {
        description: Cow::from("retries exhausted"),
    });

    archive(ctx, &envelope, &mut span)
        .await
        .map(|_| Outcome::Exhausted { retry_count: count })
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {msg}")
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        format!("handler panicked: {msg}")
    } else {
        "handler panicked".to_owned()
    }
}

/// Copies the message to junk, then removes it from the direct queue.
async fn archive<H, A, S>(
    ctx: &ConsumeContext<'_, H>,
    envelope: &Envelope<A>,
    span: &mut S,
) -> Result<(), AmqpError>
where
    H: ConsumerHandler,
    A: Acknowledger,
    S: Span,
{
    if let Err(e) = ctx.producer.send_to_junk(ctx.cfg, &envelope.data).await {
        error!("error whiling sending to junk");
        span.record_error(&e);
        if let Err(nack_err) = envelope.nack().await {
            span.record_error(&nack_err);
        }
        return Err(e);
    }

    if let Err(e) = envelope.ack().await {
        error!("error whiling ack msg sent to junk");
        span.record_error(&e);
        return Err(e);
    }

    Ok(())
}
