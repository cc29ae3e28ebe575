// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Handlers
//!
//! Business modules plug into the consumer pipeline by implementing `ConsumerHandler`
//! for their payload type: `parse_data` turns the raw body into `Data`, `exec`
//! processes it. The pipeline never looks inside `Data`.

use crate::errors::AmqpError;
use async_trait::async_trait;
use opentelemetry::Context;
use serde::de::DeserializeOwned;

/// Parser and handler of one message class.
///
/// A parse failure archives the message to junk without calling `exec`. An `exec`
/// failure sends the message through the dead-letter retry cycle until the class
/// retry limit is reached.
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    type Data: Send;

    fn parse_data(&self, data: &[u8]) -> Result<Self::Data, AmqpError>;

    /// Processes one message; `ctx` carries the publisher's trace context.
    async fn exec(&self, ctx: &Context, data: Self::Data) -> Result<(), AmqpError>;
}

/// Deserializes a JSON body, the usual `parse_data` implementation.
pub fn parse_json<T: DeserializeOwned>(data: &[u8]) -> Result<T, AmqpError> {
    serde_json::from_slice(data).map_err(|err| AmqpError::ParsePayloadError(err.to_string()))
}
