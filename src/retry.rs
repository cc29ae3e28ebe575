// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Retry Counting
//!
//! How many times a message already went through the dead-letter cycle is read from
//! broker metadata. The source of that number differs between brokers and client
//! libraries, so it is a strategy: `XDeathCounter` reads the `x-death` header RabbitMQ
//! maintains when dead-lettering, `HeaderCounter` reads an integer header set by the
//! publisher and `RedeliveredCounter` only distinguishes first delivery from redelivery.

use lapin::types::{AMQPValue, FieldTable};

/// Header RabbitMQ appends to every dead-lettered message
pub const AMQP_HEADERS_X_DEATH: &str = "x-death";
/// Number of times the message was dead-lettered for a given queue and reason
pub const AMQP_HEADERS_COUNT: &str = "count";
/// Queue the message was dead-lettered from
pub const AMQP_HEADERS_QUEUE: &str = "queue";

/// Extracts the retry count of a delivery.
pub trait RetryCounter: Send + Sync {
    fn retry_count(&self, headers: &FieldTable, redelivered: bool) -> i64;
}

/// Reads the `count` of the `x-death` entry recorded for `queue`.
///
/// Without a queue, or when no entry names it, the first (most recent) entry is used.
#[derive(Debug, Clone, Default)]
pub struct XDeathCounter {
    queue: Option<String>,
}

impl XDeathCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_queue(queue: &str) -> Self {
        XDeathCounter {
            queue: Some(queue.to_owned()),
        }
    }
}

impl RetryCounter for XDeathCounter {
    fn retry_count(&self, headers: &FieldTable, _redelivered: bool) -> i64 {
        let entries = match headers.inner().get(AMQP_HEADERS_X_DEATH) {
            Some(AMQPValue::FieldArray(arr)) => arr.as_slice(),
            _ => return 0,
        };

        let tables = entries.iter().filter_map(|value| match value {
            AMQPValue::FieldTable(table) => Some(table),
            _ => None,
        });

        let matching = self.queue.as_deref().and_then(|queue| {
            tables.clone().find(|table| {
                table
                    .inner()
                    .get(AMQP_HEADERS_QUEUE)
                    .and_then(as_string)
                    .is_some_and(|name| name == queue)
            })
        });

        matching
            .or_else(|| tables.clone().next())
            .and_then(|table| table.inner().get(AMQP_HEADERS_COUNT))
            .and_then(as_integer)
            .unwrap_or_default()
    }
}

/// Reads an integer header, e.g. a custom `x-retry-count` set on republish.
#[derive(Debug, Clone)]
pub struct HeaderCounter {
    header: String,
}

impl HeaderCounter {
    pub fn new(header: &str) -> Self {
        HeaderCounter {
            header: header.to_owned(),
        }
    }
}

impl RetryCounter for HeaderCounter {
    fn retry_count(&self, headers: &FieldTable, _redelivered: bool) -> i64 {
        headers
            .inner()
            .get(self.header.as_str())
            .and_then(as_integer)
            .unwrap_or_default()
    }
}

/// Uses the AMQP `redelivered` flag: 0 on first delivery, 1 afterwards.
#[derive(Debug, Clone, Copy, Default)]
pub struct RedeliveredCounter;

impl RetryCounter for RedeliveredCounter {
    fn retry_count(&self, _headers: &FieldTable, redelivered: bool) -> i64 {
        i64::from(redelivered)
    }
}

fn as_integer(value: &AMQPValue) -> Option<i64> {
    match value {
        AMQPValue::LongLongInt(v) => Some(*v),
        AMQPValue::LongInt(v) => Some(i64::from(*v)),
        AMQPValue::LongUInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortUInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortShortUInt(v) => Some(i64::from(*v)),
        AMQPValue::Timestamp(v) => i64::try_from(*v).ok(),
        _ => None,
    }
}

fn as_string(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(v) => Some(String::from_utf8_lossy(v.as_bytes()).into_owned()),
        AMQPValue::ShortString(v) => Some(v.as_str().to_owned()),
        _ => None,
    }
}
