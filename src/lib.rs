// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Reliable RabbitMQ messaging: one recovered connection, per message class topology
//! with a dead-letter retry cycle, delayed publishing and a bounded consumer pipeline
//! escalating poison messages to a junk queue.

mod consumer;
mod otel;

pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod envelope;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod publisher;
pub mod queue;
pub mod recovery;
pub mod registry;
pub mod retry;
pub mod topology;
pub mod worker;

pub use consumer::Outcome;
