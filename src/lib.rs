//! # RelayMQ
//!
//! `relaymq` is a messaging gateway that sits between applications and two
//! kinds of brokers: a partitioned, persistent log broker (topics with named
//! subscriptions) and a classic queue broker.
//!
//! ## Core Modules
//!
//! - `broker`: Broker seams (`LogBroker`, `QueueBroker`), the embedded sled-backed
//!   log broker and an in-process queue broker.
//! - `producer`: Per-topic producers with optional batching.
//! - `consumer`: Subscription consumers with explicit acknowledgement.
//! - `reader`: Positional readers that never create subscription state.
//! - `endpoint`: Opens, tracks and shuts down every producer, consumer and reader.
//! - `routing`: Declarative source to sink routes with retry and dead-lettering.
//! - `stats`: Point-in-time counters for topics, queues, endpoints and routes.
//! - `transport`: The WebSocket ingress.
//! - `config`: Layered configuration loading.
//! - `persistence`: sled storage used by the embedded log broker.
//! - `utils`: Error types and logging setup.

pub mod broker;
pub mod config;
pub mod consumer;
pub mod endpoint;
pub mod persistence;
pub mod producer;
pub mod reader;
pub mod routing;
pub mod stats;
pub mod transport;
pub mod utils;
