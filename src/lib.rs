//! # Rabbit Listener
//! A supervised, multi-worker RabbitMQ consumer.
//!
//! Register async handlers against queues, start them as pools of workers
//! that each hold their own connection, and let the workers reconnect on
//! their own when the broker goes away. [`Consumer::start`] returns once every
//! worker is consuming.

pub mod amqp;
pub mod broker;
pub mod codec;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod listener;
pub mod memory;
pub mod signal;
pub mod status;
pub mod worker;

// Re-export key components for easy access
pub use amqp::AmqpBroker;
pub use broker::{Broker, BrokerChannel, BrokerConnection, Delivery, Metadata, Properties};
pub use codec::{AutoDecoder, AutoEncoder, Body, Decoder, Encoder, JsonDecoder, JsonEncoder, PassthroughDecoder};
pub use config::{AckMode, ChannelSetup, ListenerConfig, ListenerConfigBuilder, QosOptions, QueueOptions};
pub use connection::ConnectionSpec;
pub use consumer::{Consumer, ListenerHandle, ListenerSet};
pub use dispatcher::{DispatchOutcome, Dispatcher};
pub use error::{BoxError, BrokerError, ConfigError, ConsumerError, DispatchError, WorkerError};
pub use handler::{Channel, FromMessage, Handler, IntoReply, Json, Message};
pub use listener::Listener;
pub use memory::MemoryBroker;
pub use signal::wait_for_shutdown_signal;
pub use status::{StatusChange, StatusRegistry, WorkerId, WorkerStatus};
pub use worker::Worker;
