//! Event hub operation layer.
//!
//! A [`ClientFactory`] memoizes broker clients and owns the processor groups, the
//! [`EventHubTemplate`] sends events and fans delivered batches out to local consumers,
//! and the [`InboundAdapter`] / [`OutboundHandler`] bridge application messages onto
//! both. Brokers plug in through the [`Connector`] trait: [`KafkaConnector`] talks the
//! Kafka protocol, [`InMemoryBroker`] keeps everything in the process.
//!
//! ## Error logging
//!
//! Log broker and checkpoint errors as structured fields (`error = %e`); handler errors
//! are `anyhow::Error` and are logged with `error = ?e` so their cause chain is visible.

pub mod broker;
pub mod checkpoint_store;
pub mod checkpointer;
pub mod client_factory;
pub mod config;
pub mod connection;
pub mod converter;
pub mod error;
pub mod inbound;
pub mod kafka;
pub mod memoizer;
pub mod memory;
pub mod metrics_consts;
pub mod outbound;
pub mod processor;
pub mod template;
pub mod types;

pub use broker::{Connector, ConsumerClient, ProcessorHandle, ProcessorOptions, ProducerClient};
pub use checkpoint_store::{CheckpointStorage, CheckpointStore};
pub use checkpointer::Checkpointer;
pub use client_factory::{ClientFactory, ClientFactoryOptions, ProcessorGroup};
pub use config::{EventHubConfig, KafkaConfig, RetryOptions};
pub use converter::{JsonMessageConverter, Message, MessageConverter};
pub use error::{EventHubError, Result};
pub use inbound::{InboundAdapter, InboundMessage, MessageHandler};
pub use kafka::KafkaConnector;
pub use memory::InMemoryBroker;
pub use outbound::OutboundHandler;
pub use template::{consumer_fn, BatchConsumer, EventBatch, EventHubTemplate};
pub use types::{
    CheckpointMode, EntityRef, EventData, PartitionSupplier, ReceivedEvent, StartPosition,
};
