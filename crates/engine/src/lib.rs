//! Broker side of Townhall: the [`Broker`] trait, its backends and the
//! [`StreamingService`] connection manager.

pub mod broker;
pub mod error;
pub mod local;
pub mod log;
pub mod mock;
pub mod remote;
pub mod service;
pub mod sqlite;

pub use broker::{
    validate_topic_config, validate_topic_name, Broker, Endpoint, RecordStream,
    DEFAULT_BROKER_PORT, MAX_PARTITIONS,
};
pub use error::{BrokerError, Result};
pub use local::LocalBroker;
pub use log::{LogStore, MemoryLog};
pub use mock::MockBroker;
pub use remote::RemoteBroker;
pub use service::{
    Backend, Consumer, Delivery, Producer, RetryPolicy, StreamingService, TopicStatus,
    DEFAULT_CONNECT_TIMEOUT,
};
pub use sqlite::SqliteLog;
