#![warn(missing_docs)]

//! WikiMesh replication subsystem: instance registration, message relay with
//! dedup and retry, ask/answer correlation, replication topology.

pub mod answer;
pub mod config;
pub mod error;
pub mod http;
pub mod instance;
pub mod loopback;
pub mod message;
pub mod message_log;
pub mod node;
pub mod receiver;
pub mod registry;
pub mod relay;
pub mod sender;
pub mod signing;
pub mod store;
pub mod topology;
pub mod transport;

pub use config::ReplConfig;
pub use error::{ReplError, Result};
pub use instance::{Instance, InstanceStatus, LocalInstance};
pub use message::{Message, MessageHeader, Metadata};
pub use node::{NodeBuilder, ReplicationNode, Stores};
pub use topology::{Direction, EntityRef, InstanceRule, ReplicationConfig, ReplicationLevel};
