//! Experiment Control System data/services bus (DDS).
//!
//! A star-topology broker to which clients connect over TCP to register
//! *subsystems*, publish key–value properties, invoke multi-target events
//! with per-recipient return values, subscribe to value changes, and
//! discover one another. See the `broker` module for the server side and
//! the `client` module for the runtime embedded in subsystem processes.

pub mod broker;
pub mod client;
pub mod config;
pub mod logging;
pub mod magics;
pub mod proto;
pub mod seg;
pub mod subsystem;
pub mod transport;
pub mod txn;
pub mod types;

// Re-export commonly used types
pub use broker::Broker;
pub use client::{
    DdsClient, EventHandler, EventProvider, InProgressEvent, IncomingEventHandle, KvHandler,
    LocalProperty, RegisteredSubsystem, RegistrationState, RemoteProperty,
};
pub use config::{BrokerConfig, ClientConfig};
pub use logging::LogClient;
pub use proto::DdsMessage;
pub use subsystem::{EventDescriptor, KvDescriptor, SubsystemInfo};
pub use txn::{IncomingTransaction, OutgoingTransaction, TransactionManager, TxnState};
pub use types::{PropertyValue, TypeSpecifier};
