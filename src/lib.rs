#![doc = include_str!("../README.md")]
#![warn(rustdoc::broken_intra_doc_links)]
#![deny(warnings)]
pub mod broker;
pub mod buffer;
pub mod config;
pub mod console;
pub mod error;
pub mod gateway;
pub mod node;
pub mod ping;
pub mod protocol;
pub mod registry;
pub mod transport;
#[cfg(test)]
pub(crate) mod testutil;

pub use broker::BrokerLink;
#[cfg(feature = "mqtt")]
pub use broker::MqttLink;
pub use config::GatewayConfig;
pub use console::{CommandTable, ConsoleChannels, ConsoleServer};
pub use error::{GatewayError, Result};
pub use gateway::{Gateway, GatewayCore, Shutdown};
pub use node::NodeAgent;
pub use protocol::ControlMessage;
pub use transport::{InProcessMesh, MeshEvent, MeshHandle, MeshTransport};
