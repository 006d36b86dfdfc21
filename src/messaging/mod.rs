pub mod broker;
pub mod message;

pub use broker::{BrokerConfig, BrokerStats, MessageBroker};
pub use message::{Message, MessageType};
