mod connection;
mod managed;
mod manager;

pub use connection::ConnectionManager;
pub use managed::{ChannelConfig, ChannelState, HandlerId, ManagedChannel};
pub use manager::ChannelManager;
