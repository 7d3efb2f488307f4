use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::RealtimeError;

pub mod local;

/// Options handed to the transport when a named channel is created.
#[derive(Debug, Clone, Default)]
pub struct TransportChannelConfig {
  /// Deliver our own broadcasts back to us. Domain handlers that rely on echo
  /// suppression turn this on; presence channels leave it off.
  pub broadcast_self: bool,
  /// Opaque per-connection token for the transport's presence sub-protocol.
  pub presence_key: Option<String>,
  /// Bearer credential passed at channel creation.
  pub access_token: Option<String>,
}

/// The publish/subscribe collaborator. The core only requires named channels,
/// a subscribe/publish pair, and a stream of raw wire payloads; everything
/// else (reconnect, dispatch, dedup) lives above this seam.
#[async_trait]
pub trait ChannelTransport: Send + Sync {
  async fn create_channel(
    &self,
    name: &str,
    config: &TransportChannelConfig,
  ) -> Result<Arc<dyn TransportChannel>, RealtimeError>;
}

#[async_trait]
pub trait TransportChannel: Send + Sync {
  /// Issue the network subscribe for this channel.
  async fn subscribe(&self) -> Result<(), RealtimeError>;

  async fn publish(&self, payload: Value) -> Result<(), RealtimeError>;

  /// Raw wire payloads delivered to this channel.
  fn incoming(&self) -> broadcast::Receiver<Value>;

  async fn close(&self);
}
