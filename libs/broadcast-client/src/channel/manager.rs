use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, trace};

use super::managed::{ChannelConfig, ManagedChannel};
use crate::config::ReconnectConfig;
use crate::transport::ChannelTransport;

/// Registry owning one [`ManagedChannel`] per channel name. Every consumer of
/// the same name gets the same instance, which is what keeps the transport at
/// exactly one connection per logical topic.
pub struct ChannelManager {
  transport: Arc<dyn ChannelTransport>,
  reconnect: ReconnectConfig,
  channels: DashMap<String, Arc<ManagedChannel>>,
}

impl ChannelManager {
  pub fn new(transport: Arc<dyn ChannelTransport>, reconnect: ReconnectConfig) -> Self {
    Self {
      transport,
      reconnect,
      channels: DashMap::new(),
    }
  }

  /// Returns the live channel for `config.name`, replacing a dead entry with
  /// a fresh one.
  pub fn get_channel(&self, config: ChannelConfig) -> Arc<ManagedChannel> {
    match self.channels.entry(config.name.clone()) {
      Entry::Occupied(mut entry) => {
        if entry.get().is_alive() {
          trace!("[channels]: reusing {}", config.name);
          return entry.get().clone();
        }
        debug!("[channels]: replacing stale entry for {}", config.name);
        let fresh = ManagedChannel::new(config, self.transport.clone(), self.reconnect.clone());
        entry.insert(fresh.clone());
        fresh
      },
      Entry::Vacant(entry) => {
        debug!("[channels]: creating {}", config.name);
        let channel = ManagedChannel::new(config, self.transport.clone(), self.reconnect.clone());
        entry.insert(channel.clone());
        channel
      },
    }
  }

  /// Unsubscribes and drops the registry entry. Idempotent.
  pub async fn remove_channel(&self, name: &str) {
    if let Some((_, channel)) = self.channels.remove(name) {
      channel.unsubscribe().await;
      debug!("[channels]: removed {}", name);
    }
  }

  /// Full teardown, e.g. on logout.
  pub async fn cleanup(&self) {
    let names: Vec<String> = self.channels.iter().map(|e| e.key().clone()).collect();
    for name in names {
      self.remove_channel(&name).await;
    }
  }

  pub fn channel_count(&self) -> usize {
    self.channels.len()
  }

  pub fn contains(&self, name: &str) -> bool {
    self.channels.contains_key(name)
  }
}
