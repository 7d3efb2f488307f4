use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use broadcast_entity::BroadcastMessage;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::config::ReconnectConfig;
use crate::error::RealtimeError;
use crate::transport::{ChannelTransport, TransportChannel, TransportChannelConfig};

/// Connection state of one managed channel, observable through
/// [`ManagedChannel::state_watch`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelState {
  pub is_connected: bool,
  pub is_subscribed: bool,
  pub is_subscribing: bool,
  pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
  pub name: String,
  pub transport: TransportChannelConfig,
}

impl ChannelConfig {
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      transport: TransportChannelConfig::default(),
    }
  }

  pub fn broadcast_self(mut self, yes: bool) -> Self {
    self.transport.broadcast_self = yes;
    self
  }

  pub fn presence_key(mut self, key: impl Into<String>) -> Self {
    self.transport.presence_key = Some(key.into());
    self
  }

  pub fn access_token(mut self, token: impl Into<String>) -> Self {
    self.transport.access_token = Some(token.into());
    self
  }
}

type MessageHandler = Arc<dyn Fn(&BroadcastMessage<Value>) + Send + Sync>;
type ErrorHandler = Arc<dyn Fn(&RealtimeError) + Send + Sync>;

/// Identifier for a registered handler; pass it to [`ManagedChannel::off`] or
/// [`ManagedChannel::off_error`] to drop the registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

pub(crate) fn reconnect_delay(attempt: u32, config: &ReconnectConfig) -> Duration {
  let base = config.base_delay.as_millis() as u64;
  let exp = base.saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX));
  Duration::from_millis(exp.min(config.max_delay.as_millis() as u64))
}

/// One managed transport channel, shared by every consumer of the same
/// channel name. Owns the transport handle, the handler registry, and the
/// reconnect bookkeeping.
pub struct ManagedChannel {
  name: String,
  transport_config: TransportChannelConfig,
  transport: Arc<dyn ChannelTransport>,
  reconnect: ReconnectConfig,
  /// Memoized transport handle; the async lock doubles as the guard against
  /// racing double-creation.
  channel: Mutex<Option<Arc<dyn TransportChannel>>>,
  state_tx: watch::Sender<ChannelState>,
  handlers: RwLock<HashMap<String, Vec<(u64, MessageHandler)>>>,
  error_handlers: RwLock<Vec<(u64, ErrorHandler)>>,
  next_handler_id: AtomicU64,
  reconnect_attempts: AtomicU32,
  reconnect_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
  dispatch_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
  weak_self: Weak<ManagedChannel>,
}

impl ManagedChannel {
  pub(crate) fn new(
    config: ChannelConfig,
    transport: Arc<dyn ChannelTransport>,
    reconnect: ReconnectConfig,
  ) -> Arc<Self> {
    let (state_tx, _) = watch::channel(ChannelState::default());
    Arc::new_cyclic(|weak| Self {
      name: config.name,
      transport_config: config.transport,
      transport,
      reconnect,
      channel: Mutex::new(None),
      state_tx,
      handlers: RwLock::new(HashMap::new()),
      error_handlers: RwLock::new(Vec::new()),
      next_handler_id: AtomicU64::new(0),
      reconnect_attempts: AtomicU32::new(0),
      reconnect_task: parking_lot::Mutex::new(None),
      dispatch_task: parking_lot::Mutex::new(None),
      weak_self: weak.clone(),
    })
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn state(&self) -> ChannelState {
    self.state_tx.borrow().clone()
  }

  pub fn state_watch(&self) -> watch::Receiver<ChannelState> {
    self.state_tx.subscribe()
  }

  pub fn is_connected(&self) -> bool {
    self.state_tx.borrow().is_connected
  }

  pub fn is_subscribed(&self) -> bool {
    self.state_tx.borrow().is_subscribed
  }

  /// A channel still worth handing out from the registry.
  pub(crate) fn is_alive(&self) -> bool {
    let state = self.state_tx.borrow();
    state.is_subscribed || state.is_connected || state.is_subscribing
  }

  /// Idempotent: while already subscribed or mid-subscribe this returns
  /// without re-issuing a network subscribe.
  pub async fn subscribe(&self) -> Result<(), RealtimeError> {
    {
      let state = self.state_tx.borrow();
      if state.is_subscribed || state.is_subscribing {
        trace!("[channel {}]: subscribe is a no-op", self.name);
        return Ok(());
      }
    }
    self.update_state(|state| {
      state.is_subscribing = true;
      state.error = None;
    });

    match self.try_subscribe().await {
      Ok(()) => {
        self.reconnect_attempts.store(0, Ordering::SeqCst);
        self.update_state(|state| {
          state.is_subscribing = false;
          state.is_subscribed = true;
          state.is_connected = true;
          state.error = None;
        });
        debug!("[channel {}]: subscribed", self.name);
        Ok(())
      },
      Err(err) => {
        warn!("[channel {}]: subscribe failed: {}", self.name, err);
        self.update_state(|state| {
          state.is_subscribing = false;
          state.is_subscribed = false;
          state.error = Some(err.to_string());
        });
        self.schedule_reconnect();
        Err(err)
      },
    }
  }

  async fn try_subscribe(&self) -> Result<(), RealtimeError> {
    let channel = self.get_or_create_channel().await?;
    channel.subscribe().await
  }

  /// Lazily creates the transport channel; the memoized handle guarantees a
  /// single creation even under concurrent callers.
  async fn get_or_create_channel(&self) -> Result<Arc<dyn TransportChannel>, RealtimeError> {
    let mut guard = self.channel.lock().await;
    if let Some(channel) = guard.as_ref() {
      return Ok(channel.clone());
    }
    let channel = self
      .transport
      .create_channel(&self.name, &self.transport_config)
      .await?;
    self.update_state(|state| state.is_connected = true);
    self.spawn_dispatch(channel.incoming());
    *guard = Some(channel.clone());
    Ok(channel)
  }

  fn schedule_reconnect(&self) {
    let attempts = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst);
    if attempts >= self.reconnect.max_attempts {
      let err = RealtimeError::ReconnectExhausted {
        channel: self.name.clone(),
        attempts,
      };
      error!(
        "[channel {}]: giving up after {} subscribe attempts",
        self.name, attempts
      );
      self.update_state(|state| state.error = Some(err.to_string()));
      self.notify_error(&err);
      return;
    }

    let delay = reconnect_delay(attempts, &self.reconnect);
    debug!(
      "[channel {}]: retrying subscribe in {:?} (attempt {})",
      self.name,
      delay,
      attempts + 1
    );
    let weak = self.weak_self.clone();
    let task = tokio::spawn(async move {
      tokio::time::sleep(delay).await;
      if let Some(channel) = weak.upgrade() {
        let _ = channel.subscribe().await;
      }
    });
    if let Some(old) = self.reconnect_task.lock().replace(task) {
      old.abort();
    }
  }

  fn spawn_dispatch(&self, mut incoming: broadcast::Receiver<Value>) {
    let weak = self.weak_self.clone();
    let name = self.name.clone();
    let task = tokio::spawn(async move {
      loop {
        match incoming.recv().await {
          Ok(value) => match weak.upgrade() {
            Some(channel) => channel.dispatch(value),
            None => break,
          },
          Err(broadcast::error::RecvError::Lagged(n)) => {
            warn!("[channel {}]: dropped {} wire messages", name, n);
          },
          Err(broadcast::error::RecvError::Closed) => break,
        }
      }
    });
    if let Some(old) = self.dispatch_task.lock().replace(task) {
      old.abort();
    }
  }

  fn dispatch(&self, value: Value) {
    let message = match BroadcastMessage::from_value(value) {
      Ok(message) => message,
      Err(err) => {
        warn!("[channel {}]: undecodable wire message: {}", self.name, err);
        return;
      },
    };

    let handlers: Vec<MessageHandler> = {
      let guard = self.handlers.read();
      match guard.get(&message.message_type) {
        Some(list) => list.iter().map(|(_, handler)| handler.clone()).collect(),
        // unmatched types are dropped so new topics stay forward-compatible
        None => {
          trace!(
            "[channel {}]: no handler for type {}",
            self.name,
            message.message_type
          );
          return;
        },
      }
    };

    for handler in handlers {
      // one faulty consumer must not break delivery to the others
      if catch_unwind(AssertUnwindSafe(|| handler(&message))).is_err() {
        error!(
          "[channel {}]: handler for {} panicked",
          self.name, message.message_type
        );
      }
    }
  }

  /// Fails fast when the channel is not connected; callers decide whether to
  /// fall back to direct persistence.
  pub async fn send<T: Serialize>(
    &self,
    message: &BroadcastMessage<T>,
  ) -> Result<(), RealtimeError> {
    if !self.state_tx.borrow().is_connected {
      return Err(RealtimeError::ChannelNotConnected(self.name.clone()));
    }
    let channel = self
      .channel
      .lock()
      .await
      .clone()
      .ok_or_else(|| RealtimeError::ChannelNotConnected(self.name.clone()))?;
    channel.publish(message.to_value()?).await
  }

  pub fn on(
    &self,
    message_type: &str,
    handler: impl Fn(&BroadcastMessage<Value>) + Send + Sync + 'static,
  ) -> HandlerId {
    let id = self.next_handler_id.fetch_add(1, Ordering::Relaxed);
    self
      .handlers
      .write()
      .entry(message_type.to_string())
      .or_default()
      .push((id, Arc::new(handler)));
    HandlerId(id)
  }

  pub fn off(&self, id: HandlerId) {
    let mut guard = self.handlers.write();
    for list in guard.values_mut() {
      list.retain(|(handler_id, _)| *handler_id != id.0);
    }
    guard.retain(|_, list| !list.is_empty());
  }

  pub fn on_error(&self, handler: impl Fn(&RealtimeError) + Send + Sync + 'static) -> HandlerId {
    let id = self.next_handler_id.fetch_add(1, Ordering::Relaxed);
    self.error_handlers.write().push((id, Arc::new(handler)));
    HandlerId(id)
  }

  pub fn off_error(&self, id: HandlerId) {
    self
      .error_handlers
      .write()
      .retain(|(handler_id, _)| *handler_id != id.0);
  }

  fn notify_error(&self, err: &RealtimeError) {
    let handlers: Vec<ErrorHandler> = self
      .error_handlers
      .read()
      .iter()
      .map(|(_, handler)| handler.clone())
      .collect();
    for handler in handlers {
      if catch_unwind(AssertUnwindSafe(|| handler(err))).is_err() {
        error!("[channel {}]: error handler panicked", self.name);
      }
    }
  }

  /// Tears down the transport handle and clears every local registration.
  pub async fn unsubscribe(&self) {
    if let Some(task) = self.reconnect_task.lock().take() {
      task.abort();
    }
    if let Some(task) = self.dispatch_task.lock().take() {
      task.abort();
    }
    if let Some(channel) = self.channel.lock().await.take() {
      channel.close().await;
    }
    self.handlers.write().clear();
    self.error_handlers.write().clear();
    self.reconnect_attempts.store(0, Ordering::SeqCst);
    self.state_tx.send_replace(ChannelState::default());
    debug!("[channel {}]: unsubscribed", self.name);
  }

  fn update_state(&self, f: impl FnOnce(&mut ChannelState)) {
    self.state_tx.send_modify(f);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn backoff_doubles_up_to_the_ceiling() {
    let config = ReconnectConfig::default();
    let expected = [1_000u64, 2_000, 4_000, 8_000, 16_000];
    for (attempt, millis) in expected.iter().enumerate() {
      assert_eq!(
        reconnect_delay(attempt as u32, &config),
        Duration::from_millis(*millis)
      );
    }
    // past 2^5 the ceiling takes over
    assert_eq!(reconnect_delay(5, &config), Duration::from_millis(30_000));
    assert_eq!(reconnect_delay(12, &config), Duration::from_millis(30_000));
    assert_eq!(reconnect_delay(63, &config), Duration::from_millis(30_000));
    assert_eq!(reconnect_delay(64, &config), Duration::from_millis(30_000));
  }
}
