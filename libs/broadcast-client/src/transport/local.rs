use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::trace;
use uuid::Uuid;

use super::{ChannelTransport, TransportChannel, TransportChannelConfig};
use crate::error::RealtimeError;

const TOPIC_CAPACITY: usize = 256;

#[derive(Clone)]
struct BusEnvelope {
  origin: String,
  payload: Value,
}

/// In-process loopback implementation of the transport contract. Every
/// publish reaches all live channels of the same name, honoring the
/// self-broadcast toggle. Used by the integration harness and by embedders
/// running in a single process.
pub struct LocalBus {
  topics: DashMap<String, broadcast::Sender<BusEnvelope>>,
  publishes: DashMap<String, Arc<AtomicUsize>>,
  fail_subscribes: Arc<AtomicU32>,
  subscribe_calls: Arc<AtomicUsize>,
  created_channels: AtomicUsize,
}

impl LocalBus {
  pub fn new() -> Arc<Self> {
    Arc::new(Self {
      topics: DashMap::new(),
      publishes: DashMap::new(),
      fail_subscribes: Arc::new(AtomicU32::new(0)),
      subscribe_calls: Arc::new(AtomicUsize::new(0)),
      created_channels: AtomicUsize::new(0),
    })
  }

  /// Make the next `n` channel subscribes fail, simulating CHANNEL_ERROR.
  pub fn fail_next_subscribes(&self, n: u32) {
    self.fail_subscribes.store(n, Ordering::SeqCst);
  }

  /// Total subscribe attempts observed across all channels.
  pub fn subscribe_calls(&self) -> usize {
    self.subscribe_calls.load(Ordering::SeqCst)
  }

  /// Total transport channel objects ever created.
  pub fn created_channels(&self) -> usize {
    self.created_channels.load(Ordering::SeqCst)
  }

  /// Messages published on one channel name.
  pub fn published(&self, name: &str) -> usize {
    self
      .publishes
      .get(name)
      .map(|count| count.load(Ordering::SeqCst))
      .unwrap_or(0)
  }

  fn publish_counter(&self, name: &str) -> Arc<AtomicUsize> {
    self
      .publishes
      .entry(name.to_string())
      .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
      .clone()
  }

  /// Live transport connections for one channel name.
  pub fn connection_count(&self, name: &str) -> usize {
    self
      .topics
      .get(name)
      .map(|sender| sender.receiver_count())
      .unwrap_or(0)
  }

  fn topic(&self, name: &str) -> broadcast::Sender<BusEnvelope> {
    self
      .topics
      .entry(name.to_string())
      .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
      .clone()
  }
}

#[async_trait]
impl ChannelTransport for LocalBus {
  async fn create_channel(
    &self,
    name: &str,
    config: &TransportChannelConfig,
  ) -> Result<Arc<dyn TransportChannel>, RealtimeError> {
    let topic = self.topic(name);
    let origin = Uuid::new_v4().to_string();
    let (out, _) = broadcast::channel(TOPIC_CAPACITY);

    let mut rx = topic.subscribe();
    let broadcast_self = config.broadcast_self;
    let forward_out = out.clone();
    let forward_origin = origin.clone();
    let forward = tokio::spawn(async move {
      loop {
        match rx.recv().await {
          Ok(envelope) => {
            if !broadcast_self && envelope.origin == forward_origin {
              continue;
            }
            let _ = forward_out.send(envelope.payload);
          },
          Err(broadcast::error::RecvError::Lagged(n)) => {
            trace!("[local bus]: receiver lagged by {}", n);
          },
          Err(broadcast::error::RecvError::Closed) => break,
        }
      }
    });

    self.created_channels.fetch_add(1, Ordering::SeqCst);
    Ok(Arc::new(LocalChannel {
      name: name.to_string(),
      origin,
      topic,
      out,
      fail_subscribes: self.fail_subscribes.clone(),
      subscribe_calls: self.subscribe_calls.clone(),
      publish_count: self.publish_counter(name),
      forward: parking_lot::Mutex::new(Some(forward)),
    }))
  }
}

struct LocalChannel {
  name: String,
  origin: String,
  topic: broadcast::Sender<BusEnvelope>,
  out: broadcast::Sender<Value>,
  fail_subscribes: Arc<AtomicU32>,
  subscribe_calls: Arc<AtomicUsize>,
  publish_count: Arc<AtomicUsize>,
  forward: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl TransportChannel for LocalChannel {
  async fn subscribe(&self) -> Result<(), RealtimeError> {
    self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
    let injected = self
      .fail_subscribes
      .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
      .is_ok();
    if injected {
      return Err(RealtimeError::Transport(format!(
        "injected subscribe failure on {}",
        self.name
      )));
    }
    Ok(())
  }

  async fn publish(&self, payload: Value) -> Result<(), RealtimeError> {
    self.publish_count.fetch_add(1, Ordering::SeqCst);
    self
      .topic
      .send(BusEnvelope {
        origin: self.origin.clone(),
        payload,
      })
      .map(|_| ())
      .map_err(|_| RealtimeError::Transport(format!("no live receivers on {}", self.name)))
  }

  fn incoming(&self) -> broadcast::Receiver<Value> {
    self.out.subscribe()
  }

  async fn close(&self) {
    if let Some(task) = self.forward.lock().take() {
      task.abort();
    }
  }
}
