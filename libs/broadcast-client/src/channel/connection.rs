use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::managed::ManagedChannel;
use crate::error::RealtimeError;

type SetupResult = Result<Arc<ManagedChannel>, Arc<RealtimeError>>;
type InFlight = Shared<BoxFuture<'static, SetupResult>>;

/// Deduplicates concurrent subscribe attempts and debounces teardown.
///
/// UI re-render churn issues subscribe/unsubscribe/subscribe bursts for the
/// same logical subscription; coalescing the in-flight setup and deferring
/// teardown by a short window absorbs that churn instead of paying transport
/// reconnect cost for every remount.
pub struct ConnectionManager {
  debounce: Duration,
  in_flight: Mutex<HashMap<String, (u64, InFlight)>>,
  pending_cleanups: Mutex<HashMap<String, JoinHandle<()>>>,
  next_generation: AtomicU64,
}

impl ConnectionManager {
  pub fn new(debounce: Duration) -> Self {
    Self {
      debounce,
      in_flight: Mutex::new(HashMap::new()),
      pending_cleanups: Mutex::new(HashMap::new()),
      next_generation: AtomicU64::new(0),
    }
  }

  /// Runs `setup` once per channel name; concurrent callers share the same
  /// in-flight outcome. A subscribe arriving just after an unmount wins over
  /// that unmount's pending cleanup.
  pub async fn subscribe<F, Fut>(
    &self,
    name: &str,
    setup: F,
  ) -> Result<Arc<ManagedChannel>, RealtimeError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Arc<ManagedChannel>, RealtimeError>> + Send + 'static,
  {
    if let Some(pending) = self.pending_cleanups.lock().remove(name) {
      trace!(
        "[connection]: re-subscribe cancels pending cleanup for {}",
        name
      );
      pending.abort();
    }

    let (generation, shared) = {
      let mut guard = self.in_flight.lock();
      match guard.get(name) {
        Some((generation, existing)) => {
          trace!("[connection]: joining in-flight subscribe for {}", name);
          (*generation, existing.clone())
        },
        None => {
          let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
          let shared = setup().map(|result| result.map_err(Arc::new)).boxed().shared();
          guard.insert(name.to_string(), (generation, shared.clone()));
          (generation, shared)
        },
      }
    };

    let result = shared.await;
    {
      // only the generation we joined gets retired, not a successor setup
      let mut guard = self.in_flight.lock();
      if guard.get(name).map(|(g, _)| *g) == Some(generation) {
        guard.remove(name);
      }
    }
    result.map_err(RealtimeError::from)
  }

  /// Defers `cleanup` by the debounce window; an immediate re-subscribe
  /// cancels it instead of paying reconnect cost.
  pub fn schedule_cleanup<Fut>(&self, name: &str, cleanup: Fut)
  where
    Fut: Future<Output = ()> + Send + 'static,
  {
    let mut guard = self.pending_cleanups.lock();
    if let Some(old) = guard.remove(name) {
      old.abort();
    }
    let delay = self.debounce;
    let label = name.to_string();
    let task = tokio::spawn(async move {
      tokio::time::sleep(delay).await;
      debug!("[connection]: running deferred cleanup for {}", label);
      cleanup.await;
    });
    guard.insert(name.to_string(), task);
  }

  /// Immediate, non-debounced teardown for one name.
  pub async fn cleanup<Fut>(&self, name: &str, cleanup: Fut)
  where
    Fut: Future<Output = ()>,
  {
    if let Some(pending) = self.pending_cleanups.lock().remove(name) {
      pending.abort();
    }
    self.in_flight.lock().remove(name);
    cleanup.await;
  }

  /// Drops all dedup and cleanup bookkeeping. Callers pair this with
  /// [`crate::channel::ChannelManager::cleanup`], which is what actually
  /// closes the channels.
  pub fn cleanup_all(&self) {
    let mut pending = self.pending_cleanups.lock();
    for (_, task) in pending.drain() {
      task.abort();
    }
    self.in_flight.lock().clear();
  }

  pub fn has_pending_cleanup(&self, name: &str) -> bool {
    self
      .pending_cleanups
      .lock()
      .get(name)
      .map(|task| !task.is_finished())
      .unwrap_or(false)
  }
}
