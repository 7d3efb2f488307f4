use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimisticStatus {
  Pending,
  Confirmed,
  Failed,
}

/// A locally-originated change registered before server confirmation. The
/// temp id stands in for the entity's id until the real one arrives.
#[derive(Debug, Clone)]
pub struct OptimisticUpdate<T> {
  pub temp_id: String,
  pub real_id: Option<String>,
  pub data: T,
  pub timestamp: i64,
  pub status: OptimisticStatus,
  created_at: Instant,
}

impl<T> OptimisticUpdate<T> {
  pub fn age(&self) -> Duration {
    self.created_at.elapsed()
  }
}

type Updates<T> = Arc<RwLock<HashMap<String, OptimisticUpdate<T>>>>;
type IdMapping = Arc<RwLock<HashMap<String, String>>>;

/// Bookkeeping shared by every domain handler: at most one entry per temp id,
/// a `real id -> temp id` table for recognizing our own echoed writes, and
/// expiry so an abandoned local write cannot stay "saving" forever.
pub struct OptimisticTracker<T> {
  updates: Updates<T>,
  id_mapping: IdMapping,
  confirm_grace: Duration,
}

impl<T> OptimisticTracker<T>
where
  T: Clone + Send + Sync + 'static,
{
  pub fn new(confirm_grace: Duration) -> Self {
    Self {
      updates: Arc::new(RwLock::new(HashMap::new())),
      id_mapping: Arc::new(RwLock::new(HashMap::new())),
      confirm_grace,
    }
  }

  pub fn add(&self, temp_id: &str, data: T) {
    let update = OptimisticUpdate {
      temp_id: temp_id.to_string(),
      real_id: None,
      data,
      timestamp: Utc::now().timestamp_millis(),
      status: OptimisticStatus::Pending,
      created_at: Instant::now(),
    };
    self.updates.write().insert(temp_id.to_string(), update);
    trace!("[optimistic]: registered {}", temp_id);
  }

  /// Marks the entry confirmed and purges it, together with the id mapping,
  /// once the grace window has absorbed the confirming broadcast's echo.
  pub fn confirm(&self, temp_id: &str, real_id: &str) {
    {
      let mut updates = self.updates.write();
      let Some(entry) = updates.get_mut(temp_id) else {
        trace!("[optimistic]: confirm for unknown temp id {}", temp_id);
        return;
      };
      entry.status = OptimisticStatus::Confirmed;
      entry.real_id = Some(real_id.to_string());
    }
    self
      .id_mapping
      .write()
      .insert(real_id.to_string(), temp_id.to_string());

    let weak_updates = Arc::downgrade(&self.updates);
    let weak_mapping = Arc::downgrade(&self.id_mapping);
    let temp_id = temp_id.to_string();
    let real_id = real_id.to_string();
    let grace = self.confirm_grace;
    tokio::spawn(async move {
      tokio::time::sleep(grace).await;
      if let Some(updates) = weak_updates.upgrade() {
        updates.write().remove(&temp_id);
      }
      if let Some(mapping) = weak_mapping.upgrade() {
        mapping.write().remove(&real_id);
      }
      trace!("[optimistic]: purged confirmed {}", temp_id);
    });
  }

  /// Immediate removal. The caller owns any compensating rollback.
  pub fn fail(&self, temp_id: &str) -> Option<OptimisticUpdate<T>> {
    let removed = self.updates.write().remove(temp_id);
    if let Some(update) = &removed {
      if let Some(real_id) = &update.real_id {
        self.id_mapping.write().remove(real_id);
      }
      warn!("[optimistic]: failed {}", temp_id);
    }
    removed
  }

  /// True when `payload_id` refers to one of our own still-tracked writes,
  /// either directly by temp id or through the confirmed id mapping.
  pub fn is_own_echo(&self, payload_id: &str) -> bool {
    if self.updates.read().contains_key(payload_id) {
      return true;
    }
    match self.id_mapping.read().get(payload_id) {
      Some(temp_id) => self.updates.read().contains_key(temp_id),
      None => false,
    }
  }

  pub fn get(&self, temp_id: &str) -> Option<OptimisticUpdate<T>> {
    self.updates.read().get(temp_id).cloned()
  }

  pub fn temp_id_for(&self, real_id: &str) -> Option<String> {
    self.id_mapping.read().get(real_id).cloned()
  }

  /// Sweeps pending entries whose confirmation never arrived. Returns how
  /// many were dropped.
  pub fn cleanup_stale(&self, max_age: Duration) -> usize {
    sweep(&self.updates, max_age)
  }

  /// Periodic sweep task; stops once the tracker is dropped.
  pub fn spawn_sweeper(&self, every: Duration, max_age: Duration) -> JoinHandle<()> {
    let weak = Arc::downgrade(&self.updates);
    tokio::spawn(async move {
      let mut interval = tokio::time::interval(every);
      interval.tick().await;
      loop {
        interval.tick().await;
        match weak.upgrade() {
          Some(updates) => {
            sweep(&updates, max_age);
          },
          None => break,
        }
      }
    })
  }

  pub fn len(&self) -> usize {
    self.updates.read().len()
  }

  pub fn is_empty(&self) -> bool {
    self.updates.read().is_empty()
  }
}

fn sweep<T>(updates: &RwLock<HashMap<String, OptimisticUpdate<T>>>, max_age: Duration) -> usize {
  let mut guard = updates.write();
  let before = guard.len();
  guard.retain(|temp_id, update| {
    let keep = update.status != OptimisticStatus::Pending || update.created_at.elapsed() <= max_age;
    if !keep {
      warn!(
        "[optimistic]: expiring {} with no confirmation after {:?}",
        temp_id,
        update.created_at.elapsed()
      );
    }
    keep
  });
  before - guard.len()
}
