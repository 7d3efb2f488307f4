use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use broadcast_entity::{topic, Activity, BroadcastMessage, GlobalPresence, Location, MessageAction};
use chrono::Utc;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::channel::{HandlerId, ManagedChannel};
use crate::client::SessionInfo;
use crate::config::RealtimeConfig;
use crate::error::RealtimeError;
use crate::script::generate_user_color;

struct GlobalEntry {
  presence: GlobalPresence,
  seen_at: Instant,
}

struct SelfState {
  location: Location,
  activity: Activity,
}

/// Company-wide presence: who is where in the app and what they are doing.
/// Runs its own heartbeat and staleness sweep on a deliberately slower
/// cadence than script presence, since app location changes far less often
/// than a cursor. A disconnected peer is detected by silence, not by a
/// goodbye, though a best-effort leave is broadcast on clean shutdown.
pub struct GlobalPresenceManager {
  session: SessionInfo,
  channel: Arc<ManagedChannel>,
  ttl: Duration,
  heartbeat_every: Duration,
  sweep_every: Duration,
  entries: RwLock<HashMap<String, GlobalEntry>>,
  self_state: RwLock<SelfState>,
  heartbeat_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
  sweep_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
  handler_id: parking_lot::Mutex<Option<HandlerId>>,
  weak_self: Weak<GlobalPresenceManager>,
}

impl GlobalPresenceManager {
  pub(crate) fn new(
    session: SessionInfo,
    channel: Arc<ManagedChannel>,
    config: &RealtimeConfig,
  ) -> Arc<Self> {
    Arc::new_cyclic(|weak| Self {
      session,
      channel,
      ttl: config.global_presence_ttl,
      heartbeat_every: config.heartbeat_every,
      sweep_every: config.presence_sweep_every,
      entries: RwLock::new(HashMap::new()),
      self_state: RwLock::new(SelfState {
        location: Location::Unknown,
        activity: Activity::Viewing,
      }),
      heartbeat_task: parking_lot::Mutex::new(None),
      sweep_task: parking_lot::Mutex::new(None),
      handler_id: parking_lot::Mutex::new(None),
      weak_self: weak.clone(),
    })
  }

  pub(crate) async fn start(&self) -> Result<(), RealtimeError> {
    let weak = self.weak_self.clone();
    let id = self.channel.on(topic::GLOBAL_PRESENCE, move |message| {
      if let Some(manager) = weak.upgrade() {
        manager.handle_presence(message);
      }
    });
    *self.handler_id.lock() = Some(id);

    self.channel.subscribe().await?;
    self.spawn_heartbeat();
    self.spawn_sweeper();
    // announce ourselves right away rather than waiting a heartbeat
    self.broadcast_presence().await
  }

  fn handle_presence(&self, message: &BroadcastMessage<Value>) {
    let presence: GlobalPresence = match message.decode_payload() {
      Ok(presence) => presence,
      Err(err) => {
        warn!("[presence]: undecodable payload: {}", err);
        return;
      },
    };
    // our own entry is synthesized locally, never taken from the wire
    if presence.user_id == self.session.user_id {
      return;
    }
    let mut guard = self.entries.write();
    guard.retain(|_, entry| entry.seen_at.elapsed() <= self.ttl);
    match message.action {
      MessageAction::Delete => {
        trace!("[presence]: {} left", presence.user_id);
        guard.remove(&presence.user_id);
      },
      _ => {
        guard.insert(
          presence.user_id.clone(),
          GlobalEntry {
            presence,
            seen_at: Instant::now(),
          },
        );
      },
    }
  }

  fn spawn_heartbeat(&self) {
    let weak = self.weak_self.clone();
    let every = self.heartbeat_every;
    let task = tokio::spawn(async move {
      let mut interval = tokio::time::interval(every);
      interval.tick().await;
      loop {
        interval.tick().await;
        match weak.upgrade() {
          Some(manager) => {
            if let Err(err) = manager.broadcast_presence().await {
              debug!("[presence]: heartbeat skipped: {}", err);
            }
          },
          None => break,
        }
      }
    });
    if let Some(old) = self.heartbeat_task.lock().replace(task) {
      old.abort();
    }
  }

  fn spawn_sweeper(&self) {
    let weak = self.weak_self.clone();
    let every = self.sweep_every;
    let task = tokio::spawn(async move {
      let mut interval = tokio::time::interval(every);
      interval.tick().await;
      loop {
        interval.tick().await;
        match weak.upgrade() {
          Some(manager) => {
            manager.sweep_stale();
          },
          None => break,
        }
      }
    });
    if let Some(old) = self.sweep_task.lock().replace(task) {
      old.abort();
    }
  }

  pub fn sweep_stale(&self) -> usize {
    let mut guard = self.entries.write();
    let before = guard.len();
    guard.retain(|_, entry| entry.seen_at.elapsed() <= self.ttl);
    let swept = before - guard.len();
    if swept > 0 {
      trace!("[presence]: swept {} stale entries", swept);
    }
    swept
  }

  /// Resolves the navigation path and re-broadcasts only when the resolved
  /// location actually changed, not on every navigation event.
  pub async fn update_location(&self, path: &str) -> Result<(), RealtimeError> {
    let location = Location::from_path(path);
    {
      let mut state = self.self_state.write();
      if state.location == location {
        return Ok(());
      }
      state.location = location;
    }
    self.broadcast_presence().await
  }

  pub async fn set_activity(&self, activity: Activity) -> Result<(), RealtimeError> {
    {
      let mut state = self.self_state.write();
      if state.activity == activity {
        return Ok(());
      }
      state.activity = activity;
    }
    self.broadcast_presence().await
  }

  pub fn self_presence(&self) -> GlobalPresence {
    let state = self.self_state.read();
    GlobalPresence {
      user_id: self.session.user_id.clone(),
      user_name: self.session.user_name.clone(),
      avatar_url: self.session.avatar_url.clone(),
      current_location: state.location.clone(),
      activity: state.activity,
      color: generate_user_color(&self.session.user_id),
      last_active_at: Utc::now().timestamp_millis(),
      session_id: Some(self.session.client_id.clone()),
    }
  }

  async fn broadcast_presence(&self) -> Result<(), RealtimeError> {
    let presence = self.self_presence();
    let message =
      BroadcastMessage::presence(topic::GLOBAL_PRESENCE, presence, &self.session.user_id)
        .with_client_id(&self.session.client_id);
    self.channel.send(&message).await
  }

  /// Live peers, self excluded. Read-only: stale entries are filtered here
  /// but only writes and the timer evict them.
  pub fn active_users(&self) -> Vec<GlobalPresence> {
    self
      .entries
      .read()
      .values()
      .filter(|entry| entry.seen_at.elapsed() <= self.ttl)
      .map(|entry| entry.presence.clone())
      .collect()
  }

  pub fn users_in_location(&self, location: &Location) -> Vec<GlobalPresence> {
    self
      .active_users()
      .into_iter()
      .filter(|presence| &presence.current_location == location)
      .collect()
  }

  pub fn users_by_activity(&self) -> HashMap<Activity, Vec<GlobalPresence>> {
    let mut grouped: HashMap<Activity, Vec<GlobalPresence>> = HashMap::new();
    for presence in self.active_users() {
      grouped.entry(presence.activity).or_default().push(presence);
    }
    grouped
  }

  /// Backing-map size including not-yet-swept stale entries.
  pub fn entry_count(&self) -> usize {
    self.entries.read().len()
  }

  /// Best-effort leave broadcast, then stops the heartbeat and sweep. Peers
  /// that miss the goodbye evict us by staleness instead.
  pub async fn shutdown(&self) {
    let presence = self.self_presence();
    let message =
      BroadcastMessage::delete(topic::GLOBAL_PRESENCE, presence, &self.session.user_id)
        .with_client_id(&self.session.client_id);
    if let Err(err) = self.channel.send(&message).await {
      debug!("[presence]: leave broadcast skipped: {}", err);
    }
    if let Some(task) = self.heartbeat_task.lock().take() {
      task.abort();
    }
    if let Some(task) = self.sweep_task.lock().take() {
      task.abort();
    }
    if let Some(id) = self.handler_id.lock().take() {
      self.channel.off(id);
    }
  }
}
