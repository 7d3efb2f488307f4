use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use broadcast_entity::{
  channel_name, topic, BroadcastMessage, MessageAction, ScriptItem, ScriptPresence,
  ScriptSyncPayload,
};
use chrono::Utc;
use parking_lot::RwLock;
use rand::Rng;
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::api::CollaborationApi;
use crate::channel::{ChannelManager, ConnectionManager, HandlerId, ManagedChannel};
use crate::client::SessionInfo;
use crate::config::RealtimeConfig;
use crate::error::RealtimeError;

/// Fixed palette for collaborator cursors. The same user must hash to the
/// same color in every session and tab without coordination.
const PRESENCE_PALETTE: [&str; 10] = [
  "#E57373", "#64B5F6", "#81C784", "#FFD54F", "#BA68C8", "#4DB6AC", "#F06292", "#A1887F",
  "#90A4AE", "#FF8A65",
];

pub fn generate_user_color(user_id: &str) -> String {
  if user_id.is_empty() {
    let index = rand::thread_rng().gen_range(0..PRESENCE_PALETTE.len());
    return PRESENCE_PALETTE[index].to_string();
  }
  let hash = user_id
    .bytes()
    .fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64));
  PRESENCE_PALETTE[(hash % PRESENCE_PALETTE.len() as u64) as usize].to_string()
}

struct PresenceEntry {
  presence: ScriptPresence,
  seen_at: Instant,
}

pub type ScriptsById = HashMap<String, ScriptItem>;

/// Script items and per-document presence for one interview. The data path
/// and the presence path are fully separate: cursor churn never touches the
/// versioned script state.
pub struct ScriptHandler {
  interview_id: String,
  session: SessionInfo,
  scripts_tx: watch::Sender<ScriptsById>,
  presence: RwLock<HashMap<String, PresenceEntry>>,
  /// Text we have applied locally but not yet persisted, per script id.
  local_changes: RwLock<HashMap<String, String>>,
  presence_ttl: Duration,
}

impl ScriptHandler {
  pub fn new(interview_id: &str, session: SessionInfo, config: &RealtimeConfig) -> Self {
    let (scripts_tx, _) = watch::channel(ScriptsById::new());
    Self {
      interview_id: interview_id.to_string(),
      session,
      scripts_tx,
      presence: RwLock::new(HashMap::new()),
      local_changes: RwLock::new(HashMap::new()),
      presence_ttl: config.script_presence_ttl,
    }
  }

  pub fn subscribe(&self) -> watch::Receiver<ScriptsById> {
    self.scripts_tx.subscribe()
  }

  pub fn script(&self, script_id: &str) -> Option<ScriptItem> {
    self.scripts_tx.borrow().get(script_id).cloned()
  }

  pub fn scripts(&self) -> ScriptsById {
    self.scripts_tx.borrow().clone()
  }

  /// Applies a local edit, bumping the item's version. Returns `None` when
  /// the stored version is already ahead of `expected_version`: the caller
  /// must surface the conflict instead of silently overwriting.
  pub fn update_script(
    &self,
    script_id: &str,
    text: &str,
    expected_version: Option<i64>,
  ) -> Option<ScriptItem> {
    let now = Utc::now().timestamp_millis();
    let mut result = None;
    self.scripts_tx.send_modify(|scripts| {
      match scripts.get_mut(script_id) {
        Some(existing) => {
          if let Some(expected) = expected_version {
            if expected < existing.version {
              warn!(
                "[script]: write against version {} rejected, local is at {}",
                expected, existing.version
              );
              return;
            }
          }
          existing.cleaned_sentence = text.to_string();
          existing.version += 1;
          existing.last_edited_by = Some(self.session.user_id.clone());
          existing.last_edited_at = Some(now);
          result = Some(existing.clone());
        },
        None => {
          let item = ScriptItem {
            interview_id: self.interview_id.clone(),
            script_id: script_id.to_string(),
            cleaned_sentence: text.to_string(),
            speaker: None,
            category: None,
            version: 1,
            last_edited_by: Some(self.session.user_id.clone()),
            last_edited_at: Some(now),
          };
          scripts.insert(script_id.to_string(), item.clone());
          result = Some(item);
        },
      }
    });
    if result.is_some() {
      self
        .local_changes
        .write()
        .insert(script_id.to_string(), text.to_string());
    }
    result
  }

  pub fn handle_message(&self, message: &BroadcastMessage<Value>) {
    match message.action {
      MessageAction::Create | MessageAction::Update => self.handle_script_update(message),
      MessageAction::Sync => self.handle_sync(message),
      MessageAction::Delete => self.handle_delete(message),
      MessageAction::Presence => {},
    }
  }

  fn handle_script_update(&self, message: &BroadcastMessage<Value>) {
    let item: ScriptItem = match message.decode_payload() {
      Ok(item) => item,
      Err(err) => {
        warn!("[script]: undecodable script payload: {}", err);
        return;
      },
    };
    let from_self = message.metadata.user_id == self.session.user_id;
    if !from_self {
      if self.local_changes.read().contains_key(&item.script_id) {
        // genuine conflict window: remote wins at the data layer, richer
        // merge UX is not this layer's job
        warn!(
          "[script]: remote edit to {} overrides an unsaved local change",
          item.script_id
        );
      }
    }

    self.scripts_tx.send_modify(|scripts| match scripts.get_mut(&item.script_id) {
      Some(existing) => {
        if item.version < existing.version {
          trace!(
            "[script]: dropping stale broadcast for {} at version {}",
            item.script_id,
            item.version
          );
          return;
        }
        if item.version == existing.version && item.cleaned_sentence == existing.cleaned_sentence {
          return;
        }
        *existing = item.clone();
      },
      None => {
        scripts.insert(item.script_id.clone(), item.clone());
      },
    });

    if !from_self {
      self.local_changes.write().remove(&item.script_id);
    }
  }

  fn handle_sync(&self, message: &BroadcastMessage<Value>) {
    let payload: ScriptSyncPayload = match message.decode_payload() {
      Ok(payload) => payload,
      Err(err) => {
        warn!("[script]: undecodable sync payload: {}", err);
        return;
      },
    };
    self.apply_sync(payload.items);
  }

  fn handle_delete(&self, message: &BroadcastMessage<Value>) {
    let item: ScriptItem = match message.decode_payload() {
      Ok(item) => item,
      Err(err) => {
        warn!("[script]: undecodable delete payload: {}", err);
        return;
      },
    };
    self.scripts_tx.send_modify(|scripts| {
      scripts.remove(&item.script_id);
    });
  }

  pub(crate) fn apply_sync(&self, items: Vec<ScriptItem>) {
    self.scripts_tx.send_modify(|scripts| {
      scripts.clear();
      for item in items {
        scripts.insert(item.script_id.clone(), item);
      }
    });
  }

  pub(crate) fn clear_local_change(&self, script_id: &str) {
    self.local_changes.write().remove(script_id);
  }

  pub fn has_local_change(&self, script_id: &str) -> bool {
    self.local_changes.read().contains_key(script_id)
  }

  /// Presence writes sweep inline so staleness is bounded by one missed
  /// heartbeat, not by the periodic timer.
  pub fn handle_presence_message(&self, message: &BroadcastMessage<Value>) {
    let presence: ScriptPresence = match message.decode_payload() {
      Ok(presence) => presence,
      Err(err) => {
        warn!("[script]: undecodable presence payload: {}", err);
        return;
      },
    };
    let mut guard = self.presence.write();
    guard.retain(|_, entry| entry.seen_at.elapsed() <= self.presence_ttl);
    match message.action {
      MessageAction::Delete => {
        guard.remove(&presence.user_id);
      },
      _ => {
        guard.insert(
          presence.user_id.clone(),
          PresenceEntry {
            presence,
            seen_at: Instant::now(),
          },
        );
      },
    }
  }

  /// Live collaborators on one script, never including the caller. Read-only:
  /// stale entries are filtered here but only writes evict them.
  pub fn get_presence_for_script(&self, script_id: &str) -> Vec<ScriptPresence> {
    self
      .presence
      .read()
      .values()
      .filter(|entry| entry.seen_at.elapsed() <= self.presence_ttl)
      .filter(|entry| entry.presence.script_id.as_deref() == Some(script_id))
      .filter(|entry| entry.presence.user_id != self.session.user_id)
      .map(|entry| entry.presence.clone())
      .collect()
  }

  /// All live per-script presence for this interview, self excluded.
  pub fn live_presence(&self) -> Vec<ScriptPresence> {
    self
      .presence
      .read()
      .values()
      .filter(|entry| entry.seen_at.elapsed() <= self.presence_ttl)
      .filter(|entry| entry.presence.user_id != self.session.user_id)
      .map(|entry| entry.presence.clone())
      .collect()
  }

  pub fn presence_entry_count(&self) -> usize {
    self.presence.read().len()
  }
}

/// Per-interview script editing session.
pub struct ScriptController {
  session: SessionInfo,
  api: Arc<dyn CollaborationApi>,
  channel: Arc<ManagedChannel>,
  channels: Arc<ChannelManager>,
  connections: Arc<ConnectionManager>,
  handler: Arc<ScriptHandler>,
  handler_ids: Vec<HandlerId>,
}

impl ScriptController {
  pub(crate) async fn open(
    interview_id: &str,
    session: SessionInfo,
    config: &RealtimeConfig,
    channels: Arc<ChannelManager>,
    connections: Arc<ConnectionManager>,
    api: Arc<dyn CollaborationApi>,
  ) -> Result<Self, RealtimeError> {
    let handler = Arc::new(ScriptHandler::new(interview_id, session.clone(), config));
    let name = channel_name::interview_channel(interview_id);

    let channel = {
      let channels = channels.clone();
      let channel_config = session.channel_config(&name).broadcast_self(true);
      connections
        .subscribe(&name, move || {
          let channel = channels.get_channel(channel_config);
          async move {
            channel.subscribe().await?;
            Ok(channel)
          }
        })
        .await?
    };

    let mut handler_ids = Vec::new();
    {
      let h = handler.clone();
      handler_ids.push(channel.on(topic::SCRIPT, move |message| h.handle_message(message)));
      let h = handler.clone();
      handler_ids.push(channel.on(topic::SCRIPT_PRESENCE, move |message| {
        h.handle_presence_message(message)
      }));
    }

    match api.list_script(interview_id).await.into_data() {
      Ok(items) => handler.apply_sync(items),
      Err(err) => warn!("[script]: initial fetch failed: {}", err),
    }

    Ok(Self {
      session,
      api,
      channel,
      channels,
      connections,
      handler,
      handler_ids,
    })
  }

  pub fn handler(&self) -> &Arc<ScriptHandler> {
    &self.handler
  }

  pub fn channel(&self) -> &Arc<ManagedChannel> {
    &self.channel
  }

  /// Applies the edit locally, broadcasts it when the channel is up, then
  /// persists. When broadcast is unavailable the save still goes through REST
  /// and reports success; peers catch up from persistence later.
  pub async fn save_sentence(
    &self,
    script_id: &str,
    text: &str,
    expected_version: Option<i64>,
  ) -> Result<ScriptItem, RealtimeError> {
    let updated = self
      .handler
      .update_script(script_id, text, expected_version)
      .ok_or_else(|| RealtimeError::WriteConflict(script_id.to_string()))?;

    if self.channel.is_connected() {
      let message =
        BroadcastMessage::update(topic::SCRIPT, updated.clone(), &self.session.user_id)
          .with_version(updated.version)
          .with_client_id(&self.session.client_id);
      if let Err(err) = self.channel.send(&message).await {
        debug!("[script]: broadcast skipped, saving via REST only: {}", err);
      }
    } else {
      debug!("[script]: channel down, saving via REST only");
    }

    let saved = self.api.save_script_item(&updated).await.into_data()?;
    self.handler.clear_local_change(script_id);
    Ok(saved)
  }

  /// Publishes cursor/selection presence. Separate message type from the
  /// data path; never touches item versions.
  pub async fn send_presence(
    &self,
    mut presence: ScriptPresence,
  ) -> Result<(), RealtimeError> {
    presence.user_id = self.session.user_id.clone();
    presence.user_name = self.session.user_name.clone();
    presence.avatar_url = self.session.avatar_url.clone();
    presence.color = generate_user_color(&self.session.user_id);
    presence.last_active_at = Utc::now().timestamp_millis();

    let message =
      BroadcastMessage::presence(topic::SCRIPT_PRESENCE, presence, &self.session.user_id)
        .with_client_id(&self.session.client_id);
    self.channel.send(&message).await
  }

  pub fn presence_for(&self, script_id: &str) -> Vec<ScriptPresence> {
    self.handler.get_presence_for_script(script_id)
  }

  pub async fn close(self) {
    for id in &self.handler_ids {
      self.channel.off(*id);
    }
    let name = self.channel.name().to_string();
    let channels = self.channels.clone();
    let label = name.clone();
    self.connections.schedule_cleanup(&name, async move {
      channels.remove_channel(&label).await;
    });
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn same_user_always_gets_the_same_color() {
    let a = generate_user_color("u-1");
    let b = generate_user_color("u-1");
    assert_eq!(a, b);
    assert!(PRESENCE_PALETTE.contains(&a.as_str()));
  }

  #[test]
  fn missing_user_id_still_yields_a_palette_color() {
    let color = generate_user_color("");
    assert!(PRESENCE_PALETTE.contains(&color.as_str()));
  }
}
