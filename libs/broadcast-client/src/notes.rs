use std::collections::HashMap;
use std::sync::Arc;

use broadcast_entity::{
  channel_name, topic, BroadcastMessage, MessageAction, Note, NoteDeletePayload, NoteReply,
  NoteSyncPayload,
};
use chrono::Utc;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::api::CollaborationApi;
use crate::channel::{ChannelManager, ConnectionManager, HandlerId, ManagedChannel};
use crate::client::SessionInfo;
use crate::config::RealtimeConfig;
use crate::error::RealtimeError;
use crate::optimistic::{OptimisticStatus, OptimisticTracker};

pub type NotesByInterview = HashMap<String, Vec<Note>>;

/// Note state for the interviews this client is watching. Incoming broadcasts
/// and local mutations both funnel through the watch sender, which preserves
/// the "replay current state, then push every mutation" contract UI readers
/// rely on.
pub struct NoteHandler {
  pub(crate) optimistic: OptimisticTracker<Note>,
  state_tx: watch::Sender<NotesByInterview>,
  duplicate_window_ms: i64,
}

impl NoteHandler {
  pub fn new(config: &RealtimeConfig) -> Self {
    let (state_tx, _) = watch::channel(NotesByInterview::new());
    Self {
      optimistic: OptimisticTracker::new(config.confirm_grace),
      state_tx,
      duplicate_window_ms: config.note_duplicate_window.as_millis() as i64,
    }
  }

  /// Current state is observable immediately via `borrow()`; every mutation
  /// notifies the receiver.
  pub fn subscribe(&self) -> watch::Receiver<NotesByInterview> {
    self.state_tx.subscribe()
  }

  pub fn notes_for(&self, interview_id: &str) -> Vec<Note> {
    self
      .state_tx
      .borrow()
      .get(interview_id)
      .cloned()
      .unwrap_or_default()
  }

  pub fn note(&self, interview_id: &str, note_id: &str) -> Option<Note> {
    self
      .state_tx
      .borrow()
      .get(interview_id)
      .and_then(|list| list.iter().find(|n| n.id == note_id).cloned())
  }

  pub fn handle_message(&self, message: &BroadcastMessage<Value>) {
    match message.action {
      MessageAction::Create => self.handle_create(message),
      MessageAction::Update => self.handle_update(message),
      MessageAction::Delete => self.handle_delete(message),
      MessageAction::Sync => self.handle_sync(message),
      MessageAction::Presence => {},
    }
  }

  /// Echo and double-delivery classification. Beyond the id mapping this
  /// treats identical content from the same author inside a short window as
  /// one delivery; a legitimate rapid identical re-post loses that bet, which
  /// is acceptable for interview notes.
  pub fn is_duplicate(&self, message: &BroadcastMessage<Value>) -> bool {
    let Ok(note) = message.decode_payload::<Note>() else {
      return false;
    };
    if self.optimistic.is_own_echo(&note.id) {
      return true;
    }
    let state = self.state_tx.borrow();
    state
      .get(&note.interview_id)
      .map(|list| {
        list.iter().any(|existing| {
          existing.id == note.id
            || (existing.content == note.content
              && existing.author_id == message.metadata.user_id
              && (existing.created_at - message.metadata.timestamp).abs()
                < self.duplicate_window_ms)
        })
      })
      .unwrap_or(false)
  }

  fn handle_create(&self, message: &BroadcastMessage<Value>) {
    let note: Note = match message.decode_payload() {
      Ok(note) => note,
      Err(err) => {
        warn!("[notes]: undecodable note payload: {}", err);
        return;
      },
    };
    if self.optimistic.is_own_echo(&note.id) {
      trace!("[notes]: suppressing own echo {}", note.id);
      return;
    }

    let sender = message.metadata.user_id.clone();
    let sent_at = message.metadata.timestamp;
    let window = self.duplicate_window_ms;
    self.state_tx.send_modify(|state| {
      let list = state.entry(note.interview_id.clone()).or_default();
      // a confirmed payload replaces the placeholder it names; this must win
      // over the duplicate heuristic below
      if let Some(temp_id) = note.temp_id.as_deref() {
        if temp_id != note.id {
          if let Some(existing) = list.iter_mut().find(|n| n.id == temp_id) {
            *existing = note.clone();
            return;
          }
        }
      }
      if list.iter().any(|n| n.id == note.id) {
        return;
      }
      if list.iter().any(|n| {
        n.content == note.content
          && n.author_id == sender
          && (n.created_at - sent_at).abs() < window
      }) {
        trace!("[notes]: dropping near-duplicate from {}", sender);
        return;
      }
      list.push(note.clone());
    });
  }

  fn handle_update(&self, message: &BroadcastMessage<Value>) {
    let note: Note = match message.decode_payload() {
      Ok(note) => note,
      Err(err) => {
        warn!("[notes]: undecodable note payload: {}", err);
        return;
      },
    };
    self.state_tx.send_modify(|state| {
      let Some(list) = state.get_mut(&note.interview_id) else {
        return;
      };
      let found = list
        .iter_mut()
        .find(|n| n.id == note.id || n.temp_id.as_deref() == Some(note.id.as_str()));
      match found {
        Some(existing) => {
          // an update payload without replies must not wipe what we have
          let kept = std::mem::take(&mut existing.replies);
          *existing = note.clone();
          if existing.replies.is_empty() {
            existing.replies = kept;
          }
        },
        // deleted while the update was in flight
        None => trace!("[notes]: update for unknown note {} dropped", note.id),
      }
    });
  }

  fn handle_delete(&self, message: &BroadcastMessage<Value>) {
    let payload: NoteDeletePayload = match message.decode_payload() {
      Ok(payload) => payload,
      Err(err) => {
        warn!("[notes]: undecodable delete payload: {}", err);
        return;
      },
    };
    // a delete by real id must also clear a placeholder we still track
    let mapped_temp = self.optimistic.temp_id_for(&payload.id);
    self.state_tx.send_modify(|state| {
      let Some(list) = state.get_mut(&payload.interview_id) else {
        return;
      };
      list.retain(|n| {
        n.id != payload.id
          && n.temp_id.as_deref() != Some(payload.id.as_str())
          && Some(n.id.as_str()) != mapped_temp.as_deref()
      });
    });
  }

  fn handle_sync(&self, message: &BroadcastMessage<Value>) {
    let payload: NoteSyncPayload = match message.decode_payload() {
      Ok(payload) => payload,
      Err(err) => {
        warn!("[notes]: undecodable sync payload: {}", err);
        return;
      },
    };
    self.apply_sync(&payload.interview_id, payload.notes);
  }

  pub fn handle_reply_message(&self, message: &BroadcastMessage<Value>) {
    let reply: NoteReply = match message.decode_payload() {
      Ok(reply) => reply,
      Err(err) => {
        warn!("[notes]: undecodable reply payload: {}", err);
        return;
      },
    };
    match message.action {
      MessageAction::Create => self.apply_local_reply(&reply),
      MessageAction::Delete => {
        self.state_tx.send_modify(|state| {
          for list in state.values_mut() {
            for note in list.iter_mut() {
              note.replies.retain(|r| r.id != reply.id);
            }
          }
        });
      },
      _ => {},
    }
  }

  pub(crate) fn apply_sync(&self, interview_id: &str, notes: Vec<Note>) {
    self.state_tx.send_modify(|state| {
      state.insert(interview_id.to_string(), notes.clone());
    });
  }

  pub(crate) fn apply_local_create(&self, note: &Note) {
    self.state_tx.send_modify(|state| {
      let list = state.entry(note.interview_id.clone()).or_default();
      if !list.iter().any(|n| n.id == note.id) {
        list.push(note.clone());
      }
    });
  }

  pub(crate) fn apply_local_update(&self, note: &Note) {
    self.state_tx.send_modify(|state| {
      if let Some(list) = state.get_mut(&note.interview_id) {
        if let Some(existing) = list.iter_mut().find(|n| n.id == note.id) {
          *existing = note.clone();
        }
      }
    });
  }

  pub(crate) fn apply_local_reply(&self, reply: &NoteReply) {
    self.state_tx.send_modify(|state| {
      for list in state.values_mut() {
        if let Some(note) = list.iter_mut().find(|n| n.id == reply.note_id) {
          if !note.replies.iter().any(|r| r.id == reply.id) {
            note.replies.push(reply.clone());
          }
          return;
        }
      }
    });
  }

  /// Replaces the placeholder with the server-confirmed note and records the
  /// id mapping so the confirming broadcast's echo is recognized.
  pub(crate) fn confirm_local_create(&self, temp_id: &str, saved: &Note) {
    self.optimistic.confirm(temp_id, &saved.id);
    self.state_tx.send_modify(|state| {
      if let Some(list) = state.get_mut(&saved.interview_id) {
        if let Some(existing) = list.iter_mut().find(|n| n.id == temp_id) {
          let mut confirmed = saved.clone();
          confirmed.temp_id = Some(temp_id.to_string());
          *existing = confirmed;
        }
      }
    });
  }

  pub(crate) fn take_local(&self, interview_id: &str, note_id: &str) -> Option<Note> {
    let mut removed = None;
    self.state_tx.send_modify(|state| {
      if let Some(list) = state.get_mut(interview_id) {
        if let Some(index) = list
          .iter()
          .position(|n| n.id == note_id || n.temp_id.as_deref() == Some(note_id))
        {
          removed = Some(list.remove(index));
        }
      }
    });
    removed
  }
}

/// Per-interview note session: optimistic local mutation, broadcast to peers,
/// persistence through the REST collaborator, reconciliation on confirm.
pub struct NotesController {
  interview_id: String,
  session: SessionInfo,
  api: Arc<dyn CollaborationApi>,
  channel: Arc<ManagedChannel>,
  channels: Arc<ChannelManager>,
  connections: Arc<ConnectionManager>,
  handler: Arc<NoteHandler>,
  handler_ids: Vec<HandlerId>,
  sweeper: JoinHandle<()>,
}

impl NotesController {
  pub(crate) async fn open(
    interview_id: &str,
    session: SessionInfo,
    config: &RealtimeConfig,
    channels: Arc<ChannelManager>,
    connections: Arc<ConnectionManager>,
    api: Arc<dyn CollaborationApi>,
  ) -> Result<Self, RealtimeError> {
    let handler = Arc::new(NoteHandler::new(config));
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
      handler_ids.push(channel.on(topic::NOTE, move |message| h.handle_message(message)));
      let h = handler.clone();
      handler_ids.push(channel.on(topic::NOTE_REPLY, move |message| {
        h.handle_reply_message(message)
      }));
    }
    let sweeper = handler
      .optimistic
      .spawn_sweeper(config.optimistic_sweep_every, config.optimistic_max_age);

    // seed from the system of record, then stay current via broadcasts
    match api.list_notes(interview_id).await.into_data() {
      Ok(notes) => handler.apply_sync(interview_id, notes),
      Err(err) => warn!("[notes]: initial fetch failed: {}", err),
    }

    Ok(Self {
      interview_id: interview_id.to_string(),
      session,
      api,
      channel,
      channels,
      connections,
      handler,
      handler_ids,
      sweeper,
    })
  }

  pub fn handler(&self) -> &Arc<NoteHandler> {
    &self.handler
  }

  pub fn channel(&self) -> &Arc<ManagedChannel> {
    &self.channel
  }

  pub fn notes(&self) -> Vec<Note> {
    self.handler.notes_for(&self.interview_id)
  }

  pub fn subscribe(&self) -> watch::Receiver<NotesByInterview> {
    self.handler.subscribe()
  }

  pub async fn create_note(&self, content: &str) -> Result<Note, RealtimeError> {
    let temp_id = Uuid::new_v4().to_string();
    let note = Note {
      id: temp_id.clone(),
      interview_id: self.interview_id.clone(),
      author_id: self.session.user_id.clone(),
      author_name: self.session.user_name.clone(),
      content: content.to_string(),
      created_at: Utc::now().timestamp_millis(),
      temp_id: Some(temp_id.clone()),
      replies: Vec::new(),
    };
    self.handler.optimistic.add(&temp_id, note.clone());
    self.handler.apply_local_create(&note);

    let message = BroadcastMessage::create(topic::NOTE, note.clone(), &self.session.user_id)
      .with_client_id(&self.session.client_id);
    if let Err(err) = self.channel.send(&message).await {
      debug!("[notes]: create broadcast skipped: {}", err);
    }

    match self.api.create_note(&note).await.into_data() {
      Ok(saved) => {
        if self.handler.optimistic.get(&temp_id).is_none() {
          // deleted locally while the save round-trip was in flight; undo
          // the save instead of resurrecting the note
          if let Err(err) = self
            .api
            .delete_note(&self.interview_id, &saved.id)
            .await
            .into_data()
          {
            warn!("[notes]: undo of orphaned save failed: {}", err);
          }
          let retraction = BroadcastMessage::delete(
            topic::NOTE,
            NoteDeletePayload {
              interview_id: self.interview_id.clone(),
              id: saved.id.clone(),
            },
            &self.session.user_id,
          );
          if let Err(send_err) = self.channel.send(&retraction).await {
            debug!("[notes]: retraction broadcast skipped: {}", send_err);
          }
          return Ok(saved);
        }
        self.handler.confirm_local_create(&temp_id, &saved);
        let mut confirmed = saved;
        confirmed.temp_id = Some(temp_id);
        let message =
          BroadcastMessage::create(topic::NOTE, confirmed.clone(), &self.session.user_id)
            .with_client_id(&self.session.client_id);
        if let Err(err) = self.channel.send(&message).await {
          debug!("[notes]: confirm broadcast skipped: {}", err);
        }
        Ok(confirmed)
      },
      Err(err) => {
        self.handler.optimistic.fail(&temp_id);
        self.handler.take_local(&self.interview_id, &temp_id);
        // peers may have rendered the placeholder already; retract it
        let retraction = BroadcastMessage::delete(
          topic::NOTE,
          NoteDeletePayload {
            interview_id: self.interview_id.clone(),
            id: temp_id,
          },
          &self.session.user_id,
        );
        if let Err(send_err) = self.channel.send(&retraction).await {
          debug!("[notes]: retraction broadcast skipped: {}", send_err);
        }
        Err(RealtimeError::Persistence(err))
      },
    }
  }

  pub async fn update_note(&self, note: &Note) -> Result<Note, RealtimeError> {
    let previous = self.handler.note(&note.interview_id, &note.id);
    self.handler.apply_local_update(note);

    let message = BroadcastMessage::update(topic::NOTE, note.clone(), &self.session.user_id)
      .with_client_id(&self.session.client_id);
    if let Err(err) = self.channel.send(&message).await {
      debug!("[notes]: update broadcast skipped: {}", err);
    }

    match self.api.update_note(note).await.into_data() {
      Ok(saved) => Ok(saved),
      Err(err) => {
        if let Some(previous) = previous {
          self.handler.apply_local_update(&previous);
          let rollback =
            BroadcastMessage::update(topic::NOTE, previous, &self.session.user_id)
              .with_client_id(&self.session.client_id);
          if let Err(send_err) = self.channel.send(&rollback).await {
            debug!("[notes]: rollback broadcast skipped: {}", send_err);
          }
        }
        Err(RealtimeError::Persistence(err))
      },
    }
  }

  pub async fn delete_note(&self, note_id: &str) -> Result<(), RealtimeError> {
    let removed = self.handler.take_local(&self.interview_id, note_id);

    let message = BroadcastMessage::delete(
      topic::NOTE,
      NoteDeletePayload {
        interview_id: self.interview_id.clone(),
        id: note_id.to_string(),
      },
      &self.session.user_id,
    )
    .with_client_id(&self.session.client_id);
    if let Err(err) = self.channel.send(&message).await {
      debug!("[notes]: delete broadcast skipped: {}", err);
    }

    // an unconfirmed optimistic note never reached the server; retracting
    // the broadcast is all there is to do
    let still_pending = self
      .handler
      .optimistic
      .get(note_id)
      .map(|u| u.status == OptimisticStatus::Pending)
      .unwrap_or(false);
    if still_pending {
      self.handler.optimistic.fail(note_id);
      return Ok(());
    }

    match self
      .api
      .delete_note(&self.interview_id, note_id)
      .await
      .into_data()
    {
      Ok(()) => Ok(()),
      Err(err) => {
        if let Some(note) = removed {
          self.handler.apply_local_create(&note);
          let restore = BroadcastMessage::create(topic::NOTE, note, &self.session.user_id)
            .with_client_id(&self.session.client_id);
          if let Err(send_err) = self.channel.send(&restore).await {
            debug!("[notes]: restore broadcast skipped: {}", send_err);
          }
        }
        Err(RealtimeError::Persistence(err))
      },
    }
  }

  pub async fn add_reply(&self, note_id: &str, content: &str) -> Result<NoteReply, RealtimeError> {
    let reply = NoteReply {
      id: Uuid::new_v4().to_string(),
      note_id: note_id.to_string(),
      author_id: self.session.user_id.clone(),
      author_name: self.session.user_name.clone(),
      content: content.to_string(),
      created_at: Utc::now().timestamp_millis(),
    };
    let saved = self.api.create_reply(&reply).await.into_data()?;
    self.handler.apply_local_reply(&saved);

    let message = BroadcastMessage::create(topic::NOTE_REPLY, saved.clone(), &self.session.user_id)
      .with_client_id(&self.session.client_id);
    if let Err(err) = self.channel.send(&message).await {
      debug!("[notes]: reply broadcast skipped: {}", err);
    }
    Ok(saved)
  }

  /// Detaches handlers and defers channel teardown so an immediate reopen
  /// reuses the connection.
  pub async fn close(self) {
    for id in &self.handler_ids {
      self.channel.off(*id);
    }
    self.sweeper.abort();
    let name = self.channel.name().to_string();
    let channels = self.channels.clone();
    let label = name.clone();
    self.connections.schedule_cleanup(&name, async move {
      channels.remove_channel(&label).await;
    });
  }
}
