#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use broadcast_entity::{Note, NoteReply, ScriptItem};
use broadcast_client::transport::local::LocalBus;
use broadcast_client::{
  ApiResponse, CollaborationApi, RealtimeClient, RealtimeConfig, SessionInfo,
};

/// Scripted REST collaborator. Assigns `n-*`/`r-*` ids, can be seeded for
/// rehydration tests, and fails on demand.
pub struct MockApi {
  next_id: AtomicU64,
  pub fail_note_creates: AtomicBool,
  pub fail_note_updates: AtomicBool,
  pub fail_note_deletes: AtomicBool,
  pub fail_script_saves: AtomicBool,
  create_delay: parking_lot::Mutex<Option<Duration>>,
  seeded_notes: parking_lot::Mutex<HashMap<String, Vec<Note>>>,
  seeded_script: parking_lot::Mutex<HashMap<String, Vec<ScriptItem>>>,
}

impl MockApi {
  pub fn new() -> Arc<Self> {
    Arc::new(Self {
      next_id: AtomicU64::new(1),
      fail_note_creates: AtomicBool::new(false),
      fail_note_updates: AtomicBool::new(false),
      fail_note_deletes: AtomicBool::new(false),
      fail_script_saves: AtomicBool::new(false),
      create_delay: parking_lot::Mutex::new(None),
      seeded_notes: parking_lot::Mutex::new(HashMap::new()),
      seeded_script: parking_lot::Mutex::new(HashMap::new()),
    })
  }

  pub fn seed_notes(&self, interview_id: &str, notes: Vec<Note>) {
    self
      .seeded_notes
      .lock()
      .insert(interview_id.to_string(), notes);
  }

  pub fn seed_script(&self, interview_id: &str, items: Vec<ScriptItem>) {
    self
      .seeded_script
      .lock()
      .insert(interview_id.to_string(), items);
  }

  /// Stretches the note-create round-trip so tests can act inside it.
  pub fn delay_creates(&self, delay: Duration) {
    *self.create_delay.lock() = Some(delay);
  }
}

#[async_trait]
impl CollaborationApi for MockApi {
  async fn list_notes(&self, interview_id: &str) -> ApiResponse<Vec<Note>> {
    ApiResponse::ok(
      self
        .seeded_notes
        .lock()
        .get(interview_id)
        .cloned()
        .unwrap_or_default(),
    )
  }

  async fn create_note(&self, note: &Note) -> ApiResponse<Note> {
    let delay = *self.create_delay.lock();
    if let Some(delay) = delay {
      tokio::time::sleep(delay).await;
    }
    if self.fail_note_creates.load(Ordering::SeqCst) {
      return ApiResponse::err("persistence unavailable");
    }
    let mut saved = note.clone();
    saved.id = format!("n-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
    saved.temp_id = None;
    ApiResponse::ok(saved)
  }

  async fn update_note(&self, note: &Note) -> ApiResponse<Note> {
    if self.fail_note_updates.load(Ordering::SeqCst) {
      return ApiResponse::err("persistence unavailable");
    }
    ApiResponse::ok(note.clone())
  }

  async fn delete_note(&self, _interview_id: &str, _note_id: &str) -> ApiResponse<()> {
    if self.fail_note_deletes.load(Ordering::SeqCst) {
      return ApiResponse::err("persistence unavailable");
    }
    ApiResponse::ok(())
  }

  async fn create_reply(&self, reply: &NoteReply) -> ApiResponse<NoteReply> {
    let mut saved = reply.clone();
    saved.id = format!("r-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
    ApiResponse::ok(saved)
  }

  async fn list_script(&self, interview_id: &str) -> ApiResponse<Vec<ScriptItem>> {
    ApiResponse::ok(
      self
        .seeded_script
        .lock()
        .get(interview_id)
        .cloned()
        .unwrap_or_default(),
    )
  }

  async fn save_script_item(&self, item: &ScriptItem) -> ApiResponse<ScriptItem> {
    if self.fail_script_saves.load(Ordering::SeqCst) {
      return ApiResponse::err("persistence unavailable");
    }
    ApiResponse::ok(item.clone())
  }
}

/// Multi-client scenario harness: every client created here shares one
/// loopback bus and one scripted REST collaborator.
pub struct TestBed {
  pub bus: Arc<LocalBus>,
  pub api: Arc<MockApi>,
}

impl TestBed {
  pub fn new() -> Self {
    Self {
      bus: LocalBus::new(),
      api: MockApi::new(),
    }
  }

  pub fn client(&self, user_id: &str) -> RealtimeClient {
    self.client_with_config(user_id, RealtimeConfig::default())
  }

  pub fn client_named(&self, user_id: &str, name: &str) -> RealtimeClient {
    let session = SessionInfo::new(user_id).with_name(name);
    RealtimeClient::with_config(
      session,
      self.bus.clone(),
      self.api.clone(),
      RealtimeConfig::default(),
    )
  }

  pub fn client_with_config(&self, user_id: &str, config: RealtimeConfig) -> RealtimeClient {
    let session = SessionInfo::new(user_id).with_name(format!("User {}", user_id));
    RealtimeClient::with_config(session, self.bus.clone(), self.api.clone(), config)
  }
}

/// Lets in-flight deliveries and timers run.
pub async fn settle() {
  tokio::time::sleep(Duration::from_millis(50)).await;
}

pub fn seed_note(interview_id: &str, id: &str, author_id: &str, content: &str) -> Note {
  Note {
    id: id.to_string(),
    interview_id: interview_id.to_string(),
    author_id: author_id.to_string(),
    author_name: None,
    content: content.to_string(),
    created_at: 0,
    temp_id: None,
    replies: Vec::new(),
  }
}

pub fn seed_script_item(interview_id: &str, script_id: &str, text: &str, version: i64) -> ScriptItem {
  ScriptItem {
    interview_id: interview_id.to_string(),
    script_id: script_id.to_string(),
    cleaned_sentence: text.to_string(),
    speaker: None,
    category: None,
    version,
    last_edited_by: None,
    last_edited_at: None,
  }
}
