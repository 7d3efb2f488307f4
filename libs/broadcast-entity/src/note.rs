use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteReply {
  pub id: String,
  pub note_id: String,
  pub author_id: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub author_name: Option<String>,
  pub content: String,
  pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
  pub id: String,
  pub interview_id: String,
  pub author_id: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub author_name: Option<String>,
  pub content: String,
  pub created_at: i64,
  /// Placeholder id assigned before the server confirms a real one. Carried
  /// in broadcasts so every client can correlate the confirmed payload with
  /// the placeholder it may still be rendering.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub temp_id: Option<String>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub replies: Vec<NoteReply>,
}

/// Payload of a SYNC broadcast: full replacement of one interview's notes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoteSyncPayload {
  pub interview_id: String,
  pub notes: Vec<Note>,
}

/// Payload of a DELETE broadcast. `id` may be a confirmed id or a still
/// unconfirmed temp id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoteDeletePayload {
  pub interview_id: String,
  pub id: String,
}
