use serde::{Deserialize, Serialize};

/// One transcript sentence of an interview script. `version` is a per-item
/// monotonic counter used for last-writer-wins conflict detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptItem {
  pub interview_id: String,
  pub script_id: String,
  pub cleaned_sentence: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub speaker: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub category: Option<String>,
  #[serde(default)]
  pub version: i64,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub last_edited_by: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub last_edited_at: Option<i64>,
}

/// Payload of a SYNC broadcast: full replacement of one interview's script.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptSyncPayload {
  pub interview_id: String,
  pub items: Vec<ScriptItem>,
}
