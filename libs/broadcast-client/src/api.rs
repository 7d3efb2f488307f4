use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use broadcast_entity::{Note, NoteReply, ScriptItem};

/// Outcome envelope of every REST collaborator call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
  pub success: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub data: Option<T>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

impl<T> ApiResponse<T> {
  pub fn ok(data: T) -> Self {
    Self {
      success: true,
      data: Some(data),
      error: None,
    }
  }

  pub fn err(message: impl Into<String>) -> Self {
    Self {
      success: false,
      data: None,
      error: Some(message.into()),
    }
  }

  pub fn into_data(self) -> Result<T, ApiError> {
    if self.success {
      match self.data {
        Some(data) => Ok(data),
        None => Err(ApiError::new("response carried no data")),
      }
    } else {
      Err(ApiError::new(
        self.error.unwrap_or_else(|| "unknown error".to_string()),
      ))
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct ApiError {
  pub message: String,
}

impl ApiError {
  pub fn new(message: impl Into<String>) -> Self {
    Self {
      message: message.into(),
    }
  }
}

/// The REST collaborator. The realtime core never retries these calls; a
/// failed mutation rolls the optimistic state back and surfaces the error.
#[async_trait]
pub trait CollaborationApi: Send + Sync {
  async fn list_notes(&self, interview_id: &str) -> ApiResponse<Vec<Note>>;

  /// Persists a note; the returned copy carries the server-assigned id.
  async fn create_note(&self, note: &Note) -> ApiResponse<Note>;

  async fn update_note(&self, note: &Note) -> ApiResponse<Note>;

  async fn delete_note(&self, interview_id: &str, note_id: &str) -> ApiResponse<()>;

  async fn create_reply(&self, reply: &NoteReply) -> ApiResponse<NoteReply>;

  async fn list_script(&self, interview_id: &str) -> ApiResponse<Vec<ScriptItem>>;

  async fn save_script_item(&self, item: &ScriptItem) -> ApiResponse<ScriptItem>;
}
