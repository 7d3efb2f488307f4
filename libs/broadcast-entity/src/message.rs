use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Topic types carried in [`BroadcastMessage::message_type`]. Handlers are
/// registered per topic and switch on these strings, so new topics must use
/// fresh values rather than repurposing existing ones.
pub mod topic {
  pub const NOTE: &str = "note";
  pub const NOTE_REPLY: &str = "note_reply";
  pub const SCRIPT: &str = "script";
  pub const SCRIPT_PRESENCE: &str = "script_presence";
  pub const GLOBAL_PRESENCE: &str = "global_presence";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageAction {
  Create,
  Update,
  Delete,
  Sync,
  Presence,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageMetadata {
  pub user_id: String,
  /// Producer-local wall clock in epoch milliseconds. Only used for
  /// tie-breaking and staleness checks, never as a total order.
  pub timestamp: i64,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub version: Option<i64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub client_id: Option<String>,
}

/// Canonical broadcast envelope. The wire shape is a JSON object with exactly
/// these five top-level keys; every producer goes through the constructors
/// below so the shape is defined in one place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastMessage<T> {
  pub id: String,
  #[serde(rename = "type")]
  pub message_type: String,
  pub action: MessageAction,
  pub payload: T,
  pub metadata: MessageMetadata,
}

impl<T> BroadcastMessage<T> {
  pub fn new(message_type: &str, action: MessageAction, payload: T, user_id: &str) -> Self {
    Self {
      id: Uuid::new_v4().to_string(),
      message_type: message_type.to_string(),
      action,
      payload,
      metadata: MessageMetadata {
        user_id: user_id.to_string(),
        timestamp: Utc::now().timestamp_millis(),
        version: None,
        client_id: None,
      },
    }
  }

  pub fn create(message_type: &str, payload: T, user_id: &str) -> Self {
    Self::new(message_type, MessageAction::Create, payload, user_id)
  }

  pub fn update(message_type: &str, payload: T, user_id: &str) -> Self {
    Self::new(message_type, MessageAction::Update, payload, user_id)
  }

  pub fn delete(message_type: &str, payload: T, user_id: &str) -> Self {
    Self::new(message_type, MessageAction::Delete, payload, user_id)
  }

  pub fn sync(message_type: &str, payload: T, user_id: &str) -> Self {
    Self::new(message_type, MessageAction::Sync, payload, user_id)
  }

  pub fn presence(message_type: &str, payload: T, user_id: &str) -> Self {
    Self::new(message_type, MessageAction::Presence, payload, user_id)
  }

  pub fn with_version(mut self, version: i64) -> Self {
    self.metadata.version = Some(version);
    self
  }

  pub fn with_client_id(mut self, client_id: &str) -> Self {
    self.metadata.client_id = Some(client_id.to_string());
    self
  }
}

impl<T> BroadcastMessage<T>
where
  T: Serialize,
{
  pub fn to_value(&self) -> Result<Value, serde_json::Error> {
    serde_json::to_value(self)
  }
}

impl BroadcastMessage<Value> {
  pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
    serde_json::from_value(value)
  }

  pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
    serde_json::from_value(self.payload.clone())
  }
}
