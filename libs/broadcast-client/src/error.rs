use std::sync::Arc;

use crate::api::ApiError;

#[derive(Debug, thiserror::Error)]
pub enum RealtimeError {
  #[error("channel {0} is not connected")]
  ChannelNotConnected(String),

  #[error("channel {channel} gave up after {attempts} subscribe attempts")]
  ReconnectExhausted { channel: String, attempts: u32 },

  #[error("transport error: {0}")]
  Transport(String),

  /// The caller's expected version is behind the stored one. Never retried
  /// automatically; the user decides what happens next.
  #[error("version conflict on script item {0}")]
  WriteConflict(String),

  #[error("persistence failed: {0}")]
  Persistence(#[from] ApiError),

  #[error("malformed wire message: {0}")]
  Serde(#[from] serde_json::Error),

  /// A subscribe outcome shared between coalesced callers.
  #[error("{0}")]
  Shared(Arc<RealtimeError>),

  #[error(transparent)]
  Internal(#[from] anyhow::Error),
}

impl From<Arc<RealtimeError>> for RealtimeError {
  fn from(err: Arc<RealtimeError>) -> Self {
    RealtimeError::Shared(err)
  }
}
