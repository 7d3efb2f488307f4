use std::time::Duration;

/// Capped exponential backoff for channel subscribe failures.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
  pub max_attempts: u32,
  pub base_delay: Duration,
  pub max_delay: Duration,
}

impl Default for ReconnectConfig {
  fn default() -> Self {
    Self {
      max_attempts: 5,
      base_delay: Duration::from_millis(1000),
      max_delay: Duration::from_millis(30_000),
    }
  }
}

#[derive(Debug, Clone)]
pub struct RealtimeConfig {
  pub reconnect: ReconnectConfig,
  /// Window during which a torn-down subscription can be resurrected by an
  /// immediate re-subscribe instead of paying reconnect cost.
  pub cleanup_debounce: Duration,
  /// How long a confirmed optimistic entry is kept around to absorb the echo
  /// of its confirming broadcast.
  pub confirm_grace: Duration,
  /// Pending optimistic entries older than this never got confirmed and are
  /// swept so the UI cannot show a permanently stuck placeholder.
  pub optimistic_max_age: Duration,
  pub optimistic_sweep_every: Duration,
  /// Two notes with identical content from the same author within this window
  /// are treated as one delivery.
  pub note_duplicate_window: Duration,
  pub script_presence_ttl: Duration,
  pub global_presence_ttl: Duration,
  pub heartbeat_every: Duration,
  pub presence_sweep_every: Duration,
}

impl Default for RealtimeConfig {
  fn default() -> Self {
    Self {
      reconnect: ReconnectConfig::default(),
      cleanup_debounce: Duration::from_millis(500),
      confirm_grace: Duration::from_secs(5),
      optimistic_max_age: Duration::from_secs(30),
      optimistic_sweep_every: Duration::from_secs(10),
      note_duplicate_window: Duration::from_secs(5),
      script_presence_ttl: Duration::from_secs(30),
      global_presence_ttl: Duration::from_secs(90),
      heartbeat_every: Duration::from_secs(15),
      presence_sweep_every: Duration::from_secs(30),
    }
  }
}
