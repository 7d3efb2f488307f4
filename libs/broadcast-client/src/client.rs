use std::sync::Arc;

use broadcast_entity::channel_name;
use uuid::Uuid;

use crate::api::CollaborationApi;
use crate::channel::{ChannelConfig, ChannelManager, ConnectionManager};
use crate::config::RealtimeConfig;
use crate::error::RealtimeError;
use crate::facade::PresenceFacade;
use crate::notes::NotesController;
use crate::presence::GlobalPresenceManager;
use crate::script::{ScriptController, ScriptHandler};
use crate::transport::ChannelTransport;

/// Identity of this browser-session-equivalent. The client id doubles as the
/// transport presence key and is stamped into message metadata.
#[derive(Debug, Clone)]
pub struct SessionInfo {
  pub user_id: String,
  pub user_name: Option<String>,
  pub avatar_url: Option<String>,
  pub client_id: String,
  /// Bearer credential handed to the transport at channel creation.
  pub access_token: Option<String>,
}

impl SessionInfo {
  pub fn new(user_id: impl Into<String>) -> Self {
    Self {
      user_id: user_id.into(),
      user_name: None,
      avatar_url: None,
      client_id: Uuid::new_v4().to_string(),
      access_token: None,
    }
  }

  pub fn with_name(mut self, name: impl Into<String>) -> Self {
    self.user_name = Some(name.into());
    self
  }

  pub fn with_avatar(mut self, url: impl Into<String>) -> Self {
    self.avatar_url = Some(url.into());
    self
  }

  pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
    self.access_token = Some(token.into());
    self
  }

  pub(crate) fn channel_config(&self, name: &str) -> ChannelConfig {
    let mut config = ChannelConfig::new(name).presence_key(&self.client_id);
    if let Some(token) = &self.access_token {
      config = config.access_token(token);
    }
    config
  }
}

/// Entry point owning the channel registry, the subscription dedup layer, and
/// the collaborator handles. One instance per process; that instance is what
/// upholds the one-transport-connection-per-channel-name invariant.
pub struct RealtimeClient {
  session: SessionInfo,
  config: RealtimeConfig,
  api: Arc<dyn CollaborationApi>,
  channels: Arc<ChannelManager>,
  connections: Arc<ConnectionManager>,
}

impl RealtimeClient {
  pub fn new(
    session: SessionInfo,
    transport: Arc<dyn ChannelTransport>,
    api: Arc<dyn CollaborationApi>,
  ) -> Self {
    Self::with_config(session, transport, api, RealtimeConfig::default())
  }

  pub fn with_config(
    session: SessionInfo,
    transport: Arc<dyn ChannelTransport>,
    api: Arc<dyn CollaborationApi>,
    config: RealtimeConfig,
  ) -> Self {
    let channels = Arc::new(ChannelManager::new(transport, config.reconnect.clone()));
    let connections = Arc::new(ConnectionManager::new(config.cleanup_debounce));
    Self {
      session,
      config,
      api,
      channels,
      connections,
    }
  }

  pub fn session(&self) -> &SessionInfo {
    &self.session
  }

  pub fn channels(&self) -> &Arc<ChannelManager> {
    &self.channels
  }

  pub fn connections(&self) -> &Arc<ConnectionManager> {
    &self.connections
  }

  /// Opens the note session for one interview: subscribes the shared
  /// interview channel, seeds from REST, and returns the mutation surface.
  pub async fn open_notes(&self, interview_id: &str) -> Result<NotesController, RealtimeError> {
    NotesController::open(
      interview_id,
      self.session.clone(),
      &self.config,
      self.channels.clone(),
      self.connections.clone(),
      self.api.clone(),
    )
    .await
  }

  /// Opens the collaborative script session for one interview.
  pub async fn open_script(&self, interview_id: &str) -> Result<ScriptController, RealtimeError> {
    ScriptController::open(
      interview_id,
      self.session.clone(),
      &self.config,
      self.channels.clone(),
      self.connections.clone(),
      self.api.clone(),
    )
    .await
  }

  /// Joins company-wide presence and starts its heartbeat.
  pub async fn join_company_presence(
    &self,
    company_id: &str,
  ) -> Result<Arc<GlobalPresenceManager>, RealtimeError> {
    let name = channel_name::company_presence_channel(company_id);
    let channel = {
      let channels = self.channels.clone();
      let channel_config = self.session.channel_config(&name);
      self
        .connections
        .subscribe(&name, move || {
          let channel = channels.get_channel(channel_config);
          async move {
            channel.subscribe().await?;
            Ok(channel)
          }
        })
        .await?
    };
    let manager = GlobalPresenceManager::new(self.session.clone(), channel, &self.config);
    manager.start().await?;
    Ok(manager)
  }

  pub fn presence_facade(
    &self,
    global: Arc<GlobalPresenceManager>,
    script: Option<Arc<ScriptHandler>>,
  ) -> PresenceFacade {
    PresenceFacade::new(global, script)
  }

  /// Full teardown, e.g. on logout: drops dedup bookkeeping and closes every
  /// managed channel.
  pub async fn shutdown(&self) {
    self.connections.cleanup_all();
    self.channels.cleanup().await;
  }
}
