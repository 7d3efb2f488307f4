//! Realtime broadcast & presence core.
//!
//! Multiplexes many logical topics (notes, collaborative script edits,
//! per-document presence, company-wide presence) onto a small number of
//! managed pub/sub channels, with optimistic local mutation, reconciliation
//! against server-confirmed state, automatic reconnection, and
//! staleness-based cleanup. The channel transport and the REST backend are
//! collaborators behind traits; nothing here is the system of record.

pub mod api;
pub mod channel;
pub mod client;
pub mod config;
pub mod error;
pub mod facade;
pub mod notes;
pub mod optimistic;
pub mod presence;
pub mod script;
pub mod transport;

pub use api::{ApiError, ApiResponse, CollaborationApi};
pub use channel::{
  ChannelConfig, ChannelManager, ChannelState, ConnectionManager, HandlerId, ManagedChannel,
};
pub use client::{RealtimeClient, SessionInfo};
pub use config::{RealtimeConfig, ReconnectConfig};
pub use error::RealtimeError;
pub use facade::{merge_active_users, ActiveUser, PresenceFacade};
pub use notes::{NoteHandler, NotesController};
pub use optimistic::{OptimisticStatus, OptimisticTracker, OptimisticUpdate};
pub use presence::GlobalPresenceManager;
pub use script::{generate_user_color, ScriptController, ScriptHandler};
pub use transport::{ChannelTransport, TransportChannel, TransportChannelConfig};
