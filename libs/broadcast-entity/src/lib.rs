pub mod channel_name;
pub mod message;
pub mod note;
pub mod presence;
pub mod script;

pub use message::{topic, BroadcastMessage, MessageAction, MessageMetadata};
pub use note::{Note, NoteDeletePayload, NoteReply, NoteSyncPayload};
pub use presence::{
  Activity, CursorCoords, GlobalPresence, Location, ScriptPresence, SelectionCoords,
  SelectionRange,
};
pub use script::{ScriptItem, ScriptSyncPayload};
