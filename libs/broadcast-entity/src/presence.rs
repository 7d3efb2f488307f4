use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorCoords {
  pub x: f32,
  pub y: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionRange {
  pub start: usize,
  pub end: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SelectionCoords {
  pub x: f32,
  pub y: f32,
  pub width: f32,
  pub height: f32,
}

/// Fine-grained per-document presence: who is editing which sentence, where
/// their cursor and selection sit. Keyed by user id, overwritten on every
/// update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptPresence {
  pub user_id: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub user_name: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub avatar_url: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub script_id: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub cursor_position: Option<usize>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub cursor_coords: Option<CursorCoords>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub selection: Option<SelectionRange>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub selection_coords: Option<SelectionCoords>,
  pub color: String,
  pub last_active_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activity {
  Editing,
  Commenting,
  Viewing,
}

impl Activity {
  /// Lower value sorts first in the unified active-user list.
  pub fn priority(&self) -> u8 {
    match self {
      Activity::Editing => 0,
      Activity::Commenting => 1,
      Activity::Viewing => 2,
    }
  }
}

/// Where a user currently is in the app, derived from the navigation path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Location {
  Dashboard,
  Project { project_id: String },
  Interview {
    project_id: String,
    interview_id: String,
  },
  Personas { project_id: String },
  Unknown,
}

impl Location {
  /// Pure mapping from a navigation path to a location. Unrecognized paths
  /// resolve to [`Location::Unknown`] rather than an error so navigation can
  /// never break presence.
  pub fn from_path(path: &str) -> Self {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    match segments.as_slice() {
      [] | ["dashboard"] => Location::Dashboard,
      ["projects", project_id] => Location::Project {
        project_id: (*project_id).to_string(),
      },
      ["projects", project_id, "personas"] => Location::Personas {
        project_id: (*project_id).to_string(),
      },
      ["projects", project_id, "interviews", interview_id, ..] => Location::Interview {
        project_id: (*project_id).to_string(),
        interview_id: (*interview_id).to_string(),
      },
      _ => Location::Unknown,
    }
  }
}

/// Coarse-grained company-wide presence: which part of the app a user is in
/// and what they are doing there. Keyed by user id within a company scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalPresence {
  pub user_id: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub user_name: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub avatar_url: Option<String>,
  pub current_location: Location,
  pub activity: Activity,
  pub color: String,
  pub last_active_at: i64,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub session_id: Option<String>,
}
