use std::collections::HashMap;
use std::sync::Arc;

use broadcast_entity::{Activity, GlobalPresence, Location, ScriptPresence};

use crate::presence::GlobalPresenceManager;
use crate::script::ScriptHandler;

/// One row of the unified active-user list consumed by the UI.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveUser {
  pub user_id: String,
  pub display_name: String,
  pub avatar_url: Option<String>,
  pub activity: Activity,
  pub color: String,
  pub location: Option<Location>,
}

fn from_global(presence: &GlobalPresence) -> ActiveUser {
  ActiveUser {
    user_id: presence.user_id.clone(),
    display_name: presence
      .user_name
      .clone()
      .unwrap_or_else(|| presence.user_id.clone()),
    avatar_url: presence.avatar_url.clone(),
    activity: presence.activity,
    color: presence.color.clone(),
    location: Some(presence.current_location.clone()),
  }
}

/// Merges global and script presence plus a synthesized self entry into one
/// deduplicated list. A script-editing signal is more specific than a global
/// viewing one and wins for the same user. The sort order — activity
/// priority, then display name — is a UI contract and must not change.
pub fn merge_active_users(
  global: &[GlobalPresence],
  script: &[ScriptPresence],
  current_user: &GlobalPresence,
) -> Vec<ActiveUser> {
  let mut by_user: HashMap<String, ActiveUser> = HashMap::new();
  for presence in global {
    by_user.insert(presence.user_id.clone(), from_global(presence));
  }
  for presence in script {
    let existing = by_user.get(&presence.user_id);
    let merged = ActiveUser {
      user_id: presence.user_id.clone(),
      display_name: presence
        .user_name
        .clone()
        .or_else(|| existing.map(|e| e.display_name.clone()))
        .unwrap_or_else(|| presence.user_id.clone()),
      avatar_url: presence
        .avatar_url
        .clone()
        .or_else(|| existing.and_then(|e| e.avatar_url.clone())),
      activity: Activity::Editing,
      color: presence.color.clone(),
      location: existing.and_then(|e| e.location.clone()),
    };
    by_user.insert(presence.user_id.clone(), merged);
  }
  // self last: our local knowledge of ourselves beats any echoed copy
  by_user.insert(current_user.user_id.clone(), from_global(current_user));

  let mut users: Vec<ActiveUser> = by_user.into_values().collect();
  users.sort_by(|a, b| {
    a.activity
      .priority()
      .cmp(&b.activity.priority())
      .then_with(|| a.display_name.cmp(&b.display_name))
  });
  users
}

/// Read model combining both presence granularities for the UI.
pub struct PresenceFacade {
  global: Arc<GlobalPresenceManager>,
  script: Option<Arc<ScriptHandler>>,
}

impl PresenceFacade {
  pub fn new(global: Arc<GlobalPresenceManager>, script: Option<Arc<ScriptHandler>>) -> Self {
    Self { global, script }
  }

  /// Everyone active right now, self always included. When a script id is
  /// given, collaborators editing that script outrank their global entries.
  pub fn active_users(&self, script_id: Option<&str>) -> Vec<ActiveUser> {
    let global = self.global.active_users();
    let script = match (&self.script, script_id) {
      (Some(handler), Some(script_id)) => handler.get_presence_for_script(script_id),
      _ => Vec::new(),
    };
    merge_active_users(&global, &script, &self.global.self_presence())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use broadcast_entity::{CursorCoords, Location};

  fn global(user_id: &str, name: &str, activity: Activity) -> GlobalPresence {
    GlobalPresence {
      user_id: user_id.to_string(),
      user_name: Some(name.to_string()),
      avatar_url: None,
      current_location: Location::Dashboard,
      activity,
      color: "#64B5F6".to_string(),
      last_active_at: 0,
      session_id: None,
    }
  }

  fn script(user_id: &str, name: &str) -> ScriptPresence {
    ScriptPresence {
      user_id: user_id.to_string(),
      user_name: Some(name.to_string()),
      avatar_url: None,
      script_id: Some("s1".to_string()),
      cursor_position: Some(4),
      cursor_coords: Some(CursorCoords { x: 1.0, y: 2.0 }),
      selection: None,
      selection_coords: None,
      color: "#E57373".to_string(),
      last_active_at: 0,
    }
  }

  #[test]
  fn script_presence_outranks_global_for_the_same_user() {
    let globals = vec![global("u-1", "Ana", Activity::Viewing)];
    let scripts = vec![script("u-1", "Ana")];
    let me = global("u-9", "Zoe", Activity::Viewing);

    let users = merge_active_users(&globals, &scripts, &me);
    let ana = users.iter().find(|u| u.user_id == "u-1").unwrap();
    assert_eq!(ana.activity, Activity::Editing);
    // the global entry still contributes the location
    assert_eq!(ana.location, Some(Location::Dashboard));
  }

  #[test]
  fn self_is_always_included_and_wins_over_echoes() {
    let globals = vec![global("u-9", "Stale Zoe", Activity::Commenting)];
    let me = global("u-9", "Zoe", Activity::Viewing);

    let users = merge_active_users(&globals, &[], &me);
    assert_eq!(users.len(), 1);
    assert_eq!(users[0].display_name, "Zoe");
    assert_eq!(users[0].activity, Activity::Viewing);
  }

  #[test]
  fn sort_is_activity_priority_then_name() {
    let globals = vec![
      global("u-1", "Zoe", Activity::Viewing),
      global("u-2", "Ana", Activity::Viewing),
      global("u-3", "Bo", Activity::Commenting),
    ];
    let scripts = vec![script("u-4", "Yuri")];
    let me = global("u-5", "Max", Activity::Viewing);

    let users = merge_active_users(&globals, &scripts, &me);
    let names: Vec<&str> = users.iter().map(|u| u.display_name.as_str()).collect();
    assert_eq!(names, vec!["Yuri", "Bo", "Ana", "Max", "Zoe"]);
  }
}
