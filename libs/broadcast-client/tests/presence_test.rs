mod util;

use std::time::Duration;

use broadcast_entity::{Activity, CursorCoords, Location, ScriptPresence};
use broadcast_client::{PresenceFacade, RealtimeConfig};

use util::{settle, TestBed};

fn cursor_presence(script_id: &str) -> ScriptPresence {
  ScriptPresence {
    user_id: String::new(),
    user_name: None,
    avatar_url: None,
    script_id: Some(script_id.to_string()),
    cursor_position: Some(0),
    cursor_coords: Some(CursorCoords { x: 0.0, y: 0.0 }),
    selection: None,
    selection_coords: None,
    color: String::new(),
    last_active_at: 0,
  }
}

#[tokio::test(start_paused = true)]
async fn script_presence_expires_after_threshold() {
  let bed = TestBed::new();
  let a = bed.client("u-1");
  let b = bed.client("u-2");
  let script_a = a.open_script("i1").await.unwrap();
  let script_b = b.open_script("i1").await.unwrap();

  script_a.send_presence(cursor_presence("s1")).await.unwrap();
  settle().await;
  assert_eq!(script_b.presence_for("s1").len(), 1);

  // one missed heartbeat past the 30s threshold and the entry is gone
  tokio::time::sleep(Duration::from_secs(31)).await;
  assert!(script_b.presence_for("s1").is_empty());
}

#[tokio::test(start_paused = true)]
async fn script_presence_write_path_evicts_stale_entries() {
  let bed = TestBed::new();
  let a = bed.client("u-1");
  let b = bed.client("u-2");
  let c = bed.client("u-3");
  let script_a = a.open_script("i1").await.unwrap();
  let script_b = b.open_script("i1").await.unwrap();
  let script_c = c.open_script("i1").await.unwrap();

  script_a.send_presence(cursor_presence("s1")).await.unwrap();
  settle().await;
  assert_eq!(script_b.handler().presence_entry_count(), 1);

  tokio::time::sleep(Duration::from_secs(31)).await;
  // reads filter but never mutate; the stale entry is still in the map
  assert!(script_b.presence_for("s1").is_empty());
  assert_eq!(script_b.handler().presence_entry_count(), 1);

  // the next presence write sweeps it out physically
  script_c.send_presence(cursor_presence("s1")).await.unwrap();
  settle().await;
  assert_eq!(script_b.handler().presence_entry_count(), 1);
  let seen = script_b.presence_for("s1");
  assert_eq!(seen.len(), 1);
  assert_eq!(seen[0].user_id, "u-3");
}

#[tokio::test(start_paused = true)]
async fn global_presence_timer_sweep_evicts_silent_peers() {
  let bed = TestBed::new();
  let a = bed.client("u-1");
  let b = bed.client("u-2");
  // the observer subscribes first so it sees the announce
  let presence_b = b.join_company_presence("c1").await.unwrap();
  let presence_a = a.join_company_presence("c1").await.unwrap();
  settle().await;

  assert_eq!(presence_b.active_users().len(), 1);

  // dropping the manager silences the heartbeat without a goodbye
  drop(presence_a);
  tokio::time::sleep(Duration::from_secs(125)).await;

  assert!(presence_b.active_users().is_empty());
  // the periodic sweep also removed it from the backing map
  assert_eq!(presence_b.entry_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn global_presence_write_sweep_evicts_independently_of_the_timer() {
  let bed = TestBed::new();
  let a = bed.client("u-1");
  let c = bed.client("u-3");
  // B's periodic sweep is pushed out of the picture; only writes can evict
  let mut config = RealtimeConfig::default();
  config.presence_sweep_every = Duration::from_secs(3600);
  let b = bed.client_with_config("u-2", config);

  let presence_b = b.join_company_presence("c1").await.unwrap();
  let presence_a = a.join_company_presence("c1").await.unwrap();
  settle().await;
  assert_eq!(presence_b.entry_count(), 1);

  drop(presence_a);
  tokio::time::sleep(Duration::from_secs(95)).await;
  // stale but not yet physically removed: reads never mutate
  assert!(presence_b.active_users().is_empty());
  assert_eq!(presence_b.entry_count(), 1);

  // an incoming presence message runs the inline sweep
  let _presence_c = c.join_company_presence("c1").await.unwrap();
  settle().await;
  assert_eq!(presence_b.entry_count(), 1);
  assert_eq!(presence_b.active_users()[0].user_id, "u-3");
}

#[tokio::test(start_paused = true)]
async fn clean_shutdown_sends_a_goodbye() {
  let bed = TestBed::new();
  let a = bed.client("u-1");
  let b = bed.client("u-2");
  let presence_b = b.join_company_presence("c1").await.unwrap();
  let presence_a = a.join_company_presence("c1").await.unwrap();
  settle().await;
  assert_eq!(presence_b.entry_count(), 1);

  presence_a.shutdown().await;
  settle().await;
  assert_eq!(presence_b.entry_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn location_changes_rebroadcast_only_when_resolved_location_changes() {
  let bed = TestBed::new();
  let a = bed.client("u-1");
  let presence_a = a.join_company_presence("c1").await.unwrap();
  settle().await;

  let before = bed.bus.published("company:c1:presence");
  presence_a.update_location("/projects/p1").await.unwrap();
  presence_a.update_location("/projects/p1").await.unwrap();
  presence_a.update_location("/projects/p1").await.unwrap();
  let after = bed.bus.published("company:c1:presence");
  assert_eq!(after - before, 1);

  presence_a
    .update_location("/projects/p1/interviews/i2")
    .await
    .unwrap();
  assert_eq!(bed.bus.published("company:c1:presence") - after, 1);
}

#[tokio::test(start_paused = true)]
async fn location_and_activity_queries_group_live_peers() {
  let bed = TestBed::new();
  let a = bed.client("u-1");
  let b = bed.client("u-2");
  let presence_b = b.join_company_presence("c1").await.unwrap();
  let presence_a = a.join_company_presence("c1").await.unwrap();

  presence_a
    .update_location("/projects/p1/interviews/i2")
    .await
    .unwrap();
  presence_a.set_activity(Activity::Commenting).await.unwrap();
  settle().await;

  let here = presence_b.users_in_location(&Location::Interview {
    project_id: "p1".to_string(),
    interview_id: "i2".to_string(),
  });
  assert_eq!(here.len(), 1);
  assert_eq!(here[0].user_id, "u-1");

  let grouped = presence_b.users_by_activity();
  assert_eq!(grouped.get(&Activity::Commenting).map(Vec::len), Some(1));
  assert!(grouped.get(&Activity::Viewing).is_none());
}

#[tokio::test(start_paused = true)]
async fn facade_merges_script_and_global_presence() {
  let bed = TestBed::new();
  let a = bed.client_named("u-1", "Ana");
  let b = bed.client_named("u-2", "Zoe");

  let presence_b = b.join_company_presence("c1").await.unwrap();
  let _presence_a = a.join_company_presence("c1").await.unwrap();
  let script_a = a.open_script("i1").await.unwrap();
  let script_b = b.open_script("i1").await.unwrap();
  settle().await;

  script_a.send_presence(cursor_presence("s1")).await.unwrap();
  settle().await;

  let facade = PresenceFacade::new(presence_b.clone(), Some(script_b.handler().clone()));
  let users = facade.active_users(Some("s1"));

  // Ana is editing, so she outranks the viewer; self is always included
  let names: Vec<&str> = users.iter().map(|u| u.display_name.as_str()).collect();
  assert_eq!(names, vec!["Ana", "Zoe"]);
  assert_eq!(users[0].activity, Activity::Editing);
  assert_eq!(users[1].activity, Activity::Viewing);
}
