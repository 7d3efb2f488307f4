mod util;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use broadcast_entity::{topic, BroadcastMessage};
use broadcast_client::{ChannelConfig, RealtimeError};
use serde_json::json;

use util::{settle, TestBed};

#[tokio::test(start_paused = true)]
async fn channel_registry_dedups_transport() {
  let bed = TestBed::new();
  let client = bed.client("u-1");

  let a = client.channels().get_channel(ChannelConfig::new("interview:i1"));
  let b = client.channels().get_channel(ChannelConfig::new("interview:i1"));
  assert!(Arc::ptr_eq(&a, &b));

  a.subscribe().await.unwrap();
  b.subscribe().await.unwrap();
  settle().await;
  assert_eq!(bed.bus.connection_count("interview:i1"), 1);
  // the second subscribe was a no-op, not a second network call
  assert_eq!(bed.bus.subscribe_calls(), 1);

  client.channels().remove_channel("interview:i1").await;
  settle().await;
  assert_eq!(bed.bus.connection_count("interview:i1"), 0);

  // releasing everything and asking again comes back to exactly one
  let c = client.channels().get_channel(ChannelConfig::new("interview:i1"));
  c.subscribe().await.unwrap();
  settle().await;
  assert_eq!(bed.bus.connection_count("interview:i1"), 1);
}

#[tokio::test(start_paused = true)]
async fn concurrent_opens_share_one_connection() {
  let bed = TestBed::new();
  let client = bed.client("u-1");

  let (notes, script) = tokio::join!(client.open_notes("i1"), client.open_script("i1"));
  let _notes = notes.unwrap();
  let _script = script.unwrap();

  settle().await;
  assert_eq!(bed.bus.created_channels(), 1);
  assert_eq!(bed.bus.connection_count("interview:i1"), 1);
}

#[tokio::test(start_paused = true)]
async fn send_fails_fast_when_not_connected() {
  let bed = TestBed::new();
  let client = bed.client("u-1");
  let channel = client.channels().get_channel(ChannelConfig::new("interview:i1"));

  let message = BroadcastMessage::create(topic::NOTE, json!({"id": "x"}), "u-1");
  let err = channel.send(&message).await.unwrap_err();
  assert!(matches!(err, RealtimeError::ChannelNotConnected(_)));
}

#[tokio::test(start_paused = true)]
async fn panicking_handler_does_not_block_delivery() {
  let bed = TestBed::new();
  let client = bed.client("u-1");
  let channel = client
    .channels()
    .get_channel(ChannelConfig::new("interview:i1").broadcast_self(true));
  channel.subscribe().await.unwrap();

  channel.on(topic::NOTE, |_| panic!("faulty consumer"));
  let received = Arc::new(AtomicBool::new(false));
  let flag = received.clone();
  channel.on(topic::NOTE, move |_| flag.store(true, Ordering::SeqCst));

  let message = BroadcastMessage::create(topic::NOTE, json!({"id": "x"}), "u-1");
  channel.send(&message).await.unwrap();
  settle().await;

  assert!(received.load(Ordering::SeqCst));
}

#[tokio::test(start_paused = true)]
async fn unmatched_message_types_are_dropped() {
  let bed = TestBed::new();
  let client = bed.client("u-1");
  let channel = client
    .channels()
    .get_channel(ChannelConfig::new("interview:i1").broadcast_self(true));
  channel.subscribe().await.unwrap();

  let received = Arc::new(AtomicBool::new(false));
  let flag = received.clone();
  channel.on(topic::NOTE, move |_| flag.store(true, Ordering::SeqCst));

  let message = BroadcastMessage::create(topic::SCRIPT, json!({"id": "x"}), "u-1");
  channel.send(&message).await.unwrap();
  settle().await;

  assert!(!received.load(Ordering::SeqCst));
}

#[tokio::test(start_paused = true)]
async fn reconnect_backoff_caps_and_gives_up() {
  let bed = TestBed::new();
  let client = bed.client("u-1");
  bed.bus.fail_next_subscribes(6);

  let channel = client.channels().get_channel(ChannelConfig::new("interview:i1"));
  let errors: Arc<parking_lot::Mutex<Vec<String>>> = Arc::new(parking_lot::Mutex::new(Vec::new()));
  let sink = errors.clone();
  channel.on_error(move |err| sink.lock().push(err.to_string()));

  assert!(channel.subscribe().await.is_err());
  assert_eq!(bed.bus.subscribe_calls(), 1);

  // retries land at +1s, +2s, +4s, +8s, +16s; leave room for all of them
  tokio::time::sleep(Duration::from_secs(40)).await;
  assert_eq!(bed.bus.subscribe_calls(), 6);
  assert_eq!(errors.lock().len(), 1);
  assert!(errors.lock()[0].contains("gave up"));

  // permanently silent from here on
  tokio::time::sleep(Duration::from_secs(120)).await;
  assert_eq!(bed.bus.subscribe_calls(), 6);

  // an explicit subscribe starts over and succeeds
  channel.subscribe().await.unwrap();
  assert!(channel.is_subscribed());
  assert_eq!(bed.bus.subscribe_calls(), 7);
}

#[tokio::test(start_paused = true)]
async fn debounced_cleanup_absorbs_remount_churn() {
  let bed = TestBed::new();
  let client = bed.client("u-1");

  let notes = client.open_notes("i1").await.unwrap();
  assert_eq!(bed.bus.created_channels(), 1);

  notes.close().await;
  // remount inside the debounce window cancels the teardown
  let notes = client.open_notes("i1").await.unwrap();
  tokio::time::sleep(Duration::from_secs(2)).await;
  assert_eq!(bed.bus.created_channels(), 1);
  assert!(client.channels().contains("interview:i1"));

  // an unmount that nothing cancels really tears down
  notes.close().await;
  tokio::time::sleep(Duration::from_secs(2)).await;
  assert!(!client.channels().contains("interview:i1"));
  assert_eq!(bed.bus.connection_count("interview:i1"), 0);
}

#[tokio::test(start_paused = true)]
async fn state_watch_reports_the_lifecycle() {
  let bed = TestBed::new();
  let client = bed.client("u-1");
  let channel = client.channels().get_channel(ChannelConfig::new("interview:i1"));

  let state = channel.state();
  assert!(!state.is_connected && !state.is_subscribed);

  let mut watch = channel.state_watch();
  channel.subscribe().await.unwrap();
  watch.changed().await.unwrap();
  let state = channel.state();
  assert!(state.is_connected && state.is_subscribed && state.error.is_none());

  channel.unsubscribe().await;
  assert_eq!(channel.state(), broadcast_client::ChannelState::default());
}
