//! Integration tests for the channel multiplexer: physical channel sharing,
//! reconnection policy, session refresh and network transitions.

use course_link::{
    ChannelInfo, ChannelMultiplexer, ChannelPhase, ChannelStatus, ConnectionError, EventHandlers,
    LinkTimeouts, NetworkEvent, ReconnectSchedule,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

mod common;

use common::{init_logging, settle, wait_until, CountingSessions, FakeTransport};

const WAIT: Duration = Duration::from_secs(2);

async fn channel(mux: &ChannelMultiplexer, topic: &str) -> ChannelInfo {
    mux.list_channels()
        .await
        .into_iter()
        .find(|info| info.topic == topic)
        .unwrap_or_else(|| panic!("no channel for '{}'", topic))
}

/// Production timers, except that an open may hang for ten minutes before
/// the attempt ceiling cuts it off.
fn slow_attempts() -> LinkTimeouts {
    LinkTimeouts::builder()
        .reconnect_attempt_timeout(Duration::from_secs(600))
        .build()
}

fn counter() -> (Arc<AtomicUsize>, impl Fn(&serde_json::Value) + Send + Sync + 'static) {
    let hits = Arc::new(AtomicUsize::new(0));
    let inner = hits.clone();
    (hits, move |_payload: &serde_json::Value| {
        inner.fetch_add(1, Ordering::SeqCst);
    })
}

#[tokio::test]
async fn test_one_physical_channel_per_topic() {
    init_logging();
    let transport = FakeTransport::new();
    let mux = common::mux(transport.clone());
    let topic = "class:1:staff";

    let (hits_a, on_a) = counter();
    let (hits_b, on_b) = counter();
    let (hits_c, on_c) = counter();
    let sub_a = mux.subscribe(topic, on_a, |_, _| {}).unwrap();
    let sub_b = mux.subscribe(topic, on_b, |_, _| {}).unwrap();
    let sub_c = mux.subscribe(topic, on_c, |_, _| {}).unwrap();

    wait_until(WAIT, || transport.opens(topic) == 1).await;
    transport.broadcast(topic, json!({"type": "system", "message": "hello"}));
    wait_until(WAIT, || hits_c.load(Ordering::SeqCst) == 1).await;
    assert_eq!(hits_a.load(Ordering::SeqCst), 1);
    assert_eq!(hits_b.load(Ordering::SeqCst), 1);
    assert_eq!(transport.opens(topic), 1);

    sub_a.unsubscribe();
    drop(sub_b);
    settle().await;
    assert_eq!(transport.closes(topic), 0, "channel closed while a consumer remains");

    sub_c.unsubscribe();
    wait_until(WAIT, || transport.closes(topic) == 1).await;
    settle().await;
    assert_eq!(transport.closes(topic), 1);
    assert!(mux.list_channels().await.is_empty());
}

#[tokio::test]
async fn test_unsubscribed_consumer_stops_receiving() {
    init_logging();
    let transport = FakeTransport::new();
    let mux = common::mux(transport.clone());
    let topic = "help_queues:3";

    let (kept_hits, kept) = counter();
    let (dropped_hits, dropped) = counter();
    let _kept = mux.subscribe(topic, kept, |_, _| {}).unwrap();
    let dropped_sub = mux.subscribe(topic, dropped, |_, _| {}).unwrap();
    wait_until(WAIT, || transport.opens(topic) == 1).await;

    dropped_sub.unsubscribe();
    transport.broadcast(topic, json!({"type": "system"}));
    wait_until(WAIT, || kept_hits.load(Ordering::SeqCst) == 1).await;
    assert_eq!(dropped_hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_late_consumer_receives_current_status() {
    init_logging();
    let transport = FakeTransport::new();
    let mux = common::mux(transport.clone());
    let topic = "class:1:user:9";

    let _first = mux.subscribe(topic, |_| {}, |_, _| {}).unwrap();
    wait_until(WAIT, || transport.opens(topic) == 1).await;
    settle().await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let record = seen.clone();
    let _second = mux
        .subscribe(topic, |_| {}, move |status, _| record.lock().unwrap().push(status))
        .unwrap();
    wait_until(WAIT, || !seen.lock().unwrap().is_empty()).await;
    assert_eq!(seen.lock().unwrap()[0], ChannelStatus::Joined);
    assert_eq!(transport.opens(topic), 1);
}

#[tokio::test]
async fn test_channel_error_schedules_backoff() {
    init_logging();
    let transport = FakeTransport::new();
    let schedules: Arc<Mutex<Vec<ReconnectSchedule>>> = Arc::new(Mutex::new(Vec::new()));
    let errors: Arc<Mutex<Vec<ConnectionError>>> = Arc::new(Mutex::new(Vec::new()));
    let (s, e) = (schedules.clone(), errors.clone());
    let handlers = EventHandlers::new()
        .on_reconnect_scheduled(move |schedule| s.lock().unwrap().push(schedule))
        .on_channel_error(move |error| e.lock().unwrap().push(error));
    let mux = common::mux_with(transport.clone(), CountingSessions::new(), handlers);
    let topic = "submission:5:graders";

    let _sub = mux.subscribe(topic, |_| {}, |_, _| {}).unwrap();
    wait_until(WAIT, || transport.opens(topic) == 1).await;
    settle().await;

    transport.report_failure(topic, ChannelStatus::ChannelError, "upstream went away");
    wait_until(WAIT, || !schedules.lock().unwrap().is_empty()).await;

    let schedule = schedules.lock().unwrap()[0].clone();
    assert_eq!(schedule.topic, topic);
    assert_eq!(schedule.attempt, 1);
    assert!(schedule.delay >= Duration::from_secs(60));
    assert!(schedule.delay <= Duration::from_secs(75));

    let error = errors.lock().unwrap()[0].clone();
    assert!(error.recoverable);
    assert!(error.message.contains("upstream went away"));

    let info = mux.list_channels().await;
    assert_eq!(info.len(), 1);
    assert_eq!(info[0].phase, ChannelPhase::Scheduled);
    assert_eq!(info[0].status, ChannelStatus::ChannelError);
    // No immediate reopen.
    assert_eq!(transport.opens(topic), 1);
}

#[tokio::test]
async fn test_token_expiry_refreshes_and_resubscribes() {
    init_logging();
    let transport = FakeTransport::new();
    let sessions = CountingSessions::new();
    let schedules = Arc::new(AtomicUsize::new(0));
    let s = schedules.clone();
    let handlers = EventHandlers::new().on_reconnect_scheduled(move |_| {
        s.fetch_add(1, Ordering::SeqCst);
    });
    let mux = common::mux_with(transport.clone(), sessions.clone(), handlers);
    let topic = "class:4:staff";

    let _sub = mux.subscribe(topic, |_| {}, |_, _| {}).unwrap();
    wait_until(WAIT, || transport.opens(topic) == 1).await;
    settle().await;
    let calls_before = sessions.calls();

    transport.report_failure(topic, ChannelStatus::ChannelError, "InvalidJWTToken: Token has expired 3 seconds ago");
    wait_until(WAIT, || transport.opens(topic) == 2).await;
    wait_until(WAIT, || transport.closes(topic) == 1).await;

    assert_eq!(sessions.calls(), calls_before + 1);
    assert_eq!(transport.tokens().last().map(String::as_str), Some("token-2"));
    assert_eq!(schedules.load(Ordering::SeqCst), 0, "expiry must not wait for backoff");

    settle().await;
    let info = mux.list_channels().await;
    assert_eq!(info[0].phase, ChannelPhase::Joined);
    assert_eq!(info[0].reconnect_attempts, 0);
}

#[tokio::test]
async fn test_events_from_superseded_handle_are_ignored() {
    init_logging();
    let transport = FakeTransport::new();
    let mux = common::mux(transport.clone());
    let topic = "discussion_threads:2";

    let (hits, on_message) = counter();
    let _sub = mux.subscribe(topic, on_message, |_, _| {}).unwrap();
    wait_until(WAIT, || transport.opens(topic) == 1).await;
    let old_sink = transport.current_sink(topic);

    transport.report_failure(topic, ChannelStatus::ChannelError, "jwt expired");
    wait_until(WAIT, || transport.opens(topic) == 2).await;
    settle().await;

    old_sink.broadcast(json!({"type": "system"}));
    old_sink.status(ChannelStatus::Closed);
    settle().await;
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    transport.broadcast(topic, json!({"type": "system"}));
    wait_until(WAIT, || hits.load(Ordering::SeqCst) == 1).await;
    let info = mux.list_channels().await;
    assert_eq!(info[0].status, ChannelStatus::Joined);
}

#[tokio::test]
async fn test_offline_then_online_resubscribes() {
    init_logging();
    let transport = FakeTransport::new();
    let mux = common::mux(transport.clone());
    let topic = "help_queue:8";

    let statuses = Arc::new(Mutex::new(Vec::new()));
    let record = statuses.clone();
    let _sub = mux
        .subscribe(topic, |_| {}, move |status, _| record.lock().unwrap().push(status))
        .unwrap();
    wait_until(WAIT, || statuses.lock().unwrap().contains(&ChannelStatus::Joined)).await;

    mux.handle_network_event(NetworkEvent::Offline);
    wait_until(WAIT, || statuses.lock().unwrap().contains(&ChannelStatus::Closed)).await;
    let info = mux.list_channels().await;
    assert_eq!(info[0].phase, ChannelPhase::Deferred);

    mux.handle_network_event(NetworkEvent::Online);
    wait_until(WAIT, || transport.opens(topic) == 2).await;
    wait_until(WAIT, || statuses.lock().unwrap().last() == Some(&ChannelStatus::Joined)).await;
}

#[tokio::test]
async fn test_disconnect_all_goes_dark_until_visible() {
    init_logging();
    let transport = FakeTransport::new();
    let mux = common::mux(transport.clone());
    let topic = "class:6:user:1";

    let _sub = mux.subscribe(topic, |_| {}, |_, _| {}).unwrap();
    wait_until(WAIT, || transport.opens(topic) == 1).await;

    mux.disconnect_all();
    wait_until(WAIT, || transport.closes(topic) == 1).await;
    let info = mux.list_channels().await;
    assert_eq!(info[0].phase, ChannelPhase::Dark);
    assert_eq!(info[0].consumers, 1);

    mux.handle_network_event(NetworkEvent::Visible);
    wait_until(WAIT, || transport.opens(topic) == 2).await;
}

#[tokio::test]
async fn test_failed_open_reports_error_and_retries_later() {
    init_logging();
    let transport = FakeTransport::new();
    transport.fail_next_opens(1);
    let errors: Arc<Mutex<Vec<ConnectionError>>> = Arc::new(Mutex::new(Vec::new()));
    let e = errors.clone();
    let handlers = EventHandlers::new().on_channel_error(move |error| e.lock().unwrap().push(error));
    let mux = common::mux_with(transport.clone(), CountingSessions::new(), handlers);
    let topic = "help_request:12";

    let statuses = Arc::new(Mutex::new(Vec::new()));
    let record = statuses.clone();
    let _sub = mux
        .subscribe(topic, |_| {}, move |status, _| record.lock().unwrap().push(status))
        .unwrap();

    wait_until(WAIT, || !errors.lock().unwrap().is_empty()).await;
    assert!(errors.lock().unwrap()[0].recoverable);
    assert!(statuses.lock().unwrap().contains(&ChannelStatus::ChannelError));
    assert_eq!(transport.opens(topic), 0);

    let info = mux.list_channels().await;
    assert_eq!(info[0].phase, ChannelPhase::Scheduled);
}

#[tokio::test]
async fn test_shutdown_rejects_new_subscriptions() {
    init_logging();
    let transport = FakeTransport::new();
    let mux = common::mux(transport.clone());
    let topic = "class:1:staff";

    let _sub = mux.subscribe(topic, |_| {}, |_, _| {}).unwrap();
    wait_until(WAIT, || transport.opens(topic) == 1).await;

    mux.shutdown().await;
    assert!(mux.is_shut_down());
    wait_until(WAIT, || transport.closes(topic) == 1).await;
    assert!(mux.subscribe(topic, |_| {}, |_, _| {}).is_err());
}

#[tokio::test(start_paused = true)]
async fn test_error_while_hidden_is_deferred_until_visible() {
    init_logging();
    let transport = FakeTransport::new();
    let mux = common::mux_with_timeouts(transport.clone(), LinkTimeouts::default());
    let topic = "class:2:staff";

    let _sub = mux.subscribe(topic, |_| {}, |_, _| {}).unwrap();
    wait_until(WAIT, || transport.opens(topic) == 1).await;
    settle().await;

    mux.handle_network_event(NetworkEvent::Hidden);
    transport.report_failure(topic, ChannelStatus::ChannelError, "upstream went away");
    settle().await;
    assert_eq!(channel(&mux, topic).await.phase, ChannelPhase::Deferred);

    // Health checks are skipped while hidden.
    tokio::time::sleep(Duration::from_secs(40)).await;
    assert_eq!(channel(&mux, topic).await.phase, ChannelPhase::Deferred);
    assert_eq!(transport.open_attempts(), 1);

    mux.handle_network_event(NetworkEvent::Visible);
    wait_until(WAIT, || transport.opens(topic) == 2).await;
    settle().await;
    let info = channel(&mux, topic).await;
    assert_eq!(info.phase, ChannelPhase::Joined);
    assert_eq!(info.reconnect_attempts, 0);
}

#[tokio::test(start_paused = true)]
async fn test_attempt_timeout_retries_after_five_seconds() {
    init_logging();
    let transport = FakeTransport::new();
    transport.hang_next_opens(1);
    let mux = common::mux_with_timeouts(transport.clone(), LinkTimeouts::default());
    let topic = "help_queues:4";

    let _sub = mux.subscribe(topic, |_| {}, |_, _| {}).unwrap();
    settle().await;
    assert_eq!(transport.open_attempts(), 1);
    assert_eq!(channel(&mux, topic).await.phase, ChannelPhase::Opening);

    tokio::time::sleep(Duration::from_secs(31)).await;
    let info = channel(&mux, topic).await;
    assert_eq!(info.phase, ChannelPhase::Scheduled);
    assert_eq!(info.status, ChannelStatus::TimedOut);
    assert_eq!(transport.open_attempts(), 1);

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(transport.open_attempts(), 1, "retried before the 5 s delay");

    tokio::time::sleep(Duration::from_secs(3)).await;
    wait_until(WAIT, || transport.opens(topic) == 1).await;
    settle().await;
    let info = channel(&mux, topic).await;
    assert_eq!(info.phase, ChannelPhase::Joined);
    assert_eq!(transport.open_attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_attempt_in_flight_past_override_allows_fresh_attempt() {
    init_logging();
    let transport = FakeTransport::new();
    transport.hang_next_opens(1);
    let mux = common::mux_with_timeouts(transport.clone(), slow_attempts());
    let topic = "submission:8:graders";

    let _sub = mux.subscribe(topic, |_| {}, |_, _| {}).unwrap();
    settle().await;
    assert_eq!(transport.open_attempts(), 1);

    // Under two minutes the hanging attempt still owns the channel.
    tokio::time::sleep(Duration::from_secs(60)).await;
    transport.report_failure(topic, ChannelStatus::ChannelError, "upstream went away");
    settle().await;
    assert_eq!(channel(&mux, topic).await.phase, ChannelPhase::Opening);

    tokio::time::sleep(Duration::from_secs(70)).await;
    transport.report_failure(topic, ChannelStatus::ChannelError, "upstream went away");
    settle().await;
    assert_eq!(channel(&mux, topic).await.phase, ChannelPhase::Scheduled);

    // First backoff is at most 60 s plus a quarter of jitter.
    tokio::time::sleep(Duration::from_secs(80)).await;
    wait_until(WAIT, || transport.opens(topic) == 1).await;
    settle().await;
    let info = channel(&mux, topic).await;
    assert_eq!(info.phase, ChannelPhase::Joined);
    assert_eq!(info.reconnect_attempts, 0);
    assert_eq!(transport.open_attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_health_check_resets_channel_stuck_five_minutes() {
    init_logging();
    let transport = FakeTransport::new();
    transport.hang_next_opens(1);
    let mux = common::mux_with_timeouts(transport.clone(), slow_attempts());
    let topic = "discussion_threads:9";

    let _sub = mux.subscribe(topic, |_| {}, |_, _| {}).unwrap();
    settle().await;

    tokio::time::sleep(Duration::from_secs(240)).await;
    assert_eq!(channel(&mux, topic).await.phase, ChannelPhase::Opening);
    assert_eq!(transport.open_attempts(), 1);

    // The check after the five minute mark resets and reopens.
    tokio::time::sleep(Duration::from_secs(120)).await;
    wait_until(WAIT, || transport.opens(topic) == 1).await;
    settle().await;
    let info = channel(&mux, topic).await;
    assert_eq!(info.phase, ChannelPhase::Joined);
    assert_eq!(info.reconnect_attempts, 0);
    assert_eq!(transport.open_attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_visible_after_long_pause_resubscribes_everything() {
    init_logging();
    let transport = FakeTransport::new();
    let mux = common::mux_with_timeouts(transport.clone(), LinkTimeouts::default());
    let topics = ["class:3:staff", "class:3:user:5"];

    let _subs: Vec<_> = topics
        .iter()
        .map(|topic| mux.subscribe(*topic, |_| {}, |_, _| {}).unwrap())
        .collect();
    wait_until(WAIT, || transport.total_opens() == 2).await;
    settle().await;

    // A short hide leaves joined channels alone.
    mux.handle_network_event(NetworkEvent::Hidden);
    tokio::time::sleep(Duration::from_secs(20)).await;
    mux.handle_network_event(NetworkEvent::Visible);
    settle().await;
    assert_eq!(transport.total_opens(), 2);

    mux.handle_network_event(NetworkEvent::Hidden);
    tokio::time::sleep(Duration::from_secs(90)).await;
    mux.handle_network_event(NetworkEvent::Visible);
    wait_until(WAIT, || transport.total_opens() == 4).await;
    settle().await;

    for topic in topics {
        assert_eq!(transport.opens(topic), 2);
        assert_eq!(transport.closes(topic), 1);
        let info = channel(&mux, topic).await;
        assert_eq!(info.phase, ChannelPhase::Joined);
        assert_eq!(info.reconnect_attempts, 0);
    }
}
