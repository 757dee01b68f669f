use super::*;
use crate::model::{LogOrigin, LogSource};

fn log_event(payload: &str) -> Event {
    Event::Log {
        payload: payload.to_string(),
        origin: LogOrigin {
            source: LogSource::Stdout,
            id: "1".into(),
        },
    }
}

#[tokio::test]
async fn late_subscriber_replays_full_log_then_sees_live_events() {
    let hub = EventHub::new("build-1", 16);

    hub.emit_event(log_event("one")).await;
    hub.emit_event(log_event("two")).await;

    let mut sub = hub.subscribe().await;

    hub.emit_event(log_event("three")).await;
    hub.close().await;

    let mut seen = Vec::new();
    while let Some(event) = sub.next().await {
        seen.push(event);
    }

    assert_eq!(seen, vec![log_event("one"), log_event("two"), log_event("three")]);
}

#[tokio::test]
async fn subscribing_after_close_still_replays_and_ends() {
    let hub = EventHub::new("build-1", 16);
    hub.emit_event(log_event("one")).await;
    hub.close().await;

    let mut sub = hub.subscribe().await;
    assert_eq!(sub.next().await, Some(log_event("one")));
    assert_eq!(sub.next().await, None);
}

#[tokio::test]
async fn events_emitted_after_close_are_dropped() {
    let hub = EventHub::new("build-1", 16);
    hub.close().await;
    hub.emit_event(log_event("ignored")).await;

    assert!(hub.events().await.is_empty());
}

#[tokio::test]
async fn slow_subscriber_is_disconnected_without_blocking_emission() {
    let hub = EventHub::new("build-1", 1);
    let mut slow = hub.subscribe().await;

    // Fill the one-slot buffer, then overflow it without slow ever draining.
    hub.emit_event(log_event("a")).await;
    hub.emit_event(log_event("b")).await;
    hub.emit_event(log_event("c")).await;

    // The hub's log itself is unaffected by a dropped subscriber.
    assert_eq!(hub.events().await.len(), 3);

    // `slow` only ever sees what fit before it was dropped; it does not see "c" and the
    // stream simply ends rather than hanging.
    let first = slow.next().await;
    assert_eq!(first, Some(log_event("a")));
}

#[tokio::test]
async fn unsubscribe_is_idempotent() {
    let hub = EventHub::new("build-1", 16);
    let sub = hub.subscribe().await;
    let id = sub.id();

    hub.unsubscribe(id).await;
    hub.unsubscribe(id).await;
}

#[tokio::test]
async fn close_is_idempotent() {
    let hub = EventHub::new("build-1", 16);
    hub.close().await;
    hub.close().await;
    assert!(hub.is_closed().await);
}

#[tokio::test]
async fn from_events_seeds_replay_without_closing() {
    let hub = EventHub::from_events("build-1", 16, vec![log_event("restored")]);
    assert!(!hub.is_closed().await);

    let mut sub = hub.subscribe().await;
    assert_eq!(sub.next().await, Some(log_event("restored")));

    hub.emit_event(log_event("new")).await;
    hub.close().await;
    assert_eq!(sub.next().await, Some(log_event("new")));
    assert_eq!(sub.next().await, None);
}
