//! Event bus tests

use edgetwin_core::EventBus;

#[derive(Debug, Clone, PartialEq)]
enum Ping {
    One,
    Two(u32),
}

#[tokio::test]
async fn test_publish_and_receive() {
    let bus: EventBus<Ping> = EventBus::new();
    let mut rx = bus.subscribe();

    assert!(bus.publish(Ping::One));
    assert!(bus.publish_with_source(Ping::Two(7), "test"));

    let (event, meta) = rx.recv().await.unwrap();
    assert_eq!(event, Ping::One);
    assert_eq!(meta.source, "system");

    let (event, meta) = rx.recv().await.unwrap();
    assert_eq!(event, Ping::Two(7));
    assert_eq!(meta.source, "test");
    assert!(!meta.event_id.is_empty());
}

#[test]
fn test_publish_without_subscribers() {
    let bus: EventBus<Ping> = EventBus::with_capacity(4).named("twin");
    assert_eq!(bus.name(), "twin");
    assert_eq!(bus.subscriber_count(), 0);
    assert!(!bus.publish(Ping::One));
}

#[test]
fn test_lagged_receiver_keeps_latest() {
    let bus: EventBus<Ping> = EventBus::with_capacity(2);
    let mut rx = bus.subscribe();

    for i in 0..5 {
        bus.publish(Ping::Two(i));
    }

    // Capacity 2: the oldest three were overwritten
    assert_eq!(rx.try_recv().map(|(e, _)| e), Some(Ping::Two(3)));
    assert_eq!(rx.try_recv().map(|(e, _)| e), Some(Ping::Two(4)));
    assert!(rx.try_recv().is_none());
}
