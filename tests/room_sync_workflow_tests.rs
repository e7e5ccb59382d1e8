use serde_json::json;
use std::time::Duration;

use ticker_sync::{
    broker::TransportError, persistence::schema::TickerBuckets, ConnectionState, RoomEvent,
    SendOptions, StateSyncBridge, TypedStore,
};

mod utils;

use utils::*;

#[tokio::test]
async fn test_retained_message_then_in_sync() {
    let setup = TestSetupBuilder::new()
        .with_retained("abc-123", r#"{"foo":"bar"}"#)
        .build();

    let mut log = None;
    let room = setup
        .coordinator
        .connect_to_room_with("abc-123", |room| log = Some(EventLog::new(room)))
        .await
        .expect("room should be created");
    let mut log = log.unwrap();

    match log.until("message").await {
        RoomEvent::Message(message) => {
            assert_eq!(message.payload, json!({"foo": "bar"}));
            assert!(message.retained);
        }
        other => panic!("expected message, got {:?}", other),
    }
    log.until("sync").await;
    assert!(log.position("message") < log.position("sync"));

    let status = wait_for_status(&setup.coordinator, |s| s.all_rooms_in_sync).await;
    assert_eq!(status.connected_rooms, vec!["abc-123".to_string()]);
    assert_eq!(room.state(), ConnectionState::InSync);
    assert!(setup.coordinator.all_rooms_in_sync().await);
}

#[tokio::test]
async fn test_invalid_room_name_never_reaches_broker() {
    let setup = TestSetupBuilder::new().build();

    for name in ["", "a/b", "room#", "x+y", "$SYS"] {
        assert!(setup.coordinator.connect_to_room(name).await.is_none());
    }

    assert!(setup.coordinator.rooms().await.is_empty());
    assert_eq!(setup.broker.session_count(), 0);
}

#[tokio::test]
async fn test_duplicate_connect_is_a_no_op() {
    let setup = TestSetupBuilder::new().build();

    let (first, second) = tokio::join!(
        setup.coordinator.connect_to_room("watchlist"),
        setup.coordinator.connect_to_room("watchlist"),
    );

    assert_eq!(first.is_some() as u8 + second.is_some() as u8, 1);
    assert_eq!(setup.coordinator.rooms().await.len(), 1);
}

#[tokio::test]
async fn test_all_rooms_in_sync_tracks_every_room() {
    let setup = TestSetupBuilder::new().build();
    assert!(!setup.coordinator.all_rooms_in_sync().await);

    let first = setup.coordinator.connect_to_room("first").await.unwrap();
    wait_for_state(&first, ConnectionState::InSync).await;
    assert!(setup.coordinator.all_rooms_in_sync().await);

    setup.broker.hold_handshakes();
    let second = setup.coordinator.connect_to_room("second").await.unwrap();
    assert_eq!(second.state(), ConnectionState::Connecting);
    assert!(!setup.coordinator.all_rooms_in_sync().await);

    setup.broker.release_handshakes();
    wait_for_state(&second, ConnectionState::InSync).await;
    let status = wait_for_status(&setup.coordinator, |s| {
        s.all_rooms_in_sync && s.connected_rooms.len() == 2
    })
    .await;
    assert_eq!(status.rooms, vec!["first".to_string(), "second".to_string()]);
}

#[tokio::test]
async fn test_disconnect_and_reconnect_keeps_room() {
    let setup = TestSetupBuilder::new().build();
    let room = setup.coordinator.connect_to_room("desk").await.unwrap();
    wait_for_state(&room, ConnectionState::InSync).await;

    room.disconnect().await;

    let status = wait_for_status(&setup.coordinator, |s| s.connected_rooms.is_empty()).await;
    assert_eq!(status.rooms, vec!["desk".to_string()]);
    assert_eq!(room.state(), ConnectionState::Disconnected);

    room.connect().unwrap();
    wait_for_state(&room, ConnectionState::InSync).await;
    wait_for_status(&setup.coordinator, |s| s.all_rooms_in_sync).await;
}

#[tokio::test]
async fn test_close_is_terminal_and_silent() {
    let setup = TestSetupBuilder::new().build();
    let room = setup.coordinator.connect_to_room("desk").await.unwrap();
    wait_for_state(&room, ConnectionState::InSync).await;
    let mut log = EventLog::new(&room);

    setup.coordinator.disconnect_from_room(&room).await;

    assert_eq!(room.state(), ConnectionState::Closed);
    assert!(log.ended().await);
    assert_eq!(log.names().last(), Some(&"close"));
    assert!(room.connect().is_err());
    assert!(setup.coordinator.rooms().await.is_empty());
    assert_eq!(setup.broker.subscriber_count(&setup.topic("desk")), 0);
}

#[tokio::test]
async fn test_rejected_credentials_close_the_room() {
    let setup = TestSetupBuilder::new()
        .with_refusal(TransportError::AuthRejected("not authorized".to_string()))
        .build();

    let room = setup.coordinator.connect_to_room("desk").await.unwrap();

    wait_for_state(&room, ConnectionState::Closed).await;
    wait_for_status(&setup.coordinator, |s| s.rooms.is_empty()).await;
}

#[tokio::test]
async fn test_unreachable_broker_is_retryable() {
    let setup = TestSetupBuilder::new()
        .with_refusal(TransportError::Unreachable("connection refused".to_string()))
        .build();

    let room = setup.coordinator.connect_to_room("desk").await.unwrap();
    wait_for_state(&room, ConnectionState::Error).await;
    assert_eq!(setup.coordinator.rooms().await.len(), 1);

    setup.broker.refuse_connections(None);
    room.connect().unwrap();
    wait_for_state(&room, ConnectionState::InSync).await;
}

#[tokio::test]
async fn test_presence_counts_each_device_once() {
    let setup = TestSetupBuilder::new().build();
    let phone = setup.device();
    let laptop = setup.device();

    let (phone_room, _) = phone.join_room("desk").await.unwrap();
    wait_for_state(&phone_room, ConnectionState::InSync).await;
    let (laptop_room, _) = laptop.join_room("desk").await.unwrap();
    wait_for_state(&laptop_room, ConnectionState::InSync).await;

    wait_for_status(&phone.coordinator, |s| s.total_participants == 2).await;
    wait_for_status(&laptop.coordinator, |s| s.total_participants == 2).await;

    // Both devices hear each other's hello and here; the count stays at two
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(phone.coordinator.total_participants_for_all_rooms().await, 2);

    setup.broker.drop_session(laptop_room.session_id());
    wait_for_status(&phone.coordinator, |s| s.total_participants == 1).await;
}

#[tokio::test]
async fn test_state_converges_across_devices() {
    let setup = TestSetupBuilder::new().build();
    let phone = setup.device();
    let laptop = setup.device();

    let phone_store = TypedStore::new(phone.persistence.clone());
    let laptop_store = TypedStore::new(laptop.persistence.clone());

    let (phone_room, _) = phone.join_room("desk").await.unwrap();
    wait_for_state(&phone_room, ConnectionState::InSync).await;

    let buckets = [("tech".to_string(), vec!["AAPL".to_string(), "MSFT".to_string()])]
        .into_iter()
        .collect();
    phone_store.set::<TickerBuckets>(&buckets).await.unwrap();

    // The laptop joins late and catches up from the retained snapshot
    let (laptop_room, _) = laptop.join_room("desk").await.unwrap();
    wait_for_state(&laptop_room, ConnectionState::InSync).await;

    tokio::time::timeout(WAIT, async {
        loop {
            if laptop_store.get::<TickerBuckets>().await.unwrap().as_ref() == Some(&buckets) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("laptop never received the buckets");

    // And changes flow back the other way
    laptop
        .persistence
        .set_item("settings", json!({"quoteCurrency": "EUR"}))
        .await
        .unwrap();

    tokio::time::timeout(WAIT, async {
        loop {
            if phone.reader.get("settings").await.unwrap() == Some(json!({"quoteCurrency": "EUR"})) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("phone never received the settings");

    assert_eq!(
        phone_store.get::<TickerBuckets>().await.unwrap(),
        Some(buckets)
    );
}

#[tokio::test]
async fn test_send_retained_reaches_late_joiner() {
    let setup = TestSetupBuilder::new().build();
    let first = setup.coordinator.connect_to_room("desk").await.unwrap();
    wait_for_state(&first, ConnectionState::InSync).await;

    first
        .send(json!({"note": "hello"}), SendOptions::retained())
        .unwrap();

    // Wait for the broker to store it
    tokio::time::timeout(WAIT, async {
        while setup.broker.retained(&setup.topic("desk")).is_none() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();

    let late = setup.device();
    let mut log = None;
    let room = late
        .coordinator
        .connect_to_room_with("desk", |room| log = Some(EventLog::new(room)))
        .await
        .unwrap();
    let mut log = log.unwrap();

    match log.until("message").await {
        RoomEvent::Message(message) => {
            assert_eq!(message.payload, json!({"note": "hello"}));
            assert_eq!(message.sender.as_deref(), Some(first.session_id()));
        }
        other => panic!("expected message, got {:?}", other),
    }
    log.until("sync").await;
    assert_eq!(room.state(), ConnectionState::InSync);
}

#[tokio::test]
async fn test_bridge_with_prefix_only_replicates_matching_keys() {
    let setup = TestSetupBuilder::new().build();
    let phone = setup.device();
    let laptop = setup.device();

    for device in [&phone, &laptop] {
        let persistence = device.persistence.clone();
        let room = device
            .coordinator
            .connect_to_room_with("desk", |room| {
                StateSyncBridge::new(room.clone(), persistence)
                    .with_key_prefix("ui.")
                    .start();
            })
            .await
            .unwrap();
        wait_for_state(&room, ConnectionState::InSync).await;
    }

    phone
        .persistence
        .set_item("local.draft", json!("not shared"))
        .await
        .unwrap();
    phone
        .persistence
        .set_item("ui.theme", json!("dark"))
        .await
        .unwrap();

    tokio::time::timeout(WAIT, async {
        while laptop.persistence.get_item("ui.theme").await.unwrap() != Some(json!("dark")) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("laptop never received ui.theme");

    assert_eq!(laptop.persistence.get_item("local.draft").await.unwrap(), None);
}

#[tokio::test]
async fn test_offline_edit_survives_reconnect() {
    let setup = TestSetupBuilder::new().build();
    let phone = setup.device();
    let laptop = setup.device();

    let (phone_room, _) = phone.join_room("desk").await.unwrap();
    wait_for_state(&phone_room, ConnectionState::InSync).await;
    let (laptop_room, _) = laptop.join_room("desk").await.unwrap();
    wait_for_state(&laptop_room, ConnectionState::InSync).await;

    phone.persistence.set_item("a", json!(1)).await.unwrap();
    wait_for_item(laptop.persistence.as_ref(), "a", json!(1)).await;

    laptop_room.disconnect().await;
    assert_eq!(laptop_room.state(), ConnectionState::Disconnected);

    // The phone moves on while the laptop is away
    phone.persistence.set_item("b", json!(2)).await.unwrap();
    tokio::time::timeout(WAIT, async {
        loop {
            let retained = setup
                .broker
                .retained(&setup.topic("desk"))
                .and_then(|bytes| serde_json::from_slice::<serde_json::Value>(&bytes).ok());
            if retained.map_or(false, |v| v["payload"]["entries"]["b"] == json!(2)) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("phone never published b");

    // And the laptop edits offline
    laptop
        .persistence
        .set_item("draft", json!("offline edit"))
        .await
        .unwrap();

    laptop_room.connect().unwrap();
    wait_for_state(&laptop_room, ConnectionState::InSync).await;

    wait_for_item(laptop.persistence.as_ref(), "b", json!(2)).await;
    wait_for_item(laptop.persistence.as_ref(), "draft", json!("offline edit")).await;
    wait_for_item(phone.persistence.as_ref(), "draft", json!("offline edit")).await;
    assert_eq!(phone.persistence.get_item("a").await.unwrap(), Some(json!(1)));
    assert_eq!(laptop.persistence.get_item("a").await.unwrap(), Some(json!(1)));
}
