use super::*;
use crate::services::persistence::test_helpers::MemorySnapshotStore;
use serde_json::{Value, json};
use std::time::Duration;
use tokio::time::timeout;

fn session(user_id: &str, capacity: usize) -> (SessionHandle, mpsc::Receiver<Payload>) {
    let (tx, rx) = mpsc::channel(capacity);
    (SessionHandle::new(user_id, format!("{user_id}-name"), tx), rx)
}

fn payload(value: &Value) -> Payload {
    Payload::from(value.to_string())
}

async fn recv_json(rx: &mut mpsc::Receiver<Payload>) -> Value {
    let msg = timeout(Duration::from_millis(200), rx.recv())
        .await
        .expect("timed out waiting for message")
        .expect("queue closed");
    serde_json::from_str(msg.as_str()).expect("payload should be json")
}

async fn assert_queue_closed(rx: &mut mpsc::Receiver<Payload>) {
    loop {
        match timeout(Duration::from_millis(200), rx.recv()).await {
            Ok(Some(_)) => {}
            Ok(None) => return,
            Err(_) => panic!("queue was not closed"),
        }
    }
}

fn test_config(idle_grace: Duration) -> HubConfig {
    HubConfig { idle_grace, ..HubConfig::default() }
}

fn spawn_hub(store: Arc<MemorySnapshotStore>, idle_grace: Duration) -> (Hub, oneshot::Receiver<Uuid>) {
    let (retired_tx, retired_rx) = oneshot::channel();
    let hook: RetireHook = Box::new(move |hub_id| {
        let _ = retired_tx.send(hub_id);
    });
    let hub = Hub::spawn("p1", CanvasStore::new(), store, test_config(idle_grace), hook);
    (hub, retired_rx)
}

fn op(subtype: &str, data: Value) -> Value {
    json!({"type": "operation", "subtype": subtype, "data": data})
}

// =============================================================================
// REGISTRATION
// =============================================================================

#[tokio::test]
async fn joiner_gets_empty_workboard_then_users_state() {
    let mut state = HubState::new("p1".into(), CanvasStore::new());
    let (s, mut rx) = session("u1", 8);
    state.register(s).await;

    let workboard = recv_json(&mut rx).await;
    assert_eq!(workboard["type"], "operation");
    assert_eq!(workboard["data"], json!([]));

    let roster = recv_json(&mut rx).await;
    assert_eq!(roster["type"], "users_state");
    assert_eq!(roster["data"]["u1"]["username"], "u1-name");
    assert!(roster["data"]["u1"]["color"].as_str().unwrap().starts_with('#'));
}

#[tokio::test]
async fn registration_broadcasts_roster_to_existing_sessions() {
    let mut state = HubState::new("p1".into(), CanvasStore::new());
    let (a, mut rx_a) = session("a", 8);
    let (b, _rx_b) = session("b", 8);
    state.register(a).await;
    let _ = recv_json(&mut rx_a).await;
    let _ = recv_json(&mut rx_a).await;

    state.register(b).await;
    let roster = recv_json(&mut rx_a).await;
    assert_eq!(roster["type"], "users_state");
    assert!(roster["data"].get("a").is_some());
    assert!(roster["data"].get("b").is_some());
}

#[tokio::test]
async fn same_user_twice_is_one_presence_two_clients() {
    let mut state = HubState::new("p1".into(), CanvasStore::new());
    let (first, _rx1) = session("u1", 8);
    let (second, _rx2) = session("u1", 8);
    let second_id = second.id;
    state.register(first).await;
    state.register(second).await;

    assert_eq!(state.clients.len(), 2);
    assert_eq!(state.users.len(), 1);

    state.unregister(second_id);
    assert_eq!(state.clients.len(), 1);
    assert_eq!(state.users.len(), 1, "presence survives while another session remains");
}

#[tokio::test]
async fn second_registration_replaces_presence() {
    let mut state = HubState::new("p1".into(), CanvasStore::new());
    let (first_tx, _rx1) = mpsc::channel(8);
    let (second_tx, mut rx2) = mpsc::channel(8);
    state.register(SessionHandle::new("u1", "first-tab", first_tx)).await;
    state.dispatch(payload(&json!({"type": "cursor_move", "userId": "u1", "data": {"position": {"x": 4, "y": 5}}}))).await;
    assert!(state.users["u1"].cursor.is_some());

    state.register(SessionHandle::new("u1", "second-tab", second_tx)).await;
    assert_eq!(state.users["u1"].username, "second-tab");
    assert!(state.users["u1"].cursor.is_none(), "cursor resets with the new presence");

    let _workboard = recv_json(&mut rx2).await;
    let roster = recv_json(&mut rx2).await;
    assert_eq!(roster["data"]["u1"]["username"], "second-tab");
}

#[tokio::test]
async fn presence_outlives_the_replaced_session() {
    let mut state = HubState::new("p1".into(), CanvasStore::new());
    let (first, _rx1) = session("u1", 8);
    let (second, _rx2) = session("u1", 8);
    let first_id = first.id;
    state.register(first).await;
    state.register(second).await;

    state.unregister(first_id);
    assert_eq!(state.clients.len(), 1);
    assert_eq!(state.users.len(), 1, "presence survives while another session remains");
}

#[tokio::test]
async fn unregister_closes_queue_and_removes_presence() {
    let mut state = HubState::new("p1".into(), CanvasStore::new());
    let (s, mut rx) = session("u1", 8);
    let id = s.id;
    state.register(s).await;
    state.unregister(id);

    assert!(state.clients.is_empty());
    assert!(state.users.is_empty());
    assert_queue_closed(&mut rx).await;
}

#[tokio::test]
async fn unregister_unknown_session_is_noop() {
    let mut state = HubState::new("p1".into(), CanvasStore::new());
    let (s, mut rx) = session("u1", 8);
    state.register(s).await;
    let _ = recv_json(&mut rx).await;
    let _ = recv_json(&mut rx).await;

    state.unregister(Uuid::new_v4());
    assert_eq!(state.clients.len(), 1);
    assert!(timeout(Duration::from_millis(50), rx.recv()).await.is_err(), "no roster broadcast expected");
}

#[tokio::test]
async fn joiner_with_full_queue_is_not_added() {
    let mut state = HubState::new("p1".into(), CanvasStore::new());
    let (tx, _rx) = mpsc::channel(1);
    tx.try_send(Payload::from("filler")).unwrap();
    state.register(SessionHandle::new("u1", "u1", tx)).await;
    assert!(state.clients.is_empty());
    assert!(state.users.is_empty());
}

// =============================================================================
// DISPATCH
// =============================================================================

#[tokio::test]
async fn operation_sequence_yields_expected_store() {
    let store = CanvasStore::new();
    let mut state = HubState::new("p1".into(), store.clone());

    let messages = [
        op("add", json!([{"id": "c1", "vectorData": {"width": 100}}, {"id": "c2", "vectorData": {}}])),
        op("shape", json!({"id": "c1", "stroke": {"type": "rectangle", "id": "e1", "width": 5}})),
        op("shape", json!({"id": "c1", "stroke": {"type": "rectangle", "id": "e1", "width": 7}})),
        op("shape", json!({"id": "c1", "stroke": {"type": "circle", "id": "e2", "radius": 3}})),
        op("canvas", json!({"id": "c1", "background": "#123456"})),
        op("remove", json!("c2")),
        op("remove", json!("never-existed")),
        op("action", json!({"canvasId": "c1", "vectorElementId": "e1", "action": {"type": "link", "link": "https://x"}})),
        op("action", json!({"canvasId": "c1", "vectorElementId": "ghost", "action": {"type": "link", "link": "https://y"}})),
    ];
    for message in &messages {
        state.dispatch(payload(message)).await;
    }

    let all = store.list_all().await;
    assert_eq!(all.len(), 1);
    let c1 = &all[0];
    assert_eq!(c1.id, "c1");
    assert_eq!(c1.vector_data.background_fill, "#123456");
    assert_eq!(c1.vector_data.elements.len(), 2);
    let e1 = serde_json::to_value(c1.element("e1").unwrap()).unwrap();
    assert_eq!(e1["width"], 7.0);
    assert_eq!(e1["action"], json!({"type": "link", "link": "https://x"}));
    assert!(c1.element("ghost").is_none());
}

#[tokio::test]
async fn every_message_is_relayed_verbatim_even_if_malformed() {
    let mut state = HubState::new("p1".into(), CanvasStore::new());
    let (s, mut rx) = session("u1", 16);
    state.register(s).await;
    let _ = recv_json(&mut rx).await;
    let _ = recv_json(&mut rx).await;

    let raw = r#"{"type":"operation","subtype":"spin","data":{}}"#;
    state.dispatch(Payload::from(raw)).await;
    let relayed = timeout(Duration::from_millis(200), rx.recv()).await.unwrap().unwrap();
    assert_eq!(relayed.as_str(), raw);

    state.dispatch(Payload::from("not json at all")).await;
    let relayed = timeout(Duration::from_millis(200), rx.recv()).await.unwrap().unwrap();
    assert_eq!(relayed.as_str(), "not json at all");
}

#[tokio::test]
async fn cursor_move_updates_known_presence_only() {
    let mut state = HubState::new("p1".into(), CanvasStore::new());
    let (s, _rx) = session("u1", 16);
    state.register(s).await;

    let moved = json!({"type": "cursor_move", "userId": "u1", "data": {"position": {"x": 4, "y": 5}, "isDrawing": true}});
    state.dispatch(payload(&moved)).await;
    let presence = &state.users["u1"];
    assert_eq!(presence.cursor, Some(protocol::Point::new(4.0, 5.0)));
    assert!(presence.is_drawing);

    let stranger = json!({"type": "cursor_move", "userId": "ghost", "data": {"position": {"x": 1, "y": 1}}});
    state.dispatch(payload(&stranger)).await;
    assert_eq!(state.users.len(), 1);
}

#[tokio::test]
async fn workboard_replays_into_fresh_store() {
    let source = CanvasStore::new();
    let mut state = HubState::new("p1".into(), source.clone());
    state.dispatch(payload(&op("add", json!({"id": "c1", "vectorData": {"width": 12.5, "height": 3}})))).await;
    state
        .dispatch(payload(&op("shape", json!({"id": "c1", "stroke": {"type": "path", "id": "p", "points": [{"x": 0.1, "y": 0.2}]}}))))
        .await;

    let (s, mut rx) = session("u1", 8);
    state.register(s).await;
    let workboard = recv_json(&mut rx).await;

    let replica = CanvasStore::new();
    let mut replay = HubState::new("p2".into(), replica.clone());
    replay.dispatch(payload(&workboard)).await;

    assert_eq!(replica.list_all().await, source.list_all().await);
}

// =============================================================================
// BACKPRESSURE
// =============================================================================

#[tokio::test]
async fn slow_session_is_dropped_and_fast_sessions_get_everything() {
    const BROADCASTS: usize = 1000;
    let (hub, _retired) = spawn_hub(MemorySnapshotStore::new(), Duration::from_secs(60));

    let (fast_a, mut rx_a) = session("fast-a", 4096);
    let (fast_b, mut rx_b) = session("fast-b", 4096);
    let (slow, _rx_slow) = session("slow", 8);
    hub.register(fast_a).await.unwrap();
    hub.register(fast_b).await.unwrap();
    hub.register(slow).await.unwrap();

    let message = op("canvas", json!({"id": "c1", "background": "#000"}));
    for _ in 0..BROADCASTS {
        hub.publish(payload(&message)).await.unwrap();
    }

    for rx in [&mut rx_a, &mut rx_b] {
        let mut operations = 0;
        let mut last_roster = Value::Null;
        timeout(Duration::from_secs(5), async {
            while operations < BROADCASTS {
                let msg = recv_json(rx).await;
                if msg["type"] == "users_state" {
                    last_roster = msg;
                } else if msg["subtype"] == "canvas" {
                    operations += 1;
                }
            }
        })
        .await
        .expect("responsive sessions should receive every broadcast");

        assert_eq!(operations, BROADCASTS);
        assert!(last_roster["data"].get("slow").is_none(), "slow session should be gone: {last_roster}");
        assert!(last_roster["data"].get("fast-a").is_some());
    }
}

// =============================================================================
// LIFECYCLE
// =============================================================================

#[tokio::test]
async fn idle_hub_flushes_and_retires() {
    let store = MemorySnapshotStore::new();
    let (hub, retired) = spawn_hub(store.clone(), Duration::from_millis(50));

    let (s, _rx) = session("u1", 8);
    let id = s.id;
    hub.register(s).await.unwrap();
    hub.publish(payload(&op("add", json!({"id": "kept"})))).await.unwrap();
    hub.unregister(id).await;

    let retired_id = timeout(Duration::from_secs(2), retired).await.expect("hub should retire").unwrap();
    assert_eq!(retired_id, hub.id());
    assert!(hub.is_closed());
    assert_eq!(store.stored("p1").unwrap(), vec![Canvas::new("kept")]);

    let (late, _late_rx) = session("u2", 8);
    assert!(matches!(hub.register(late).await, Err(HubError::Retired(_))));
}

#[tokio::test]
async fn registration_before_grace_cancels_retirement() {
    let (hub, mut retired) = spawn_hub(MemorySnapshotStore::new(), Duration::from_millis(150));

    let (first, _rx1) = session("u1", 8);
    let first_id = first.id;
    hub.register(first).await.unwrap();
    hub.unregister(first_id).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    let (second, _rx2) = session("u2", 8);
    hub.register(second).await.unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(retired.try_recv().is_err());
    assert!(!hub.is_closed());
}

#[tokio::test]
async fn request_flush_saves_current_canvases() {
    let store = MemorySnapshotStore::new();
    let (hub, _retired) = spawn_hub(store.clone(), Duration::from_secs(60));
    let (s, _rx) = session("u1", 8);
    hub.register(s).await.unwrap();
    hub.publish(payload(&op("add", json!([{"id": "a"}, {"id": "b"}])))).await.unwrap();

    timeout(Duration::from_secs(1), async {
        while hub.canvases().len().await < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("add should be applied");

    hub.request_flush();
    timeout(Duration::from_secs(1), async {
        while store.stored("p1").is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("flush should land");
    assert_eq!(store.stored("p1").unwrap().len(), 2);
}

#[tokio::test]
async fn flush_requested_during_a_slow_save_still_lands() {
    let store = MemorySnapshotStore::new();
    store.set_save_delay(Duration::from_millis(200));
    let (hub, _retired) = spawn_hub(store.clone(), Duration::from_secs(60));
    let (s, _rx) = session("u1", 8);
    hub.register(s).await.unwrap();

    hub.request_flush();
    hub.publish(payload(&op("add", json!({"id": "late"})))).await.unwrap();
    timeout(Duration::from_secs(1), async {
        while hub.canvases().len().await < 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("add should be applied");
    hub.request_flush();

    timeout(Duration::from_secs(2), async {
        while store.stored("p1").is_none_or(|canvases| canvases.is_empty()) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("the later request should save the newer state");
    assert_eq!(store.stored("p1").unwrap(), vec![Canvas::new("late")]);
    assert_eq!(store.save_count(), 2);
}

#[tokio::test]
async fn rejected_joiner_does_not_keep_an_idle_hub_alive() {
    let (hub, retired) = spawn_hub(MemorySnapshotStore::new(), Duration::from_millis(50));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (dead, dead_rx) = session("u1", 8);
    drop(dead_rx);
    let _ = hub.register(dead).await;

    let retired_id = timeout(Duration::from_secs(2), retired).await.expect("hub should still retire").unwrap();
    assert_eq!(retired_id, hub.id());
}

#[tokio::test]
async fn failed_flush_is_not_fatal() {
    let store = MemorySnapshotStore::new();
    store.set_failing(true);
    let (hub, _retired) = spawn_hub(store.clone(), Duration::from_secs(60));
    hub.flush().await;
    assert_eq!(store.save_count(), 0);

    store.set_failing(false);
    hub.flush().await;
    assert_eq!(store.save_count(), 1);
}
