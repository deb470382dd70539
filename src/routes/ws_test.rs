use super::*;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::FutureExt;
use futures::channel::mpsc as fmpsc;
use serde_json::Value;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};

use crate::config::HubConfig;
use crate::services::persistence::test_helpers::MemorySnapshotStore;
use crate::services::registry::HubRegistry;
use crate::state::test_helpers::{test_app_state, test_app_state_with_store};

const WAIT: Duration = Duration::from_secs(2);

fn text(s: &str) -> Message {
    Message::Text(Payload::from(s.to_owned()))
}

fn registry(store: Arc<MemorySnapshotStore>) -> HubRegistry {
    HubRegistry::new(store, HubConfig::default())
}

async fn next_json(rx: &mut mpsc::Receiver<Payload>) -> Value {
    let payload = timeout(WAIT, rx.recv()).await.expect("timed out").expect("queue closed");
    serde_json::from_str(payload.as_str()).unwrap()
}

// =============================================================================
// IDENTITY
// =============================================================================

#[test]
fn identity_requires_project_id() {
    assert!(resolve_identity(WsParams::default()).is_none());
    assert!(resolve_identity(WsParams { project_id: Some("   ".into()), ..WsParams::default() }).is_none());
}

#[test]
fn identity_keeps_supplied_user() {
    let identity = resolve_identity(WsParams {
        project_id: Some("p1".into()),
        user_id: Some("u1".into()),
        username: Some("ada".into()),
    })
    .unwrap();
    assert_eq!(identity, Identity { project_id: "p1".into(), user_id: "u1".into(), username: "ada".into() });
}

#[test]
fn identity_defaults_to_anonymous() {
    let a = resolve_identity(WsParams { project_id: Some("p1".into()), ..WsParams::default() }).unwrap();
    let b = resolve_identity(WsParams { project_id: Some("p1".into()), ..WsParams::default() }).unwrap();
    assert!(a.user_id.starts_with("user_"));
    assert_eq!(a.user_id.len(), "user_".len() + 32);
    assert_ne!(a.user_id, b.user_id);
    assert_eq!(a.username, "anonymous");
}

#[test]
fn params_accept_legacy_capitalisation() {
    let params: WsParams = serde_json::from_str(r#"{"projectID":"p1","userID":"u1"}"#).unwrap();
    assert_eq!(params.project_id.as_deref(), Some("p1"));
    assert_eq!(params.user_id.as_deref(), Some("u1"));
}

// =============================================================================
// INBOUND PUMP
// =============================================================================

#[tokio::test]
async fn inbound_pump_relays_text_and_utf8_binary_then_unregisters() {
    let registry = registry(MemorySnapshotStore::new());
    let sender = registry.join("p1", "u1", "ada").await.unwrap();
    let mut observer = registry.join("p1", "u2", "bob").await.unwrap();
    next_json(&mut observer.outbound).await; // workboard

    let op1 = r#"{"type":"operation","subtype":"add","data":{"id":"c1"}}"#;
    let op2 = r#"{"type":"operation","subtype":"add","data":{"id":"c2"}}"#;
    let frames = vec![
        Ok::<_, std::io::Error>(text(op1)),
        Ok(Message::Ping(Bytes::new())),
        Ok(Message::Binary(Bytes::from(op2.as_bytes().to_vec()))),
        Ok(Message::Binary(Bytes::from_static(&[0xff, 0xfe]))),
        Ok(Message::Close(None)),
        Ok(text(r#"{"type":"operation","subtype":"add","data":{"id":"after-close"}}"#)),
    ];
    timeout(WAIT, inbound_pump(futures::stream::iter(frames), &sender.hub, sender.session_id))
        .await
        .expect("pump should stop at close");

    // Unregistration may overtake the relays; they share no queue.
    let mut relays = Vec::new();
    let mut sender_gone = false;
    while relays.len() < 2 || !sender_gone {
        let msg = next_json(&mut observer.outbound).await;
        if msg["type"] == "users_state" {
            sender_gone = msg["data"].get("u1").is_none();
        } else {
            relays.push(msg["data"]["id"].clone());
        }
    }
    assert_eq!(relays, vec![Value::from("c1"), Value::from("c2")]);
    assert!(timeout(Duration::from_millis(50), observer.outbound.recv()).await.is_err());

    let ids: Vec<String> = sender.hub.workboard().await.into_iter().map(|c| c.id).collect();
    assert_eq!(ids, vec!["c1".to_owned(), "c2".to_owned()]);
}

#[tokio::test]
async fn inbound_pump_stops_on_read_error() {
    let registry = registry(MemorySnapshotStore::new());
    let mut joined = registry.join("p1", "u1", "ada").await.unwrap();

    let frames = vec![Err::<Message, _>(std::io::Error::other("reset")), Ok(text("{}"))];
    timeout(WAIT, inbound_pump(futures::stream::iter(frames), &joined.hub, joined.session_id))
        .await
        .expect("pump should stop on error");

    // Unregistered: the queue drains and then closes.
    timeout(WAIT, async { while joined.outbound.recv().await.is_some() {} })
        .await
        .expect("session queue should close");
}

// =============================================================================
// OUTBOUND PUMP
// =============================================================================

#[tokio::test]
async fn outbound_pump_forwards_queue_then_closes() {
    let registry = registry(MemorySnapshotStore::new());
    let Joined { hub, session_id, outbound } = registry.join("p1", "u1", "ada").await.unwrap();
    let (sink, mut written) = fmpsc::unbounded::<Message>();

    let pump = tokio::spawn(outbound_pump(sink, outbound, hub.clone(), Duration::from_secs(60), WAIT));

    let first = timeout(WAIT, written.next()).await.unwrap().unwrap();
    let Message::Text(first) = first else { panic!("expected text, got {first:?}") };
    let first: Value = serde_json::from_str(first.as_str()).unwrap();
    assert_eq!(first["type"], "operation");
    assert_eq!(first["data"], serde_json::json!([]));

    hub.unregister(session_id).await;
    timeout(WAIT, pump).await.expect("pump should stop").unwrap();

    let mut last = None;
    while let Ok(Some(msg)) = timeout(Duration::from_millis(50), written.next()).await {
        last = Some(msg);
    }
    assert!(matches!(last, Some(Message::Close(None))), "last frame was {last:?}");
}

#[tokio::test]
async fn outbound_pump_pings_and_requests_flush() {
    let store = MemorySnapshotStore::new();
    let registry = registry(store.clone());
    let Joined { hub, outbound, .. } = registry.join("p1", "u1", "ada").await.unwrap();
    let (sink, mut written) = fmpsc::unbounded::<Message>();

    let _pump = tokio::spawn(outbound_pump(sink, outbound, hub, Duration::from_millis(20), WAIT));

    timeout(WAIT, async {
        while let Some(msg) = written.next().await {
            if matches!(msg, Message::Ping(_)) {
                break;
            }
        }
    })
    .await
    .expect("expected a ping");

    timeout(WAIT, async {
        while store.save_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("tick should flush the snapshot");
}

#[tokio::test]
async fn outbound_pump_stops_when_socket_is_gone() {
    let registry = registry(MemorySnapshotStore::new());
    let Joined { hub, outbound, .. } = registry.join("p1", "u1", "ada").await.unwrap();
    let (sink, written) = fmpsc::unbounded::<Message>();
    drop(written);

    timeout(WAIT, outbound_pump(sink, outbound, hub, Duration::from_secs(60), WAIT))
        .await
        .expect("a failed write should end the pump");
}

// =============================================================================
// SESSION TEARDOWN
// =============================================================================

#[tokio::test]
async fn session_ends_only_after_close_frame_and_final_flush() {
    let store = MemorySnapshotStore::new();
    let registry = registry(store.clone());
    let Joined { hub, session_id, outbound } = registry.join("p1", "u1", "ada").await.unwrap();
    let (sink, mut written) = fmpsc::unbounded::<Message>();
    let writer = tokio::spawn(outbound_pump(sink, outbound, hub.clone(), Duration::from_secs(60), WAIT));

    let (frames_tx, frames) = fmpsc::unbounded::<Result<Message, std::io::Error>>();
    let session = tokio::spawn({
        let hub = hub.clone();
        async move { drive_session(frames, writer, &hub, session_id).await }
    });

    frames_tx.unbounded_send(Ok(text(r#"{"type":"operation","subtype":"add","data":{"id":"c1"}}"#))).unwrap();
    timeout(WAIT, async {
        while hub.canvases().get("c1").await.is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("add should be applied");
    frames_tx.unbounded_send(Ok(Message::Close(None))).unwrap();
    timeout(WAIT, session).await.expect("session should end").unwrap();

    let mut last = None;
    while let Some(Some(msg)) = written.next().now_or_never() {
        last = Some(msg);
    }
    assert!(matches!(last, Some(Message::Close(None))), "close frame should already be written, last was {last:?}");

    timeout(WAIT, async {
        while store.stored("p1").is_none_or(|canvases| canvases.is_empty()) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("final flush should save the session's edits");
}

#[tokio::test]
async fn dead_socket_ends_the_session_and_unregisters() {
    let registry = registry(MemorySnapshotStore::new());
    let Joined { hub, session_id, outbound } = registry.join("p1", "u1", "ada").await.unwrap();
    let mut observer = registry.join("p1", "u2", "bob").await.unwrap();
    let (sink, written) = fmpsc::unbounded::<Message>();
    drop(written);
    let writer = tokio::spawn(outbound_pump(sink, outbound, hub.clone(), Duration::from_secs(60), WAIT));

    timeout(WAIT, drive_session(futures::stream::pending::<Result<Message, std::io::Error>>(), writer, &hub, session_id))
        .await
        .expect("a failed write should end the session");

    timeout(WAIT, async {
        loop {
            let msg = next_json(&mut observer.outbound).await;
            if msg["type"] == "users_state" && msg["data"].get("u1").is_none() {
                break;
            }
        }
    })
    .await
    .expect("roster should drop the dead session");
}

// =============================================================================
// END TO END
// =============================================================================

async fn spawn_server(state: AppState) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, crate::routes::app(state)).await.unwrap();
    });
    addr
}

type Client = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn connect(addr: SocketAddr, query: &str) -> Client {
    let (client, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws?{query}")).await.unwrap();
    client
}

async fn recv_json(client: &mut Client) -> Value {
    loop {
        let msg = timeout(WAIT, client.next()).await.expect("timed out").expect("closed").unwrap();
        if let WsMessage::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

async fn recv_relay(client: &mut Client) -> Value {
    loop {
        let msg = recv_json(client).await;
        if msg["type"] != "users_state" {
            return msg;
        }
    }
}

#[tokio::test]
async fn new_session_receives_empty_workboard_then_roster() {
    let addr = spawn_server(test_app_state()).await;
    let mut client = connect(addr, "projectId=p1&userId=u1&username=ada").await;

    let workboard = recv_json(&mut client).await;
    assert_eq!(workboard["type"], "operation");
    assert_eq!(workboard["data"], serde_json::json!([]));

    let roster = recv_json(&mut client).await;
    assert_eq!(roster["type"], "users_state");
    assert_eq!(roster["data"]["u1"]["username"], "ada");
}

#[tokio::test]
async fn upgrade_without_project_id_is_rejected() {
    let addr = spawn_server(test_app_state()).await;
    for query in ["userId=u1", "projectId=%20"] {
        match tokio_tungstenite::connect_async(format!("ws://{addr}/ws?{query}")).await {
            Err(tungstenite::Error::Http(response)) => assert_eq!(response.status().as_u16(), 400),
            other => panic!("expected HTTP 400 for {query}, got {:?}", other.map(|(_, r)| r.status())),
        }
    }
}

#[tokio::test]
async fn messages_relay_between_sessions_and_update_the_hub() {
    let state = test_app_state();
    let addr = spawn_server(state.clone()).await;
    let mut ada = connect(addr, "projectId=p1&userId=u1&username=ada").await;
    recv_json(&mut ada).await;
    let mut bob = connect(addr, "projectId=p1&userId=u2&username=bob").await;
    recv_json(&mut bob).await;

    let shape = r##"{"type":"operation","subtype":"shape","data":{"id":"c1","stroke":{"type":"rectangle","id":"r1","stroke":"#000","strokeWidth":1,"fill":"none","x":1,"y":2,"width":3,"height":4}}}"##;
    ada.send(WsMessage::text(shape)).await.unwrap();

    let relayed = recv_relay(&mut bob).await;
    assert_eq!(relayed, serde_json::from_str::<Value>(shape).unwrap());
    let echoed = recv_relay(&mut ada).await;
    assert_eq!(echoed["subtype"], "shape");

    let hub = state.hubs.get("p1").expect("hub should be live");
    let canvas = hub.canvases().get("c1").await.expect("shape should create the canvas");
    assert_eq!(canvas.vector_data.elements.len(), 1);
}

#[tokio::test]
async fn binary_frames_are_relayed_as_text() {
    let addr = spawn_server(test_app_state()).await;
    let mut ada = connect(addr, "projectId=p1&userId=u1").await;
    recv_json(&mut ada).await;
    let mut bob = connect(addr, "projectId=p1&userId=u2").await;
    recv_json(&mut bob).await;

    let cursor = r#"{"type":"cursor_move","userID":"u1","data":{"position":{"x":5,"y":6}}}"#;
    ada.send(WsMessage::binary(cursor.as_bytes().to_vec())).await.unwrap();
    assert_eq!(recv_relay(&mut bob).await["type"], "cursor_move");
}

#[tokio::test]
async fn closing_a_session_shrinks_the_roster() {
    let store = MemorySnapshotStore::new();
    let addr = spawn_server(test_app_state_with_store(store, HubConfig::default())).await;
    let mut ada = connect(addr, "projectId=p1&userId=u1").await;
    recv_json(&mut ada).await;
    let mut bob = connect(addr, "projectId=p1&userId=u2").await;
    recv_json(&mut bob).await;

    bob.close(None).await.unwrap();

    loop {
        let msg = recv_json(&mut ada).await;
        if msg["type"] == "users_state" && msg["data"].get("u2").is_none() && msg["data"].get("u1").is_some() {
            break;
        }
    }
}
