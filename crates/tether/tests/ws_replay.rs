//! End-to-end replay/live delivery over a real WebSocket connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::{Value, json};
use tokio_tungstenite::tungstenite::Message;

use tether::api::{AppState, router};
use tether::config::RuntimeConfig;
use tether::gateway::Gateway;
use tether::hub::EventHub;
use tether::process::NativeProcessFactory;
use tether::store::SqliteStore;

async fn spawn_server() -> (SocketAddr, Arc<SqliteStore>, Arc<EventHub>) {
    let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());
    let hub = Arc::new(EventHub::new());
    // The runtime is never started in these tests; the replay surface only
    // touches the store and the hub.
    let gateway = Gateway::new(
        RuntimeConfig::default(),
        Arc::new(NativeProcessFactory),
        Arc::clone(&store),
        Arc::clone(&hub),
    );
    let app = router(AppState {
        gateway,
        store: Arc::clone(&store),
        hub: Arc::clone(&hub),
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, store, hub)
}

/// Append an event and fan it out, the way the gateway does for a live
/// notification.
async fn persist_and_broadcast(
    store: &SqliteStore,
    hub: &EventHub,
    thread_id: Option<&str>,
    method: &str,
    payload: Value,
) -> i64 {
    let event = store
        .insert_event(thread_id, None, method, &payload)
        .await
        .unwrap();
    hub.broadcast(&event);
    event.cursor
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn connect(addr: SocketAddr, query: &str) -> WsStream {
    let url = format!("ws://{}/ws/events{}", addr, query);
    let (stream, _response) = tokio_tungstenite::connect_async(url).await.unwrap();
    stream
}

/// Next JSON event frame, skipping pings.
async fn next_event(stream: &mut WsStream) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("timed out waiting for event")
            .expect("stream ended")
            .expect("websocket error");
        match msg {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {:?}", other),
        }
    }
}

async fn wait_for_subscriber(hub: &EventHub) {
    for _ in 0..200 {
        if hub.subscriber_count() > 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("no subscriber registered");
}

#[tokio::test]
async fn replays_past_cursor_then_delivers_live_in_order() {
    let (addr, store, hub) = spawn_server().await;

    // Cursor 1 is already consumed by the client; cursor 2 is waiting.
    store
        .insert_event(None, None, "thread/started", &json!({"threadId": "t1"}))
        .await
        .unwrap();
    store
        .insert_event(None, None, "account/updated", &json!({"authMode": "chatgpt"}))
        .await
        .unwrap();

    let mut ws = connect(addr, "?cursor=1").await;

    let replayed = next_event(&mut ws).await;
    assert_eq!(replayed["cursor"], 2);
    assert_eq!(replayed["method"], "account/updated");

    // Receiving the replayed event proves the live subscription is active.
    let live_cursor = persist_and_broadcast(
        &store,
        &hub,
        None,
        "account/login/completed",
        json!({"authMode": "chatgpt"}),
    )
    .await;
    assert_eq!(live_cursor, 3);

    let live = next_event(&mut ws).await;
    assert_eq!(live["cursor"], 3);
    assert_eq!(live["method"], "account/login/completed");
}

#[tokio::test]
async fn duplicate_live_deliveries_are_dropped_across_the_transition() {
    let (addr, store, hub) = spawn_server().await;

    store
        .insert_event(None, None, "turn/started", &json!({"turnId": "u1"}))
        .await
        .unwrap();
    let second = store
        .insert_event(None, None, "turn/completed", &json!({"turnId": "u1"}))
        .await
        .unwrap();

    let mut ws = connect(addr, "?cursor=1").await;
    let replayed = next_event(&mut ws).await;
    assert_eq!(replayed["cursor"], 2);

    // Re-broadcast the event the replay already delivered, then a fresh one.
    hub.broadcast(&second);
    let fresh = persist_and_broadcast(&store, &hub, None, "turn/started", json!({"turnId": "u2"}))
        .await;

    let next = next_event(&mut ws).await;
    assert_eq!(next["cursor"], fresh);
    assert_eq!(next["method"], "turn/started");
}

#[tokio::test]
async fn default_cursor_on_empty_store_is_live_only() {
    let (addr, store, hub) = spawn_server().await;

    let mut ws = connect(addr, "").await;
    wait_for_subscriber(&hub).await;

    let cursor = persist_and_broadcast(&store, &hub, None, "error", json!({"message": "boom"}))
        .await;

    let live = next_event(&mut ws).await;
    assert_eq!(live["cursor"], cursor);
    assert_eq!(live["type"], "error");
}

#[tokio::test]
async fn non_numeric_cursor_defaults_to_full_replay() {
    let (addr, store, _hub) = spawn_server().await;

    store
        .insert_event(Some("t1"), None, "thread/started", &json!({"threadId": "t1"}))
        .await
        .unwrap();

    let mut ws = connect(addr, "?cursor=bogus").await;
    let replayed = next_event(&mut ws).await;
    assert_eq!(replayed["cursor"], 1);
    assert_eq!(replayed["type"], "thread.started");
}

#[tokio::test]
async fn thread_scope_filters_replay_and_live() {
    let (addr, store, hub) = spawn_server().await;

    store
        .insert_event(Some("t1"), None, "thread/started", &json!({"threadId": "t1"}))
        .await
        .unwrap();
    store
        .insert_event(Some("t2"), None, "thread/started", &json!({"threadId": "t2"}))
        .await
        .unwrap();

    let mut ws = connect(addr, "?thread=t2").await;
    let replayed = next_event(&mut ws).await;
    assert_eq!(replayed["cursor"], 2);
    assert_eq!(replayed["threadId"], "t2");

    persist_and_broadcast(&store, &hub, Some("t1"), "turn/started", json!({"turnId": "u1"}))
        .await;
    let seen = persist_and_broadcast(
        &store,
        &hub,
        Some("t2"),
        "turn/started",
        json!({"turnId": "u2"}),
    )
    .await;

    let live = next_event(&mut ws).await;
    assert_eq!(live["cursor"], seen);
    assert_eq!(live["threadId"], "t2");
}
