//! WebSocket replay gateway.
//!
//! A connection supplies a cursor; everything persisted after that cursor is
//! replayed in order, then delivery switches to live events. The hub
//! subscription is taken before the replay snapshot is read, and live events
//! at or below the last replayed cursor are dropped, so the transition has
//! no gap and no duplicate.

use std::collections::HashMap;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use log::{debug, error};
use serde::Serialize;

use tether_protocol::StreamEvent;

use crate::api::AppState;
use crate::hub::Scope;
use crate::store::REPLAY_PAGE_SIZE;

const PING_INTERVAL_SECS: u64 = 30;

/// Parse the replay cursor. Missing, non-numeric, or negative values all
/// mean "from the beginning".
pub fn cursor_from_query(params: &HashMap<String, String>) -> i64 {
    params
        .get("cursor")
        .and_then(|raw| raw.parse::<i64>().ok())
        .filter(|cursor| *cursor >= 0)
        .unwrap_or(0)
}

/// GET /ws/events
pub async fn ws_handler(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let cursor = cursor_from_query(&params);
    let scope = match params.get("thread") {
        Some(thread) => Scope::Thread(thread.clone()),
        None => Scope::AllThreads,
    };
    ws.on_upgrade(move |socket| handle_connection(socket, state, cursor, scope))
}

async fn handle_connection(socket: WebSocket, state: AppState, cursor: i64, scope: Scope) {
    let (mut sender, mut receiver) = socket.split();

    // Subscribe first; the snapshot below then covers any event the
    // subscription could have raced with, and the cursor check drops the
    // overlap.
    let (sub_id, mut live) = state.hub.subscribe(scope.clone());

    let thread = match &scope {
        Scope::Thread(thread) => Some(thread.as_str()),
        Scope::AllThreads => None,
    };
    let replay = match state
        .store
        .list_events_since(thread, cursor, REPLAY_PAGE_SIZE)
        .await
    {
        Ok(events) => events,
        Err(e) => {
            error!("replay query failed: {:#}", e);
            state.hub.unsubscribe(sub_id);
            return;
        }
    };

    let mut last_cursor = cursor;
    for event in &replay {
        if send_json(&mut sender, &StreamEvent::from_event(event))
            .await
            .is_err()
        {
            state.hub.unsubscribe(sub_id);
            return;
        }
        last_cursor = event.cursor;
    }
    debug!(
        "replayed {} events, live from cursor {}",
        replay.len(),
        last_cursor
    );

    let mut ping = tokio::time::interval(Duration::from_secs(PING_INTERVAL_SECS));
    ping.tick().await; // first tick fires immediately

    loop {
        tokio::select! {
            event = live.recv() => {
                match event {
                    Some(event) => {
                        if event.cursor <= last_cursor {
                            continue;
                        }
                        last_cursor = event.cursor;
                        if send_json(&mut sender, &event).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = ping.tick() => {
                if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }
            inbound = receiver.next() => {
                if !handle_inbound(inbound).await {
                    break;
                }
            }
        }
    }

    state.hub.unsubscribe(sub_id);
    debug!("websocket closed at cursor {}", last_cursor);
}

async fn send_json<T: Serialize>(
    sender: &mut SplitSink<WebSocket, Message>,
    value: &T,
) -> Result<(), axum::Error> {
    let text = match serde_json::to_string(value) {
        Ok(text) => text,
        Err(e) => {
            error!("failed to encode stream event: {}", e);
            return Ok(());
        }
    };
    sender.send(Message::Text(text.into())).await
}

/// Client frames are ignored except for close. Returns false when the
/// connection should end.
async fn handle_inbound(inbound: Option<Result<Message, axum::Error>>) -> bool {
    match inbound {
        Some(Ok(Message::Close(_))) | None => false,
        Some(Ok(_)) => true,
        Some(Err(e)) => {
            debug!("websocket receive error: {}", e);
            false
        }
    }
}
