//! Persisted runtime events and their stream representation.
//!
//! Every notification the runtime emits is appended to the event log exactly
//! once; the `cursor` assigned at insert time is the sole ordering contract.
//! Subscribers (replay and live alike) receive [`StreamEvent`]s, which carry
//! the cursor plus an optional externally visible event type derived from the
//! notification method.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Synthetic method under which approval resolutions land in the event log.
pub const APPROVAL_RESOLVED_METHOD: &str = "approval/resolved";

/// Runtime methods that request a human approval before proceeding.
pub const APPROVAL_REQUEST_METHODS: &[&str] = &[
    "item/commandExecution/requestApproval",
    "item/fileChange/requestApproval",
];

/// A persisted runtime notification. Append-only, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeEvent {
    /// Strictly increasing position in the log.
    pub cursor: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<String>,
    /// The runtime notification method.
    pub method: String,
    /// The notification params, stored verbatim.
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

/// Externally visible stream-event types.
///
/// The runtime's notification methods map onto a smaller vocabulary for
/// stream consumers; item-scoped updates without a dedicated type collapse
/// into the `item.delta` bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamEventKind {
    #[serde(rename = "thread.started")]
    ThreadStarted,
    #[serde(rename = "turn.started")]
    TurnStarted,
    #[serde(rename = "turn.completed")]
    TurnCompleted,
    #[serde(rename = "item.started")]
    ItemStarted,
    #[serde(rename = "item.completed")]
    ItemCompleted,
    #[serde(rename = "item.delta")]
    ItemDelta,
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "approval.requested")]
    ApprovalRequested,
    #[serde(rename = "approval.resolved")]
    ApprovalResolved,
}

impl StreamEventKind {
    /// Map a persisted method to its stream-event type, if it has one.
    /// Methods without a mapping are persisted and streamed untyped.
    pub fn from_method(method: &str) -> Option<Self> {
        if APPROVAL_REQUEST_METHODS.contains(&method) {
            return Some(Self::ApprovalRequested);
        }
        match method {
            "thread/started" => Some(Self::ThreadStarted),
            "turn/started" => Some(Self::TurnStarted),
            "turn/completed" => Some(Self::TurnCompleted),
            "item/started" => Some(Self::ItemStarted),
            "item/completed" => Some(Self::ItemCompleted),
            "error" => Some(Self::Error),
            APPROVAL_RESOLVED_METHOD => Some(Self::ApprovalResolved),
            m if m.starts_with("item/") => Some(Self::ItemDelta),
            _ => None,
        }
    }
}

/// An event as delivered to stream subscribers, replayed or live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEvent {
    pub cursor: i64,
    /// Externally visible event type, when the method maps to one.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<StreamEventKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    pub method: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

impl StreamEvent {
    /// The stream representation of a persisted event. Replay and live
    /// delivery both go through this conversion, so a subscriber sees the
    /// same bytes for an event regardless of which path delivered it.
    pub fn from_event(event: &RuntimeEvent) -> Self {
        Self {
            cursor: event.cursor,
            kind: StreamEventKind::from_method(&event.method),
            thread_id: event.thread_id.clone(),
            method: event.method.clone(),
            payload: event.payload.clone(),
            created_at: event.created_at,
        }
    }
}
