//! Scope-id extraction from notification payloads.
//!
//! Runtime notifications carry their thread and turn ids in whatever shape
//! the emitting subsystem chose: top-level `threadId`, snake_case variants,
//! or nested under a `thread`/`turn` object. Events are indexed by these ids
//! in the log, so extraction has to tolerate all of them.

use std::collections::VecDeque;

use serde_json::Value;

/// Ids locating an event within the conversation hierarchy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeIds {
    pub thread_id: Option<String>,
    pub turn_id: Option<String>,
}

const MAX_DEPTH: usize = 3;

/// Pull thread and turn ids out of a notification payload.
pub fn scope_ids(payload: &Value) -> ScopeIds {
    ScopeIds {
        thread_id: find_id(payload, &["threadId", "thread_id"], "thread"),
        turn_id: find_id(payload, &["turnId", "turn_id"], "turn"),
    }
}

/// Level-order walk: every object at one depth is checked before anything
/// deeper, so the shallowest id always wins.
fn find_id(root: &Value, keys: &[&str], container: &str) -> Option<String> {
    let mut queue = VecDeque::from([(root, 0usize)]);
    while let Some((value, depth)) = queue.pop_front() {
        let Some(obj) = value.as_object() else {
            continue;
        };

        for key in keys {
            if let Some(Value::String(id)) = obj.get(*key) {
                return Some(id.clone());
            }
        }
        if let Some(inner) = obj.get(container)
            && let Some(Value::String(id)) = inner.get("id")
        {
            return Some(id.clone());
        }

        if depth + 1 < MAX_DEPTH {
            queue.extend(obj.values().filter(|v| v.is_object()).map(|v| (v, depth + 1)));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reads_top_level_camel_case() {
        let ids = scope_ids(&json!({"threadId": "t1", "turnId": "u1"}));
        assert_eq!(ids.thread_id.as_deref(), Some("t1"));
        assert_eq!(ids.turn_id.as_deref(), Some("u1"));
    }

    #[test]
    fn reads_snake_case() {
        let ids = scope_ids(&json!({"thread_id": "t2"}));
        assert_eq!(ids.thread_id.as_deref(), Some("t2"));
        assert_eq!(ids.turn_id, None);
    }

    #[test]
    fn reads_nested_container_objects() {
        let ids = scope_ids(&json!({
            "thread": {"id": "t3", "title": "build"},
            "turn": {"id": "u3"}
        }));
        assert_eq!(ids.thread_id.as_deref(), Some("t3"));
        assert_eq!(ids.turn_id.as_deref(), Some("u3"));
    }

    #[test]
    fn descends_into_nested_items() {
        let ids = scope_ids(&json!({
            "item": {"id": "i1", "threadId": "t4", "turnId": "u4"}
        }));
        assert_eq!(ids.thread_id.as_deref(), Some("t4"));
        assert_eq!(ids.turn_id.as_deref(), Some("u4"));
    }

    #[test]
    fn shallow_ids_win_over_deeper_earlier_siblings() {
        let ids = scope_ids(&json!({
            "a": {"x": {"threadId": "deep"}},
            "b": {"threadId": "shallow"}
        }));
        assert_eq!(ids.thread_id.as_deref(), Some("shallow"));
    }

    #[test]
    fn stops_at_depth_limit() {
        let ids = scope_ids(&json!({
            "a": {"b": {"c": {"threadId": "too-deep"}}}
        }));
        assert_eq!(ids.thread_id, None);
    }

    #[test]
    fn non_object_payloads_yield_nothing() {
        assert_eq!(scope_ids(&json!("turn/started")), ScopeIds::default());
        assert_eq!(scope_ids(&Value::Null), ScopeIds::default());
    }
}
