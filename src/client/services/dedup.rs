//! Duplicate suppression for the message and notification logs.
//!
//! The backend may deliver the same frame twice (redelivery, or one broadcast
//! to the actor plus one to the recipient list) and the local optimistic echo
//! of a sent chat message is followed by the server's own copy.

use chrono::Duration;

use crate::common::models::UserId;
use crate::common::protocol::{InboundMessage, MessageKind};

/// Default chat dedup window.
pub const CHAT_DEDUP_WINDOW_MS: i64 = 3000;

/// True when `candidate` repeats `existing` within `window`.
///
/// A missing or unparsable timestamp on either side never counts as a
/// duplicate.
pub fn is_duplicate_chat(existing: &InboundMessage, candidate: &InboundMessage, window: Duration) -> bool {
    if existing.content.is_empty()
        || existing.kind != candidate.kind
        || existing.from != candidate.from
        || existing.content != candidate.content
    {
        return false;
    }
    if candidate.kind == MessageKind::GroupMessage && existing.group_id != candidate.group_id {
        return false;
    }
    match (existing.timestamp(), candidate.timestamp()) {
        (Some(a), Some(b)) => (a - b).num_milliseconds().abs() < window.num_milliseconds(),
        _ => false,
    }
}

pub fn should_admit_chat<'a, I>(log: I, candidate: &InboundMessage, window: Duration) -> bool
where
    I: IntoIterator<Item = &'a InboundMessage>,
{
    !log.into_iter().any(|existing| is_duplicate_chat(existing, candidate, window))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyKind {
    Invitation,
    Request,
    Event,
    Record,
}

fn notification_key(m: &InboundMessage) -> Option<(KeyKind, u64)> {
    m.invitation_id
        .map(|id| (KeyKind::Invitation, id))
        .or(m.request_id.map(|id| (KeyKind::Request, id)))
        .or_else(|| match m.kind {
            MessageKind::NewGroupEvent => m.post_id.map(|id| (KeyKind::Event, id)),
            _ => None,
        })
        .or(m.record_id.map(|id| (KeyKind::Record, id)))
}

fn actor(m: &InboundMessage) -> Option<UserId> {
    m.from.or(m.inviter_id)
}

/// Notification identity: a shared identifier, the same `(group, actor)`
/// or the same `(type, content)`. Any one match is enough.
pub fn is_duplicate_notification(existing: &InboundMessage, candidate: &InboundMessage) -> bool {
    let same_key = match (notification_key(existing), notification_key(candidate)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    };
    let same_origin = match (existing.group_id, candidate.group_id, actor(existing), actor(candidate)) {
        (Some(ga), Some(gb), Some(fa), Some(fb)) => ga == gb && fa == fb,
        _ => false,
    };
    same_key || same_origin || (existing.kind == candidate.kind && existing.content == candidate.content)
}

pub fn should_admit_notification<'a, I>(log: I, candidate: &InboundMessage) -> bool
where
    I: IntoIterator<Item = &'a InboundMessage>,
{
    !log.into_iter().any(|existing| is_duplicate_notification(existing, candidate))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn window() -> Duration {
        Duration::milliseconds(CHAT_DEDUP_WINDOW_MS)
    }

    fn chat(kind: &str, from: u64, content: &str, ts: &str) -> InboundMessage {
        InboundMessage::from_value(json!({
            "type": kind, "from": from, "to": 42, "content": content, "timestamp": ts,
        }))
        .unwrap()
    }

    fn notification(value: serde_json::Value) -> InboundMessage {
        InboundMessage::from_value(value).unwrap()
    }

    #[test]
    fn chat_within_window_is_duplicate() {
        let a = chat("private_message", 7, "hi", "2024-05-01T10:00:00Z");
        let b = chat("private_message", 7, "hi", "2024-05-01T10:00:02Z");
        assert!(is_duplicate_chat(&a, &b, window()));
        assert!(!should_admit_chat([&a], &b, window()));
    }

    #[test]
    fn chat_outside_window_is_admitted() {
        let a = chat("private_message", 7, "hi", "2024-05-01T10:00:00Z");
        let b = chat("private_message", 7, "hi", "2024-05-01T10:00:04Z");
        assert!(should_admit_chat([&a], &b, window()));
    }

    #[test]
    fn chat_boundary_is_exclusive() {
        let a = chat("message", 7, "hi", "2024-05-01T10:00:00Z");
        let b = chat("message", 7, "hi", "2024-05-01T10:00:03Z");
        assert!(!is_duplicate_chat(&a, &b, window()));
    }

    #[test]
    fn chat_fields_must_all_match() {
        let a = chat("private_message", 7, "hi", "2024-05-01T10:00:00Z");
        assert!(!is_duplicate_chat(&a, &chat("private_message", 8, "hi", "2024-05-01T10:00:00Z"), window()));
        assert!(!is_duplicate_chat(&a, &chat("private_message", 7, "ho", "2024-05-01T10:00:00Z"), window()));
        assert!(!is_duplicate_chat(&a, &chat("message", 7, "hi", "2024-05-01T10:00:00Z"), window()));
    }

    #[test]
    fn group_chat_is_scoped_by_group() {
        let a = notification(json!({"type":"group_message","from":7,"group_id":1,"content":"hi","timestamp":"2024-05-01T10:00:00Z"}));
        let b = notification(json!({"type":"group_message","from":7,"group_id":2,"content":"hi","timestamp":"2024-05-01T10:00:00Z"}));
        let c = notification(json!({"type":"group_message","from":7,"group_id":1,"content":"hi","timestamp":"2024-05-01T10:00:01Z"}));
        assert!(!is_duplicate_chat(&a, &b, window()));
        assert!(is_duplicate_chat(&a, &c, window()));
    }

    #[test]
    fn unparsable_timestamp_fails_open() {
        let a = chat("private_message", 7, "hi", "not a date");
        let b = chat("private_message", 7, "hi", "2024-05-01T10:00:00Z");
        assert!(!is_duplicate_chat(&a, &b, window()));
        assert!(!is_duplicate_chat(&b, &a, window()));
    }

    #[test]
    fn notification_id_wins_over_content() {
        let a = notification(json!({"type":"group_invitation","from":3,"group_id":9,"invitation_id":5,"content":"join"}));
        let b = notification(json!({"type":"group_invitation","from":3,"group_id":9,"invitation_id":5,"content":"please join"}));
        let other = notification(json!({"type":"group_invitation","from":4,"group_id":9,"invitation_id":6,"content":"another invite"}));
        assert!(is_duplicate_notification(&a, &b));
        assert!(!is_duplicate_notification(&a, &other));
    }

    #[test]
    fn distinct_ids_do_not_override_group_and_actor() {
        let a = notification(json!({"type":"group_invitation","from":3,"group_id":9,"invitation_id":5,"content":"join"}));
        let b = notification(json!({"type":"group_invitation","from":3,"group_id":9,"invitation_id":6,"content":"join again"}));
        assert!(is_duplicate_notification(&a, &b));
        assert!(!should_admit_notification([&a], &b));
    }

    #[test]
    fn different_groups_still_match_on_type_and_content() {
        let a = notification(json!({"type":"new_groupEvent","from":3,"group_id":9,"content":"Event X"}));
        let b = notification(json!({"type":"new_groupEvent","from":3,"group_id":10,"content":"Event X"}));
        let c = notification(json!({"type":"new_groupEvent","from":3,"group_id":10,"content":"Event Y"}));
        assert!(is_duplicate_notification(&a, &b));
        assert!(!should_admit_notification([&a], &b));
        assert!(!is_duplicate_notification(&a, &c));
    }

    #[test]
    fn notification_group_and_actor_match_without_id() {
        let a = notification(json!({"type":"group_invitation","from":3,"group_id":9,"content":"join"}));
        let b = notification(json!({"type":"group_invitation","From":3,"GroupID":9,"content":"join now"}));
        assert!(is_duplicate_notification(&a, &b));
    }

    #[test]
    fn notification_falls_back_to_type_and_content() {
        let a = notification(json!({"type":"new_follower","from":3,"content":"bob follows you"}));
        let b = notification(json!({"type":"new_follower","from":4,"content":"bob follows you"}));
        let c = notification(json!({"type":"follow_request","from":3,"content":"bob follows you"}));
        assert!(is_duplicate_notification(&a, &b));
        assert!(!is_duplicate_notification(&a, &c));
    }
}
