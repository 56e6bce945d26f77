use log::debug;

use crate::client::models::state::RealtimeState;
use crate::common::protocol::{InboundMessage, MessageKind};

/// Sink a frame is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Presence,
    Messages,
    Notifications,
    Passthrough,
}

/// What happened to the state when a frame was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    PresenceReplaced,
    /// Presence delta without a full list.
    PresenceIgnored,
    MessageAdmitted,
    NotificationAdmitted,
    Duplicate,
    Passthrough,
}

pub fn route(kind: &MessageKind) -> Route {
    if kind.is_presence() {
        Route::Presence
    } else if kind.is_chat() {
        Route::Messages
    } else if kind.is_notification() {
        Route::Notifications
    } else {
        Route::Passthrough
    }
}

/// Apply `message` to the matching log. Fan-out is the caller's job.
pub fn apply(state: &mut RealtimeState, message: &InboundMessage) -> Dispatch {
    let dispatch = match route(&message.kind) {
        Route::Presence => match (&message.kind, &message.users) {
            (MessageKind::OnlineUsers, users) => {
                state.presence.replace(users.clone().unwrap_or_default());
                Dispatch::PresenceReplaced
            }
            (_, Some(users)) => {
                state.presence.replace(users.clone());
                Dispatch::PresenceReplaced
            }
            (_, None) => Dispatch::PresenceIgnored,
        },
        Route::Messages => {
            if state.messages.insert(message.clone(), false) {
                Dispatch::MessageAdmitted
            } else {
                Dispatch::Duplicate
            }
        }
        Route::Notifications => {
            if state.notifications.insert(message.clone()) {
                Dispatch::NotificationAdmitted
            } else {
                Dispatch::Duplicate
            }
        }
        Route::Passthrough => Dispatch::Passthrough,
    };
    debug!("{} -> {:?}", message.kind, dispatch);
    dispatch
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn state() -> RealtimeState {
        RealtimeState::new(Duration::from_millis(3000))
    }

    fn msg(value: serde_json::Value) -> InboundMessage {
        InboundMessage::from_value(value).unwrap()
    }

    #[test]
    fn routes_by_type() {
        assert_eq!(route(&MessageKind::OnlineUsers), Route::Presence);
        assert_eq!(route(&MessageKind::Message), Route::Messages);
        assert_eq!(route(&MessageKind::GroupMessage), Route::Messages);
        assert_eq!(route(&MessageKind::NewGroupEvent), Route::Notifications);
        assert_eq!(route(&MessageKind::NewPostLike), Route::Passthrough);
        assert_eq!(route(&MessageKind::Unknown("typing".into())), Route::Passthrough);
    }

    #[test]
    fn online_users_replaces_presence() {
        let mut state = state();
        let d = apply(&mut state, &msg(json!({"type":"online_users","users":[{"id":7,"username":"alice"}]})));
        assert_eq!(d, Dispatch::PresenceReplaced);
        assert_eq!(state.presence.username(7), Some("alice"));

        apply(&mut state, &msg(json!({"type":"online_users"})));
        assert!(state.presence.is_empty());
    }

    #[test]
    fn presence_delta_without_list_is_ignored() {
        let mut state = state();
        apply(&mut state, &msg(json!({"type":"online_users","users":[{"id":7,"username":"alice"}]})));
        let d = apply(&mut state, &msg(json!({"type":"user_disconnected","from":7})));
        assert_eq!(d, Dispatch::PresenceIgnored);
        assert!(state.presence.contains(7));

        let d = apply(&mut state, &msg(json!({"type":"user_connected","users":[{"id":8,"username":"bob"}]})));
        assert_eq!(d, Dispatch::PresenceReplaced);
        assert!(!state.presence.contains(7));
    }

    #[test]
    fn passthrough_types_leave_logs_untouched() {
        let mut state = state();
        let d = apply(&mut state, &msg(json!({"type":"new_post","content":"{\"id\":1}"})));
        assert_eq!(d, Dispatch::Passthrough);
        assert!(state.messages.is_empty());
        assert!(state.notifications.is_empty());
    }

    #[test]
    fn repeated_notification_is_reported_duplicate() {
        let mut state = state();
        let n = msg(json!({"type":"follow_request","from":4,"content":"bob wants to follow you"}));
        assert_eq!(apply(&mut state, &n), Dispatch::NotificationAdmitted);
        assert_eq!(apply(&mut state, &n), Dispatch::Duplicate);
        assert_eq!(state.notifications.len(), 1);
    }
}
