use chrono::{DateTime, SecondsFormat, Utc};

use crate::common::error::ProtocolError;
use crate::common::models::{GroupId, UserId};
use crate::common::protocol::{ChatFrame, InboundMessage, MessageKind};

/// Recipient of an outgoing chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatTarget {
    User(UserId),
    Group(GroupId),
}

/// Chat message typed by the local user, not yet stamped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingChat {
    pub target: ChatTarget,
    pub content: String,
}

impl OutgoingChat {
    pub fn private(to: UserId, content: impl Into<String>) -> Self {
        Self {
            target: ChatTarget::User(to),
            content: content.into(),
        }
    }

    pub fn group(group_id: GroupId, content: impl Into<String>) -> Self {
        Self {
            target: ChatTarget::Group(group_id),
            content: content.into(),
        }
    }

    pub fn is_blank(&self) -> bool {
        self.content.trim().is_empty()
    }

    /// Wire frame sent by `from` at `at`.
    pub fn frame(&self, from: UserId, at: DateTime<Utc>) -> ChatFrame {
        let (kind, to, group_id) = match self.target {
            ChatTarget::User(id) => (MessageKind::PrivateMessage, Some(id), None),
            ChatTarget::Group(id) => (MessageKind::GroupMessage, None, Some(id)),
        };
        ChatFrame {
            kind,
            from,
            to,
            group_id,
            content: self.content.trim().to_string(),
            timestamp: at.to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }
}

/// The optimistic local copy of a sent frame.
pub fn local_echo(frame: &ChatFrame) -> Result<InboundMessage, ProtocolError> {
    InboundMessage::from_value(serde_json::to_value(frame)?)
}
