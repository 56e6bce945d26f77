use chrono::{DateTime, Duration, Utc};

use crate::client::services::dedup;
use crate::common::models::{GroupId, OnlineUser, UserId};
use crate::common::protocol::{InboundMessage, MessageKind};

/// One chat message held by the [`MessageLog`].
#[derive(Debug, Clone, PartialEq)]
pub struct ChatEntry {
    pub message: InboundMessage,
    /// Sort key: the message timestamp, or arrival time when it has none.
    pub at: DateTime<Utc>,
    /// Appended optimistically after a successful local send.
    pub local_echo: bool,
}

/// Chat messages ordered by timestamp.
#[derive(Debug, Clone)]
pub struct MessageLog {
    entries: Vec<ChatEntry>,
    window: Duration,
}

impl MessageLog {
    pub fn new(window: std::time::Duration) -> Self {
        Self {
            entries: Vec::new(),
            window: Duration::milliseconds(window.as_millis() as i64),
        }
    }

    /// Admit `message` unless it repeats an entry inside the dedup window.
    /// Returns whether it was inserted.
    pub fn insert(&mut self, message: InboundMessage, local_echo: bool) -> bool {
        if !dedup::should_admit_chat(self.messages(), &message, self.window) {
            return false;
        }
        let at = message.timestamp().unwrap_or_else(Utc::now);
        // Stable: equal timestamps keep arrival order.
        let idx = self.entries.partition_point(|e| e.at <= at);
        self.entries.insert(
            idx,
            ChatEntry {
                message,
                at,
                local_echo,
            },
        );
        true
    }

    pub fn entries(&self) -> &[ChatEntry] {
        &self.entries
    }

    pub fn messages(&self) -> impl Iterator<Item = &InboundMessage> {
        self.entries.iter().map(|e| &e.message)
    }

    /// Private messages exchanged between `me` and `peer`.
    pub fn conversation(&self, me: UserId, peer: UserId) -> Vec<&InboundMessage> {
        self.messages()
            .filter(|m| m.kind != MessageKind::GroupMessage)
            .filter(|m| {
                (m.from == Some(me) && m.to == Some(peer)) || (m.from == Some(peer) && m.to == Some(me))
            })
            .collect()
    }

    pub fn group(&self, group_id: GroupId) -> Vec<&InboundMessage> {
        self.messages()
            .filter(|m| m.kind == MessageKind::GroupMessage && m.group_id == Some(group_id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Entries taken out of the [`NotificationLog`], with their former positions.
#[derive(Debug, Clone, Default)]
pub struct Removal {
    removed: Vec<(usize, InboundMessage)>,
}

impl Removal {
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.removed.len()
    }
}

#[derive(Debug, Clone, Default)]
pub struct NotificationLog {
    entries: Vec<InboundMessage>,
}

impl NotificationLog {
    pub fn insert(&mut self, message: InboundMessage) -> bool {
        if !dedup::should_admit_notification(&self.entries, &message) {
            return false;
        }
        self.entries.push(message);
        true
    }

    /// Remove every entry that denotes the same notification as `target`.
    pub fn remove_matching(&mut self, target: &InboundMessage) -> Removal {
        let mut removed = Vec::new();
        let mut kept = Vec::with_capacity(self.entries.len());
        for (idx, entry) in self.entries.drain(..).enumerate() {
            if dedup::is_duplicate_notification(&entry, target) {
                removed.push((idx, entry));
            } else {
                kept.push(entry);
            }
        }
        self.entries = kept;
        Removal { removed }
    }

    /// Put back what `removal` took out, at the original positions.
    pub fn restore(&mut self, removal: Removal) {
        for (idx, entry) in removal.removed {
            if !dedup::should_admit_notification(&self.entries, &entry) {
                continue;
            }
            let idx = idx.min(self.entries.len());
            self.entries.insert(idx, entry);
        }
    }

    pub fn entries(&self) -> &[InboundMessage] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Users currently online.
#[derive(Debug, Clone, Default)]
pub struct PresenceSet {
    users: Vec<OnlineUser>,
}

impl PresenceSet {
    pub fn replace(&mut self, users: Vec<OnlineUser>) {
        self.users.clear();
        for user in users {
            if !self.contains(user.id) {
                self.users.push(user);
            }
        }
    }

    pub fn contains(&self, id: UserId) -> bool {
        self.users.iter().any(|u| u.id == id)
    }

    pub fn username(&self, id: UserId) -> Option<&str> {
        self.users.iter().find(|u| u.id == id).map(|u| u.username.as_str())
    }

    pub fn users(&self) -> &[OnlineUser] {
        &self.users
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn clear(&mut self) {
        self.users.clear();
    }
}

/// The logs derived from the stream of one identity.
#[derive(Debug, Clone)]
pub struct RealtimeState {
    pub messages: MessageLog,
    pub notifications: NotificationLog,
    pub presence: PresenceSet,
}

impl RealtimeState {
    pub fn new(chat_window: std::time::Duration) -> Self {
        Self {
            messages: MessageLog::new(chat_window),
            notifications: NotificationLog::default(),
            presence: PresenceSet::default(),
        }
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.notifications.clear();
        self.presence.clear();
    }
}
