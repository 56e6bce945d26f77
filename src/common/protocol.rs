//! Wire protocol of the per-user message stream.
//!
//! Frames are JSON objects tagged by `type`. The backend is not consistent
//! about field names (`from`/`From`, `group_id`/`GroupID`/`groupId`, ...) and
//! some types carry a further JSON document inside `content`. Both quirks are
//! absorbed here, once, so the rest of the crate only ever sees
//! [`InboundMessage`] in its canonical shape.

use std::fmt;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::common::error::ProtocolError;
use crate::common::models::{GroupId, LikeCounts, OnlineUser, PostSummary, UserId, VoteChoice, VoteTally};

/// Closed set of frame types understood by the stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageKind {
    OnlineUsers,
    UserConnected,
    UserDisconnected,
    PrivateMessage,
    Message,
    GroupMessage,
    FollowRequest,
    FollowRequestResponse,
    NewFollower,
    GroupInvitation,
    GroupJoinRequest,
    NewGroupEvent,
    NewPost,
    NewGroupPost,
    NewPostLike,
    NewCommentLike,
    NewComment,
    GroupPostLikeUpdate,
    GroupEventVoteUpdate,
    GroupMemberUpdate,
    Error,
    /// Outbound only.
    GetOnlineUsers,
    Unknown(String),
}

impl MessageKind {
    pub fn parse(tag: &str) -> Self {
        match tag {
            "online_users" => MessageKind::OnlineUsers,
            "user_connected" => MessageKind::UserConnected,
            "user_disconnected" => MessageKind::UserDisconnected,
            "private_message" => MessageKind::PrivateMessage,
            "message" => MessageKind::Message,
            "group_message" => MessageKind::GroupMessage,
            "follow_request" => MessageKind::FollowRequest,
            "follow_request_response" => MessageKind::FollowRequestResponse,
            "new_follower" => MessageKind::NewFollower,
            "group_invitation" => MessageKind::GroupInvitation,
            "group_join_request" => MessageKind::GroupJoinRequest,
            "new_groupEvent" => MessageKind::NewGroupEvent,
            "new_post" => MessageKind::NewPost,
            "new_groupPost" => MessageKind::NewGroupPost,
            "new_postLike" => MessageKind::NewPostLike,
            "new_commentLike" => MessageKind::NewCommentLike,
            "new_comment" => MessageKind::NewComment,
            "group_post_like_update" => MessageKind::GroupPostLikeUpdate,
            "group_event_vote_update" => MessageKind::GroupEventVoteUpdate,
            "group_member_update" => MessageKind::GroupMemberUpdate,
            "error" => MessageKind::Error,
            "get_online_users" => MessageKind::GetOnlineUsers,
            other => MessageKind::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            MessageKind::OnlineUsers => "online_users",
            MessageKind::UserConnected => "user_connected",
            MessageKind::UserDisconnected => "user_disconnected",
            MessageKind::PrivateMessage => "private_message",
            MessageKind::Message => "message",
            MessageKind::GroupMessage => "group_message",
            MessageKind::FollowRequest => "follow_request",
            MessageKind::FollowRequestResponse => "follow_request_response",
            MessageKind::NewFollower => "new_follower",
            MessageKind::GroupInvitation => "group_invitation",
            MessageKind::GroupJoinRequest => "group_join_request",
            MessageKind::NewGroupEvent => "new_groupEvent",
            MessageKind::NewPost => "new_post",
            MessageKind::NewGroupPost => "new_groupPost",
            MessageKind::NewPostLike => "new_postLike",
            MessageKind::NewCommentLike => "new_commentLike",
            MessageKind::NewComment => "new_comment",
            MessageKind::GroupPostLikeUpdate => "group_post_like_update",
            MessageKind::GroupEventVoteUpdate => "group_event_vote_update",
            MessageKind::GroupMemberUpdate => "group_member_update",
            MessageKind::Error => "error",
            MessageKind::GetOnlineUsers => "get_online_users",
            MessageKind::Unknown(tag) => tag,
        }
    }

    /// Types kept in the message log.
    pub fn is_chat(&self) -> bool {
        matches!(
            self,
            MessageKind::PrivateMessage | MessageKind::Message | MessageKind::GroupMessage
        )
    }

    /// Types kept in the notification log.
    pub fn is_notification(&self) -> bool {
        matches!(
            self,
            MessageKind::FollowRequest
                | MessageKind::FollowRequestResponse
                | MessageKind::NewFollower
                | MessageKind::GroupInvitation
                | MessageKind::GroupJoinRequest
                | MessageKind::NewGroupEvent
        )
    }

    pub fn is_presence(&self) -> bool {
        matches!(
            self,
            MessageKind::OnlineUsers | MessageKind::UserConnected | MessageKind::UserDisconnected
        )
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for MessageKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MessageKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tag = String::deserialize(deserializer)?;
        Ok(MessageKind::parse(&tag))
    }
}

// Alias lists, first non-empty match wins.
const FROM: &[&str] = &["from", "From"];
const TO: &[&str] = &["to", "To"];
const GROUP_ID: &[&str] = &["group_id", "GroupID", "groupId", "group"];
const CONTENT: &[&str] = &["content", "Content"];
const TIMESTAMP: &[&str] = &["timestamp", "Timestamp", "time", "Time"];
const USERNAME: &[&str] = &["username", "Username"];
const INVITATION_ID: &[&str] = &["invitation_id", "InvitationID", "invitationId"];
const REQUEST_ID: &[&str] = &["request_id", "RequestID", "requestId"];
const POST_ID: &[&str] = &["post_id", "PostId", "postId"];
const COMMENT_ID: &[&str] = &["comment_id", "CommentId", "commentId"];
const REQUESTER_ID: &[&str] = &["RequesterID", "requester_id", "requesterId", "user_id", "UserID"];
const INVITER_ID: &[&str] = &["inviter_id", "InviterID", "inviterId"];

/// A decoded frame in canonical shape.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub kind: MessageKind,
    pub from: Option<UserId>,
    pub to: Option<UserId>,
    pub group_id: Option<GroupId>,
    /// Plain text, or the JSON text of an embedded document.
    pub content: String,
    /// Timestamp exactly as received (normally RFC 3339).
    pub timestamp: Option<String>,
    pub username: Option<String>,
    pub invitation_id: Option<u64>,
    pub request_id: Option<u64>,
    /// Generic `id` field some notifications carry.
    pub record_id: Option<u64>,
    pub post_id: Option<u64>,
    pub comment_id: Option<u64>,
    pub requester_id: Option<UserId>,
    pub inviter_id: Option<UserId>,
    pub users: Option<Vec<OnlineUser>>,
    /// The untouched frame.
    pub raw: Value,
}

impl InboundMessage {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let kind = match value.as_object() {
            Some(obj) => pick_string(obj, &["type", "Type"]).ok_or(ProtocolError::MissingType)?,
            None => return Err(ProtocolError::NotAnObject),
        };
        Self::normalize(MessageKind::parse(&kind), value)
    }

    /// Decode a record that may lack a `type` tag (history endpoints).
    pub fn from_value_or(value: Value, default_kind: MessageKind) -> Result<Self, ProtocolError> {
        let kind = match value.as_object() {
            Some(obj) => pick_string(obj, &["type", "Type"])
                .map(|tag| MessageKind::parse(&tag))
                .unwrap_or(default_kind),
            None => return Err(ProtocolError::NotAnObject),
        };
        Self::normalize(kind, value)
    }

    fn normalize(kind: MessageKind, raw: Value) -> Result<Self, ProtocolError> {
        let obj = raw.as_object().ok_or(ProtocolError::NotAnObject)?;

        let from = pick_id(obj, FROM);
        let content = match pick(obj, CONTENT) {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        };
        let users = obj
            .get("users")
            .filter(|v| v.is_array())
            .and_then(|v| serde_json::from_value::<Vec<OnlineUser>>(v.clone()).ok());

        Ok(Self {
            from,
            to: pick_id(obj, TO),
            group_id: pick_id(obj, GROUP_ID),
            content,
            timestamp: pick_string(obj, TIMESTAMP),
            username: pick_string(obj, USERNAME),
            invitation_id: pick_id(obj, INVITATION_ID),
            request_id: pick_id(obj, REQUEST_ID),
            record_id: pick_id(obj, &["id"]),
            post_id: pick_id(obj, POST_ID),
            comment_id: pick_id(obj, COMMENT_ID),
            requester_id: pick_id(obj, REQUESTER_ID).or(from),
            inviter_id: pick_id(obj, INVITER_ID).or(from),
            users,
            kind,
            raw,
        })
    }

    /// Parsed timestamp, `None` when missing or unparsable.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp.as_deref().and_then(parse_timestamp)
    }

    /// Decode the type-specific payload.
    pub fn payload(&self) -> Result<EventPayload, ProtocolError> {
        match &self.kind {
            kind @ (MessageKind::NewPost | MessageKind::NewGroupPost) => {
                let mut post: PostSummary = decode_embedded(kind, &self.content)?;
                if post.id == 0 {
                    post.id = self.post_id.unwrap_or_default();
                }
                Ok(EventPayload::Post(post))
            }
            kind @ MessageKind::NewPostLike => {
                let mut counts: LikeCounts = decode_embedded(kind, &self.content)?;
                counts.post_id = counts.post_id.or(self.post_id);
                Ok(EventPayload::PostLikes(counts))
            }
            kind @ MessageKind::NewCommentLike => {
                let mut counts: LikeCounts = decode_embedded(kind, &self.content)?;
                counts.comment_id = counts.comment_id.or(self.comment_id);
                Ok(EventPayload::CommentLikes(counts))
            }
            kind @ MessageKind::GroupPostLikeUpdate => {
                let mut counts: LikeCounts = decode_embedded(kind, &self.content)?;
                counts.post_id = counts.post_id.or(self.post_id);
                counts.group_id = counts.group_id.or(self.group_id);
                Ok(EventPayload::GroupPostLikes(counts))
            }
            MessageKind::GroupEventVoteUpdate => {
                let obj = self.raw.as_object();
                let count = |key: &str| obj.and_then(|o| o.get(key)).and_then(Value::as_u64).unwrap_or(0);
                Ok(EventPayload::EventVotes(VoteTally {
                    event_id: self.post_id.unwrap_or_default(),
                    yes_count: count("yes_count"),
                    no_count: count("no_count"),
                    user_vote: obj
                        .and_then(|o| pick_string(o, &["user_vote", "UserVote"]))
                        .and_then(|v| VoteChoice::parse(&v)),
                }))
            }
            kind if kind.is_presence() => Ok(match &self.users {
                Some(users) => EventPayload::Presence(users.clone()),
                None => EventPayload::Text(self.content.clone()),
            }),
            _ => Ok(EventPayload::Text(self.content.clone())),
        }
    }

    /// Entity the frame refers to, top-level fields first, embedded payload second.
    pub fn target(&self) -> Option<TargetEntity> {
        match &self.kind {
            MessageKind::GroupInvitation => self
                .invitation_id
                .map(TargetEntity::Invitation)
                .or(self.group_id.map(TargetEntity::Group)),
            MessageKind::GroupJoinRequest => self
                .request_id
                .map(TargetEntity::JoinRequest)
                .or(self.group_id.map(TargetEntity::Group)),
            MessageKind::NewGroupEvent | MessageKind::GroupEventVoteUpdate => {
                self.post_id.map(TargetEntity::Event)
            }
            MessageKind::NewCommentLike => self.comment_id.map(TargetEntity::Comment).or_else(|| {
                match self.payload() {
                    Ok(EventPayload::CommentLikes(c)) => c.comment_id.map(TargetEntity::Comment),
                    _ => None,
                }
            }),
            MessageKind::NewPost
            | MessageKind::NewGroupPost
            | MessageKind::NewPostLike
            | MessageKind::NewComment
            | MessageKind::GroupPostLikeUpdate => self.post_id.map(TargetEntity::Post).or_else(|| {
                match self.payload() {
                    Ok(EventPayload::Post(p)) if p.id != 0 => Some(TargetEntity::Post(p.id)),
                    Ok(EventPayload::PostLikes(c)) | Ok(EventPayload::GroupPostLikes(c)) => {
                        c.post_id.map(TargetEntity::Post)
                    }
                    _ => None,
                }
            }),
            MessageKind::GroupMessage | MessageKind::GroupMemberUpdate => {
                self.group_id.map(TargetEntity::Group)
            }
            _ => None,
        }
    }
}

/// Type-specific payload of a frame.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    Text(String),
    Presence(Vec<OnlineUser>),
    Post(PostSummary),
    PostLikes(LikeCounts),
    CommentLikes(LikeCounts),
    GroupPostLikes(LikeCounts),
    EventVotes(VoteTally),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetEntity {
    Post(u64),
    Comment(u64),
    Event(u64),
    Invitation(u64),
    JoinRequest(u64),
    Group(GroupId),
}

/// Chat frame sent by this client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatFrame {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub from: UserId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<UserId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<GroupId>,
    pub content: String,
    pub timestamp: String,
}

/// Control frame asking the server for the presence list.
pub fn online_users_request() -> Value {
    serde_json::json!({ "type": MessageKind::GetOnlineUsers.as_str() })
}

fn decode_embedded<T: DeserializeOwned>(kind: &MessageKind, content: &str) -> Result<T, ProtocolError> {
    serde_json::from_str(content).map_err(|source| ProtocolError::EmbeddedContent {
        kind: kind.clone(),
        source,
    })
}

fn pick<'a>(obj: &'a Map<String, Value>, aliases: &[&str]) -> Option<&'a Value> {
    aliases
        .iter()
        .filter_map(|key| obj.get(*key))
        .find(|v| match v {
            Value::Null => false,
            Value::String(s) => !s.is_empty(),
            _ => true,
        })
}

fn pick_string(obj: &Map<String, Value>, aliases: &[&str]) -> Option<String> {
    match pick(obj, aliases)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Identifiers arrive as numbers or numeric strings; zero means absent.
fn pick_id(obj: &Map<String, Value>, aliases: &[&str]) -> Option<u64> {
    aliases.iter().filter_map(|key| obj.get(*key)).find_map(|v| {
        let id = match v {
            Value::Number(n) => n
                .as_u64()
                .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0 && *f > 0.0).map(|f| f as u64)),
            Value::String(s) => s.trim().parse::<u64>().ok(),
            _ => None,
        };
        id.filter(|id| *id != 0)
    })
}

/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS[.fff]` (UTC) and epoch milliseconds.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(Utc.from_utc_datetime(&naive));
    }
    raw.parse::<i64>()
        .ok()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn kind_round_trips_every_known_tag() {
        for tag in [
            "online_users",
            "user_connected",
            "private_message",
            "group_message",
            "new_groupEvent",
            "group_post_like_update",
            "get_online_users",
        ] {
            assert_eq!(MessageKind::parse(tag).as_str(), tag);
        }
        assert_eq!(
            MessageKind::parse("typing"),
            MessageKind::Unknown("typing".to_string())
        );
    }

    #[test]
    fn normalizes_aliased_fields() {
        let msg = InboundMessage::decode(
            r#"{"Type":"group_invitation","From":"7","GroupID":3,"Content":"join us","InvitationID":11}"#,
        )
        .unwrap();
        assert_eq!(msg.kind, MessageKind::GroupInvitation);
        assert_eq!(msg.from, Some(7));
        assert_eq!(msg.group_id, Some(3));
        assert_eq!(msg.content, "join us");
        assert_eq!(msg.invitation_id, Some(11));
        assert_eq!(msg.inviter_id, Some(7));
    }

    #[test]
    fn zero_identifiers_are_absent() {
        let msg = InboundMessage::decode(
            r#"{"type":"private_message","from":7,"to":42,"group_id":0,"post_id":0,"content":"hi"}"#,
        )
        .unwrap();
        assert_eq!(msg.group_id, None);
        assert_eq!(msg.post_id, None);
        assert_eq!(msg.to, Some(42));
    }

    #[test]
    fn requester_falls_back_through_aliases() {
        let explicit = InboundMessage::decode(r#"{"type":"follow_request","requester_id":9,"from":0}"#).unwrap();
        assert_eq!(explicit.requester_id, Some(9));

        let via_from = InboundMessage::decode(r#"{"type":"follow_request","from":5}"#).unwrap();
        assert_eq!(via_from.requester_id, Some(5));

        let missing = InboundMessage::decode(r#"{"type":"follow_request","content":"x"}"#).unwrap();
        assert_eq!(missing.requester_id, None);
    }

    #[test]
    fn rejects_malformed_frames() {
        assert!(matches!(InboundMessage::decode("{not json"), Err(ProtocolError::InvalidJson(_))));
        assert!(matches!(InboundMessage::decode("[1,2]"), Err(ProtocolError::NotAnObject)));
        assert!(matches!(InboundMessage::decode(r#"{"from":1}"#), Err(ProtocolError::MissingType)));
    }

    #[test]
    fn decodes_embedded_like_counts() {
        let frame = json!({
            "type": "new_postLike",
            "from": 3,
            "post_id": 12,
            "content": "{\"post_id\":12,\"likes_count\":4,\"dislikes_count\":1}",
        });
        let msg = InboundMessage::from_value(frame).unwrap();
        match msg.payload().unwrap() {
            EventPayload::PostLikes(counts) => {
                assert_eq!(counts.post_id, Some(12));
                assert_eq!(counts.likes_count, 4);
                assert_eq!(counts.dislikes_count, 1);
            }
            other => panic!("unexpected payload {other:?}"),
        }
        assert_eq!(msg.target(), Some(TargetEntity::Post(12)));
    }

    #[test]
    fn embedded_post_supplies_missing_target() {
        let frame = json!({
            "type": "new_post",
            "from": 3,
            "content": "{\"id\":77,\"title\":\"t\",\"content\":\"body\",\"userID\":3,\"categories\":[\"go\"]}",
        });
        let msg = InboundMessage::from_value(frame).unwrap();
        assert_eq!(msg.target(), Some(TargetEntity::Post(77)));
        let EventPayload::Post(post) = msg.payload().unwrap() else {
            panic!("expected post payload");
        };
        assert_eq!(post.user_id, Some(3));
        assert_eq!(post.categories, vec!["go".to_string()]);
    }

    #[test]
    fn malformed_embedded_content_is_an_error() {
        let msg = InboundMessage::decode(r#"{"type":"new_commentLike","content":"oops"}"#).unwrap();
        assert!(matches!(
            msg.payload(),
            Err(ProtocolError::EmbeddedContent { kind: MessageKind::NewCommentLike, .. })
        ));
    }

    #[test]
    fn vote_update_reads_top_level_counters() {
        let msg = InboundMessage::decode(
            r#"{"type":"group_event_vote_update","post_id":5,"group_id":2,"yes_count":3,"no_count":1,"user_vote":"yes"}"#,
        )
        .unwrap();
        assert_eq!(
            msg.payload().unwrap(),
            EventPayload::EventVotes(VoteTally {
                event_id: 5,
                yes_count: 3,
                no_count: 1,
                user_vote: Some(VoteChoice::Yes),
            })
        );
    }

    #[test]
    fn object_content_is_kept_as_json_text() {
        let msg = InboundMessage::decode(r#"{"type":"new_post","content":{"id":4}}"#).unwrap();
        assert_eq!(msg.content, r#"{"id":4}"#);
    }

    #[test]
    fn parses_supported_timestamp_formats() {
        let a = parse_timestamp("2024-05-01T10:00:00.123456789Z").unwrap();
        let b = parse_timestamp("2024-05-01 10:00:00").unwrap();
        let c = parse_timestamp("1714557600000").unwrap();
        assert_eq!(b, c);
        assert!(a > b);
        assert!(parse_timestamp("yesterday").is_none());
    }
}
