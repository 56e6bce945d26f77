use serde::{Deserialize, Deserializer, Serialize};

/// Numeric identity of a user as issued by the backend.
pub type UserId = u64;
/// Numeric identity of a group.
pub type GroupId = u64;

/// Authenticated identity returned by the session check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub user_id: UserId,
    pub username: String,
}

/// Rappresenta un utente attualmente connesso
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnlineUser {
    pub id: UserId,
    #[serde(default)]
    pub username: String,
}

/// Post broadcast inside the `content` of `new_post` / `new_groupPost` frames.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PostSummary {
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default, rename = "userID", alias = "user_id")]
    pub user_id: Option<UserId>,
    #[serde(default, rename = "createdAt", alias = "created_at")]
    pub created_at: Option<String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub categories: Vec<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

/// Like/dislike counters carried by the like update frames.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LikeCounts {
    #[serde(default)]
    pub post_id: Option<u64>,
    #[serde(default)]
    pub comment_id: Option<u64>,
    #[serde(default)]
    pub group_id: Option<GroupId>,
    #[serde(default)]
    pub likes_count: u64,
    #[serde(default)]
    pub dislikes_count: u64,
}

/// Vote counters of a group event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteTally {
    pub event_id: u64,
    pub yes_count: u64,
    pub no_count: u64,
    pub user_vote: Option<VoteChoice>,
}

/// Answer to a follow request, group invitation or join request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Accept,
    Decline,
}

impl Decision {
    pub fn as_str(self) -> &'static str {
        match self {
            Decision::Accept => "accept",
            Decision::Decline => "decline",
        }
    }

    /// Status word the group endpoints expect.
    pub fn as_status(self) -> &'static str {
        match self {
            Decision::Accept => "accepted",
            Decision::Decline => "declined",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoteChoice {
    Yes,
    No,
}

impl VoteChoice {
    pub fn as_str(self) -> &'static str {
        match self {
            VoteChoice::Yes => "yes",
            VoteChoice::No => "no",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "yes" => Some(VoteChoice::Yes),
            "no" => Some(VoteChoice::No),
            _ => None,
        }
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}
