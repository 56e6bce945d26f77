//! REST collaborators: session check, history hydration and the
//! notification action endpoints.

use async_trait::async_trait;
use log::{debug, warn};
use reqwest::header::COOKIE;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use url::Url;

use crate::client::config::ClientConfig;
use crate::client::services::notification_actions::{ActionRequest, NotificationApi};
use crate::common::error::{ActionError, ApiError};
use crate::common::models::{GroupId, Session, UserId};
use crate::common::protocol::{InboundMessage, MessageKind};

#[derive(Debug, Deserialize)]
struct SessionCheck {
    #[serde(default, rename = "loggedIn")]
    logged_in: bool,
    #[serde(default, rename = "userID")]
    user_id: Option<UserId>,
    #[serde(default)]
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PendingInvitation {
    id: u64,
    #[serde(default)]
    group_id: Option<GroupId>,
    #[serde(default)]
    inviter_id: Option<UserId>,
}

#[derive(Debug, Deserialize)]
struct PendingJoinRequest {
    id: u64,
    #[serde(default)]
    group_id: Option<GroupId>,
    #[serde(default)]
    user_id: Option<UserId>,
}

#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base: Url,
    cookie: Option<String>,
}

impl ApiClient {
    pub fn new(config: &ClientConfig) -> Result<Self, ApiError> {
        let mut base = Url::parse(&config.backend_url)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let http = reqwest::Client::builder().timeout(config.http_timeout).build()?;
        Ok(Self {
            http,
            base,
            cookie: config.session_cookie.clone(),
        })
    }

    fn url(&self, path: &str) -> Result<Url, ApiError> {
        Ok(self.base.join(path)?)
    }

    fn with_cookie(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.cookie {
            Some(cookie) => request.header(COOKIE, cookie),
            None => request,
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, ApiError> {
        debug!("GET {}", url);
        let response = self.with_cookie(self.http.get(url)).send().await?;
        read_json(response).await
    }

    async fn post_json(&self, url: Url, body: Value) -> Result<(), ApiError> {
        debug!("POST {} {}", url, body);
        let response = self.with_cookie(self.http.post(url)).json(&body).send().await?;
        expect_success(response).await
    }

    /// `None` when the backend reports no logged-in user.
    pub async fn check_session(&self) -> Result<Option<Session>, ApiError> {
        let url = self.url("check-session")?;
        let response = self.with_cookie(self.http.get(url)).send().await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Ok(None);
        }
        let check: SessionCheck = read_json(response).await?;
        Ok(match (check.logged_in, check.user_id) {
            (true, Some(user_id)) if user_id != 0 => Some(Session {
                user_id,
                username: check.username.unwrap_or_default(),
            }),
            _ => None,
        })
    }

    /// Private messages exchanged with `peer`.
    pub async fn fetch_chat_history(&self, peer: UserId) -> Result<Vec<InboundMessage>, ApiError> {
        let mut url = self.url("get-chat-history")?;
        url.query_pairs_mut().append_pair("user_id", &peer.to_string());
        let body: Value = self.get_json(url).await?;
        Ok(decode_history(body, MessageKind::PrivateMessage))
    }

    pub async fn fetch_group_history(&self, group_id: GroupId, offset: u32) -> Result<Vec<InboundMessage>, ApiError> {
        let mut url = self.url("group-messages")?;
        url.query_pairs_mut()
            .append_pair("group_id", &group_id.to_string())
            .append_pair("offset", &offset.to_string());
        let body: Value = self.get_json(url).await?;
        let mut messages = decode_history(body, MessageKind::GroupMessage);
        for message in &mut messages {
            message.group_id = message.group_id.or(Some(group_id));
        }
        Ok(messages)
    }

    pub async fn respond_follow_request(&self, requester_id: UserId, action: &str) -> Result<(), ApiError> {
        let url = self.url("handle-follow-request")?;
        self.post_json(url, json!({ "requester_id": requester_id, "action": action }))
            .await
    }

    pub async fn respond_group_invitation(&self, invitation_id: u64, status: &str) -> Result<(), ApiError> {
        let url = self.url("respond-group-invitation")?;
        self.post_json(url, json!({ "invitation_id": invitation_id, "status": status }))
            .await
    }

    pub async fn respond_join_request(&self, request_id: u64, status: &str) -> Result<(), ApiError> {
        let url = self.url("respond-join-request")?;
        self.post_json(url, json!({ "request_id": request_id, "status": status }))
            .await
    }

    pub async fn vote_event(&self, event_id: u64, choice: &str) -> Result<(), ApiError> {
        let mut url = self.url("groups/events/vote")?;
        url.query_pairs_mut()
            .append_pair("event_id", &event_id.to_string())
            .append_pair("choice", choice);
        debug!("POST {}", url);
        let response = self.with_cookie(self.http.post(url)).send().await?;
        expect_success(response).await
    }

    /// First pending invitation matching the given group and inviter.
    pub async fn find_invitation(
        &self,
        group_id: Option<GroupId>,
        inviter_id: Option<UserId>,
    ) -> Result<Option<u64>, ApiError> {
        let url = self.url("get-received-invitations")?;
        let pending: Option<Vec<PendingInvitation>> = self.get_json(url).await?;
        Ok(pending.unwrap_or_default().into_iter().find_map(|inv| {
            let group_ok = group_id.map_or(true, |g| inv.group_id == Some(g));
            let inviter_ok = inviter_id.map_or(true, |u| inv.inviter_id == Some(u));
            (group_ok && inviter_ok).then_some(inv.id)
        }))
    }

    /// First pending join request matching the given group and requester.
    pub async fn find_join_request(
        &self,
        group_id: Option<GroupId>,
        requester_id: Option<UserId>,
    ) -> Result<Option<u64>, ApiError> {
        let url = self.url("get-pending-join-requests")?;
        let pending: Option<Vec<PendingJoinRequest>> = self.get_json(url).await?;
        Ok(pending.unwrap_or_default().into_iter().find_map(|req| {
            let group_ok = group_id.map_or(true, |g| req.group_id == Some(g));
            let user_ok = requester_id.map_or(true, |u| req.user_id == Some(u));
            (group_ok && user_ok).then_some(req.id)
        }))
    }
}

#[async_trait]
impl NotificationApi for ApiClient {
    async fn submit(&self, request: &ActionRequest) -> Result<(), ActionError> {
        match request {
            ActionRequest::FollowResponse { requester_id, decision } => {
                self.respond_follow_request(*requester_id, decision.as_str()).await?;
            }
            ActionRequest::InvitationResponse {
                invitation_id,
                group_id,
                inviter_id,
                decision,
            } => {
                let id = match invitation_id {
                    Some(id) => *id,
                    None => self
                        .find_invitation(*group_id, *inviter_id)
                        .await?
                        .ok_or(ActionError::InvitationNotFound)?,
                };
                self.respond_group_invitation(id, decision.as_status()).await?;
            }
            ActionRequest::JoinRequestResponse {
                request_id,
                group_id,
                requester_id,
                decision,
            } => {
                let id = match request_id {
                    Some(id) => *id,
                    None => self
                        .find_join_request(*group_id, *requester_id)
                        .await?
                        .ok_or(ActionError::JoinRequestNotFound)?,
                };
                self.respond_join_request(id, decision.as_status()).await?;
            }
            ActionRequest::EventVote { event_id, choice } => {
                self.vote_event(*event_id, choice.as_str()).await?;
            }
        }
        Ok(())
    }
}

async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, ApiError> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(status_error(status, &body));
    }
    serde_json::from_str(&body).map_err(|e| ApiError::Decode(e.to_string()))
}

async fn expect_success(response: Response) -> Result<(), ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    Err(status_error(status, &body))
}

fn status_error(status: StatusCode, body: &str) -> ApiError {
    let from_json = serde_json::from_str::<Value>(body).ok().and_then(|v| {
        ["message", "error"]
            .iter()
            .find_map(|key| v.get(*key).and_then(Value::as_str).map(str::to_string))
    });
    let message = from_json.unwrap_or_else(|| match body.trim() {
        "" => status.canonical_reason().unwrap_or("request failed").to_string(),
        text => text.to_string(),
    });
    ApiError::Status {
        status: status.as_u16(),
        message,
    }
}

/// History arrives either as `{messages: [...]}` or as a bare array; `null` is empty.
fn decode_history(body: Value, default_kind: MessageKind) -> Vec<InboundMessage> {
    let records = match body {
        Value::Array(items) => items,
        Value::Object(mut obj) => match obj.remove("messages") {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    };
    records
        .into_iter()
        .filter_map(|record| match InboundMessage::from_value_or(record, default_kind.clone()) {
            Ok(message) => Some(message),
            Err(e) => {
                warn!("Skipping history record: {}", e);
                None
            }
        })
        .collect()
}
