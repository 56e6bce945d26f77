//! Accept / decline / vote on notifications.
//!
//! Resolution turns a notification plus a user action into one concrete
//! REST request. Performing it removes the notification optimistically,
//! submits, and either rolls the removal back or re-checks a little later
//! for copies the stream redelivered meanwhile.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};

use crate::client::services::connection_manager::ConnectionManager;
use crate::common::error::ActionError;
use crate::common::models::{Decision, GroupId, UserId, VoteChoice};
use crate::common::protocol::{InboundMessage, MessageKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationAction {
    Accept,
    Decline,
    Vote(VoteChoice),
}

impl fmt::Display for NotificationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotificationAction::Accept => f.write_str("accept"),
            NotificationAction::Decline => f.write_str("decline"),
            NotificationAction::Vote(choice) => write!(f, "vote {}", choice.as_str()),
        }
    }
}

impl NotificationAction {
    fn decision(self) -> Option<Decision> {
        match self {
            NotificationAction::Accept => Some(Decision::Accept),
            NotificationAction::Decline => Some(Decision::Decline),
            NotificationAction::Vote(_) => None,
        }
    }
}

/// A resolved follow-up request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionRequest {
    FollowResponse {
        requester_id: UserId,
        decision: Decision,
    },
    /// Without `invitation_id` the invitation is looked up by group and inviter.
    InvitationResponse {
        invitation_id: Option<u64>,
        group_id: Option<GroupId>,
        inviter_id: Option<UserId>,
        decision: Decision,
    },
    /// Without `request_id` the request is looked up by group and requester.
    JoinRequestResponse {
        request_id: Option<u64>,
        group_id: Option<GroupId>,
        requester_id: Option<UserId>,
        decision: Decision,
    },
    EventVote {
        event_id: u64,
        choice: VoteChoice,
    },
}

pub fn resolve(notification: &InboundMessage, action: NotificationAction) -> Result<ActionRequest, ActionError> {
    let unsupported = || ActionError::Unsupported {
        kind: notification.kind.clone(),
        action: action.to_string(),
    };

    match (&notification.kind, action) {
        (MessageKind::FollowRequest, _) => {
            let decision = action.decision().ok_or_else(unsupported)?;
            let requester_id = notification
                .requester_id
                .ok_or(ActionError::MissingIdentifier("requester id"))?;
            Ok(ActionRequest::FollowResponse { requester_id, decision })
        }
        (MessageKind::GroupInvitation, _) => {
            let decision = action.decision().ok_or_else(unsupported)?;
            if notification.invitation_id.is_none() && notification.group_id.is_none() {
                return Err(ActionError::MissingIdentifier("invitation id"));
            }
            Ok(ActionRequest::InvitationResponse {
                invitation_id: notification.invitation_id,
                group_id: notification.group_id,
                inviter_id: notification.inviter_id,
                decision,
            })
        }
        (MessageKind::GroupJoinRequest, _) => {
            let decision = action.decision().ok_or_else(unsupported)?;
            if notification.request_id.is_none()
                && (notification.group_id.is_none() || notification.requester_id.is_none())
            {
                return Err(ActionError::MissingIdentifier("request id"));
            }
            Ok(ActionRequest::JoinRequestResponse {
                request_id: notification.request_id,
                group_id: notification.group_id,
                requester_id: notification.requester_id,
                decision,
            })
        }
        (MessageKind::NewGroupEvent, NotificationAction::Vote(choice)) => {
            let event_id = notification
                .post_id
                .ok_or(ActionError::MissingIdentifier("event id"))?;
            Ok(ActionRequest::EventVote { event_id, choice })
        }
        _ => Err(unsupported()),
    }
}

/// REST side of the notification actions.
#[async_trait]
pub trait NotificationApi: Send + Sync {
    async fn submit(&self, request: &ActionRequest) -> Result<(), ActionError>;
}

pub struct NotificationActions {
    manager: ConnectionManager,
    api: Arc<dyn NotificationApi>,
    recheck_delay: Duration,
}

impl NotificationActions {
    pub fn new(manager: ConnectionManager, api: Arc<dyn NotificationApi>) -> Self {
        let recheck_delay = manager.config().action_recheck_delay;
        Self {
            manager,
            api,
            recheck_delay,
        }
    }

    /// Resolve, remove optimistically, submit. On rejection the log is
    /// restored and the error returned.
    pub async fn perform(
        &self,
        notification: &InboundMessage,
        action: NotificationAction,
    ) -> Result<ActionRequest, ActionError> {
        let request = resolve(notification, action)?;
        let removal = self.manager.remove_notification(notification);
        debug!("Optimistically removed {} notification(s)", removal.len());

        match self.api.submit(&request).await {
            Ok(()) => {
                info!("{} on {} notification succeeded", action, notification.kind);
                self.schedule_recheck(notification.clone());
                Ok(request)
            }
            Err(e) => {
                warn!("{} on {} notification failed: {}", action, notification.kind, e);
                self.manager.restore_notifications(removal);
                Err(e)
            }
        }
    }

    fn schedule_recheck(&self, notification: InboundMessage) {
        let manager = self.manager.clone();
        let delay = self.recheck_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let late = manager.remove_notification(&notification);
            if !late.is_empty() {
                debug!("Re-check removed {} redelivered notification(s)", late.len());
            }
        });
    }
}
