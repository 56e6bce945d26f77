use thiserror::Error;

use crate::common::protocol::MessageKind;

/// Failure decoding an inbound frame.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Frame is not a JSON object")]
    NotAnObject,

    #[error("Missing type field")]
    MissingType,

    #[error("Malformed {kind} content: {source}")]
    EmbeddedContent {
        kind: MessageKind,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Invalid stream endpoint: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

/// Failure talking to one of the REST collaborators.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Request failed with status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Unexpected response body: {0}")]
    Decode(String),

    #[error("Invalid backend url: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

/// Failure performing a user action on a notification.
#[derive(Error, Debug)]
pub enum ActionError {
    #[error("Notification has no {0}")]
    MissingIdentifier(&'static str),

    #[error("Action {action} is not available for {kind} notifications")]
    Unsupported { kind: MessageKind, action: String },

    #[error("Invitation not found")]
    InvitationNotFound,

    #[error("Join request not found")]
    JoinRequestNotFound,

    #[error(transparent)]
    Api(#[from] ApiError),
}
