use std::borrow::Cow;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::common::error::TransportError;
use crate::common::models::UserId;

/// Close code sent on an explicit logout.
pub const NORMAL_CLOSE: u16 = 1000;
pub const LOGOUT_REASON: &str = "User logout";
/// Reported when the peer vanished without a close frame.
pub const ABNORMAL_CLOSE: u16 = 1006;

/// Frame handed to the writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Text(String),
    Close { code: u16, reason: String },
}

impl OutboundFrame {
    pub fn logout() -> Self {
        OutboundFrame::Close {
            code: NORMAL_CLOSE,
            reason: LOGOUT_REASON.to_string(),
        }
    }
}

/// What the reader task reports back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Frame(String),
    Error(String),
    Closed { code: u16, reason: String },
}

/// A live connection: push frames into `outgoing`, read events from `incoming`.
#[derive(Debug)]
pub struct TransportHandle {
    pub outgoing: mpsc::UnboundedSender<OutboundFrame>,
    pub incoming: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Opens the per-user stream.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, identity: UserId) -> Result<TransportHandle, TransportError>;
}

/// WebSocket connector, `?user_id=<identity>` appended to the base endpoint.
#[derive(Debug, Clone)]
pub struct WsConnector {
    endpoint: Url,
}

impl WsConnector {
    pub fn new(endpoint: &str) -> Result<Self, TransportError> {
        Ok(Self {
            endpoint: Url::parse(endpoint)?,
        })
    }

    pub fn endpoint_for(&self, identity: UserId) -> Url {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut().append_pair("user_id", &identity.to_string());
        url
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, identity: UserId) -> Result<TransportHandle, TransportError> {
        let url = self.endpoint_for(identity);
        info!("[WS] Connecting to {}", url);
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("Failed to connect: {}", e)))?;
        info!("[WS] Connected as user {}", identity);

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<OutboundFrame>();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel::<TransportEvent>();

        // Task per i messaggi in uscita
        tokio::spawn(async move {
            while let Some(frame) = outgoing_rx.recv().await {
                match frame {
                    OutboundFrame::Text(text) => {
                        debug!("[WS] Sending {}", text);
                        if let Err(e) = ws_sender.send(Message::Text(text)).await {
                            warn!("[WS] Failed to send frame: {}", e);
                            break;
                        }
                    }
                    OutboundFrame::Close { code, reason } => {
                        let close = CloseFrame {
                            code: CloseCode::from(code),
                            reason: Cow::Owned(reason),
                        };
                        if let Err(e) = ws_sender.send(Message::Close(Some(close))).await {
                            debug!("[WS] Close frame not delivered: {}", e);
                        }
                        break;
                    }
                }
            }
            debug!("[WS] Writer ended");
        });

        // Task per i messaggi in arrivo
        tokio::spawn(async move {
            let mut closed = None;
            while let Some(item) = ws_receiver.next().await {
                match item {
                    Ok(Message::Text(text)) => {
                        if incoming_tx.send(TransportEvent::Frame(text)).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        closed = Some(match frame {
                            Some(f) => (u16::from(f.code), f.reason.into_owned()),
                            None => (NORMAL_CLOSE, String::new()),
                        });
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let _ = incoming_tx.send(TransportEvent::Error(e.to_string()));
                        break;
                    }
                }
            }
            let (code, reason) = closed.unwrap_or((ABNORMAL_CLOSE, String::new()));
            let _ = incoming_tx.send(TransportEvent::Closed { code, reason });
            debug!("[WS] Reader ended");
        });

        Ok(TransportHandle {
            outgoing: outgoing_tx,
            incoming: incoming_rx,
        })
    }
}
