#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use social_realtime::client::services::subscribers::Subscription;
use social_realtime::client::services::transport::{
    Connector, OutboundFrame, TransportEvent, TransportHandle,
};
use social_realtime::common::models::UserId;
use social_realtime::{ClientConfig, ConnectionManager, ConnectionStatus, InboundMessage, TransportError};

/// The server end of one scripted connection.
pub struct ServerSide {
    pub identity: UserId,
    pub to_client: mpsc::UnboundedSender<TransportEvent>,
    pub from_client: mpsc::UnboundedReceiver<OutboundFrame>,
}

impl ServerSide {
    pub fn push(&self, frame: Value) {
        self.to_client
            .send(TransportEvent::Frame(frame.to_string()))
            .expect("client reader gone");
    }

    pub fn push_raw(&self, text: &str) {
        self.to_client
            .send(TransportEvent::Frame(text.to_string()))
            .expect("client reader gone");
    }

    pub fn close(&self, code: u16) {
        let _ = self.to_client.send(TransportEvent::Closed {
            code,
            reason: String::new(),
        });
    }

    /// Next frame the client sent, parsed as JSON text.
    pub async fn next_text(&mut self) -> Value {
        match tokio::time::timeout(Duration::from_secs(30), self.from_client.recv()).await {
            Ok(Some(OutboundFrame::Text(text))) => serde_json::from_str(&text).expect("client sent invalid JSON"),
            other => panic!("expected a text frame, got {:?}", other),
        }
    }

    /// Everything sent so far, without waiting.
    pub fn drain(&mut self) -> Vec<OutboundFrame> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.from_client.try_recv() {
            frames.push(frame);
        }
        frames
    }
}

/// In-memory connector: every successful open hands its server side to the test.
pub struct MockConnector {
    opens: AtomicUsize,
    refuse: AtomicBool,
    accepted: mpsc::UnboundedSender<ServerSide>,
}

impl MockConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerSide>) {
        let (accepted, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                opens: AtomicUsize::new(0),
                refuse: AtomicBool::new(false),
                accepted,
            }),
            rx,
        )
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self, identity: UserId) -> Result<TransportHandle, TransportError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionFailed("connection refused".to_string()));
        }
        let (client_out, server_in) = mpsc::unbounded_channel();
        let (server_out, client_in) = mpsc::unbounded_channel();
        let _ = self.accepted.send(ServerSide {
            identity,
            to_client: server_out,
            from_client: server_in,
        });
        Ok(TransportHandle {
            outgoing: client_out,
            incoming: client_in,
        })
    }
}

/// Forwards every fanned-out frame to the test.
pub fn record(manager: &ConnectionManager) -> (Subscription, mpsc::UnboundedReceiver<InboundMessage>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let sub = manager.subscribe(move |message: &InboundMessage| -> anyhow::Result<()> {
        tx.send(message.clone())?;
        Ok(())
    });
    (sub, rx)
}

pub async fn next_message(rx: &mut mpsc::UnboundedReceiver<InboundMessage>) -> InboundMessage {
    tokio::time::timeout(Duration::from_secs(30), rx.recv())
        .await
        .expect("no frame delivered")
        .expect("recorder dropped")
}

pub async fn wait_status(manager: &ConnectionManager, wanted: ConnectionStatus) {
    let mut status = manager.status();
    tokio::time::timeout(Duration::from_secs(30), status.wait_for(|s| *s == wanted))
        .await
        .expect("status never reached")
        .expect("status channel closed");
}

pub async fn accept(servers: &mut mpsc::UnboundedReceiver<ServerSide>) -> ServerSide {
    tokio::time::timeout(Duration::from_secs(30), servers.recv())
        .await
        .expect("client never connected")
        .expect("connector dropped")
}

/// Let spawned tasks run without advancing the clock.
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

pub fn manager_with(config: ClientConfig) -> (ConnectionManager, Arc<MockConnector>, mpsc::UnboundedReceiver<ServerSide>) {
    let (connector, servers) = MockConnector::new();
    let manager = ConnectionManager::new(config, connector.clone());
    (manager, connector, servers)
}

pub fn manager() -> (ConnectionManager, Arc<MockConnector>, mpsc::UnboundedReceiver<ServerSide>) {
    manager_with(ClientConfig::default())
}
