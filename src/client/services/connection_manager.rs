//! One live stream per identity, with reconnect, classification and fan-out.
//!
//! The manager is a cheap cloneable handle. Background work (open, read loop,
//! settle timer, reconnect timer) runs on Tokio tasks, so `connect` must be
//! called from inside a runtime. Locks are never held across an await point
//! or while subscribers run.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::client::config::ClientConfig;
use crate::client::models::state::{ChatEntry, RealtimeState, Removal};
use crate::client::services::classifier;
use crate::client::services::outbound::{self, OutgoingChat};
use crate::client::services::subscribers::{Subscriber, SubscriberRegistry, Subscription};
use crate::client::services::transport::{
    Connector, OutboundFrame, TransportEvent, TransportHandle, WsConnector, LOGOUT_REASON,
};
use crate::common::error::TransportError;
use crate::common::models::{GroupId, OnlineUser, UserId};
use crate::common::protocol::{online_users_request, InboundMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    /// Transport error seen, waiting for the close that follows it.
    Failed,
    Closed,
}

/// The status line shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

impl From<ConnectionState> for ConnectionStatus {
    fn from(state: ConnectionState) -> Self {
        match state {
            ConnectionState::Connecting => ConnectionStatus::Connecting,
            ConnectionState::Open => ConnectionStatus::Connected,
            _ => ConnectionStatus::Disconnected,
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionStatus::Disconnected => "Disconnected",
            ConnectionStatus::Connecting => "Connecting...",
            ConnectionStatus::Connected => "Connected",
        })
    }
}

struct ConnInner {
    identity: Option<UserId>,
    state: ConnectionState,
    /// Bumped on every connect/disconnect; events of older generations are ignored.
    generation: u64,
    outgoing: Option<mpsc::UnboundedSender<OutboundFrame>>,
    /// False after an explicit disconnect.
    active: bool,
    reconnect_pending: bool,
    reconnect_task: Option<JoinHandle<()>>,
    last_error: Option<String>,
    retry_attempts: u32,
}

struct Shared {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    conn: Mutex<ConnInner>,
    state: Mutex<RealtimeState>,
    subscribers: SubscriberRegistry,
    status: watch::Sender<ConnectionStatus>,
}

#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    pub fn new(config: ClientConfig, connector: Arc<dyn Connector>) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        let state = RealtimeState::new(config.chat_dedup_window);
        Self {
            shared: Arc::new(Shared {
                config,
                connector,
                conn: Mutex::new(ConnInner {
                    identity: None,
                    state: ConnectionState::Idle,
                    generation: 0,
                    outgoing: None,
                    active: false,
                    reconnect_pending: false,
                    reconnect_task: None,
                    last_error: None,
                    retry_attempts: 0,
                }),
                state: Mutex::new(state),
                subscribers: SubscriberRegistry::new(),
                status,
            }),
        }
    }

    /// Manager backed by the WebSocket transport at `config.stream_url`.
    pub fn with_websocket(config: ClientConfig) -> Result<Self, TransportError> {
        let connector = WsConnector::new(&config.stream_url)?;
        Ok(Self::new(config, Arc::new(connector)))
    }

    fn conn(&self) -> MutexGuard<'_, ConnInner> {
        self.shared.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn logs(&self) -> MutexGuard<'_, RealtimeState> {
        self.shared.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish_status(&self, status: ConnectionStatus) {
        let previous = self.shared.status.send_replace(status);
        if previous != status {
            info!("Connection status: {}", status);
        }
    }

    /// Open the stream for `identity`. A no-op without identity or while a
    /// connection for the same identity is connecting or open.
    pub fn connect(&self, identity: Option<UserId>) {
        let Some(identity) = identity else {
            debug!("connect() without identity ignored");
            return;
        };

        let (generation, switched) = {
            let mut conn = self.conn();
            if conn.identity == Some(identity)
                && matches!(conn.state, ConnectionState::Connecting | ConnectionState::Open)
            {
                debug!("Connection for user {} already {:?}", identity, conn.state);
                return;
            }
            let switched = conn.identity.is_some_and(|current| current != identity);
            if let Some(stale) = conn.outgoing.take() {
                let _ = stale.send(OutboundFrame::logout());
            }
            if let Some(timer) = conn.reconnect_task.take() {
                timer.abort();
            }
            conn.reconnect_pending = false;
            conn.identity = Some(identity);
            conn.active = true;
            conn.generation += 1;
            conn.state = ConnectionState::Connecting;
            (conn.generation, switched)
        };
        if switched {
            // Last connection wins; the previous identity's logs go with it.
            self.logs().clear();
        }
        self.publish_status(ConnectionStatus::Connecting);

        let this = self.clone();
        tokio::spawn(async move { this.run_connection(identity, generation).await });
    }

    async fn run_connection(self, identity: UserId, generation: u64) {
        info!("Opening stream for user {}", identity);
        let TransportHandle { outgoing, mut incoming } = match self.shared.connector.open(identity).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!("Stream for user {} failed to open: {}", identity, e);
                self.record_error(generation, e.to_string());
                self.handle_close(generation);
                return;
            }
        };

        {
            let mut conn = self.conn();
            if conn.generation != generation {
                debug!("Discarding superseded connection for user {}", identity);
                let _ = outgoing.send(OutboundFrame::logout());
                return;
            }
            conn.state = ConnectionState::Open;
            conn.outgoing = Some(outgoing);
            conn.retry_attempts = 0;
            conn.last_error = None;
        }
        info!("Stream open for user {}", identity);
        self.publish_status(ConnectionStatus::Connected);
        self.spawn_settle(generation);

        while let Some(event) = incoming.recv().await {
            if !self.is_current(generation) {
                break;
            }
            match event {
                TransportEvent::Frame(text) => self.handle_frame(&text),
                TransportEvent::Error(e) => {
                    warn!("Stream error for user {}: {}", identity, e);
                    self.record_error(generation, e);
                }
                TransportEvent::Closed { code, reason } => {
                    info!("Stream closed for user {} ({} {})", identity, code, reason);
                    break;
                }
            }
        }
        self.handle_close(generation);
    }

    fn is_current(&self, generation: u64) -> bool {
        self.conn().generation == generation
    }

    fn record_error(&self, generation: u64, error: String) {
        let mut conn = self.conn();
        if conn.generation == generation {
            conn.state = ConnectionState::Failed;
            conn.last_error = Some(error);
        }
    }

    fn spawn_settle(&self, generation: u64) {
        let this = self.clone();
        let delay = self.shared.config.settle_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let open = {
                let conn = this.conn();
                conn.generation == generation && conn.state == ConnectionState::Open
            };
            if open && !this.request_online_users() {
                debug!("Presence request not sent");
            }
        });
    }

    /// Close bookkeeping: at most one reconnect timer per identity.
    fn handle_close(&self, generation: u64) {
        {
            let mut conn = self.conn();
            if conn.generation != generation {
                return;
            }
            conn.state = ConnectionState::Closed;
            conn.outgoing = None;

            if conn.active && !conn.reconnect_pending {
                if let Some(identity) = conn.identity {
                    conn.reconnect_pending = true;
                    conn.retry_attempts = conn.retry_attempts.saturating_add(1);
                    let delay = self.shared.config.reconnect.delay(conn.retry_attempts);
                    info!(
                        "Reconnecting user {} in {:?} (attempt {})",
                        identity, delay, conn.retry_attempts
                    );
                    let this = self.clone();
                    conn.reconnect_task = Some(tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        {
                            let mut conn = this.conn();
                            if !conn.reconnect_pending || !conn.active {
                                return;
                            }
                            conn.reconnect_pending = false;
                            // Detach: connect() must not abort the running timer.
                            conn.reconnect_task = None;
                        }
                        this.connect(Some(identity));
                    }));
                }
            }
        }
        self.publish_status(ConnectionStatus::Disconnected);
    }

    fn handle_frame(&self, text: &str) {
        let message = match InboundMessage::decode(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping malformed frame: {}", e);
                return;
            }
        };
        debug!("Frame {} from {:?}", message.kind, message.from);
        {
            let mut logs = self.logs();
            classifier::apply(&mut logs, &message);
        }
        self.shared.subscribers.publish(&message);
    }

    /// Logout: stop reconnecting, close the live handle, clear every log.
    /// Subscribers stay registered. Safe to call repeatedly.
    pub fn disconnect(&self) {
        let outgoing = {
            let mut conn = self.conn();
            conn.active = false;
            conn.identity = None;
            conn.generation += 1;
            conn.reconnect_pending = false;
            if let Some(timer) = conn.reconnect_task.take() {
                timer.abort();
            }
            if conn.state != ConnectionState::Idle {
                conn.state = ConnectionState::Closed;
            }
            conn.outgoing.take()
        };
        if let Some(tx) = outgoing {
            info!("Closing stream: {}", LOGOUT_REASON);
            let _ = tx.send(OutboundFrame::logout());
        }
        self.logs().clear();
        self.publish_status(ConnectionStatus::Disconnected);
    }

    /// Serialize and hand `payload` to the transport. False unless open.
    pub fn send<T: Serialize + ?Sized>(&self, payload: &T) -> bool {
        let conn = self.conn();
        if conn.state != ConnectionState::Open {
            debug!("send() refused, connection is {:?}", conn.state);
            return false;
        }
        let Some(tx) = conn.outgoing.as_ref() else {
            return false;
        };
        let text = match serde_json::to_string(payload) {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to serialize outgoing frame: {}", e);
                return false;
            }
        };
        tx.send(OutboundFrame::Text(text)).is_ok()
    }

    /// Send a chat message and, when accepted by the transport, echo it
    /// into the message log.
    pub fn send_chat(&self, chat: OutgoingChat) -> bool {
        if chat.is_blank() {
            return false;
        }
        let Some(me) = self.identity() else {
            return false;
        };
        let frame = chat.frame(me, Utc::now());
        if !self.send(&frame) {
            return false;
        }
        match outbound::local_echo(&frame) {
            Ok(echo) => {
                self.logs().messages.insert(echo, true);
            }
            Err(e) => warn!("Local echo not recorded: {}", e),
        }
        true
    }

    pub fn request_online_users(&self) -> bool {
        self.send(&online_users_request())
    }

    pub fn subscribe<S: Subscriber + 'static>(&self, subscriber: S) -> Subscription {
        self.shared.subscribers.subscribe(subscriber)
    }

    /// Merge fetched history into the message log. Returns how many were new.
    pub fn merge_history(&self, messages: Vec<InboundMessage>) -> usize {
        let mut logs = self.logs();
        let mut added = 0;
        for message in messages {
            if message.kind.is_chat() && logs.messages.insert(message, false) {
                added += 1;
            }
        }
        added
    }

    pub fn clear_notifications(&self) {
        self.logs().notifications.clear();
    }

    pub(crate) fn remove_notification(&self, target: &InboundMessage) -> Removal {
        self.logs().notifications.remove_matching(target)
    }

    pub(crate) fn restore_notifications(&self, removal: Removal) {
        self.logs().notifications.restore(removal);
    }

    pub fn state(&self) -> ConnectionState {
        self.conn().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub fn identity(&self) -> Option<UserId> {
        self.conn().identity
    }

    pub fn last_error(&self) -> Option<String> {
        self.conn().last_error.clone()
    }

    pub fn retry_attempts(&self) -> u32 {
        self.conn().retry_attempts
    }

    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status.subscribe()
    }

    pub fn current_status(&self) -> ConnectionStatus {
        *self.shared.status.borrow()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    /// Read-only access to the logs. `f` runs under the state lock and must
    /// not call back into the manager.
    pub fn with_state<R>(&self, f: impl FnOnce(&RealtimeState) -> R) -> R {
        f(&self.logs())
    }

    pub fn messages(&self) -> Vec<ChatEntry> {
        self.logs().messages.entries().to_vec()
    }

    pub fn conversation(&self, peer: UserId) -> Vec<InboundMessage> {
        let Some(me) = self.identity() else {
            return Vec::new();
        };
        self.logs().messages.conversation(me, peer).into_iter().cloned().collect()
    }

    pub fn group_messages(&self, group_id: GroupId) -> Vec<InboundMessage> {
        self.logs().messages.group(group_id).into_iter().cloned().collect()
    }

    pub fn notifications(&self) -> Vec<InboundMessage> {
        self.logs().notifications.entries().to_vec()
    }

    pub fn online_users(&self) -> Vec<OnlineUser> {
        self.logs().presence.users().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Connector whose open never completes.
    struct Pending {
        opens: AtomicUsize,
    }

    #[async_trait]
    impl Connector for Pending {
        async fn open(&self, _identity: UserId) -> Result<TransportHandle, TransportError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            std::future::pending().await
        }
    }

    fn manager(connector: Arc<Pending>) -> ConnectionManager {
        ConnectionManager::new(ClientConfig::default(), connector)
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_close_schedules_one_timer() {
        let connector = Arc::new(Pending { opens: AtomicUsize::new(0) });
        let manager = manager(connector.clone());
        manager.connect(Some(42));
        tokio::task::yield_now().await;

        let generation = manager.conn().generation;
        manager.handle_close(generation);
        manager.handle_close(generation);
        manager.handle_close(generation);
        assert_eq!(manager.retry_attempts(), 1);
        assert!(manager.conn().reconnect_pending);

        tokio::time::sleep(Duration::from_millis(3100)).await;
        tokio::task::yield_now().await;
        assert_eq!(connector.opens.load(Ordering::SeqCst), 2);
        assert_eq!(manager.state(), ConnectionState::Connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_cancels_pending_reconnect() {
        let connector = Arc::new(Pending { opens: AtomicUsize::new(0) });
        let manager = manager(connector.clone());
        manager.connect(Some(42));
        tokio::task::yield_now().await;

        let generation = manager.conn().generation;
        manager.handle_close(generation);
        manager.disconnect();
        manager.disconnect();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(connector.opens.load(Ordering::SeqCst), 1);
        assert_eq!(manager.state(), ConnectionState::Closed);
        assert_eq!(manager.identity(), None);
        assert_eq!(manager.current_status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn connect_without_identity_is_a_no_op() {
        let connector = Arc::new(Pending { opens: AtomicUsize::new(0) });
        let manager = manager(connector.clone());
        manager.connect(None);
        tokio::task::yield_now().await;
        assert_eq!(manager.state(), ConnectionState::Idle);
        assert_eq!(connector.opens.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn status_labels() {
        assert_eq!(ConnectionStatus::Connecting.to_string(), "Connecting...");
        assert_eq!(ConnectionStatus::from(ConnectionState::Failed), ConnectionStatus::Disconnected);
    }
}
