pub mod api_client;
pub mod classifier;
pub mod connection_manager;
pub mod dedup;
pub mod notification_actions;
pub mod outbound;
pub mod subscribers;
pub mod transport;
