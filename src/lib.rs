pub mod client;
pub mod common;
pub mod utils;

pub use client::config::{ClientConfig, ReconnectPolicy};
pub use client::services::connection_manager::{ConnectionManager, ConnectionState, ConnectionStatus};
pub use common::error::{ActionError, ApiError, ProtocolError, TransportError};
pub use common::protocol::{InboundMessage, MessageKind};
