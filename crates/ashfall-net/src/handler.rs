//! Seams between the transport and application code.

use std::sync::Arc;

use async_trait::async_trait;

use crate::connection::Connection;
use crate::messages::Message;

/// Error type handlers report. Logged by the transport, never fatal.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

pub type HandlerResult = Result<(), HandlerError>;

/// Receives every non-heartbeat message read from a connection.
///
/// Messages from one connection are delivered in order, one at a time. The
/// message is borrowed: the transport recycles it after the call returns, so
/// copy out whatever must outlive the call.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle_message(&self, conn: &Arc<dyn Connection>, msg: &Message) -> HandlerResult;
}

/// Invoked when a connection is established or torn down.
pub type ConnectionCallback = Arc<dyn Fn(Arc<dyn Connection>) + Send + Sync>;
