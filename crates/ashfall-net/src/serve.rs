//! Server-side read loop shared by the TCP and WebSocket servers.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::connection::Connection;
use crate::error::NetError;
use crate::handler::{ConnectionCallback, MessageHandler};
use crate::pool::Pools;

/// Read from `conn` until it fails, idles out, or `token` is cancelled.
///
/// Any received message, heartbeats included, resets the idle clock.
/// Heartbeats stop here; everything else goes to `handler`. Every message is
/// recycled into `pools` once the handler returns.
pub(crate) async fn serve_connection(
    conn: Arc<dyn Connection>,
    handler: Arc<dyn MessageHandler>,
    pools: Pools,
    idle_timeout: Duration,
    token: CancellationToken,
) {
    let mut last_seen = Instant::now();

    loop {
        if last_seen.elapsed() > idle_timeout {
            tracing::info!("{} from {} idle for {idle_timeout:?}, closing", conn.id(), conn.remote_addr());
            break;
        }

        let received = tokio::select! {
            _ = token.cancelled() => break,
            received = tokio::time::timeout(idle_timeout, conn.receive_message()) => received,
        };

        let msg = match received {
            Ok(Ok(msg)) => msg,
            Ok(Err(NetError::ConnectionClosed)) => {
                tracing::debug!("{} closed by peer", conn.id());
                break;
            }
            Ok(Err(e)) => {
                tracing::warn!("read from {} failed: {e}", conn.id());
                break;
            }
            Err(_) => {
                tracing::info!("{} from {} idle for {idle_timeout:?}, closing", conn.id(), conn.remote_addr());
                break;
            }
        };
        last_seen = Instant::now();

        if msg.is_heartbeat() {
            pools.recycle(msg);
            continue;
        }

        tracing::debug!("{} received message type {:#04x}, {} bytes", conn.id(), msg.msg_type, msg.payload.len());
        if let Err(e) = handler.handle_message(&conn, &msg).await {
            tracing::error!("handle message type {:#04x} from {} failed: {e}", msg.msg_type, conn.id());
        }
        pools.recycle(msg);
    }
}

/// Run `serve_connection` on its own task so a panicking handler only takes
/// down that task. Returns once the connection loop has ended either way.
pub(crate) async fn serve_isolated(
    conn: Arc<dyn Connection>,
    handler: Arc<dyn MessageHandler>,
    pools: Pools,
    idle_timeout: Duration,
    token: CancellationToken,
) {
    let id = conn.id();
    let task = tokio::spawn(serve_connection(conn, handler, pools, idle_timeout, token));
    if let Err(join_error) = task.await {
        if join_error.is_panic() {
            let payload = join_error.into_panic();
            tracing::error!("{id} handler panicked: {}", panic_message(&payload));
        } else {
            tracing::debug!("{id} connection task cancelled");
        }
    }
}

/// Run a lifecycle callback on its own task.
pub(crate) fn notify(cb: &Option<ConnectionCallback>, conn: &Arc<dyn Connection>) {
    if let Some(cb) = cb.clone() {
        let conn = conn.clone();
        tokio::spawn(async move { cb(conn) });
    }
}

fn panic_message(payload: &Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message_from_str_and_string() {
        let payload: Box<dyn Any + Send> = Box::new("static boom");
        assert_eq!(panic_message(&payload), "static boom");

        let payload: Box<dyn Any + Send> = Box::new(format!("boom {}", 7));
        assert_eq!(panic_message(&payload), "boom 7");

        let payload: Box<dyn Any + Send> = Box::new(42u32);
        assert_eq!(panic_message(&payload), "unknown panic payload");
    }
}
