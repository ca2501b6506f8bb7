//! Reconnecting Postgres `LISTEN` loop.
//!
//! Notification delivery is best-effort: messages published while the
//! connection is down are lost. Consumers get [`ListenEvent::Gap`]
//! around every outage and are expected to re-check their state (and to run a
//! periodic poll anyway).

use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgListener;
use tokio::task::JoinHandle;

/// Something observed on a notification channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenEvent<'a> {
    /// A `NOTIFY` with its payload.
    Notification(&'a str),
    /// The connection was (re)established or lost; notifications may have been missed.
    Gap,
}

/// Spawns a task listening on `channel` until the pool is closed.
///
/// Must be called from within a Tokio runtime.
pub fn spawn_listener<F>(
    pool: PgPool,
    channel: &'static str,
    reconnect_delay: Duration,
    on_event: F,
) -> JoinHandle<()>
where
    F: Fn(ListenEvent<'_>) + Send + Sync + 'static,
{
    tokio::spawn(async move {
        loop {
            if pool.is_closed() {
                break;
            }

            let mut listener = match PgListener::connect_with(&pool).await {
                Ok(listener) => listener,
                Err(e) => {
                    tracing::warn!(channel, error = %e, "listener connect failed, retrying");
                    tokio::time::sleep(reconnect_delay).await;
                    continue;
                }
            };
            if let Err(e) = listener.listen(channel).await {
                tracing::warn!(channel, error = %e, "LISTEN failed, retrying");
                tokio::time::sleep(reconnect_delay).await;
                continue;
            }

            tracing::debug!(channel, "listening for notifications");
            on_event(ListenEvent::Gap);

            loop {
                match listener.try_recv().await {
                    Ok(Some(notification)) => {
                        on_event(ListenEvent::Notification(notification.payload()));
                    }
                    Ok(None) => {
                        // Connection dropped; try_recv reconnects on the next call.
                        tracing::warn!(channel, "notification connection lost");
                        on_event(ListenEvent::Gap);
                    }
                    Err(e) => {
                        tracing::warn!(channel, error = %e, "notification receive failed");
                        break;
                    }
                }
            }

            tokio::time::sleep(reconnect_delay).await;
        }
        tracing::debug!(channel, "listener stopped");
    })
}
