use sqlx::PgPool;
use sqlx::postgres::PgListener;

use kyomei_common::error::Result;
use kyomei_common::types::{BusMessage, Channel};

/// Pub/sub over Postgres NOTIFY. The Syncer and the Processor never hold a
/// reference to each other; both hold one of these.
#[derive(Clone)]
pub struct NotificationBus {
    pool: PgPool,
}

impl NotificationBus {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Best-effort publish: a send failure logs and is swallowed. Consumers
    /// have a fallback poll, so a lost notification only costs latency.
    pub async fn publish(&self, message: &BusMessage) {
        let result = sqlx::query("SELECT pg_notify($1, $2)")
            .bind(message.channel.name())
            .bind(message.to_json())
            .execute(&self.pool)
            .await;

        if let Err(e) = result {
            tracing::warn!(
                channel = message.channel.name(),
                chain_id = message.chain_id,
                error = %e,
                "Failed to publish notification"
            );
        }
    }

    pub async fn subscribe(&self, channels: &[Channel]) -> Result<BusSubscription> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        let names: Vec<&str> = channels.iter().map(|c| c.name()).collect();
        listener.listen_all(names).await?;
        Ok(BusSubscription { listener })
    }
}

/// A live LISTEN session. `recv` blocks until the next well-formed message;
/// malformed payloads are logged and skipped.
pub struct BusSubscription {
    listener: PgListener,
}

impl BusSubscription {
    pub async fn recv(&mut self) -> Result<BusMessage> {
        loop {
            let notification = self.listener.recv().await?;
            match BusMessage::from_json(notification.payload()) {
                Some(message) => return Ok(message),
                None => {
                    tracing::warn!(
                        channel = notification.channel(),
                        payload = notification.payload(),
                        "Discarding malformed bus payload"
                    );
                }
            }
        }
    }
}
