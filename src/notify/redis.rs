//! Redis-backed notification bus.

use super::{NotificationBus, NotifyError, StateNotice};
use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub struct RedisBus {
    client: redis::Client,
    publisher: ConnectionManager,
}

impl RedisBus {
    pub async fn connect(url: &str) -> Result<RedisBus, NotifyError> {
        let client = redis::Client::open(url).map_err(|e| NotifyError::new(e.to_string()))?;
        let publisher = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| NotifyError::new(e.to_string()))?;
        Ok(RedisBus { client, publisher })
    }
}

#[async_trait]
impl NotificationBus for RedisBus {
    async fn publish(&self, channel: &str, notice: &StateNotice) -> Result<(), NotifyError> {
        let body = serde_json::to_string(notice).map_err(|e| NotifyError::new(e.to_string()))?;
        let mut conn = self.publisher.clone();
        conn.publish::<_, _, ()>(channel, body)
            .await
            .map_err(|e| NotifyError::new(e.to_string()))?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<StateNotice>, NotifyError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| NotifyError::new(e.to_string()))?;
        pubsub
            .subscribe(channel)
            .await
            .map_err(|e| NotifyError::new(e.to_string()))?;

        let (tx, rx) = mpsc::channel(16);
        let channel = channel.to_string();
        tokio::spawn(async move {
            let mut stream = pubsub.into_on_message();
            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(target: "senpuki::notify", channel = %channel, error = %e, "bad bus payload");
                        continue;
                    }
                };
                let notice: StateNotice = match serde_json::from_str(&payload) {
                    Ok(n) => n,
                    Err(e) => {
                        warn!(target: "senpuki::notify", channel = %channel, error = %e, "bad bus message");
                        continue;
                    }
                };
                let terminal = notice.is_terminal();
                if tx.send(notice).await.is_err() {
                    break;
                }
                if terminal {
                    debug!(target: "senpuki::notify", channel = %channel, "terminal state observed, unsubscribing");
                    break;
                }
            }
        });
        Ok(rx)
    }
}
