//! Redis result publisher: one envelope per job on the per-request channel,
//! with a TTL'd copy under `job:<request_id>` for late subscribers.

use std::time::Duration;

use async_trait::async_trait;
use nimbus_common::{PublishError, ResultEnvelope, ResultPublisher};
use redis::aio::MultiplexedConnection;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::RedisConfig;

const PUBLISH_ATTEMPTS: u32 = 3;
const BACKOFF_INITIAL: Duration = Duration::from_millis(100);
const JOB_RESULT_TTL_SECONDS: u64 = 600;

pub struct RedisPublisher {
    client: redis::Client,
    connection: Mutex<Option<MultiplexedConnection>>,
    result_prefix: String,
}

impl RedisPublisher {
    pub fn new(config: &RedisConfig) -> Result<Self, redis::RedisError> {
        let info = redis::ConnectionInfo {
            addr: redis::ConnectionAddr::Tcp(config.host.clone(), config.port),
            redis: redis::RedisConnectionInfo {
                db: 0,
                username: None,
                password: (!config.password.is_empty()).then(|| config.password.clone()),
            },
        };
        Ok(Self {
            client: redis::Client::open(info)?,
            connection: Mutex::new(None),
            result_prefix: config.result_prefix.clone(),
        })
    }

    /// Lazily established, reused across publishes, dropped on failure so
    /// the next attempt reconnects.
    async fn connection(&self) -> Result<MultiplexedConnection, redis::RedisError> {
        let mut guard = self.connection.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self.client.get_multiplexed_async_connection().await?;
        *guard = Some(conn.clone());
        Ok(conn)
    }

    async fn reset_connection(&self) {
        *self.connection.lock().await = None;
    }

    async fn publish_once(&self, channel: &str, payload: &str) -> Result<i64, redis::RedisError> {
        let mut conn = self.connection().await?;
        let subscribers: i64 = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(subscribers)
    }

    async fn store_copy(&self, request_id: &str, payload: &str) {
        let key = format!("job:{request_id}");
        match self.connection().await {
            Ok(mut conn) => {
                let result: Result<(), redis::RedisError> = redis::cmd("SET")
                    .arg(&key)
                    .arg(payload)
                    .arg("EX")
                    .arg(JOB_RESULT_TTL_SECONDS)
                    .query_async(&mut conn)
                    .await;
                match result {
                    Ok(()) => debug!(%key, ttl = JOB_RESULT_TTL_SECONDS, "result copy stored"),
                    Err(e) => warn!(%key, error = %e, "failed to store result copy"),
                }
            }
            Err(e) => warn!(%key, error = %e, "failed to store result copy"),
        }
    }
}

#[async_trait]
impl ResultPublisher for RedisPublisher {
    async fn publish(&self, envelope: &ResultEnvelope) -> Result<(), PublishError> {
        let channel = format!("{}{}", self.result_prefix, envelope.request_id);
        let payload = serde_json::to_string(envelope)
            .map_err(|e| PublishError(format!("serialize envelope: {e}")))?;

        let mut backoff = BACKOFF_INITIAL;
        let mut last_error = String::new();
        for attempt in 1..=PUBLISH_ATTEMPTS {
            match self.publish_once(&channel, &payload).await {
                Ok(subscribers) => {
                    if subscribers == 0 {
                        warn!(%channel, "result published but nobody is subscribed");
                    } else {
                        info!(%channel, subscribers, "result published");
                    }
                    self.store_copy(&envelope.request_id, &payload).await;
                    return Ok(());
                }
                Err(e) => {
                    warn!(%channel, attempt, error = %e, "publish attempt failed");
                    last_error = e.to_string();
                    self.reset_connection().await;
                    if attempt < PUBLISH_ATTEMPTS {
                        tokio::time::sleep(backoff).await;
                        backoff *= 2;
                    }
                }
            }
        }
        Err(PublishError(format!(
            "bus unreachable after {PUBLISH_ATTEMPTS} attempts: {last_error}"
        )))
    }
}
