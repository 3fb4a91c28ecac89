//! Redis hash announcing token batch jobs to every worker.
//!
//! Each field is a job id and each value the encoded job. Workers poll the
//! hash, so one published job reaches all of them until it is retired.

use std::collections::HashMap;

use async_trait::async_trait;
use fanout_application::TokenBatchJobRegistry;
use fanout_core::{AppError, AppResult};
use fanout_domain::TokenBatchJob;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use tracing::warn;

/// Redis implementation of the token batch job registry.
#[derive(Clone)]
pub struct RedisTokenBatchJobRegistry {
    client: redis::Client,
    registry_key: String,
}

impl RedisTokenBatchJobRegistry {
    /// Creates one registry adapter over the hash at `registry_key`.
    #[must_use]
    pub fn new(client: redis::Client, registry_key: impl Into<String>) -> Self {
        Self {
            client,
            registry_key: registry_key.into(),
        }
    }

    async fn connection(&self) -> AppResult<MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|error| AppError::Internal(format!("failed to connect to redis: {error}")))
    }
}

#[async_trait]
impl TokenBatchJobRegistry for RedisTokenBatchJobRegistry {
    async fn publish(&self, job: &TokenBatchJob) -> AppResult<()> {
        let payload = job.encode()?;

        self.connection()
            .await?
            .hset::<_, _, _, ()>(self.registry_key.as_str(), job.job_id.as_str(), payload)
            .await
            .map_err(|error| {
                AppError::Internal(format!("failed to publish token batch job: {error}"))
            })
    }

    async fn list_active(&self) -> AppResult<Vec<TokenBatchJob>> {
        let mut connection = self.connection().await?;
        let entries: HashMap<String, String> = connection
            .hgetall(self.registry_key.as_str())
            .await
            .map_err(|error| {
                AppError::Internal(format!("failed to list token batch jobs: {error}"))
            })?;

        let mut jobs = Vec::with_capacity(entries.len());
        for (job_id, payload) in entries {
            match TokenBatchJob::decode(payload.as_str()) {
                Ok(job) => jobs.push(job),
                Err(error) => {
                    warn!(
                        registry_key = %self.registry_key,
                        job_id = %job_id,
                        error = %error,
                        "dropping malformed token batch job"
                    );
                    connection
                        .hdel::<_, _, ()>(self.registry_key.as_str(), job_id.as_str())
                        .await
                        .map_err(|error| {
                            AppError::Internal(format!(
                                "failed to drop malformed token batch job: {error}"
                            ))
                        })?;
                }
            }
        }

        jobs.sort_by(|left, right| left.job_id.cmp(&right.job_id));
        Ok(jobs)
    }

    async fn retire(&self, job_id: &str) -> AppResult<()> {
        self.connection()
            .await?
            .hdel::<_, _, ()>(self.registry_key.as_str(), job_id)
            .await
            .map_err(|error| {
                AppError::Internal(format!("failed to retire token batch job: {error}"))
            })
    }
}

#[cfg(test)]
mod tests {
    use fanout_application::TokenBatchJobRegistry;
    use fanout_domain::{MessageInput, TokenBatchJob};
    use redis::AsyncCommands;

    use super::RedisTokenBatchJobRegistry;

    fn test_registries() -> Option<(RedisTokenBatchJobRegistry, RedisTokenBatchJobRegistry)> {
        let Ok(redis_url) = std::env::var("REDIS_URL") else {
            return None;
        };

        let registry_key = format!("token_batch_jobs_test:{}", uuid::Uuid::new_v4());
        let open = || match redis::Client::open(redis_url.as_str()) {
            Ok(client) => RedisTokenBatchJobRegistry::new(client, registry_key.as_str()),
            Err(error) => panic!("failed to open REDIS_URL in test: {error}"),
        };

        Some((open(), open()))
    }

    fn job(workload_id: &str) -> TokenBatchJob {
        let message = MessageInput::new("spring-sale", "Sale", "Today only")
            .unwrap_or_else(|_| unreachable!());
        TokenBatchJob::new(workload_id, message)
    }

    #[tokio::test]
    async fn published_job_reaches_every_worker_until_retired() {
        let Some((publisher, worker)) = test_registries() else {
            return;
        };
        let first = job("workload-1");
        let second = job("workload-2");

        assert!(publisher.publish(&first).await.is_ok());
        assert!(publisher.publish(&second).await.is_ok());

        let expected = vec![first.clone(), second.clone()];
        assert_eq!(publisher.list_active().await.ok(), Some(expected.clone()));
        assert_eq!(worker.list_active().await.ok(), Some(expected));

        assert!(worker.retire(first.job_id.as_str()).await.is_ok());
        assert!(worker.retire(first.job_id.as_str()).await.is_ok());
        assert_eq!(publisher.list_active().await.ok(), Some(vec![second.clone()]));

        assert!(publisher.retire(second.job_id.as_str()).await.is_ok());
        assert_eq!(worker.list_active().await.ok(), Some(Vec::new()));
    }

    #[tokio::test]
    async fn malformed_job_is_dropped_from_registry() {
        let Some((publisher, worker)) = test_registries() else {
            return;
        };
        let valid = job("workload-1");
        assert!(publisher.publish(&valid).await.is_ok());

        let mut connection = publisher
            .connection()
            .await
            .unwrap_or_else(|_| unreachable!());
        let written: redis::RedisResult<()> = connection
            .hset(publisher.registry_key.as_str(), "broken", "{not json")
            .await;
        assert!(written.is_ok());

        assert_eq!(worker.list_active().await.ok(), Some(vec![valid]));
        let remaining: redis::RedisResult<bool> = connection
            .hexists(publisher.registry_key.as_str(), "broken")
            .await;
        assert_eq!(remaining.ok(), Some(false));

        let deleted: redis::RedisResult<()> =
            connection.del(publisher.registry_key.as_str()).await;
        assert!(deleted.is_ok());
    }
}
