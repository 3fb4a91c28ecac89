use async_trait::async_trait;
use fanout_core::AppResult;
use fanout_domain::{PushNotiMessage, TokenBatchJob};

/// Lookup port for devices enrolled in a campaign.
///
/// Devices are addressed by a 1-based index that is stable for the lifetime
/// of a job.
#[async_trait]
pub trait DeviceTokenRepository: Send + Sync {
    /// Counts devices enrolled in `campaign`.
    async fn count_devices_for_campaign(&self, campaign: &str) -> AppResult<u64>;

    /// Returns the tokens of devices `start_index..=end_index`.
    async fn get_device_tokens_for_campaign(
        &self,
        campaign: &str,
        start_index: u64,
        end_index: u64,
    ) -> AppResult<Vec<String>>;
}

/// Registry port announcing token batch jobs to every worker.
///
/// A published job stays visible to all workers until it is retired, so each
/// worker joins the same workload instead of one worker taking the job.
#[async_trait]
pub trait TokenBatchJobRegistry: Send + Sync {
    /// Announces one job.
    async fn publish(&self, job: &TokenBatchJob) -> AppResult<()>;

    /// Returns every job announced and not yet retired.
    async fn list_active(&self) -> AppResult<Vec<TokenBatchJob>>;

    /// Stops announcing a job. Retiring an unknown job is a no-op.
    async fn retire(&self, job_id: &str) -> AppResult<()>;
}

/// Delivery port for built notification batches.
#[async_trait]
pub trait PushNotificationSink: Send + Sync {
    /// Delivers one batch.
    async fn send(&self, message: &PushNotiMessage) -> AppResult<()>;
}
