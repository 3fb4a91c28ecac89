use std::sync::Arc;
use std::time::Duration;

use fanout_core::{AppError, AppResult};
use fanout_domain::{Assignment, MessageInput, PushNotiMessage, TokenBatchJob};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::token_batch_ports::{DeviceTokenRepository, PushNotificationSink, TokenBatchJobRegistry};
use crate::work_distributor::{AssignmentOutcome, WorkDistributor};

/// Consume-loop tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBatchOptions {
    /// Poll interval while waiting for assignments, also used as the back-off
    /// after a retryable failure.
    pub poll_interval: Duration,
    /// Devices per delivered batch; progress is checkpointed after each one.
    pub send_batch_size: usize,
}

impl Default for TokenBatchOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(10),
            send_batch_size: 500,
        }
    }
}

/// Counters reported when a consume loop stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeSummary {
    /// Assignments this loop committed.
    pub committed: usize,
    /// Assignments this loop rolled back after a failed delivery.
    pub rolled_back: usize,
    /// Whether the loop stopped because every assignment was committed.
    pub fulfilled: bool,
}

/// Turns campaign messages into workloads of device ranges and delivers one
/// notification batch per assignment.
#[derive(Clone)]
pub struct TokenBatchDistributor {
    distributor: WorkDistributor,
    device_tokens: Arc<dyn DeviceTokenRepository>,
    jobs: Arc<dyn TokenBatchJobRegistry>,
    sink: Arc<dyn PushNotificationSink>,
    options: TokenBatchOptions,
}

impl TokenBatchDistributor {
    /// Creates a token batch distributor.
    pub fn new(
        distributor: WorkDistributor,
        device_tokens: Arc<dyn DeviceTokenRepository>,
        jobs: Arc<dyn TokenBatchJobRegistry>,
        sink: Arc<dyn PushNotificationSink>,
        options: TokenBatchOptions,
    ) -> AppResult<Self> {
        if options.poll_interval.is_zero() {
            return Err(AppError::Validation(
                "poll_interval must be greater than zero".to_owned(),
            ));
        }
        if options.send_batch_size == 0 {
            return Err(AppError::Validation(
                "send_batch_size must be greater than zero".to_owned(),
            ));
        }

        Ok(Self {
            distributor,
            device_tokens,
            jobs,
            sink,
            options,
        })
    }

    /// Returns the underlying work distributor.
    #[must_use]
    pub fn work_distributor(&self) -> &WorkDistributor {
        &self.distributor
    }

    /// Partitions the campaign's devices into a workload and publishes the
    /// job announcing it.
    ///
    /// Returns `None` without publishing when the campaign has no devices.
    pub async fn create_batch_job(
        &self,
        cancel: &CancellationToken,
        message: MessageInput,
    ) -> AppResult<Option<TokenBatchJob>> {
        message.validate()?;

        let device_count = self
            .device_tokens
            .count_devices_for_campaign(message.campaign.as_str())
            .await?;
        if device_count == 0 {
            info!(campaign = %message.campaign, "campaign has no devices, skipping job");
            return Ok(None);
        }

        let workload = self.distributor.create_workload(cancel, device_count).await?;
        let job = TokenBatchJob::new(workload.id(), message);
        self.jobs.publish(&job).await?;

        info!(
            job_id = %job.job_id,
            campaign = %job.message.campaign,
            device_count,
            "token batch job published"
        );
        Ok(Some(job))
    }

    /// Returns every job still announced to workers.
    pub async fn active_jobs(&self) -> AppResult<Vec<TokenBatchJob>> {
        self.jobs.list_active().await
    }

    /// Claims and delivers assignments of `job` until the workload is
    /// fulfilled or `cancel` fires.
    ///
    /// Every worker may consume the same job at once; each claims disjoint
    /// assignments. The job is retired once its workload is fulfilled.
    /// Retryable failures are logged and retried after the poll interval;
    /// anything else stops the loop.
    pub async fn consume_job(
        &self,
        cancel: &CancellationToken,
        job: &TokenBatchJob,
    ) -> AppResult<ConsumeSummary> {
        let mut summary = ConsumeSummary::default();

        loop {
            let assignment = match self
                .distributor
                .wait_for_assignment(cancel, self.options.poll_interval, job.job_id.as_str())
                .await
            {
                Ok(assignment) => assignment,
                Err(AppError::WorkloadFulfilled(_)) => {
                    summary.fulfilled = true;
                    self.retire(job).await;
                    break;
                }
                Err(AppError::Cancelled(_)) => break,
                Err(error) if error.is_retryable() => {
                    warn!(job_id = %job.job_id, error = %error, "waiting for assignment failed");
                    if self.back_off(cancel).await {
                        break;
                    }
                    continue;
                }
                Err(error) => return Err(error),
            };

            match self
                .distributor
                .handle_assignment(cancel, &assignment, || {
                    self.deliver(cancel, &job.message, &assignment)
                })
                .await
            {
                Ok(AssignmentOutcome::Committed) => summary.committed += 1,
                Ok(AssignmentOutcome::RolledBack(_)) => {
                    summary.rolled_back += 1;
                    if self.back_off(cancel).await {
                        break;
                    }
                }
                Err(AppError::Cancelled(_)) => break,
                Err(error @ (AppError::InvariantViolation(_) | AppError::NotFound(_))) => {
                    warn!(
                        job_id = %job.job_id,
                        assignment_id = %assignment.id(),
                        error = %error,
                        "assignment was reclaimed before it could be settled"
                    );
                }
                Err(error) if error.is_retryable() => {
                    warn!(
                        job_id = %job.job_id,
                        assignment_id = %assignment.id(),
                        error = %error,
                        "settling assignment failed; it stays in flight until reclaimed"
                    );
                    if self.back_off(cancel).await {
                        break;
                    }
                }
                Err(error) => return Err(error),
            }
        }

        info!(
            job_id = %job.job_id,
            committed = summary.committed,
            rolled_back = summary.rolled_back,
            fulfilled = summary.fulfilled,
            "token batch consumer stopped"
        );
        Ok(summary)
    }

    async fn deliver(
        &self,
        cancel: &CancellationToken,
        message: &MessageInput,
        assignment: &Assignment,
    ) -> AppResult<()> {
        let start_index = assignment.work_start_at();
        let device_tokens = self
            .device_tokens
            .get_device_tokens_for_campaign(
                message.campaign.as_str(),
                start_index,
                assignment.work_end_at(),
            )
            .await?;

        let mut delivered_until = start_index - 1;
        for batch in device_tokens.chunks(self.options.send_batch_size) {
            self.sink
                .send(&PushNotiMessage {
                    message: message.clone(),
                    device_tokens: batch.to_vec(),
                })
                .await?;

            delivered_until += batch.len() as u64;
            self.distributor
                .progress(cancel, assignment, delivered_until.min(assignment.end_index()))
                .await?;
        }

        debug!(
            assignment_id = %assignment.id(),
            start_index,
            end_index = assignment.work_end_at(),
            device_count = device_tokens.len(),
            "assignment delivered"
        );
        Ok(())
    }

    async fn retire(&self, job: &TokenBatchJob) {
        match self.jobs.retire(job.job_id.as_str()).await {
            Ok(()) => debug!(job_id = %job.job_id, "token batch job retired"),
            Err(error) => warn!(
                job_id = %job.job_id,
                error = %error,
                "retiring fulfilled token batch job failed"
            ),
        }
    }

    async fn back_off(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            () = cancel.cancelled() => true,
            () = tokio::time::sleep(self.options.poll_interval) => false,
        }
    }
}
