//! Fanout worker runtime: polls announced token batch jobs and delivers
//! their device-range assignments alongside every other worker.

#![forbid(unsafe_code)]

mod worker_config;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use fanout_application::{
    LockFactory, TokenBatchDistributor, TokenBatchJobRegistry, WorkDistributor,
};
use fanout_core::{AppError, AppResult};
use fanout_domain::{MessageInput, TokenBatchJob};
use fanout_infrastructure::{
    ConsolePushNotificationSink, HttpDeviceTokenRepository, RedisLockBackend,
    RedisTokenBatchJobRegistry, RedisWorkStorageProxy,
};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::worker_config::{WorkerCommand, WorkerConfig, init_tracing};

#[tokio::main]
async fn main() -> Result<(), AppError> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = Arc::new(WorkerConfig::load()?);
    let redis_client = redis::Client::open(config.redis_url.as_str())
        .map_err(|error| AppError::Internal(format!("invalid REDIS_URL: {error}")))?;
    let jobs: Arc<dyn TokenBatchJobRegistry> = Arc::new(RedisTokenBatchJobRegistry::new(
        redis_client.clone(),
        config.token_batch_job_registry_key.as_str(),
    ));
    let service = build_token_batch_distributor(&config, redis_client, jobs)?;

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("shutdown requested"),
            Err(error) => warn!(error = %error, "failed to listen for ctrl-c"),
        }
        shutdown.cancel();
    });

    match &config.command {
        WorkerCommand::Enqueue {
            campaign,
            title,
            body,
        } => {
            let message = MessageInput::new(campaign.as_str(), title.as_str(), body.as_str())?;
            match service.create_batch_job(&cancel, message).await? {
                Some(job) => info!(job_id = %job.job_id, "token batch job published"),
                None => info!(campaign = %campaign, "campaign has no devices, nothing published"),
            }
            Ok(())
        }
        WorkerCommand::Consume => consume_jobs(config.clone(), &service, &cancel).await,
    }
}

fn build_token_batch_distributor(
    config: &WorkerConfig,
    redis_client: redis::Client,
    jobs: Arc<dyn TokenBatchJobRegistry>,
) -> AppResult<TokenBatchDistributor> {
    let locks = LockFactory::new(
        Arc::new(RedisLockBackend::new(
            redis_client.clone(),
            config.distributed_lock_key_prefix.as_str(),
        )),
        config.lock_options(),
    )?;
    let storage = Arc::new(RedisWorkStorageProxy::new(
        redis_client,
        config.work_distributor_key_prefix.as_str(),
        locks.clone(),
    ));
    let distributor = WorkDistributor::new(storage, locks, config.distribution_size)?;

    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(15))
        .build()
        .map_err(|error| AppError::Internal(format!("failed to build HTTP client: {error}")))?;
    let device_tokens = Arc::new(HttpDeviceTokenRepository::new(
        http_client,
        config.user_service_base_url.as_str(),
        3,
        200,
    )?);

    TokenBatchDistributor::new(
        distributor,
        device_tokens,
        jobs,
        Arc::new(ConsolePushNotificationSink::new()),
        config.token_batch_options(),
    )
}

/// Polls the job registry and runs every announced job this worker is not
/// already running. A finished job is not restarted while it stays listed.
async fn consume_jobs(
    config: Arc<WorkerConfig>,
    service: &TokenBatchDistributor,
    cancel: &CancellationToken,
) -> AppResult<()> {
    info!(
        worker_id = %config.worker_id,
        concurrency = config.worker_concurrency,
        distribution_size = config.distribution_size,
        registry_key = %config.token_batch_job_registry_key,
        "fanout-worker started"
    );

    let mut running: HashMap<String, JoinHandle<()>> = HashMap::new();
    let mut ticker = tokio::time::interval(config.job_poll_interval());

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let jobs = match service.active_jobs().await {
            Ok(jobs) => jobs,
            Err(error) => {
                warn!(
                    worker_id = %config.worker_id,
                    error = %error,
                    "failed to list token batch jobs"
                );
                continue;
            }
        };

        let active: HashSet<&str> = jobs.iter().map(|job| job.job_id.as_str()).collect();
        running.retain(|job_id, handle| !handle.is_finished() || active.contains(job_id.as_str()));

        for job in &jobs {
            if running.contains_key(job.job_id.as_str()) {
                continue;
            }

            let handle = tokio::spawn(run_job(
                config.clone(),
                service.clone(),
                job.clone(),
                cancel.clone(),
            ));
            running.insert(job.job_id.clone(), handle);
        }
    }

    for (job_id, handle) in running {
        if let Err(error) = handle.await {
            warn!(job_id = %job_id, error = %error, "token batch job task panicked");
        }
    }

    info!(worker_id = %config.worker_id, "fanout-worker stopped");
    Ok(())
}

async fn run_job(
    config: Arc<WorkerConfig>,
    service: TokenBatchDistributor,
    job: TokenBatchJob,
    cancel: CancellationToken,
) {
    info!(
        worker_id = %config.worker_id,
        job_id = %job.job_id,
        campaign = %job.message.campaign,
        "joining token batch job"
    );

    let job = Arc::new(job);
    let job_cancel = cancel.child_token();
    let reclaimer = tokio::spawn(reclaim_abandoned_assignments(
        service.work_distributor().clone(),
        job.job_id.clone(),
        config.reclaim_after(),
        job_cancel.clone(),
    ));

    let mut consumers = JoinSet::new();
    for _ in 0..config.worker_concurrency {
        let service = service.clone();
        let job = job.clone();
        let cancel = job_cancel.clone();
        consumers.spawn(async move { service.consume_job(&cancel, &job).await });
    }

    while let Some(joined) = consumers.join_next().await {
        match joined {
            Ok(Ok(summary)) => info!(
                worker_id = %config.worker_id,
                job_id = %job.job_id,
                committed = summary.committed,
                rolled_back = summary.rolled_back,
                fulfilled = summary.fulfilled,
                "token batch consumer finished"
            ),
            Ok(Err(error)) => warn!(
                worker_id = %config.worker_id,
                job_id = %job.job_id,
                error = %error,
                "token batch consumer failed"
            ),
            Err(error) => warn!(
                worker_id = %config.worker_id,
                job_id = %job.job_id,
                error = %error,
                "token batch consumer task panicked"
            ),
        }
    }

    job_cancel.cancel();
    if let Err(error) = reclaimer.await {
        warn!(job_id = %job.job_id, error = %error, "reclaim task panicked");
    }
}

async fn reclaim_abandoned_assignments(
    distributor: WorkDistributor,
    workload_id: String,
    reclaim_after: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval((reclaim_after / 2).max(Duration::from_secs(1)));
    ticker.tick().await;

    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        match distributor
            .reclaim_abandoned_assignments(&cancel, workload_id.as_str(), reclaim_after)
            .await
        {
            Ok(_) | Err(AppError::Cancelled(_)) => {}
            Err(AppError::NotFound(_)) => return,
            Err(error) => warn!(
                workload_id = %workload_id,
                error = %error,
                "failed to reclaim abandoned assignments"
            ),
        }
    }
}
