use std::sync::Arc;
use std::time::Duration;

use fanout_application::{LockFactory, LockOptions, WorkDistributor, WorkStorageProxy};
use fanout_core::AppError;
use fanout_domain::Workload;
use redis::AsyncCommands;
use tokio_util::sync::CancellationToken;

use super::RedisWorkStorageProxy;
use crate::{InMemoryLockBackend, RedisLockBackend};

fn test_storage() -> Option<Arc<RedisWorkStorageProxy>> {
    let Ok(redis_url) = std::env::var("REDIS_URL") else {
        return None;
    };

    let client = match redis::Client::open(redis_url) {
        Ok(client) => client,
        Err(error) => panic!("failed to open REDIS_URL in test: {error}"),
    };

    let namespace = uuid::Uuid::new_v4();
    let locks = match LockFactory::new(
        Arc::new(RedisLockBackend::new(
            client.clone(),
            format!("distributed_lock_test:{namespace}"),
        )),
        LockOptions::default(),
    ) {
        Ok(locks) => locks,
        Err(error) => panic!("failed to build lock factory in test: {error}"),
    };

    Some(Arc::new(RedisWorkStorageProxy::new(
        client,
        format!("work_distributor_test:{namespace}"),
        locks,
    )))
}

fn distributor(storage: Arc<RedisWorkStorageProxy>) -> WorkDistributor {
    let locks = LockFactory::new(
        Arc::new(InMemoryLockBackend::new()),
        LockOptions::default(),
    )
    .unwrap_or_else(|_| unreachable!());

    WorkDistributor::new(storage, locks, 10).unwrap_or_else(|_| unreachable!())
}

#[tokio::test]
async fn insert_rejects_duplicate_workload() {
    let Some(storage) = test_storage() else {
        return;
    };
    let cancel = CancellationToken::new();
    let workload = Workload::new("duplicate", 100, 10).unwrap_or_else(|_| unreachable!());

    assert!(storage.insert_workload(&cancel, &workload).await.is_ok());
    assert!(matches!(
        storage.insert_workload(&cancel, &workload).await,
        Err(AppError::Conflict(_))
    ));

    let loaded = storage.get_workload(&cancel, "duplicate").await;
    assert_eq!(loaded.ok(), Some(workload));
}

#[tokio::test]
async fn missing_workload_is_not_found() {
    let Some(storage) = test_storage() else {
        return;
    };

    assert!(matches!(
        storage
            .get_workload(&CancellationToken::new(), "missing")
            .await,
        Err(AppError::NotFound(_))
    ));
}

#[tokio::test]
async fn pop_records_assignment_in_flight() {
    let Some(storage) = test_storage() else {
        return;
    };
    let cancel = CancellationToken::new();
    let distributor = distributor(storage.clone());
    let workload = distributor
        .create_workload(&cancel, 25)
        .await
        .unwrap_or_else(|_| unreachable!());

    let popped = storage
        .pop_assignment_from_queue(&cancel, workload.id(), "claim-\"1\"")
        .await
        .unwrap_or_else(|_| unreachable!())
        .unwrap_or_else(|| unreachable!());
    assert_eq!((popped.start_index(), popped.end_index()), (1, 10));
    assert_eq!(popped.claim_token(), Some("claim-\"1\""));

    let in_flight = storage
        .get_in_flight_assignment(&cancel, workload.id(), popped.id())
        .await
        .unwrap_or_else(|_| unreachable!());
    assert_eq!(in_flight.claim_token, "claim-\"1\"");
    assert_eq!(in_flight.assignment.id(), popped.id());
    assert_eq!(in_flight.assignment.progress(), popped.progress());
    assert_eq!(in_flight.claimed_at, in_flight.updated_at);

    let listed = storage
        .list_in_flight_assignments(&cancel, workload.id())
        .await
        .unwrap_or_default();
    assert_eq!(listed.len(), 1);
}

#[tokio::test]
async fn distributor_runs_rollback_and_commit_on_redis() {
    let Some(storage) = test_storage() else {
        return;
    };
    let cancel = CancellationToken::new();
    let distributor = distributor(storage.clone());
    let workload = distributor
        .create_workload_with_id(&cancel, "campaign-7", 30)
        .await
        .unwrap_or_else(|_| unreachable!());

    let first = distributor
        .next_assignment(&cancel, workload.id())
        .await
        .unwrap_or_else(|_| unreachable!())
        .unwrap_or_else(|| unreachable!());
    assert!(distributor.progress(&cancel, &first, 4).await.is_ok());
    assert!(distributor.rollback(&cancel, &first).await.is_ok());

    let mut resumed_start = None;
    loop {
        match distributor
            .wait_for_assignment(&cancel, Duration::from_millis(5), workload.id())
            .await
        {
            Ok(assignment) => {
                if assignment.id() == first.id() {
                    resumed_start = Some(assignment.start_index());
                }
                assert!(distributor.commit(&cancel, &assignment).await.is_ok());
            }
            Err(AppError::WorkloadFulfilled(_)) => break,
            Err(error) => panic!("unexpected distributor error: {error}"),
        }
    }

    assert_eq!(resumed_start, Some(5));
    assert!(matches!(
        distributor.commit(&cancel, &first).await,
        Err(AppError::InvariantViolation(_))
    ));

    let stored = distributor
        .get_workload(&cancel, workload.id())
        .await
        .unwrap_or_else(|_| unreachable!());
    assert_eq!(stored.total_committed_assignments(), 3);

    assert!(
        distributor
            .delete_workload_and_assignments(&cancel, workload.id())
            .await
            .is_ok()
    );
}

#[tokio::test]
async fn delete_leaves_no_keys_behind() {
    let Some(storage) = test_storage() else {
        return;
    };
    let cancel = CancellationToken::new();
    let distributor = distributor(storage.clone());
    let workload = distributor
        .create_workload(&cancel, 20)
        .await
        .unwrap_or_else(|_| unreachable!());
    let claimed = distributor
        .next_assignment(&cancel, workload.id())
        .await
        .unwrap_or_else(|_| unreachable!())
        .unwrap_or_else(|| unreachable!());

    assert!(
        storage
            .delete_workload_and_assignments(&cancel, workload.id())
            .await
            .is_ok()
    );

    assert!(matches!(
        storage
            .get_in_flight_assignment(&cancel, workload.id(), claimed.id())
            .await,
        Err(AppError::NotFound(_))
    ));
    assert!(matches!(
        storage
            .pop_assignment_from_queue(&cancel, workload.id(), "claim-2")
            .await,
        Ok(None)
    ));

    let mut connection = storage
        .client
        .get_multiplexed_async_connection()
        .await
        .unwrap_or_else(|_| unreachable!());
    let remaining: Vec<String> = connection
        .keys(format!("{}:*", storage.key_prefix))
        .await
        .unwrap_or_else(|_| unreachable!());
    assert!(remaining.is_empty(), "keys left after delete: {remaining:?}");
}

#[tokio::test]
async fn stale_claim_cannot_commit_after_reclaim() {
    let Some(storage) = test_storage() else {
        return;
    };
    let cancel = CancellationToken::new();
    let distributor = distributor(storage.clone());
    let workload = distributor
        .create_workload(&cancel, 10)
        .await
        .unwrap_or_else(|_| unreachable!());
    let stale = distributor
        .next_assignment(&cancel, workload.id())
        .await
        .unwrap_or_else(|_| unreachable!())
        .unwrap_or_else(|| unreachable!());

    let reclaimed = distributor
        .reclaim_abandoned_assignments(&cancel, workload.id(), Duration::ZERO)
        .await;
    assert_eq!(reclaimed.ok(), Some(1));
    let live = distributor
        .next_assignment(&cancel, workload.id())
        .await
        .unwrap_or_else(|_| unreachable!())
        .unwrap_or_else(|| unreachable!());

    assert!(matches!(
        distributor.commit(&cancel, &stale).await,
        Err(AppError::InvariantViolation(_))
    ));
    assert!(distributor.commit(&cancel, &live).await.is_ok());
    assert!(
        distributor
            .has_workload_fulfilled(&cancel, workload.id())
            .await
            .unwrap_or(false)
    );
}
