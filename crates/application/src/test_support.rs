//! Fakes shared by service tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use fanout_core::{AppError, AppResult};
use fanout_domain::{Assignment, Workload};

use crate::distributed_lock::{LockFactory, LockOptions};
use crate::work_distributor::WorkDistributor;
use crate::work_ports::{InFlightAssignment, LockBackend, WorkStorageProxy, WorkloadModifier};

#[derive(Default)]
pub(crate) struct FakeLockBackend {
    held: Mutex<HashMap<String, (String, Instant)>>,
}

#[async_trait]
impl LockBackend for FakeLockBackend {
    async fn try_acquire(&self, keys: &[String], token: &str, ttl: Duration) -> AppResult<bool> {
        let mut held = self.held.lock().await;
        let now = Instant::now();
        if keys
            .iter()
            .any(|key| held.get(key).is_some_and(|(_, expires_at)| *expires_at > now))
        {
            return Ok(false);
        }
        for key in keys {
            held.insert(key.clone(), (token.to_owned(), now + ttl));
        }
        Ok(true)
    }

    async fn release(&self, keys: &[String], token: &str) -> AppResult<usize> {
        let mut held = self.held.lock().await;
        let mut released = 0;
        for key in keys {
            if held.get(key).is_some_and(|(holder, _)| holder == token) {
                held.remove(key);
                released += 1;
            }
        }
        Ok(released)
    }
}

#[derive(Default)]
struct FakeState {
    workloads: HashMap<String, Workload>,
    queues: HashMap<String, VecDeque<Assignment>>,
    in_flight: HashMap<String, InFlightAssignment>,
}

#[derive(Default)]
pub(crate) struct FakeWorkStorage {
    state: Mutex<FakeState>,
    pub(crate) fail_pushes: AtomicBool,
    /// Delay applied once, after the next in-flight listing is taken and
    /// before it is returned.
    pub(crate) delay_next_listing: Mutex<Option<Duration>>,
}

impl FakeWorkStorage {
    pub(crate) async fn queue_len(&self, workload_id: &str) -> usize {
        self.state
            .lock()
            .await
            .queues
            .get(workload_id)
            .map_or(0, VecDeque::len)
    }

    pub(crate) async fn in_flight_len(&self) -> usize {
        self.state.lock().await.in_flight.len()
    }
}

fn workload_not_found(workload_id: &str) -> AppError {
    AppError::NotFound(format!("workload '{workload_id}' does not exist"))
}

#[async_trait]
impl WorkStorageProxy for FakeWorkStorage {
    async fn save_workload(
        &self,
        _cancel: &CancellationToken,
        workload: &Workload,
    ) -> AppResult<()> {
        self.state
            .lock()
            .await
            .workloads
            .insert(workload.id().to_owned(), workload.clone());
        Ok(())
    }

    async fn insert_workload(
        &self,
        _cancel: &CancellationToken,
        workload: &Workload,
    ) -> AppResult<()> {
        let mut state = self.state.lock().await;
        if state.workloads.contains_key(workload.id()) {
            return Err(AppError::Conflict(format!(
                "workload duplication: '{}'",
                workload.id()
            )));
        }
        state
            .workloads
            .insert(workload.id().to_owned(), workload.clone());
        Ok(())
    }

    async fn get_workload(
        &self,
        _cancel: &CancellationToken,
        workload_id: &str,
    ) -> AppResult<Workload> {
        self.state
            .lock()
            .await
            .workloads
            .get(workload_id)
            .cloned()
            .ok_or_else(|| workload_not_found(workload_id))
    }

    async fn get_and_update_workload(
        &self,
        _cancel: &CancellationToken,
        workload_id: &str,
        modifier: WorkloadModifier<'_>,
    ) -> AppResult<Workload> {
        let mut state = self.state.lock().await;
        let mut workload = state
            .workloads
            .get(workload_id)
            .cloned()
            .ok_or_else(|| workload_not_found(workload_id))?;
        modifier(&mut workload)?;
        state
            .workloads
            .insert(workload_id.to_owned(), workload.clone());
        Ok(workload)
    }

    async fn delete_workload_and_assignments(
        &self,
        _cancel: &CancellationToken,
        workload_id: &str,
    ) -> AppResult<()> {
        let mut state = self.state.lock().await;
        if state.workloads.remove(workload_id).is_none() {
            return Err(workload_not_found(workload_id));
        }
        state.queues.remove(workload_id);
        state
            .in_flight
            .retain(|_, in_flight| in_flight.assignment.workload_id() != workload_id);
        Ok(())
    }

    async fn push_assignment_to_queue(
        &self,
        cancel: &CancellationToken,
        assignment: &Assignment,
    ) -> AppResult<()> {
        self.push_assignments_to_queue(cancel, std::slice::from_ref(assignment))
            .await
    }

    async fn push_assignments_to_queue(
        &self,
        _cancel: &CancellationToken,
        assignments: &[Assignment],
    ) -> AppResult<()> {
        if self.fail_pushes.load(Ordering::SeqCst) {
            return Err(AppError::Internal("queue unavailable".to_owned()));
        }

        let mut state = self.state.lock().await;
        for assignment in assignments {
            state
                .queues
                .entry(assignment.workload_id().to_owned())
                .or_default()
                .push_back(assignment.clone());
        }
        Ok(())
    }

    async fn pop_assignment_from_queue(
        &self,
        _cancel: &CancellationToken,
        workload_id: &str,
        claim_token: &str,
    ) -> AppResult<Option<Assignment>> {
        let mut state = self.state.lock().await;
        let Some(assignment) = state
            .queues
            .get_mut(workload_id)
            .and_then(VecDeque::pop_front)
        else {
            return Ok(None);
        };

        let now = Utc::now();
        state.in_flight.insert(
            assignment.id().to_owned(),
            InFlightAssignment {
                assignment: assignment.clone(),
                claim_token: claim_token.to_owned(),
                claimed_at: now,
                updated_at: now,
            },
        );
        Ok(Some(assignment.claimed(claim_token)))
    }

    async fn get_in_flight_assignment(
        &self,
        _cancel: &CancellationToken,
        workload_id: &str,
        assignment_id: &str,
    ) -> AppResult<InFlightAssignment> {
        self.state
            .lock()
            .await
            .in_flight
            .get(assignment_id)
            .filter(|in_flight| in_flight.assignment.workload_id() == workload_id)
            .cloned()
            .ok_or_else(|| {
                AppError::NotFound(format!("assignment '{assignment_id}' is not in flight"))
            })
    }

    async fn update_in_flight_assignment(
        &self,
        _cancel: &CancellationToken,
        assignment: &Assignment,
    ) -> AppResult<()> {
        let mut state = self.state.lock().await;
        let in_flight = state.in_flight.get_mut(assignment.id()).ok_or_else(|| {
            AppError::NotFound(format!("assignment '{}' is not in flight", assignment.id()))
        })?;
        in_flight.assignment = assignment.clone();
        in_flight.updated_at = Utc::now();
        Ok(())
    }

    async fn commit_in_flight_assignment(
        &self,
        _cancel: &CancellationToken,
        assignment: &Assignment,
        modifier: WorkloadModifier<'_>,
    ) -> AppResult<Workload> {
        let mut state = self.state.lock().await;
        let workload_id = assignment.workload_id();
        let mut workload = state
            .workloads
            .get(workload_id)
            .cloned()
            .ok_or_else(|| workload_not_found(workload_id))?;
        modifier(&mut workload)?;

        state
            .workloads
            .insert(workload_id.to_owned(), workload.clone());
        state.in_flight.remove(assignment.id());
        Ok(workload)
    }

    async fn requeue_in_flight_assignment(
        &self,
        _cancel: &CancellationToken,
        assignment: &Assignment,
    ) -> AppResult<()> {
        let mut state = self.state.lock().await;
        if state.in_flight.remove(assignment.id()).is_none() {
            return Err(AppError::NotFound(format!(
                "assignment '{}' is not in flight",
                assignment.id()
            )));
        }
        state
            .queues
            .entry(assignment.workload_id().to_owned())
            .or_default()
            .push_back(assignment.clone());
        Ok(())
    }

    async fn list_in_flight_assignments(
        &self,
        _cancel: &CancellationToken,
        workload_id: &str,
    ) -> AppResult<Vec<InFlightAssignment>> {
        let delay = self.delay_next_listing.lock().await.take();
        let listed: Vec<InFlightAssignment> = self
            .state
            .lock()
            .await
            .in_flight
            .values()
            .filter(|in_flight| in_flight.assignment.workload_id() == workload_id)
            .cloned()
            .collect();

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(listed)
    }
}

pub(crate) fn build_distributor(distribution_size: u64) -> (WorkDistributor, Arc<FakeWorkStorage>) {
    let storage = Arc::new(FakeWorkStorage::default());
    let locks = LockFactory::new(
        Arc::new(FakeLockBackend::default()),
        LockOptions {
            ttl: Duration::from_secs(5),
            max_wait: Duration::from_secs(5),
            retry_wait_min: Duration::from_millis(1),
            retry_wait_max: Duration::from_millis(3),
        },
    )
    .unwrap_or_else(|_| unreachable!());
    let distributor = WorkDistributor::new(storage.clone(), locks, distribution_size)
        .unwrap_or_else(|_| unreachable!());

    (distributor, storage)
}
