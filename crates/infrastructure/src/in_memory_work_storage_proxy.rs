use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::Utc;
use fanout_application::{InFlightAssignment, WorkStorageProxy, WorkloadModifier};
use fanout_core::{AppError, AppResult};
use fanout_domain::{Assignment, Workload};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct WorkStorageState {
    workloads: HashMap<String, Workload>,
    queues: HashMap<String, VecDeque<Assignment>>,
    in_flight: HashMap<String, InFlightAssignment>,
}

/// In-process work storage for tests and single-process runs.
///
/// Every operation runs under one mutex, so no distributed lock is needed.
#[derive(Default)]
pub struct InMemoryWorkStorageProxy {
    state: Mutex<WorkStorageState>,
}

impl InMemoryWorkStorageProxy {
    /// Creates empty storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns how many assignments are queued for a workload.
    pub async fn queued_assignments(&self, workload_id: &str) -> usize {
        self.state
            .lock()
            .await
            .queues
            .get(workload_id)
            .map_or(0, VecDeque::len)
    }
}

fn workload_not_exists(workload_id: &str) -> AppError {
    AppError::NotFound(format!("workload '{workload_id}' does not exist"))
}

fn not_in_flight(assignment_id: &str) -> AppError {
    AppError::NotFound(format!("assignment '{assignment_id}' is not in flight"))
}

#[async_trait]
impl WorkStorageProxy for InMemoryWorkStorageProxy {
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
                "workload duplication: workload '{}' already exists",
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
            .ok_or_else(|| workload_not_exists(workload_id))
    }

    async fn get_and_update_workload(
        &self,
        _cancel: &CancellationToken,
        workload_id: &str,
        modifier: WorkloadModifier<'_>,
    ) -> AppResult<Workload> {
        let mut state = self.state.lock().await;
        let workload = state
            .workloads
            .get_mut(workload_id)
            .ok_or_else(|| workload_not_exists(workload_id))?;

        let mut updated = workload.clone();
        modifier(&mut updated)?;
        *workload = updated.clone();

        Ok(updated)
    }

    async fn delete_workload_and_assignments(
        &self,
        _cancel: &CancellationToken,
        workload_id: &str,
    ) -> AppResult<()> {
        let mut state = self.state.lock().await;
        if state.workloads.remove(workload_id).is_none() {
            return Err(workload_not_exists(workload_id));
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

        let claimed_at = Utc::now();
        state.in_flight.insert(
            assignment.id().to_owned(),
            InFlightAssignment {
                assignment: assignment.clone(),
                claim_token: claim_token.to_owned(),
                claimed_at,
                updated_at: claimed_at,
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
            .ok_or_else(|| not_in_flight(assignment_id))
    }

    async fn update_in_flight_assignment(
        &self,
        _cancel: &CancellationToken,
        assignment: &Assignment,
    ) -> AppResult<()> {
        let mut state = self.state.lock().await;
        let in_flight = state
            .in_flight
            .get_mut(assignment.id())
            .ok_or_else(|| not_in_flight(assignment.id()))?;

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
        if !state.in_flight.contains_key(assignment.id()) {
            return Err(not_in_flight(assignment.id()));
        }

        let workload_id = assignment.workload_id();
        let workload = state
            .workloads
            .get_mut(workload_id)
            .ok_or_else(|| workload_not_exists(workload_id))?;

        let mut updated = workload.clone();
        modifier(&mut updated)?;
        *workload = updated.clone();
        state.in_flight.remove(assignment.id());

        Ok(updated)
    }

    async fn requeue_in_flight_assignment(
        &self,
        _cancel: &CancellationToken,
        assignment: &Assignment,
    ) -> AppResult<()> {
        let mut state = self.state.lock().await;
        if state.in_flight.remove(assignment.id()).is_none() {
            return Err(not_in_flight(assignment.id()));
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
        Ok(self
            .state
            .lock()
            .await
            .in_flight
            .values()
            .filter(|in_flight| in_flight.assignment.workload_id() == workload_id)
            .cloned()
            .collect())
    }
}
