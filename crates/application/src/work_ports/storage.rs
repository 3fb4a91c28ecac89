use async_trait::async_trait;
use fanout_core::AppResult;
use fanout_domain::{Assignment, Workload};
use tokio_util::sync::CancellationToken;

use super::in_flight::InFlightAssignment;

/// Pure mutation applied to a workload inside an atomic read-modify-write.
pub type WorkloadModifier<'a> = &'a (dyn Fn(&mut Workload) -> AppResult<()> + Send + Sync);

/// Persistence and queueing port for workloads and their assignments.
///
/// Every operation must be safe for concurrent callers across processes.
/// The cancellation token bounds any lock wait an implementation performs.
#[async_trait]
pub trait WorkStorageProxy: Send + Sync {
    /// Creates or overwrites workload metadata.
    async fn save_workload(&self, cancel: &CancellationToken, workload: &Workload)
    -> AppResult<()>;

    /// Creates workload metadata, failing with a conflict when the id exists.
    async fn insert_workload(
        &self,
        cancel: &CancellationToken,
        workload: &Workload,
    ) -> AppResult<()>;

    /// Returns current workload metadata or a not-found error.
    async fn get_workload(&self, cancel: &CancellationToken, workload_id: &str)
    -> AppResult<Workload>;

    /// Fetches, mutates, and stores one workload as a single atomic section.
    async fn get_and_update_workload(
        &self,
        cancel: &CancellationToken,
        workload_id: &str,
        modifier: WorkloadModifier<'_>,
    ) -> AppResult<Workload>;

    /// Removes the workload, drains its queue, and forgets its in-flight
    /// assignments.
    async fn delete_workload_and_assignments(
        &self,
        cancel: &CancellationToken,
        workload_id: &str,
    ) -> AppResult<()>;

    /// Appends one assignment to the tail of its workload queue.
    async fn push_assignment_to_queue(
        &self,
        cancel: &CancellationToken,
        assignment: &Assignment,
    ) -> AppResult<()>;

    /// Appends assignments, in order, to the tail of their workload queue.
    async fn push_assignments_to_queue(
        &self,
        cancel: &CancellationToken,
        assignments: &[Assignment],
    ) -> AppResult<()>;

    /// Atomically removes the head assignment and records it as in flight
    /// under `claim_token`.
    ///
    /// The returned assignment carries the claim token. Returns `None` when
    /// the queue is empty.
    async fn pop_assignment_from_queue(
        &self,
        cancel: &CancellationToken,
        workload_id: &str,
        claim_token: &str,
    ) -> AppResult<Option<Assignment>>;

    /// Returns one in-flight assignment or a not-found error.
    async fn get_in_flight_assignment(
        &self,
        cancel: &CancellationToken,
        workload_id: &str,
        assignment_id: &str,
    ) -> AppResult<InFlightAssignment>;

    /// Stores new progress for an in-flight assignment without touching the
    /// queue or its claim, and refreshes its `updated_at`.
    async fn update_in_flight_assignment(
        &self,
        cancel: &CancellationToken,
        assignment: &Assignment,
    ) -> AppResult<()>;

    /// Applies `modifier` to the owning workload and drops the in-flight
    /// record, atomically.
    async fn commit_in_flight_assignment(
        &self,
        cancel: &CancellationToken,
        assignment: &Assignment,
        modifier: WorkloadModifier<'_>,
    ) -> AppResult<Workload>;

    /// Pushes the assignment to the tail of its queue and drops the in-flight
    /// record, atomically.
    async fn requeue_in_flight_assignment(
        &self,
        cancel: &CancellationToken,
        assignment: &Assignment,
    ) -> AppResult<()>;

    /// Lists in-flight assignments of one workload.
    async fn list_in_flight_assignments(
        &self,
        cancel: &CancellationToken,
        workload_id: &str,
    ) -> AppResult<Vec<InFlightAssignment>>;
}
