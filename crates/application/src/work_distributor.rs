use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fanout_core::{AppError, AppResult};
use fanout_domain::{Assignment, Workload};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::distributed_lock::LockFactory;
use crate::work_ports::{InFlightAssignment, WorkStorageProxy};

mod assignments;
mod workloads;

/// Number of assignments pushed per queue append while seeding a workload.
const SEED_BATCH_SIZE: usize = 1_000;

/// Result of running business work for one assignment.
#[derive(Debug)]
pub enum AssignmentOutcome {
    /// Work succeeded and the assignment was committed.
    Committed,
    /// Work failed; the assignment was re-enqueued from its last progress.
    RolledBack(AppError),
}

/// Splits workloads into fixed-size assignments and hands them to workers.
///
/// There is no coordinator process: every instance talks to the same storage
/// proxy, and per-assignment locks serialize progress, commit, and rollback.
/// Every pop issues a fresh claim token; only the handle holding the current
/// claim may checkpoint, commit, or roll back the assignment.
#[derive(Clone)]
pub struct WorkDistributor {
    storage: Arc<dyn WorkStorageProxy>,
    locks: LockFactory,
    distribution_size: u64,
}

impl WorkDistributor {
    /// Creates a distributor issuing `distribution_size` units per assignment.
    pub fn new(
        storage: Arc<dyn WorkStorageProxy>,
        locks: LockFactory,
        distribution_size: u64,
    ) -> AppResult<Self> {
        if distribution_size == 0 {
            return Err(AppError::Validation(
                "distribution_size must be greater than zero".to_owned(),
            ));
        }

        Ok(Self {
            storage,
            locks,
            distribution_size,
        })
    }

    /// Returns the number of units per assignment.
    #[must_use]
    pub fn distribution_size(&self) -> u64 {
        self.distribution_size
    }
}

fn assignment_lock_key(assignment_id: &str) -> String {
    format!("assignment:{assignment_id}")
}

fn superseded_claim(assignment_id: &str) -> AppError {
    AppError::InvariantViolation(format!(
        "assignment '{assignment_id}' was reclaimed and is held by another claim"
    ))
}
