use chrono::{DateTime, Utc};
use fanout_core::{AppError, AppResult, NonEmptyString};
use serde::{Deserialize, Serialize};

/// Partitioning job over a contiguous, 1-based unit space.
///
/// A workload is split into `ceil(total_work_units / units_per_assignment)`
/// assignments. Fulfillment is derived from the committed counter and is the
/// only completion state a workload has.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workload {
    id: NonEmptyString,
    #[serde(rename = "total_units")]
    total_work_units: u64,
    #[serde(rename = "dist_size")]
    units_per_assignment: u64,
    #[serde(rename = "total_committed")]
    total_committed_assignments: u64,
    created_at: DateTime<Utc>,
}

impl Workload {
    /// Creates a validated workload with no committed assignments.
    pub fn new(
        id: impl Into<String>,
        total_work_units: u64,
        units_per_assignment: u64,
    ) -> AppResult<Self> {
        if total_work_units == 0 {
            return Err(AppError::Validation(
                "workload empty: total_work_units must be greater than zero".to_owned(),
            ));
        }

        let id = NonEmptyString::new(id).map_err(|_| {
            AppError::Validation("workload attributes invalid: id must not be empty".to_owned())
        })?;

        let workload = Self {
            id,
            total_work_units,
            units_per_assignment,
            total_committed_assignments: 0,
            created_at: Utc::now(),
        };
        workload.validate()?;

        Ok(workload)
    }

    /// Checks attribute constraints, including records decoded from storage.
    pub fn validate(&self) -> AppResult<()> {
        if self.total_work_units == 0 {
            return Err(AppError::Validation(format!(
                "workload attributes invalid: workload '{}' has zero work units",
                self.id
            )));
        }

        if self.units_per_assignment == 0 {
            return Err(AppError::Validation(format!(
                "workload attributes invalid: workload '{}' has zero units per assignment",
                self.id
            )));
        }

        if self.total_committed_assignments > self.expected_total_assignments() {
            return Err(AppError::Validation(format!(
                "workload attributes invalid: workload '{}' committed {} of {} assignments",
                self.id,
                self.total_committed_assignments,
                self.expected_total_assignments()
            )));
        }

        Ok(())
    }

    /// Returns the workload identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        self.id.as_str()
    }

    /// Returns the total number of units in the workload.
    #[must_use]
    pub fn total_work_units(&self) -> u64 {
        self.total_work_units
    }

    /// Returns the fixed number of units per assignment.
    #[must_use]
    pub fn units_per_assignment(&self) -> u64 {
        self.units_per_assignment
    }

    /// Returns the number of committed assignments.
    #[must_use]
    pub fn total_committed_assignments(&self) -> u64 {
        self.total_committed_assignments
    }

    /// Returns when the workload was created.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Returns `ceil(total_work_units / units_per_assignment)`.
    #[must_use]
    pub fn expected_total_assignments(&self) -> u64 {
        self.total_work_units.div_ceil(self.units_per_assignment)
    }

    /// Returns how many assignments still have to be committed.
    #[must_use]
    pub fn total_pending_assignments(&self) -> u64 {
        self.expected_total_assignments()
            .saturating_sub(self.total_committed_assignments)
    }

    /// Returns whether every expected assignment has been committed.
    #[must_use]
    pub fn has_fulfilled(&self) -> bool {
        self.total_committed_assignments == self.expected_total_assignments()
    }

    /// Records one more committed assignment.
    pub fn increase_total_committed_assignments(&mut self) -> AppResult<()> {
        if self.total_committed_assignments >= self.expected_total_assignments() {
            return Err(AppError::InvariantViolation(format!(
                "unexpected workload total committed assignments: workload '{}' already committed {} of {}",
                self.id,
                self.total_committed_assignments,
                self.expected_total_assignments()
            )));
        }

        self.total_committed_assignments += 1;
        Ok(())
    }

    /// Yields the inclusive `(start, end)` range of every assignment, in order.
    ///
    /// Ranges are contiguous and non-overlapping; the last one may be shorter.
    pub fn assignment_ranges(&self) -> impl Iterator<Item = (u64, u64)> + use<> {
        let total = self.total_work_units;
        let size = self.units_per_assignment;

        (0..self.expected_total_assignments()).map(move |index| {
            let start = index * size + 1;
            let end = start.saturating_add(size - 1).min(total);
            (start, end)
        })
    }
}
