use fanout_core::{AppError, AppResult, NonEmptyString};
use serde::{Deserialize, Serialize};

/// One claimable, inclusive unit range of a workload.
///
/// The range bounds are fixed at issuance except for `start_index`, which only
/// moves forward when a failed attempt is resumed from its last progress.
/// `progress` is the last unit index processed; `start_index - 1` means none.
///
/// An assignment popped from its queue carries the claim token it was issued
/// under. The token is never persisted with the assignment itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    id: NonEmptyString,
    workload_id: NonEmptyString,
    #[serde(rename = "start_idx")]
    start_index: u64,
    #[serde(rename = "end_idx")]
    end_index: u64,
    progress: u64,
    #[serde(skip)]
    claim_token: Option<String>,
}

impl Assignment {
    /// Creates a validated assignment with no recorded progress.
    pub fn new(
        id: impl Into<String>,
        workload_id: impl Into<String>,
        start_index: u64,
        end_index: u64,
    ) -> AppResult<Self> {
        let id = NonEmptyString::new(id).map_err(|_| invalid("id must not be empty"))?;
        let workload_id = NonEmptyString::new(workload_id)
            .map_err(|_| invalid("workload_id must not be empty"))?;

        let assignment = Self {
            id,
            workload_id,
            start_index,
            end_index,
            progress: start_index.saturating_sub(1),
            claim_token: None,
        };
        assignment.validate()?;

        Ok(assignment)
    }

    /// Checks range and progress constraints.
    pub fn validate(&self) -> AppResult<()> {
        if self.start_index == 0 {
            return Err(invalid("start_index is 1-based"));
        }

        if self.start_index > self.end_index {
            return Err(invalid("start_index must not exceed end_index"));
        }

        if self.progress > self.end_index {
            return Err(invalid("progress must not exceed end_index"));
        }

        if self.progress < self.start_index - 1 {
            return Err(invalid("progress must not precede start_index"));
        }

        Ok(())
    }

    /// Returns the assignment identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        self.id.as_str()
    }

    /// Returns the owning workload identifier.
    #[must_use]
    pub fn workload_id(&self) -> &str {
        self.workload_id.as_str()
    }

    /// Returns the first unit index of the current attempt.
    #[must_use]
    pub fn start_index(&self) -> u64 {
        self.start_index
    }

    /// Returns the last unit index of the assignment.
    #[must_use]
    pub fn end_index(&self) -> u64 {
        self.end_index
    }

    /// Returns the last unit index processed.
    #[must_use]
    pub fn progress(&self) -> u64 {
        self.progress
    }

    /// Returns the first unit index still to be processed.
    #[must_use]
    pub fn work_start_at(&self) -> u64 {
        if self.progress >= self.start_index {
            return self.progress.saturating_add(1);
        }
        self.start_index
    }

    /// Returns the last unit index to be processed.
    #[must_use]
    pub fn work_end_at(&self) -> u64 {
        self.end_index
    }

    /// Returns the claim this handle was issued under, if it was claimed.
    #[must_use]
    pub fn claim_token(&self) -> Option<&str> {
        self.claim_token.as_deref()
    }

    /// Returns this assignment as held under `claim_token`.
    #[must_use]
    pub fn claimed(mut self, claim_token: impl Into<String>) -> Self {
        self.claim_token = Some(claim_token.into());
        self
    }

    /// Returns whether every unit in the range has been processed.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.progress == self.end_index
    }

    /// Records the last processed unit index.
    ///
    /// Progress may stay at `start_index - 1` (nothing processed) and may not
    /// leave the assignment's range.
    pub fn record_progress(&mut self, progress: u64) -> AppResult<()> {
        if progress > self.end_index || progress < self.start_index.saturating_sub(1) {
            return Err(invalid(&format!(
                "progress {progress} is outside assignment '{}' range [{}, {}]",
                self.id, self.start_index, self.end_index
            )));
        }

        self.progress = progress;
        Ok(())
    }

    /// Moves `start_index` past the recorded progress so a retry resumes
    /// where the failed attempt stopped.
    pub fn resume(&mut self) -> AppResult<()> {
        if self.is_completed() {
            return Err(invalid(&format!(
                "assignment '{}' is completed and cannot be resumed",
                self.id
            )));
        }

        if self.progress >= self.start_index {
            self.start_index = self.progress + 1;
        }

        Ok(())
    }
}

fn invalid(reason: &str) -> AppError {
    AppError::Validation(format!("invalid assignment: {reason}"))
}

#[cfg(test)]
mod tests {
    use super::Assignment;

    fn assignment(start: u64, end: u64) -> Assignment {
        Assignment::new("assignment-3", "workload-1", start, end)
            .unwrap_or_else(|_| unreachable!())
    }

    #[test]
    fn new_assignment_has_no_progress() {
        let assignment = assignment(21, 30);

        assert_eq!(assignment.progress(), 20);
        assert_eq!(assignment.work_start_at(), 21);
        assert_eq!(assignment.work_end_at(), 30);
        assert!(!assignment.is_completed());
    }

    #[test]
    fn assignment_rejects_inverted_range() {
        assert!(Assignment::new("a", "w", 11, 10).is_err());
    }

    #[test]
    fn assignment_rejects_zero_start() {
        assert!(Assignment::new("a", "w", 0, 10).is_err());
    }

    #[test]
    fn assignment_requires_ids() {
        assert!(Assignment::new("", "w", 1, 10).is_err());
        assert!(Assignment::new("a", " ", 1, 10).is_err());
    }

    #[test]
    fn progress_cannot_leave_range() {
        let mut assignment = assignment(21, 30);

        assert!(assignment.record_progress(31).is_err());
        assert!(assignment.record_progress(19).is_err());
        assert!(assignment.record_progress(20).is_ok());
        assert!(assignment.record_progress(30).is_ok());
        assert!(assignment.is_completed());
    }

    #[test]
    fn resume_starts_after_progress() {
        let mut assignment = assignment(21, 30);
        assert!(assignment.record_progress(25).is_ok());
        assert!(assignment.resume().is_ok());

        assert_eq!(assignment.id(), "assignment-3");
        assert_eq!(assignment.start_index(), 26);
        assert_eq!(assignment.end_index(), 30);
        assert_eq!(assignment.work_start_at(), 26);
        assert!(assignment.validate().is_ok());
    }

    #[test]
    fn resume_without_progress_keeps_range() {
        let mut assignment = assignment(21, 30);
        assert!(assignment.resume().is_ok());

        assert_eq!(assignment.start_index(), 21);
    }

    #[test]
    fn completed_assignment_cannot_resume() {
        let mut assignment = assignment(21, 30);
        assert!(assignment.record_progress(30).is_ok());

        assert!(assignment.resume().is_err());
    }

    #[test]
    fn range_ending_at_max_index_does_not_overflow() {
        let mut assignment = assignment(u64::MAX - 1, u64::MAX);
        assert!(assignment.record_progress(u64::MAX - 2).is_ok());
        assert!(assignment.record_progress(u64::MAX).is_ok());

        assert!(assignment.validate().is_ok());
        assert!(assignment.is_completed());
        assert_eq!(assignment.work_start_at(), u64::MAX);
    }

    #[test]
    fn claim_token_is_not_persisted() {
        let claimed = assignment(1, 10).claimed("claim-1");
        assert_eq!(claimed.claim_token(), Some("claim-1"));

        let encoded = serde_json::to_value(&claimed).unwrap_or_else(|_| unreachable!());
        assert!(encoded.get("claim_token").is_none());

        let decoded: Assignment = serde_json::from_value(encoded).unwrap_or_else(|_| unreachable!());
        assert_eq!(decoded.claim_token(), None);
    }

    #[test]
    fn decoded_assignment_uses_storage_field_names() {
        let decoded: Result<Assignment, _> = serde_json::from_value(serde_json::json!({
            "id": "assignment-1",
            "workload_id": "workload-1",
            "start_idx": 1,
            "end_idx": 10,
            "progress": 4,
        }));

        let assignment = decoded.unwrap_or_else(|_| unreachable!());
        assert_eq!(assignment.work_start_at(), 5);
        assert!(assignment.validate().is_ok());
    }
}
