use super::*;

impl WorkDistributor {
    /// Claims the next queued assignment of a workload.
    ///
    /// Returns `None` when the queue is empty, which happens both after
    /// fulfillment and while other workers still hold assignments. Queued
    /// assignments whose progress already reached their end are committed and
    /// skipped. The returned assignment carries a fresh claim token.
    pub async fn next_assignment(
        &self,
        cancel: &CancellationToken,
        workload_id: &str,
    ) -> AppResult<Option<Assignment>> {
        loop {
            let claim_token = uuid::Uuid::new_v4().to_string();
            let Some(assignment) = self
                .storage
                .pop_assignment_from_queue(cancel, workload_id, claim_token.as_str())
                .await?
            else {
                return Ok(None);
            };

            if assignment.is_completed() {
                debug!(
                    workload_id = %workload_id,
                    assignment_id = %assignment.id(),
                    "committing queued assignment that was already completed"
                );
                self.commit(cancel, &assignment).await?;
                continue;
            }

            debug!(
                workload_id = %workload_id,
                assignment_id = %assignment.id(),
                start_index = assignment.work_start_at(),
                end_index = assignment.work_end_at(),
                "assignment claimed"
            );
            return Ok(Some(assignment));
        }
    }

    /// Polls for an assignment every `poll_interval`.
    ///
    /// Stops with the claimed assignment, with `AppError::WorkloadFulfilled`
    /// once every assignment is committed, or with `AppError::Cancelled` when
    /// `cancel` fires. Storage and lock failures are returned to the caller's
    /// retry loop.
    pub async fn wait_for_assignment(
        &self,
        cancel: &CancellationToken,
        poll_interval: Duration,
        workload_id: &str,
    ) -> AppResult<Assignment> {
        if poll_interval.is_zero() {
            return Err(AppError::Validation(
                "poll_interval must be greater than zero".to_owned(),
            ));
        }

        loop {
            if cancel.is_cancelled() {
                return Err(stopped_waiting(workload_id));
            }

            if let Some(assignment) = self.next_assignment(cancel, workload_id).await? {
                return Ok(assignment);
            }

            if self
                .storage
                .get_workload(cancel, workload_id)
                .await?
                .has_fulfilled()
            {
                return Err(AppError::WorkloadFulfilled(format!(
                    "workload '{workload_id}' has already fulfilled as all assignments committed"
                )));
            }

            tokio::select! {
                () = cancel.cancelled() => return Err(stopped_waiting(workload_id)),
                () = tokio::time::sleep(poll_interval) => {}
            }
        }
    }

    /// Runs `work` for a claimed assignment, then commits it on success or
    /// rolls it back on failure.
    ///
    /// `work` may call [`WorkDistributor::progress`] to checkpoint partial
    /// completion so a rollback resumes after the last checkpoint. The error
    /// of failed work is reported through `AssignmentOutcome::RolledBack`;
    /// only commit and rollback failures are returned as errors.
    pub async fn handle_assignment<F, Fut>(
        &self,
        cancel: &CancellationToken,
        assignment: &Assignment,
        work: F,
    ) -> AppResult<AssignmentOutcome>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = AppResult<()>>,
    {
        match work().await {
            Ok(()) => {
                self.commit(cancel, assignment).await?;
                Ok(AssignmentOutcome::Committed)
            }
            Err(error) => {
                warn!(
                    workload_id = %assignment.workload_id(),
                    assignment_id = %assignment.id(),
                    error = %error,
                    "assignment work failed, rolling back"
                );
                self.rollback(cancel, assignment).await?;
                Ok(AssignmentOutcome::RolledBack(error))
            }
        }
    }

    /// Records the last processed unit index of a claimed assignment.
    ///
    /// Fails with `AppError::InvariantViolation` when the assignment has been
    /// reclaimed and is now held under another claim.
    pub async fn progress(
        &self,
        cancel: &CancellationToken,
        assignment: &Assignment,
        progress: u64,
    ) -> AppResult<Assignment> {
        self.locks
            .with_lock(cancel, vec![assignment_lock_key(assignment.id())], || async {
                let mut current = self.load_claimed(cancel, assignment).await?;
                current.record_progress(progress)?;
                self.storage
                    .update_in_flight_assignment(cancel, &current)
                    .await?;

                debug!(
                    workload_id = %current.workload_id(),
                    assignment_id = %current.id(),
                    progress,
                    "assignment progress recorded"
                );
                Ok(current)
            })
            .await
    }

    /// Counts a claimed assignment as done and discards it.
    ///
    /// Committing an assignment that is not in flight, including a second
    /// commit of the same id, or one held under another claim, is an
    /// invariant violation and changes nothing.
    pub async fn commit(&self, cancel: &CancellationToken, assignment: &Assignment) -> AppResult<()> {
        self.locks
            .with_lock(cancel, vec![assignment_lock_key(assignment.id())], || async {
                let current = match self.load_claimed(cancel, assignment).await {
                    Ok(current) => current,
                    Err(AppError::NotFound(_)) => {
                        return Err(AppError::InvariantViolation(format!(
                            "assignment '{}' is not in flight; it was already committed or never issued",
                            assignment.id()
                        )));
                    }
                    Err(error) => return Err(error),
                };

                self.commit_in_flight(cancel, &current).await
            })
            .await
    }

    /// Re-enqueues a claimed assignment so the next claimant resumes it right
    /// after its recorded progress, keeping the same id.
    ///
    /// An assignment whose progress already reached its end is committed
    /// instead.
    pub async fn rollback(
        &self,
        cancel: &CancellationToken,
        assignment: &Assignment,
    ) -> AppResult<()> {
        self.locks
            .with_lock(cancel, vec![assignment_lock_key(assignment.id())], || async {
                let current = self.load_claimed(cancel, assignment).await?;
                self.roll_back_in_flight(cancel, current).await
            })
            .await
    }

    /// Rolls back in-flight assignments not claimed or checkpointed within
    /// `older_than`, so ranges held by crashed workers are issued again.
    ///
    /// Each candidate is re-read under its assignment lock and skipped when it
    /// was checkpointed or claimed again since the listing, so concurrent
    /// reclaimers never requeue a live claim. Returns how many assignments
    /// were re-enqueued or committed.
    pub async fn reclaim_abandoned_assignments(
        &self,
        cancel: &CancellationToken,
        workload_id: &str,
        older_than: Duration,
    ) -> AppResult<usize> {
        let older_than = chrono::Duration::from_std(older_than).map_err(|error| {
            AppError::Validation(format!("invalid reclaim threshold: {error}"))
        })?;
        let cutoff = Utc::now() - older_than;

        let abandoned: Vec<InFlightAssignment> = self
            .storage
            .list_in_flight_assignments(cancel, workload_id)
            .await?
            .into_iter()
            .filter(|in_flight| in_flight.updated_at <= cutoff)
            .collect();

        let mut reclaimed = 0;
        for candidate in &abandoned {
            match self.reclaim_if_abandoned(cancel, candidate, cutoff).await {
                Ok(true) => reclaimed += 1,
                Ok(false) | Err(AppError::NotFound(_)) => {}
                Err(error) => return Err(error),
            }
        }

        if reclaimed > 0 {
            warn!(
                workload_id = %workload_id,
                reclaimed,
                "reclaimed abandoned assignments"
            );
        }

        Ok(reclaimed)
    }

    async fn reclaim_if_abandoned(
        &self,
        cancel: &CancellationToken,
        candidate: &InFlightAssignment,
        cutoff: DateTime<Utc>,
    ) -> AppResult<bool> {
        let assignment = &candidate.assignment;

        self.locks
            .with_lock(cancel, vec![assignment_lock_key(assignment.id())], || async {
                let current = self
                    .storage
                    .get_in_flight_assignment(cancel, assignment.workload_id(), assignment.id())
                    .await?;
                if current.claim_token != candidate.claim_token || current.updated_at > cutoff {
                    debug!(
                        workload_id = %assignment.workload_id(),
                        assignment_id = %assignment.id(),
                        "assignment was claimed or checkpointed again, not reclaiming"
                    );
                    return Ok(false);
                }

                self.roll_back_in_flight(cancel, current.assignment.claimed(current.claim_token))
                    .await?;
                Ok(true)
            })
            .await
    }

    /// Loads the stored state of `assignment`, provided `assignment` still
    /// holds the current claim. Must run under the assignment lock.
    async fn load_claimed(
        &self,
        cancel: &CancellationToken,
        assignment: &Assignment,
    ) -> AppResult<Assignment> {
        let in_flight = self
            .storage
            .get_in_flight_assignment(cancel, assignment.workload_id(), assignment.id())
            .await?;

        if assignment.claim_token() != Some(in_flight.claim_token.as_str()) {
            return Err(superseded_claim(assignment.id()));
        }

        Ok(in_flight.assignment.claimed(in_flight.claim_token))
    }

    async fn roll_back_in_flight(
        &self,
        cancel: &CancellationToken,
        mut assignment: Assignment,
    ) -> AppResult<()> {
        if assignment.is_completed() {
            return self.commit_in_flight(cancel, &assignment).await;
        }

        assignment.resume()?;
        self.storage
            .requeue_in_flight_assignment(cancel, &assignment)
            .await?;

        info!(
            workload_id = %assignment.workload_id(),
            assignment_id = %assignment.id(),
            start_index = assignment.start_index(),
            end_index = assignment.end_index(),
            "assignment rolled back"
        );
        Ok(())
    }

    async fn commit_in_flight(
        &self,
        cancel: &CancellationToken,
        assignment: &Assignment,
    ) -> AppResult<()> {
        let workload = self
            .storage
            .commit_in_flight_assignment(cancel, assignment, &|workload| {
                workload.increase_total_committed_assignments()
            })
            .await?;

        info!(
            workload_id = %workload.id(),
            assignment_id = %assignment.id(),
            committed = workload.total_committed_assignments(),
            expected = workload.expected_total_assignments(),
            "assignment committed"
        );

        if workload.has_fulfilled() {
            info!(workload_id = %workload.id(), "workload fulfilled");
        }

        Ok(())
    }
}

fn stopped_waiting(workload_id: &str) -> AppError {
    AppError::Cancelled(format!(
        "stopped waiting for assignment of workload '{workload_id}'"
    ))
}
