use super::*;

impl WorkDistributor {
    /// Creates a workload under a generated id and enqueues its assignments.
    pub async fn create_workload(
        &self,
        cancel: &CancellationToken,
        total_work_units: u64,
    ) -> AppResult<Workload> {
        let workload_id = uuid::Uuid::new_v4().to_string();
        self.create_workload_with_id(cancel, workload_id.as_str(), total_work_units)
            .await
    }

    /// Creates a workload under a caller-chosen id and enqueues its
    /// assignments.
    ///
    /// Fails with a conflict when the id is already in use; existing state is
    /// never reset.
    pub async fn create_workload_with_id(
        &self,
        cancel: &CancellationToken,
        workload_id: &str,
        total_work_units: u64,
    ) -> AppResult<Workload> {
        if total_work_units == 0 {
            return Err(AppError::Validation(
                "workload empty: total_work_units must be greater than zero".to_owned(),
            ));
        }

        let workload = Workload::new(workload_id, total_work_units, self.distribution_size)?;
        let assignments = workload
            .assignment_ranges()
            .map(|(start_index, end_index)| {
                Assignment::new(
                    uuid::Uuid::new_v4().to_string(),
                    workload.id(),
                    start_index,
                    end_index,
                )
            })
            .collect::<AppResult<Vec<_>>>()?;

        self.storage.insert_workload(cancel, &workload).await?;

        for batch in assignments.chunks(SEED_BATCH_SIZE) {
            if let Err(error) = self.storage.push_assignments_to_queue(cancel, batch).await {
                if let Err(cleanup_error) = self
                    .storage
                    .delete_workload_and_assignments(cancel, workload.id())
                    .await
                {
                    warn!(
                        workload_id = %workload.id(),
                        error = %cleanup_error,
                        "failed to remove partially seeded workload"
                    );
                }
                return Err(error);
            }
        }

        info!(
            workload_id = %workload.id(),
            total_work_units = workload.total_work_units(),
            distribution_size = workload.units_per_assignment(),
            expected_assignments = workload.expected_total_assignments(),
            "workload created"
        );

        Ok(workload)
    }

    /// Returns current workload metadata.
    pub async fn get_workload(
        &self,
        cancel: &CancellationToken,
        workload_id: &str,
    ) -> AppResult<Workload> {
        self.storage.get_workload(cancel, workload_id).await
    }

    /// Returns whether every assignment of the workload has been committed.
    pub async fn has_workload_fulfilled(
        &self,
        cancel: &CancellationToken,
        workload_id: &str,
    ) -> AppResult<bool> {
        Ok(self
            .storage
            .get_workload(cancel, workload_id)
            .await?
            .has_fulfilled())
    }

    /// Deletes workload metadata together with queued and in-flight
    /// assignments.
    pub async fn delete_workload_and_assignments(
        &self,
        cancel: &CancellationToken,
        workload_id: &str,
    ) -> AppResult<()> {
        self.storage
            .delete_workload_and_assignments(cancel, workload_id)
            .await?;

        info!(workload_id = %workload_id, "workload deleted");
        Ok(())
    }
}
