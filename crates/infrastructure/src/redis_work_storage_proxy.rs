//! Redis-backed storage for workloads, assignment queues, and in-flight
//! assignments.
//!
//! Keys, under `{key_prefix}`:
//! - `workload:{<workload_id>}`: workload JSON
//! - `workload_assignments:{<workload_id>}`: FIFO list of assignment JSON
//! - `workload_in_flight:{<workload_id>}`: hash of assignment id to in-flight JSON
//!
//! The workload id is wrapped in a hash tag so every key of one workload lands
//! in the same cluster slot, and every script declares the keys it touches.

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use fanout_application::{InFlightAssignment, LockFactory, WorkStorageProxy, WorkloadModifier};
use fanout_core::{AppError, AppResult};
use fanout_domain::{Assignment, Workload};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, RedisError, Script};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

const POP_ASSIGNMENT_SCRIPT: &str = r#"
local raw = redis.call('LPOP', KEYS[1])
if not raw then
  return false
end
local id = cjson.decode(raw)['id']
local record = '{"assignment":' .. raw .. ',"claim_token":' .. ARGV[2] .. ',"claimed_at":"' .. ARGV[1] .. '","updated_at":"' .. ARGV[1] .. '"}'
redis.call('HSET', KEYS[2], id, record)
return raw
"#;

const REQUEUE_ASSIGNMENT_SCRIPT: &str = r#"
if redis.call('HDEL', KEYS[1], ARGV[1]) == 0 then
  return 0
end
redis.call('RPUSH', KEYS[2], ARGV[2])
return 1
"#;

const DELETE_WORKLOAD_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return 0
end
redis.call('DEL', KEYS[1], KEYS[2], KEYS[3])
return 1
"#;

/// Redis implementation of the work storage port.
///
/// Single-command and scripted operations rely on Redis atomicity.
/// Workload read-modify-write sections hold a distributed lock on
/// `workload:{workload_id}`.
#[derive(Clone)]
pub struct RedisWorkStorageProxy {
    client: redis::Client,
    key_prefix: String,
    locks: LockFactory,
}

impl RedisWorkStorageProxy {
    /// Creates one storage adapter.
    #[must_use]
    pub fn new(client: redis::Client, key_prefix: impl Into<String>, locks: LockFactory) -> Self {
        Self {
            client,
            key_prefix: key_prefix.into(),
            locks,
        }
    }

    fn workload_key(&self, workload_id: &str) -> String {
        format!("{}:workload:{{{workload_id}}}", self.key_prefix)
    }

    fn queue_key(&self, workload_id: &str) -> String {
        format!("{}:workload_assignments:{{{workload_id}}}", self.key_prefix)
    }

    fn in_flight_key(&self, workload_id: &str) -> String {
        format!("{}:workload_in_flight:{{{workload_id}}}", self.key_prefix)
    }

    async fn connection(&self) -> AppResult<MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|error| AppError::Internal(format!("failed to connect to redis: {error}")))
    }

    async fn load_workload(
        &self,
        connection: &mut MultiplexedConnection,
        workload_id: &str,
    ) -> AppResult<Workload> {
        let raw: Option<String> = connection
            .get(self.workload_key(workload_id))
            .await
            .map_err(|error| redis_error("failed to load workload", error))?;

        let raw = raw.ok_or_else(|| workload_not_exists(workload_id))?;
        let workload: Workload = decode(raw.as_str(), "workload")?;
        workload.validate()?;

        Ok(workload)
    }

    async fn load_in_flight(
        &self,
        connection: &mut MultiplexedConnection,
        workload_id: &str,
        assignment_id: &str,
    ) -> AppResult<InFlightAssignment> {
        let raw: Option<String> = connection
            .hget(self.in_flight_key(workload_id), assignment_id)
            .await
            .map_err(|error| redis_error("failed to load in-flight assignment", error))?;
        let raw = raw.ok_or_else(|| not_in_flight(assignment_id))?;

        decode(raw.as_str(), "in-flight assignment")
    }
}

fn workload_lock_key(workload_id: &str) -> String {
    format!("workload:{workload_id}")
}

fn workload_not_exists(workload_id: &str) -> AppError {
    AppError::NotFound(format!("workload '{workload_id}' does not exist"))
}

fn not_in_flight(assignment_id: &str) -> AppError {
    AppError::NotFound(format!("assignment '{assignment_id}' is not in flight"))
}

fn redis_error(context: &str, error: RedisError) -> AppError {
    AppError::Internal(format!("{context}: {error}"))
}

fn encode<T: Serialize>(value: &T, what: &str) -> AppResult<String> {
    serde_json::to_string(value)
        .map_err(|error| AppError::Internal(format!("failed to encode {what}: {error}")))
}

fn decode<T: DeserializeOwned>(raw: &str, what: &str) -> AppResult<T> {
    serde_json::from_str(raw)
        .map_err(|error| AppError::Internal(format!("failed to decode {what}: {error}")))
}

#[async_trait]
impl WorkStorageProxy for RedisWorkStorageProxy {
    async fn save_workload(&self, cancel: &CancellationToken, workload: &Workload) -> AppResult<()> {
        let raw = encode(workload, "workload")?;

        self.locks
            .with_lock(cancel, vec![workload_lock_key(workload.id())], || async {
                let mut connection = self.connection().await?;
                connection
                    .set::<_, _, ()>(self.workload_key(workload.id()), raw.as_str())
                    .await
                    .map_err(|error| redis_error("failed to save workload", error))
            })
            .await
    }

    async fn insert_workload(
        &self,
        _cancel: &CancellationToken,
        workload: &Workload,
    ) -> AppResult<()> {
        let raw = encode(workload, "workload")?;
        let mut connection = self.connection().await?;

        let inserted: bool = connection
            .set_nx(self.workload_key(workload.id()), raw.as_str())
            .await
            .map_err(|error| redis_error("failed to insert workload", error))?;

        if !inserted {
            return Err(AppError::Conflict(format!(
                "workload duplication: workload '{}' already exists",
                workload.id()
            )));
        }

        Ok(())
    }

    async fn get_workload(
        &self,
        _cancel: &CancellationToken,
        workload_id: &str,
    ) -> AppResult<Workload> {
        let mut connection = self.connection().await?;
        self.load_workload(&mut connection, workload_id).await
    }

    async fn get_and_update_workload(
        &self,
        cancel: &CancellationToken,
        workload_id: &str,
        modifier: WorkloadModifier<'_>,
    ) -> AppResult<Workload> {
        self.locks
            .with_lock(cancel, vec![workload_lock_key(workload_id)], || async {
                let mut connection = self.connection().await?;
                let mut workload = self.load_workload(&mut connection, workload_id).await?;
                modifier(&mut workload)?;

                connection
                    .set::<_, _, ()>(
                        self.workload_key(workload_id),
                        encode(&workload, "workload")?,
                    )
                    .await
                    .map_err(|error| redis_error("failed to update workload", error))?;

                Ok(workload)
            })
            .await
    }

    async fn delete_workload_and_assignments(
        &self,
        cancel: &CancellationToken,
        workload_id: &str,
    ) -> AppResult<()> {
        self.locks
            .with_lock(cancel, vec![workload_lock_key(workload_id)], || async {
                let mut connection = self.connection().await?;

                let deleted = Script::new(DELETE_WORKLOAD_SCRIPT)
                    .key(self.workload_key(workload_id))
                    .key(self.queue_key(workload_id))
                    .key(self.in_flight_key(workload_id))
                    .invoke_async::<i32>(&mut connection)
                    .await
                    .map_err(|error| redis_error("failed to delete workload", error))?;

                if deleted == 0 {
                    return Err(workload_not_exists(workload_id));
                }

                Ok(())
            })
            .await
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
        let Some(first) = assignments.first() else {
            return Ok(());
        };
        let workload_id = first.workload_id();
        if assignments
            .iter()
            .any(|assignment| assignment.workload_id() != workload_id)
        {
            return Err(AppError::Validation(
                "assignments pushed together must belong to one workload".to_owned(),
            ));
        }

        let encoded = assignments
            .iter()
            .map(|assignment| encode(assignment, "assignment"))
            .collect::<AppResult<Vec<_>>>()?;

        let mut connection = self.connection().await?;
        connection
            .rpush::<_, _, ()>(self.queue_key(workload_id), encoded)
            .await
            .map_err(|error| redis_error("failed to push assignments", error))
    }

    async fn pop_assignment_from_queue(
        &self,
        _cancel: &CancellationToken,
        workload_id: &str,
        claim_token: &str,
    ) -> AppResult<Option<Assignment>> {
        let claimed_at = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        let claim_token_json = encode(&claim_token, "claim token")?;
        let mut connection = self.connection().await?;

        let raw = Script::new(POP_ASSIGNMENT_SCRIPT)
            .key(self.queue_key(workload_id))
            .key(self.in_flight_key(workload_id))
            .arg(claimed_at)
            .arg(claim_token_json)
            .invoke_async::<Option<String>>(&mut connection)
            .await
            .map_err(|error| redis_error("failed to pop assignment", error))?;

        let Some(raw) = raw else {
            return Ok(None);
        };

        let assignment: Assignment = decode(raw.as_str(), "assignment")?;
        assignment.validate()?;
        Ok(Some(assignment.claimed(claim_token)))
    }

    async fn get_in_flight_assignment(
        &self,
        _cancel: &CancellationToken,
        workload_id: &str,
        assignment_id: &str,
    ) -> AppResult<InFlightAssignment> {
        let mut connection = self.connection().await?;
        self.load_in_flight(&mut connection, workload_id, assignment_id)
            .await
    }

    async fn update_in_flight_assignment(
        &self,
        _cancel: &CancellationToken,
        assignment: &Assignment,
    ) -> AppResult<()> {
        let mut connection = self.connection().await?;
        let mut in_flight = self
            .load_in_flight(&mut connection, assignment.workload_id(), assignment.id())
            .await?;
        in_flight.assignment = assignment.clone();
        in_flight.updated_at = Utc::now();

        connection
            .hset::<_, _, _, ()>(
                self.in_flight_key(assignment.workload_id()),
                assignment.id(),
                encode(&in_flight, "in-flight assignment")?,
            )
            .await
            .map_err(|error| redis_error("failed to update in-flight assignment", error))
    }

    async fn commit_in_flight_assignment(
        &self,
        cancel: &CancellationToken,
        assignment: &Assignment,
        modifier: WorkloadModifier<'_>,
    ) -> AppResult<Workload> {
        let workload_id = assignment.workload_id();

        self.locks
            .with_lock(cancel, vec![workload_lock_key(workload_id)], || async {
                let mut connection = self.connection().await?;

                let in_flight: bool = connection
                    .hexists(self.in_flight_key(workload_id), assignment.id())
                    .await
                    .map_err(|error| redis_error("failed to check in-flight assignment", error))?;
                if !in_flight {
                    return Err(not_in_flight(assignment.id()));
                }

                let mut workload = self.load_workload(&mut connection, workload_id).await?;
                modifier(&mut workload)?;

                redis::pipe()
                    .atomic()
                    .set(self.workload_key(workload_id), encode(&workload, "workload")?)
                    .ignore()
                    .hdel(self.in_flight_key(workload_id), assignment.id())
                    .ignore()
                    .query_async::<()>(&mut connection)
                    .await
                    .map_err(|error| redis_error("failed to commit assignment", error))?;

                Ok(workload)
            })
            .await
    }

    async fn requeue_in_flight_assignment(
        &self,
        _cancel: &CancellationToken,
        assignment: &Assignment,
    ) -> AppResult<()> {
        let workload_id = assignment.workload_id();
        let raw = encode(assignment, "assignment")?;
        let mut connection = self.connection().await?;

        let requeued = Script::new(REQUEUE_ASSIGNMENT_SCRIPT)
            .key(self.in_flight_key(workload_id))
            .key(self.queue_key(workload_id))
            .arg(assignment.id())
            .arg(raw)
            .invoke_async::<i32>(&mut connection)
            .await
            .map_err(|error| redis_error("failed to requeue assignment", error))?;

        if requeued == 0 {
            return Err(not_in_flight(assignment.id()));
        }

        Ok(())
    }

    async fn list_in_flight_assignments(
        &self,
        _cancel: &CancellationToken,
        workload_id: &str,
    ) -> AppResult<Vec<InFlightAssignment>> {
        let mut connection = self.connection().await?;
        let raw: Vec<String> = connection
            .hvals(self.in_flight_key(workload_id))
            .await
            .map_err(|error| redis_error("failed to list in-flight assignments", error))?;

        raw.iter()
            .map(|raw| decode(raw.as_str(), "in-flight assignment"))
            .collect()
    }
}

#[cfg(test)]
mod tests;
