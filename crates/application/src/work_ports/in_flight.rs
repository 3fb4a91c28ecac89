use chrono::{DateTime, Utc};
use fanout_domain::Assignment;
use serde::{Deserialize, Serialize};

/// Assignment currently owned by one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InFlightAssignment {
    /// Claimed assignment, including its latest recorded progress.
    pub assignment: Assignment,
    /// Token identifying the claim that currently holds the assignment.
    ///
    /// A new token is issued every time the assignment is popped, so a stale
    /// holder can be told apart from the current one.
    pub claim_token: String,
    /// When the assignment was popped from the queue.
    pub claimed_at: DateTime<Utc>,
    /// When the holder last claimed or checkpointed the assignment.
    pub updated_at: DateTime<Utc>,
}
