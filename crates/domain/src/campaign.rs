use fanout_core::{AppError, AppResult};
use serde::{Deserialize, Serialize};

/// Notification request addressed to every device enrolled in a campaign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageInput {
    /// Message identifier.
    pub id: String,
    /// Campaign whose devices receive the message.
    pub campaign: String,
    /// Notification title.
    pub title: String,
    /// Notification body.
    pub body: String,
}

impl MessageInput {
    /// Creates a validated message with a generated identifier.
    pub fn new(
        campaign: impl Into<String>,
        title: impl Into<String>,
        body: impl Into<String>,
    ) -> AppResult<Self> {
        let message = Self {
            id: uuid::Uuid::new_v4().to_string(),
            campaign: campaign.into(),
            title: title.into(),
            body: body.into(),
        };
        message.validate()?;

        Ok(message)
    }

    /// Checks that the message can be delivered.
    pub fn validate(&self) -> AppResult<()> {
        if self.campaign.trim().is_empty() {
            return Err(AppError::Validation(
                "message campaign must not be empty".to_owned(),
            ));
        }

        if self.title.trim().is_empty() && self.body.trim().is_empty() {
            return Err(AppError::Validation(
                "message requires a title or a body".to_owned(),
            ));
        }

        Ok(())
    }
}

/// Announcement that a campaign message has been partitioned into a workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBatchJob {
    /// Workload identifier the job's assignments belong to.
    pub job_id: String,
    /// Message to deliver.
    pub message: MessageInput,
}

impl TokenBatchJob {
    /// Creates one job for a workload.
    #[must_use]
    pub fn new(job_id: impl Into<String>, message: MessageInput) -> Self {
        Self {
            job_id: job_id.into(),
            message,
        }
    }

    /// Encodes the job as JSON.
    pub fn encode(&self) -> AppResult<String> {
        serde_json::to_string(self)
            .map_err(|error| AppError::Internal(format!("failed to encode token batch job: {error}")))
    }

    /// Decodes a job from JSON.
    pub fn decode(value: &str) -> AppResult<Self> {
        let job: Self = serde_json::from_str(value).map_err(|error| {
            AppError::Validation(format!("invalid token batch job payload: {error}"))
        })?;

        if job.job_id.trim().is_empty() {
            return Err(AppError::Validation(
                "token batch job_id must not be empty".to_owned(),
            ));
        }
        job.message.validate()?;

        Ok(job)
    }
}

/// Message plus the device tokens of one batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushNotiMessage {
    /// Message to deliver.
    pub message: MessageInput,
    /// Target device tokens.
    pub device_tokens: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::{MessageInput, TokenBatchJob};

    #[test]
    fn message_requires_campaign() {
        assert!(MessageInput::new(" ", "Streak", "Keep it up").is_err());
    }

    #[test]
    fn message_requires_content() {
        assert!(MessageInput::new("spring-sale", "", "  ").is_err());
    }

    #[test]
    fn token_batch_job_decodes_encoded_payload() {
        let message = MessageInput::new("spring-sale", "Sale", "50% off")
            .unwrap_or_else(|_| unreachable!());
        let job = TokenBatchJob::new("workload-1", message);

        let encoded = job.encode().unwrap_or_else(|_| unreachable!());
        let decoded = TokenBatchJob::decode(encoded.as_str());

        assert_eq!(decoded.ok(), Some(job));
    }

    #[test]
    fn token_batch_job_rejects_missing_job_id() {
        let decoded = TokenBatchJob::decode(
            r#"{"job_id":"","message":{"id":"m","campaign":"c","title":"t","body":"b"}}"#,
        );

        assert!(decoded.is_err());
    }
}
