//! Console notification sink for development. Logs batches to tracing output.

use async_trait::async_trait;
use fanout_application::PushNotificationSink;
use fanout_core::AppResult;
use fanout_domain::PushNotiMessage;
use tracing::info;

/// Development sink that logs notification batches instead of pushing them.
#[derive(Clone)]
pub struct ConsolePushNotificationSink;

impl ConsolePushNotificationSink {
    /// Creates a new console sink.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Default for ConsolePushNotificationSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PushNotificationSink for ConsolePushNotificationSink {
    async fn send(&self, message: &PushNotiMessage) -> AppResult<()> {
        info!(
            message_id = %message.message.id,
            campaign = %message.message.campaign,
            device_count = message.device_tokens.len(),
            first_token = message.device_tokens.first().map(String::as_str).unwrap_or(""),
            "--- PUSH (console) ---\nTitle: {}\n\n{}\n--- END PUSH ---",
            message.message.title,
            message.message.body
        );

        Ok(())
    }
}
