use std::time::Duration;

use async_trait::async_trait;
use fanout_application::DeviceTokenRepository;
use fanout_core::{AppError, AppResult};
use reqwest::Url;
use serde::Deserialize;
use serde::de::DeserializeOwned;

#[derive(Debug, Deserialize)]
struct DeviceCountResponse {
    count: u64,
}

#[derive(Debug, Deserialize)]
struct DeviceTokensResponse {
    tokens: Vec<String>,
}

/// Device-token lookup against the user service's HTTP API.
///
/// Endpoints, relative to the base URL:
/// - `GET campaigns/{campaign}/devices/count` returning `{"count": n}`
/// - `GET campaigns/{campaign}/devices/tokens?start=&end=` returning
///   `{"tokens": [...]}`
pub struct HttpDeviceTokenRepository {
    http_client: reqwest::Client,
    base_url: Url,
    max_attempts: u8,
    retry_backoff_ms: u64,
}

impl HttpDeviceTokenRepository {
    /// Creates a repository for the service rooted at `base_url`.
    pub fn new(
        http_client: reqwest::Client,
        base_url: &str,
        max_attempts: u8,
        retry_backoff_ms: u64,
    ) -> AppResult<Self> {
        let base_url = Url::parse(base_url).map_err(|error| {
            AppError::Validation(format!("invalid user service base url '{base_url}': {error}"))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(AppError::Validation(format!(
                "user service base url '{base_url}' cannot carry a path"
            )));
        }

        Ok(Self {
            http_client,
            base_url,
            max_attempts: max_attempts.max(1),
            retry_backoff_ms: retry_backoff_ms.max(50),
        })
    }

    fn campaign_endpoint(&self, campaign: &str, leaf: &str) -> AppResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| {
                AppError::Validation("user service base url cannot carry a path".to_owned())
            })?
            .pop_if_empty()
            .extend(["campaigns", campaign, "devices", leaf]);
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: Url,
        query: &[(&str, u64)],
    ) -> AppResult<T> {
        let mut attempt = 0_u8;
        let mut last_error: Option<String> = None;

        while attempt < self.max_attempts {
            attempt = attempt.saturating_add(1);
            let response = self
                .http_client
                .get(url.clone())
                .query(query)
                .send()
                .await;

            match response {
                Ok(response) if response.status().is_success() => {
                    return response.json::<T>().await.map_err(|error| {
                        AppError::Internal(format!(
                            "user service returned an unreadable body for '{url}': {error}"
                        ))
                    });
                }
                Ok(response) if response.status() == reqwest::StatusCode::NOT_FOUND => {
                    return Err(AppError::NotFound(format!(
                        "user service has no resource at '{url}'"
                    )));
                }
                Ok(response)
                    if response.status().is_server_error()
                        || response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS =>
                {
                    last_error = Some(format!(
                        "transient HTTP status {} from user service for '{url}'",
                        response.status()
                    ));
                }
                Ok(response) => {
                    let status = response.status();
                    let body = response
                        .text()
                        .await
                        .unwrap_or_else(|_| "<response body unavailable>".to_owned());
                    return Err(AppError::Validation(format!(
                        "user service request failed with status {status}: {body}"
                    )));
                }
                Err(error) => {
                    last_error = Some(format!("user service transport error: {error}"));
                }
            }

            if attempt < self.max_attempts {
                let delay = self.retry_backoff_ms.saturating_mul(u64::from(attempt));
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
        }

        Err(AppError::Internal(last_error.unwrap_or_else(|| {
            "user service request exhausted retries".to_owned()
        })))
    }
}

#[async_trait]
impl DeviceTokenRepository for HttpDeviceTokenRepository {
    async fn count_devices_for_campaign(&self, campaign: &str) -> AppResult<u64> {
        let url = self.campaign_endpoint(campaign, "count")?;
        let response: DeviceCountResponse = self.get_json(url, &[]).await?;
        Ok(response.count)
    }

    async fn get_device_tokens_for_campaign(
        &self,
        campaign: &str,
        start_index: u64,
        end_index: u64,
    ) -> AppResult<Vec<String>> {
        if start_index == 0 || start_index > end_index {
            return Err(AppError::Validation(format!(
                "invalid device range [{start_index}, {end_index}]"
            )));
        }

        let url = self.campaign_endpoint(campaign, "tokens")?;
        let response: DeviceTokensResponse = self
            .get_json(url, &[("start", start_index), ("end", end_index)])
            .await?;
        Ok(response.tokens)
    }
}
