//! JSON-over-HTTP plumbing shared by the model endpoint clients.
//!
//! Retry strategy:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Connection errors → retry
//! - Request timeout → fail immediately with [`BackendError::Timeout`]
//! - Backoff: base, 2×base, 4×base, ... (capped at 2^5)

use harness_core::error::BackendError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

#[derive(Clone)]
pub struct JsonClient {
    client: reqwest::Client,
    max_retries: u32,
    backoff: Duration,
    /// Label used in error messages and logs.
    service: &'static str,
}

impl JsonClient {
    pub fn new(service: &'static str, timeout_secs: u64, max_retries: u32) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs.max(1)))
            .build()
            .map_err(|e| BackendError::unavailable(format!("{service}: {e}")))?;
        Ok(Self {
            client,
            max_retries,
            backoff: Duration::from_secs(1),
            service,
        })
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// POST `body` to `url` and decode the JSON response.
    pub async fn post<B, T>(&self, url: &str, body: &B, bearer: Option<&str>) -> Result<T, BackendError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = self.backoff * (1u32 << (attempt - 1).min(5));
                tracing::debug!(service = self.service, attempt, ?delay, "retrying request");
                tokio::time::sleep(delay).await;
            }

            let mut request = self.client.post(url).json(body);
            if let Some(token) = bearer {
                request = request.bearer_auth(token);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return response.json::<T>().await.map_err(|e| {
                            BackendError::InvalidResponse(format!("{}: {e}", self.service))
                        });
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    let err = BackendError::unavailable(format!(
                        "{} error {}: {}",
                        self.service, status, body_text
                    ));

                    // Rate limited or server error — retry
                    if status.as_u16() == 429 || status.is_server_error() {
                        tracing::warn!(service = self.service, %status, attempt, "transient endpoint error");
                        last_err = Some(err);
                        continue;
                    }

                    // Client error (not 429) — don't retry
                    return Err(err);
                }
                Err(e) if e.is_timeout() => return Err(BackendError::Timeout),
                Err(e) => {
                    tracing::warn!(service = self.service, error = %e, attempt, "endpoint connection error");
                    last_err = Some(BackendError::unavailable(format!(
                        "{} connection error: {e}",
                        self.service
                    )));
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            BackendError::unavailable(format!("{} failed after retries", self.service))
        }))
    }
}

/// Read `OPENAI_API_KEY` from the environment.
pub fn openai_api_key() -> Result<String, BackendError> {
    std::env::var("OPENAI_API_KEY")
        .map_err(|_| BackendError::unavailable("OPENAI_API_KEY environment variable not set"))
}
