//! HTTP client for the upstream transaction API.
//!
//! Wraps reqwest with bearer auth, a per-call timeout, and bounded
//! exponential backoff. Rate limiting (429) honors `Retry-After` when the
//! server sends one. Retry exhaustion surfaces as a transient error so the
//! run aborts with the watermark unmoved.

use reqwest::{Client, Response, StatusCode};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use super::types::{HistoryPage, TransactionDetail};
use crate::config::{ApiConfig, SyncConfig};
use crate::error::{PipelineError, Result};

pub struct ApiClient {
    client: Client,
    base_url: String,
    api_key: String,
    max_attempts: u32,
    backoff_base_ms: u64,
    backoff_max_ms: u64,
}

impl ApiClient {
    pub fn new(api: &ApiConfig, sync: &SyncConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(api.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: api.base_url.trim_end_matches('/').to_string(),
            api_key: api.api_key.clone(),
            max_attempts: sync.max_attempts.max(1),
            backoff_base_ms: sync.backoff_base_ms,
            backoff_max_ms: sync.backoff_max_ms,
        })
    }

    /// Fetch one history page. `oldest_time` bounds the page to records
    /// strictly newer than the watermark; `cursor` is the raw query string
    /// from a previous page's `next` link and takes precedence.
    pub async fn fetch_history_page(
        &self,
        oldest_time: Option<&str>,
        cursor: Option<&str>,
        page_size: u32,
    ) -> Result<HistoryPage> {
        let url = match cursor {
            Some(qs) => format!("{}/me/transactions/history?{}", self.base_url, qs),
            None => {
                let mut url = format!(
                    "{}/me/transactions/history?order=ascending&limit={}",
                    self.base_url, page_size
                );
                if let Some(ts) = oldest_time {
                    url.push_str(&format!("&oldest_time={}", ts));
                }
                url
            }
        };
        let response = self.get_with_retry(&url).await?;
        Ok(response.json::<HistoryPage>().await?)
    }

    /// Fetch full detail for a single transaction.
    pub async fn fetch_transaction_detail(&self, id: &str) -> Result<TransactionDetail> {
        let url = format!("{}/me/transactions?id={}", self.base_url, id);
        let response = self.get_with_retry(&url).await?;
        Ok(response.json::<TransactionDetail>().await?)
    }

    /// GET with bounded exponential backoff on timeouts, 5xx, and 429.
    async fn get_with_retry(&self, url: &str) -> Result<Response> {
        let mut last_error = String::new();
        let mut pending_delay: Option<Duration> = None;

        for attempt in 0..self.max_attempts {
            if let Some(delay) = pending_delay.take() {
                debug!(url, attempt, delay_ms = delay.as_millis() as u64, "retrying");
                sleep(delay).await;
            }

            let result = self
                .client
                .get(url)
                .bearer_auth(&self.api_key)
                .send()
                .await;

            match result {
                Ok(response) => match classify_status(response.status()) {
                    StatusClass::Success => return Ok(response),
                    StatusClass::Unauthorized => {
                        return Err(PipelineError::Config(format!(
                            "upstream rejected credentials: {}",
                            response.status()
                        )));
                    }
                    StatusClass::RateLimited => {
                        let retry_after = retry_after_secs(&response);
                        if let Some(secs) = retry_after {
                            warn!(url, secs, "rate limited, honoring Retry-After");
                        }
                        pending_delay = Some(retry_delay(
                            retry_after,
                            attempt,
                            self.backoff_base_ms,
                            self.backoff_max_ms,
                        ));
                        last_error = format!("rate limited ({})", response.status());
                    }
                    StatusClass::ServerError => {
                        let status = response.status();
                        warn!(url, %status, "server error, will retry");
                        pending_delay = Some(backoff_delay(
                            attempt,
                            self.backoff_base_ms,
                            self.backoff_max_ms,
                        ));
                        last_error = format!("upstream returned {}", status);
                    }
                    StatusClass::PermanentClientError => {
                        return Err(PipelineError::Fatal(format!(
                            "upstream returned {} for {}",
                            response.status(),
                            url
                        )));
                    }
                },
                Err(e) if e.is_timeout() || e.is_connect() => {
                    warn!(url, error = %e, "request failed, will retry");
                    pending_delay = Some(backoff_delay(
                        attempt,
                        self.backoff_base_ms,
                        self.backoff_max_ms,
                    ));
                    last_error = e.to_string();
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(PipelineError::Transient(format!(
            "{} attempts exhausted for {}: {}",
            self.max_attempts, url, last_error
        )))
    }
}

/// How a response status feeds the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatusClass {
    Success,
    Unauthorized,
    RateLimited,
    ServerError,
    PermanentClientError,
}

fn classify_status(status: StatusCode) -> StatusClass {
    if status.is_success() {
        StatusClass::Success
    } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        StatusClass::Unauthorized
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        StatusClass::RateLimited
    } else if status.is_server_error() {
        StatusClass::ServerError
    } else {
        StatusClass::PermanentClientError
    }
}

/// Delay before retry attempt `n` (0-based): base * 2^n, capped.
pub fn backoff_delay(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    let exp = base_ms.saturating_mul(1u64 << attempt.min(16));
    Duration::from_millis(exp.min(max_ms))
}

/// `Retry-After` replaces the exponential backoff for that attempt; the
/// two never stack.
fn retry_delay(retry_after: Option<u64>, attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    match retry_after {
        Some(secs) => Duration::from_secs(secs),
        None => backoff_delay(attempt, base_ms, max_ms),
    }
}

fn retry_after_secs(response: &Response) -> Option<u64> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_capped() {
        assert_eq!(backoff_delay(0, 500, 30_000), Duration::from_millis(500));
        assert_eq!(backoff_delay(1, 500, 30_000), Duration::from_millis(1_000));
        assert_eq!(backoff_delay(3, 500, 30_000), Duration::from_millis(4_000));
        assert_eq!(backoff_delay(10, 500, 30_000), Duration::from_millis(30_000));
    }

    #[test]
    fn backoff_never_overflows() {
        assert_eq!(backoff_delay(u32::MAX, 500, 30_000), Duration::from_millis(30_000));
    }

    #[test]
    fn retry_after_replaces_backoff_instead_of_stacking() {
        assert_eq!(
            retry_delay(Some(7), 3, 500, 30_000),
            Duration::from_secs(7)
        );
        assert_eq!(
            retry_delay(None, 3, 500, 30_000),
            backoff_delay(3, 500, 30_000)
        );
    }

    #[test]
    fn plain_client_errors_are_permanent_not_transient() {
        assert_eq!(
            classify_status(StatusCode::BAD_REQUEST),
            StatusClass::PermanentClientError
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            StatusClass::PermanentClientError
        );
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED),
            StatusClass::Unauthorized
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            StatusClass::RateLimited
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            StatusClass::ServerError
        );
    }
}
