use std::thread::sleep;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use reqwest::StatusCode;
use reqwest::blocking::Client;

pub fn build_client(user_agent: &str, timeout_ms: u64) -> Result<Client> {
    Client::builder()
        .user_agent(user_agent.to_string())
        .timeout(Duration::from_millis(timeout_ms))
        .build()
        .context("failed to build HTTP client")
}

pub fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

pub fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request()
}

/// Exponential backoff with up to 100ms of clock jitter.
pub fn backoff_delay(base_ms: u64, attempt: usize) -> Duration {
    let exponent = u32::try_from(attempt).unwrap_or(16);
    let base = base_ms.saturating_mul(2u64.saturating_pow(exponent));
    let jitter = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| u64::from(duration.subsec_millis() % 100))
        .unwrap_or(0);
    Duration::from_millis(base.saturating_add(jitter))
}

pub fn wait_before_retry(base_ms: u64, attempt: usize) {
    sleep(backoff_delay(base_ms, attempt));
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use reqwest::StatusCode;

    use super::{backoff_delay, is_retryable_status};

    #[test]
    fn backoff_doubles_per_attempt() {
        let first = backoff_delay(100, 0);
        let third = backoff_delay(100, 2);
        assert!(first >= Duration::from_millis(100) && first < Duration::from_millis(200));
        assert!(third >= Duration::from_millis(400) && third < Duration::from_millis(500));
    }

    #[test]
    fn only_transient_statuses_retry() {
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!is_retryable_status(StatusCode::NOT_FOUND));
        assert!(!is_retryable_status(StatusCode::BAD_REQUEST));
    }
}
