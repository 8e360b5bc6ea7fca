//! Shared HTTP helpers for REST collaborators

use std::time::Duration;

use reqwest::{Client, RequestBuilder, StatusCode};

use nko_core::{NkoError, Result};

/// Build a client with a request timeout
pub fn build_client(timeout_secs: u64) -> Result<Client> {
    Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| NkoError::Config(format!("Failed to build HTTP client: {e}")))
}

/// Map a non-success HTTP status onto the error taxonomy
///
/// 429 is rate limiting and 5xx is transient (both retryable under the
/// presets); every other status is a permanent rejection built by `permanent`.
pub fn classify_status(
    status: StatusCode,
    body: &str,
    permanent: impl FnOnce(String) -> NkoError,
) -> NkoError {
    let message = format!("HTTP {}: {}", status.as_u16(), truncate(body, 500));
    if status == StatusCode::TOO_MANY_REQUESTS {
        NkoError::RateLimited(message)
    } else if status.is_server_error() {
        NkoError::Transient(message)
    } else {
        permanent(message)
    }
}

/// Map a transport failure (connect, timeout, body read) to a transient error
pub fn transport_error(context: &str, err: reqwest::Error) -> NkoError {
    NkoError::Transient(format!("{context}: {err}"))
}

/// Attach PostgREST-style `apikey` and bearer headers
pub fn with_service_key(request: RequestBuilder, api_key: Option<&str>) -> RequestBuilder {
    match api_key {
        Some(key) => request
            .header("apikey", key)
            .header("Authorization", format!("Bearer {key}")),
        None => request,
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max_chars).collect();
        format!("{cut}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nko_core::ErrorKind;

    #[test]
    fn test_classify_status() {
        let rate = classify_status(StatusCode::TOO_MANY_REQUESTS, "slow down", NkoError::Database);
        assert_eq!(rate.kind(), ErrorKind::RateLimited);

        let server = classify_status(StatusCode::BAD_GATEWAY, "", NkoError::Database);
        assert_eq!(server.kind(), ErrorKind::Transient);

        let conflict = classify_status(StatusCode::CONFLICT, "duplicate key", NkoError::Database);
        assert_eq!(conflict.kind(), ErrorKind::Database);
        assert!(conflict.to_string().contains("409"));
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("abc", 5), "abc");
        assert_eq!(truncate("ߒߞߏߒߞߏ", 3), "ߒߞߏ...");
    }
}
