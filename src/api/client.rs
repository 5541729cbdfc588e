// TV3 Downloader - Catalog Sync and Media Download Engine
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! HTTP client for the 3cat catalog API
//!
//! This module wraps `reqwest::Client` with the behaviour every catalog call
//! needs:
//! - Base URL handling and default headers (User-Agent, Accept)
//! - Whole-request timeout and connect timeout
//! - Retry with exponential backoff for transport failures, 5xx and 429
//! - A semaphore bounding concurrent catalog requests
//! - Decoding into typed records, with a response snippet on parse failure
//!
//! # Retry Strategy
//! - `RetryPolicy::max_attempts` total attempts (default 4)
//! - Backoff doubles from `base_delay_ms` up to `max_delay_ms`, with jitter
//! - Retry on: connect/timeout/request errors, 5xx, 429 (honouring Retry-After)
//! - No retry on: other 4xx, undecodable bodies
//! - Exhausted retries surface as `NetworkError`

use crate::config::{EngineConfig, RetryPolicy};
use crate::error::{Result, Tv3Error};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Longest body excerpt kept on a parse error
const PARSE_CONTEXT_CHARS: usize = 400;

/// HTTP client for catalog endpoints
#[derive(Debug)]
pub struct ApiClient {
    /// Underlying HTTP client
    client: Client,
    /// API base URL without trailing slash
    base_url: String,
    retry: RetryPolicy,
    /// Bounds concurrent catalog requests
    semaphore: Arc<Semaphore>,
    /// Requests actually put on the wire, retries included
    requests_sent: AtomicU64,
}

impl ApiClient {
    /// Create a client from engine configuration
    ///
    /// # Errors
    /// Returns error if the base URL is unparsable or the HTTP client cannot be built
    pub fn new(config: &EngineConfig) -> Result<Self> {
        let base = url::Url::parse(&config.api_base_url)?;

        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&config.user_agent)
                .map_err(|e| Tv3Error::invalid_input(format!("Invalid user agent: {}", e)))?,
        );
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .timeout(config.request_timeout())
            .connect_timeout(config.connect_timeout())
            .default_headers(headers)
            .pool_max_idle_per_host(config.max_workers)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;

        Ok(Self {
            client,
            base_url: base.as_str().trim_end_matches('/').to_string(),
            retry: config.retry.clone(),
            semaphore: Arc::new(Semaphore::new(config.max_workers.max(1))),
            requests_sent: AtomicU64::new(0),
        })
    }

    /// Get the API base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Number of HTTP requests issued so far, retries included
    pub fn requests_sent(&self) -> u64 {
        self.requests_sent.load(Ordering::Relaxed)
    }

    /// Perform a GET request with query parameters and decode the JSON body
    ///
    /// # Arguments
    /// * `endpoint` - API endpoint path (e.g. "/videos")
    /// * `query` - Query parameters
    pub async fn get_json<T, Q>(&self, endpoint: &str, query: &Q) -> Result<T>
    where
        T: DeserializeOwned,
        Q: Serialize + ?Sized,
    {
        let url = format!("{}{}", self.base_url, endpoint);

        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|e| Tv3Error::internal(format!("Semaphore acquire failed: {}", e)))?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            self.requests_sent.fetch_add(1, Ordering::Relaxed);

            let failure = match self.client.get(&url).query(query).send().await {
                Ok(response) => {
                    let status = response.status();
                    match status {
                        s if s.is_success() => {
                            return Self::decode_response(endpoint, response).await;
                        }

                        // 429 Rate Limiting - respect Retry-After header
                        StatusCode::TOO_MANY_REQUESTS => Tv3Error::RateLimitExceeded {
                            retry_after_seconds: Self::extract_retry_after(&response),
                            endpoint: endpoint.to_string(),
                        },

                        // 5xx Server Error - retry with backoff
                        s if s.is_server_error() => {
                            let body = response.text().await.unwrap_or_default();
                            Tv3Error::api_failed(
                                format!("Server error {}: {}", status, truncate(&body, 200)),
                                Some(status.as_u16()),
                                Some(endpoint.to_string()),
                            )
                        }

                        // Other errors - don't retry
                        _ => {
                            let body = response.text().await.unwrap_or_default();
                            return Err(Tv3Error::api_failed(
                                format!("Request failed with {}: {}", status, truncate(&body, 200)),
                                Some(status.as_u16()),
                                Some(endpoint.to_string()),
                            ));
                        }
                    }
                }
                Err(e) if Self::is_retryable_network_error(&e) => {
                    Tv3Error::network_error(format!("Request to {} failed: {}", endpoint, e), true)
                }
                Err(e) => {
                    return Err(Tv3Error::network_error(
                        format!("Request to {} failed: {}", endpoint, e),
                        false,
                    ));
                }
            };

            if attempt >= self.retry.max_attempts {
                warn!(endpoint, attempts = attempt, error = %failure, "giving up after retries");
                return Err(Self::exhausted(failure, attempt));
            }

            let delay = match failure.retry_after_seconds() {
                Some(secs) => Duration::from_secs(secs).min(Duration::from_millis(self.retry.max_delay_ms)),
                None => self.retry.delay_for_attempt(attempt),
            };
            debug!(
                endpoint,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "retrying catalog request"
            );
            sleep(delay).await;
        }
    }

    /// Decode a successful response body
    async fn decode_response<T: DeserializeOwned>(endpoint: &str, response: Response) -> Result<T> {
        // Read the text first so it can be quoted on parse error
        let text = response.text().await.map_err(|e| {
            Tv3Error::network_error(format!("Failed to read body of {}: {}", endpoint, e), true)
        })?;

        serde_json::from_str::<T>(&text).map_err(|e| {
            Tv3Error::parse_error(
                format!(
                    "{}: {} at line {} col {}. Context: ...{}...",
                    endpoint,
                    e,
                    e.line(),
                    e.column(),
                    parse_context(&text, e.line(), e.column())
                ),
                Some(truncate(&text, 2_000)),
            )
        })
    }

    /// Convert the last retryable failure into the surfaced error
    fn exhausted(last: Tv3Error, attempts: u32) -> Tv3Error {
        match last {
            Tv3Error::NetworkError { message, .. } => Tv3Error::network_error(
                format!("{} (after {} attempts)", message, attempts),
                true,
            ),
            other => Tv3Error::network_error(
                format!("{} (after {} attempts)", other, attempts),
                true,
            ),
        }
    }

    /// Check if a network error is retryable
    fn is_retryable_network_error(error: &reqwest::Error) -> bool {
        error.is_timeout() || error.is_connect() || error.is_request() || error.is_body()
    }

    /// Extract retry-after delay from response headers (in seconds)
    fn extract_retry_after(response: &Response) -> u64 {
        response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .unwrap_or(1)
    }
}

/// Text around a 1-based line/column position reported by the JSON decoder
fn parse_context(text: &str, line: usize, column: usize) -> &str {
    let line_start: usize = text
        .split_inclusive('\n')
        .take(line.saturating_sub(1))
        .map(str::len)
        .sum();
    let offset = (line_start + column.saturating_sub(1)).min(text.len());
    let start = floor_char_boundary(text, offset.saturating_sub(PARSE_CONTEXT_CHARS / 2));
    let end = floor_char_boundary(text, (offset + PARSE_CONTEXT_CHARS / 2).min(text.len()));
    &text[start..end]
}

fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    index = index.min(text.len());
    while !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn truncate(text: &str, max: usize) -> String {
    let end = floor_char_boundary(text, max);
    text[..end].to_string()
}

// ===== TESTS =====
