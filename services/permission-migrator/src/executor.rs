// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Rate-limited request executor
//!
//! Every outbound API call is sent through [`RequestExecutor::execute`].
//! Write calls are paced against a [`RateLimiterState`] shared by every
//! worker of every identity: a counting admission gate bounds entry into
//! the pacing section, and a single adaptive delay governs the spacing
//! between successive writes. Throttling responses (429/403) widen the
//! delay and are retried with exponential backoff; transport failures are
//! retried with linear backoff; any other non-2xx status fails at once.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::time::{Instant, sleep, sleep_until};
use tracing::{debug, warn};

use crate::auth::{AuthError, TokenManager};
use crate::metrics;
use crate::transport::{ApiRequest, ApiResponse, Transport, TransportError};

/// Default starting spacing between writes
pub const DEFAULT_INITIAL_DELAY_MS: u64 = 150;
pub const DEFAULT_MIN_DELAY_MS: u64 = 100;
pub const DEFAULT_MAX_DELAY_MS: u64 = 500;
pub const DEFAULT_ADMISSION_CAPACITY: usize = 8;
pub const DEFAULT_MAX_RETRIES: u32 = 5;

const DELAY_DECREASE_MS: u64 = 10;
const DELAY_INCREASE_MS: u64 = 50;

/// Marks a limiter that has not paced any write yet
const NEVER_WRITTEN: u64 = u64::MAX;

/// Substrings (lowercase) identifying a policy restriction in an error
const RESTRICTION_MARKERS: &[&str] = &["restricted", "flagged", "sharingnotallowed"];

/// Errors returned once the executor gives up on a call
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("Rate limited after {attempts} attempts: {status} - {body}")]
    Throttled {
        status: u16,
        body: String,
        attempts: u32,
    },

    #[error("Request failed after {attempts} attempts: {source}")]
    Transient {
        attempts: u32,
        #[source]
        source: TransportError,
    },

    #[error("API request failed: {status} - {body}")]
    Permanent { status: u16, body: String },

    #[error("Failed to decode response: {0}")]
    Decode(String),

    #[error("Invalid request URL: {0}")]
    InvalidUrl(String),
}

impl ApiError {
    /// True when the error reads as a sharing-policy restriction rather
    /// than an ordinary failure.
    pub fn is_restriction(&self) -> bool {
        let message = self.to_string().to_lowercase();
        RESTRICTION_MARKERS.iter().any(|m| message.contains(m))
    }

    /// HTTP status carried by the error, if one was received
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Throttled { status, .. } | ApiError::Permanent { status, .. } => {
                Some(*status)
            }
            _ => None,
        }
    }
}

/// Whether a call mutates remote state (paced) or only reads it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Read,
    Write,
}

impl CallKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CallKind::Read => "read",
            CallKind::Write => "write",
        }
    }
}

/// Pacing parameters for a [`RateLimiterState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacingConfig {
    pub initial_delay_ms: u64,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub admission_capacity: usize,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: DEFAULT_INITIAL_DELAY_MS,
            min_delay_ms: DEFAULT_MIN_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            admission_capacity: DEFAULT_ADMISSION_CAPACITY,
        }
    }
}

impl PacingConfig {
    /// A non-adaptive spacing: floor, ceiling and start are all `interval_ms`.
    pub fn fixed(interval_ms: u64) -> Self {
        Self {
            initial_delay_ms: interval_ms,
            min_delay_ms: interval_ms,
            max_delay_ms: interval_ms,
            admission_capacity: 1,
        }
    }
}

/// Shared write-pacing state.
///
/// One instance is shared by every executor that must respect the same
/// remote quota, so spacing holds across all identities and workers.
pub struct RateLimiterState {
    admission: Semaphore,
    delay_ms: AtomicU64,
    min_delay_ms: u64,
    max_delay_ms: u64,
    epoch: Instant,
    /// Milliseconds after `epoch` of the latest reserved write slot
    last_write_ms: AtomicU64,
}

impl RateLimiterState {
    pub fn new(config: PacingConfig) -> Self {
        let min_delay_ms = config.min_delay_ms.min(config.max_delay_ms);
        let max_delay_ms = config.max_delay_ms;
        Self {
            admission: Semaphore::new(config.admission_capacity.max(1)),
            delay_ms: AtomicU64::new(config.initial_delay_ms.clamp(min_delay_ms, max_delay_ms)),
            min_delay_ms,
            max_delay_ms,
            epoch: Instant::now(),
            last_write_ms: AtomicU64::new(NEVER_WRITTEN),
        }
    }

    /// Current minimum spacing between writes
    pub fn delay_ms(&self) -> u64 {
        self.delay_ms.load(Ordering::Relaxed)
    }

    fn now_ms(&self) -> u64 {
        Instant::now().duration_since(self.epoch).as_millis() as u64
    }

    /// Wait until at least the current delay has passed since the last write.
    pub async fn pace(&self) {
        // The gate is never closed; if it were, pace without it.
        let _permit = self.admission.acquire().await.ok();

        // Reserve the next write slot before sleeping so that writers
        // admitted together queue up one delay apart.
        let delay = self.delay_ms();
        let now = self.now_ms();
        let slot = |last: u64| {
            if last == NEVER_WRITTEN {
                now
            } else {
                now.max(last.saturating_add(delay))
            }
        };
        let previous = self
            .last_write_ms
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| Some(slot(last)))
            .unwrap_or_else(|last| last);
        let next = slot(previous);

        if next > now {
            sleep_until(self.epoch + Duration::from_millis(next)).await;
        }
    }

    /// Narrow the spacing after a first-attempt write succeeded.
    pub fn on_success(&self) -> u64 {
        let floor = self.min_delay_ms;
        let previous = self
            .delay_ms
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |d| {
                Some(d.saturating_sub(DELAY_DECREASE_MS).max(floor))
            })
            .unwrap_or_else(|d| d);
        let current = previous.saturating_sub(DELAY_DECREASE_MS).max(floor);
        if current < previous {
            debug!(delay_ms = current, "Decreased write delay");
        }
        current
    }

    /// Widen the spacing after a throttling response.
    pub fn on_throttled(&self) -> u64 {
        let ceiling = self.max_delay_ms;
        let previous = self
            .delay_ms
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |d| {
                Some((d + DELAY_INCREASE_MS).min(ceiling))
            })
            .unwrap_or_else(|d| d);
        let current = (previous + DELAY_INCREASE_MS).min(ceiling);
        warn!(delay_ms = current, "Increased write delay due to rate limiting");
        current
    }
}

/// Backoff before retry `attempt` (1-based) of a throttled call: `2^attempt` seconds.
pub fn throttle_backoff(attempt: u32) -> Duration {
    Duration::from_secs(1u64 << attempt.min(16))
}

/// Backoff before retry `attempt` (1-based) after a transport failure.
pub fn transient_backoff(attempt: u32) -> Duration {
    Duration::from_secs(u64::from(attempt))
}

fn is_throttle_status(status: u16) -> bool {
    status == 429 || status == 403
}

/// Decode a JSON response body
pub fn decode<T: DeserializeOwned>(response: &ApiResponse) -> Result<T, ApiError> {
    serde_json::from_str(&response.body).map_err(|e| ApiError::Decode(e.to_string()))
}

/// Sends authenticated requests with pacing and retry.
pub struct RequestExecutor {
    tokens: Arc<TokenManager>,
    transport: Arc<dyn Transport>,
    limiter: Arc<RateLimiterState>,
    max_retries: u32,
}

impl RequestExecutor {
    pub fn new(
        tokens: Arc<TokenManager>,
        transport: Arc<dyn Transport>,
        limiter: Arc<RateLimiterState>,
        max_retries: u32,
    ) -> Self {
        Self {
            tokens,
            transport,
            limiter,
            max_retries,
        }
    }

    pub fn limiter(&self) -> &Arc<RateLimiterState> {
        &self.limiter
    }

    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    /// Execute `request` on behalf of `identity`.
    ///
    /// The token is fetched once up front; a token failure is returned as
    /// [`ApiError::Auth`] without any API call being made.
    pub async fn execute(
        &self,
        request: ApiRequest,
        identity: &str,
        kind: CallKind,
    ) -> Result<ApiResponse, ApiError> {
        let token = self.tokens.get_token(identity).await?;
        let mut attempt: u32 = 0;

        loop {
            if kind == CallKind::Write {
                self.limiter.pace().await;
            }

            metrics::record_call(kind.as_str());

            let outbound = request.clone().with_bearer(token.bearer().clone());
            match self.transport.send(outbound).await {
                Ok(response) if response.is_success() => {
                    if kind == CallKind::Write && attempt == 0 {
                        self.limiter.on_success();
                    }
                    return Ok(response);
                }
                Ok(response) if is_throttle_status(response.status) => {
                    attempt += 1;
                    metrics::record_throttled();
                    let delay_ms = self.limiter.on_throttled();

                    if attempt > self.max_retries {
                        warn!(
                            identity = %identity,
                            status = response.status,
                            attempts = attempt,
                            "Max retries exceeded for rate limit"
                        );
                        return Err(ApiError::Throttled {
                            status: response.status,
                            body: response.body,
                            attempts: attempt,
                        });
                    }

                    let backoff = throttle_backoff(attempt);
                    warn!(
                        identity = %identity,
                        status = response.status,
                        attempt,
                        max_retries = self.max_retries,
                        backoff_ms = backoff.as_millis() as u64,
                        delay_ms,
                        "Rate limit hit, backing off"
                    );
                    metrics::record_retry("throttled");
                    sleep(backoff).await;
                }
                Ok(response) => {
                    debug!(
                        identity = %identity,
                        status = response.status,
                        url = %request.url,
                        "Request failed with non-retryable status"
                    );
                    return Err(ApiError::Permanent {
                        status: response.status,
                        body: response.body,
                    });
                }
                Err(source) => {
                    attempt += 1;
                    if attempt > self.max_retries {
                        return Err(ApiError::Transient {
                            attempts: attempt,
                            source,
                        });
                    }

                    let backoff = transient_backoff(attempt);
                    warn!(
                        identity = %identity,
                        attempt,
                        max_retries = self.max_retries,
                        error = %source,
                        "Request failed, retrying"
                    );
                    metrics::record_retry("transient");
                    sleep(backoff).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::testing::{self, ScriptedTransport};
    use reqwest::{Method, Url};

    const WRITE_URL: &str = "https://drive.test/drive/v3/files/f1/permissions";

    fn write_request() -> ApiRequest {
        ApiRequest::post_json(
            Url::parse(WRITE_URL).unwrap(),
            serde_json::json!({"type": "user", "role": "writer"}),
        )
    }

    fn setup(max_retries: u32) -> (Arc<ScriptedTransport>, Arc<RateLimiterState>, RequestExecutor) {
        let transport = testing::scripted_transport();
        let limiter = Arc::new(RateLimiterState::new(PacingConfig::default()));
        let executor = testing::executor(&transport, Arc::clone(&limiter), max_retries);
        (transport, limiter, executor)
    }

    #[test]
    fn test_throttle_backoff_strictly_increases() {
        let delays: Vec<Duration> = (1..=DEFAULT_MAX_RETRIES).map(throttle_backoff).collect();
        assert_eq!(delays[0], Duration::from_secs(2));
        assert_eq!(delays[1], Duration::from_secs(4));
        for pair in delays.windows(2) {
            assert!(pair[1] > pair[0]);
        }
        assert_eq!(transient_backoff(3), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttled_twice_then_success() {
        let (transport, limiter, executor) = setup(DEFAULT_MAX_RETRIES);
        transport.respond(Method::POST, "/permissions", 429, "rateLimitExceeded");
        transport.respond(Method::POST, "/permissions", 429, "rateLimitExceeded");
        transport.respond(Method::POST, "/permissions", 200, r#"{"id":"perm-1"}"#);

        let start = Instant::now();
        let response = executor
            .execute(write_request(), "alice@example.com", CallKind::Write)
            .await
            .unwrap();
        let elapsed = start.elapsed();

        assert_eq!(response.body, r#"{"id":"perm-1"}"#);
        assert_eq!(transport.count(Method::POST, "/permissions"), 3);
        // 2s then 4s of backoff; the pacing gaps are already covered by them
        assert!(elapsed >= Duration::from_secs(6), "elapsed {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(7), "elapsed {:?}", elapsed);
        assert_eq!(limiter.delay_ms(), DEFAULT_INITIAL_DELAY_MS + 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttling_fails_after_retry_cap() {
        let (transport, limiter, executor) = setup(DEFAULT_MAX_RETRIES);
        transport.respond(Method::POST, "/permissions", 429, "rateLimitExceeded");

        let start = Instant::now();
        let err = executor
            .execute(write_request(), "alice@example.com", CallKind::Write)
            .await
            .unwrap_err();

        match err {
            ApiError::Throttled {
                status, attempts, ..
            } => {
                assert_eq!(status, 429);
                assert_eq!(attempts, DEFAULT_MAX_RETRIES + 1);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(
            transport.count(Method::POST, "/permissions"),
            (DEFAULT_MAX_RETRIES + 1) as usize
        );
        // 2 + 4 + 8 + 16 + 32 seconds of backoff
        assert!(start.elapsed() >= Duration::from_secs(62));
        assert_eq!(limiter.delay_ms(), 450);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_is_clamped_to_ceiling() {
        let (transport, limiter, executor) = setup(10);
        transport.respond(Method::POST, "/permissions", 403, "userRateLimitExceeded");

        executor
            .execute(write_request(), "alice@example.com", CallKind::Write)
            .await
            .unwrap_err();

        assert_eq!(limiter.delay_ms(), DEFAULT_MAX_DELAY_MS);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_not_retried() {
        let (transport, limiter, executor) = setup(DEFAULT_MAX_RETRIES);
        transport.respond(Method::POST, "/permissions", 404, "File not found: f1");

        let err = executor
            .execute(write_request(), "alice@example.com", CallKind::Write)
            .await
            .unwrap_err();

        assert!(matches!(err, ApiError::Permanent { status: 404, .. }));
        assert_eq!(err.status(), Some(404));
        assert_eq!(transport.count(Method::POST, "/permissions"), 1);
        assert_eq!(limiter.delay_ms(), DEFAULT_INITIAL_DELAY_MS);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_retried_linearly() {
        let (transport, _limiter, executor) = setup(DEFAULT_MAX_RETRIES);
        transport.fail(Method::POST, "/permissions", "connection reset");
        transport.fail(Method::POST, "/permissions", "connection reset");
        transport.respond(Method::POST, "/permissions", 200, "{}");

        let start = Instant::now();
        executor
            .execute(write_request(), "alice@example.com", CallKind::Write)
            .await
            .unwrap();

        // 1s then 2s
        assert!(start.elapsed() >= Duration::from_secs(3));
        assert!(start.elapsed() < Duration::from_secs(4));
        assert_eq!(transport.count(Method::POST, "/permissions"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_gives_up() {
        let (transport, _limiter, executor) = setup(2);
        transport.fail(Method::POST, "/permissions", "connection refused");

        let err = executor
            .execute(write_request(), "alice@example.com", CallKind::Write)
            .await
            .unwrap_err();

        assert!(matches!(err, ApiError::Transient { attempts: 3, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_attempt_success_narrows_delay() {
        let (transport, limiter, executor) = setup(DEFAULT_MAX_RETRIES);
        transport.respond(Method::POST, "/permissions", 200, "{}");

        for _ in 0..10 {
            executor
                .execute(write_request(), "alice@example.com", CallKind::Write)
                .await
                .unwrap();
        }

        assert_eq!(limiter.delay_ms(), DEFAULT_MIN_DELAY_MS);
    }

    #[tokio::test(start_paused = true)]
    async fn test_writes_are_spaced_by_current_delay() {
        let (transport, limiter, executor) = setup(DEFAULT_MAX_RETRIES);
        transport.respond(Method::POST, "/permissions", 200, "{}");

        executor
            .execute(write_request(), "alice@example.com", CallKind::Write)
            .await
            .unwrap();
        let delay = limiter.delay_ms();

        let start = Instant::now();
        executor
            .execute(write_request(), "bob@example.com", CallKind::Write)
            .await
            .unwrap();

        assert!(start.elapsed() >= Duration::from_millis(delay));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_writers_take_separate_slots() {
        let limiter = Arc::new(RateLimiterState::new(PacingConfig::default()));
        let delay = Duration::from_millis(limiter.delay_ms());
        limiter.pace().await;

        let start = Instant::now();
        let timed = |limiter: Arc<RateLimiterState>| async move {
            limiter.pace().await;
            start.elapsed()
        };
        let (a, b) = tokio::join!(timed(Arc::clone(&limiter)), timed(Arc::clone(&limiter)));

        let (first, second) = if a <= b { (a, b) } else { (b, a) };
        assert!(first >= delay);
        assert!(second - first >= delay);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reads_bypass_pacing() {
        let (transport, limiter, executor) = setup(DEFAULT_MAX_RETRIES);
        transport.respond(Method::GET, "/about", 200, "{}");

        let start = Instant::now();
        for _ in 0..5 {
            let request = ApiRequest::get(Url::parse("https://drive.test/drive/v3/about").unwrap());
            executor
                .execute(request, "alice@example.com", CallKind::Read)
                .await
                .unwrap();
        }

        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(limiter.delay_ms(), DEFAULT_INITIAL_DELAY_MS);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_failure_makes_no_api_call() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond(Method::POST, "/token", 400, r#"{"error":"invalid_grant"}"#);
        let limiter = Arc::new(RateLimiterState::new(PacingConfig::default()));
        let executor = testing::executor(&transport, limiter, DEFAULT_MAX_RETRIES);

        let err = executor
            .execute(write_request(), "alice@example.com", CallKind::Write)
            .await
            .unwrap_err();

        assert!(matches!(err, ApiError::Auth(_)));
        assert_eq!(transport.count(Method::POST, "/permissions"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_requests_carry_bearer_token() {
        let (transport, _limiter, executor) = setup(DEFAULT_MAX_RETRIES);
        transport.respond(Method::POST, "/permissions", 200, "{}");

        executor
            .execute(write_request(), "alice@example.com", CallKind::Write)
            .await
            .unwrap();

        let sent = transport.requests_to(Method::POST, "/permissions");
        assert_eq!(sent[0].bearer.as_deref(), Some(testing::TEST_BEARER));
    }

    #[test]
    fn test_restriction_classification() {
        let restricted = ApiError::Permanent {
            status: 400,
            body: "Sharing is Restricted by the domain administrator".to_string(),
        };
        assert!(restricted.is_restriction());

        let flagged = ApiError::Throttled {
            status: 403,
            body: "The file has been flagged".to_string(),
            attempts: 6,
        };
        assert!(flagged.is_restriction());

        let not_allowed = ApiError::Permanent {
            status: 403,
            body: r#"{"reason":"sharingNotAllowed"}"#.to_string(),
        };
        assert!(not_allowed.is_restriction());

        let plain = ApiError::Permanent {
            status: 500,
            body: "Internal error".to_string(),
        };
        assert!(!plain.is_restriction());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_pacing_spacing() {
        let limiter = RateLimiterState::new(PacingConfig::fixed(1200));
        limiter.pace().await;
        let start = Instant::now();
        limiter.pace().await;
        assert!(start.elapsed() >= Duration::from_millis(1200));
        assert!(start.elapsed() < Duration::from_millis(1250));

        assert_eq!(limiter.on_throttled(), 1200);
        assert_eq!(limiter.on_success(), 1200);
    }
}
