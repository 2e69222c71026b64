// Bounded, class-selective retries for object-store operations, and the
// page cursor used when listing the parts of a multipart upload.

use crate::config::UploadConfig;
use crate::error::{Error, Result};
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

/// Decides whether a failed attempt may be repeated and how often.
pub trait RetryPolicy {
    /// Whether `error` is worth another attempt.
    fn should_retry(&self, error: &Error) -> bool;

    /// Total number of attempts, the first one included.
    fn max_attempts(&self) -> u32;

    /// Pause before attempt `attempt + 1`.
    fn delay(&self, _attempt: u32) -> Duration {
        Duration::ZERO
    }
}

/// Retries object-store replies in the 5xx class only. Anything else,
/// connection failures included, aborts on the first occurrence.
#[derive(Debug, Clone)]
pub struct ServerErrorPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl ServerErrorPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
        }
    }

    pub fn from_config(config: &UploadConfig) -> Self {
        Self {
            max_attempts: config.max_retries,
            base_delay: Duration::from_millis(config.retry_delay_ms),
        }
    }
}

impl Default for ServerErrorPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

impl RetryPolicy for ServerErrorPolicy {
    fn should_retry(&self, error: &Error) -> bool {
        matches!(error, Error::Transfer(e) if e.is_server_error())
    }

    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn delay(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }
}

/// Run `operation` until it succeeds, the policy refuses the error, or the
/// attempt bound is reached. The last error is returned unmodified.
pub fn with_retry<T, F>(policy: &dyn RetryPolicy, name: &str, mut operation: F) -> Result<T>
where
    F: FnMut(u32) -> Result<T>,
{
    let max = policy.max_attempts().max(1);
    let mut attempt = 1;
    loop {
        match operation(attempt) {
            Ok(value) => {
                if attempt > 1 {
                    info!(operation = name, attempt, "succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => {
                if attempt >= max || !policy.should_retry(&err) {
                    return Err(err);
                }
                let delay = policy.delay(attempt);
                warn!(operation = name, attempt, max, error = %err, "retrying");
                if !delay.is_zero() {
                    thread::sleep(delay);
                }
                attempt += 1;
            }
        }
    }
}

/// One page of a marker-paginated listing.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub is_truncated: bool,
    pub next_marker: u64,
}

/// Cursor over a marker-paginated listing (e.g. `part-number-marker`).
///
/// The cursor only ever moves forward. A failed fetch still advances it by
/// one and clears the truncation flag, so a retry never re-requests the
/// page that just failed and a caller looping on `is_truncated` stops once
/// the retry budget is spent.
#[derive(Debug, Clone, Default)]
pub struct Paginator {
    next_marker: u64,
    is_truncated: bool,
    started: bool,
}

impl Paginator {
    pub fn new(start_marker: u64) -> Self {
        Self {
            next_marker: start_marker,
            is_truncated: false,
            started: false,
        }
    }

    pub fn next_marker(&self) -> u64 {
        self.next_marker
    }

    /// Whether the server announced more pages after the last fetch.
    pub fn is_truncated(&self) -> bool {
        self.is_truncated
    }

    /// True before the first fetch and while more pages follow.
    pub fn has_more(&self) -> bool {
        !self.started || self.is_truncated
    }

    /// Fetch the page at the current cursor, retrying per `policy`.
    pub fn fetch_with_retry<T, F>(&mut self, policy: &dyn RetryPolicy, mut fetch: F) -> Result<Vec<T>>
    where
        F: FnMut(u64) -> Result<Page<T>>,
    {
        self.started = true;
        let max = policy.max_attempts().max(1);
        let mut attempt = 1;
        loop {
            let marker = self.next_marker;
            self.is_truncated = false;

            match fetch(marker) {
                Ok(page) => {
                    if page.is_truncated && page.next_marker <= marker {
                        warn!(marker, next = page.next_marker, "listing cursor did not advance, stopping");
                    } else {
                        self.is_truncated = page.is_truncated;
                    }
                    self.next_marker = page.next_marker.max(marker);
                    return Ok(page.items);
                }
                Err(err) => {
                    self.next_marker = marker + 1;
                    if attempt >= max || !policy.should_retry(&err) {
                        return Err(err);
                    }
                    warn!(marker, attempt, max, error = %err, "page fetch failed, advancing cursor");
                    let delay = policy.delay(attempt);
                    if !delay.is_zero() {
                        thread::sleep(delay);
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Drain every page.
    pub fn collect_all<T, F>(&mut self, policy: &dyn RetryPolicy, mut fetch: F) -> Result<Vec<T>>
    where
        F: FnMut(u64) -> Result<Page<T>>,
    {
        let mut all = Vec::new();
        while self.has_more() {
            all.extend(self.fetch_with_retry(policy, &mut fetch)?);
        }
        Ok(all)
    }
}
