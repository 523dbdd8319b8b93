use std::time;

use http::HeaderMap;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
/// Backoff applied to a file that failed to upload before it is attempted again.
pub struct RetryPolicy {
    /// Coefficient to multiply initial_interval with for every past attempt.
    backoff_coefficient: u32,
    /// The backoff interval after the first failure. A zero interval disables backoff entirely.
    initial_interval: time::Duration,
    /// The maximum possible backoff between attempts.
    maximum_interval: Option<time::Duration>,
}

impl RetryPolicy {
    pub fn new(
        backoff_coefficient: u32,
        initial_interval: time::Duration,
        maximum_interval: Option<time::Duration>,
    ) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            maximum_interval,
        }
    }

    /// A policy that never delays: every failed file is eligible again on the next poll cycle.
    pub fn immediate() -> Self {
        Self::new(1, time::Duration::ZERO, None)
    }

    pub fn is_immediate(&self) -> bool {
        self.initial_interval.is_zero()
    }

    /// Calculate the time to wait before the next attempt, given how many attempts failed so far.
    ///
    /// `preferred_retry_interval` is what the remote asked for (e.g. via Retry-After). It is
    /// honored as a lower bound, but never beyond `maximum_interval`.
    pub fn time_until_next_retry(
        &self,
        attempt: u32,
        preferred_retry_interval: Option<time::Duration>,
    ) -> time::Duration {
        if self.is_immediate() {
            return time::Duration::ZERO;
        }

        let exponent = attempt.saturating_sub(1);
        let multiplier = self.backoff_coefficient.saturating_pow(exponent);
        let candidate_interval = self
            .initial_interval
            .checked_mul(multiplier)
            .unwrap_or(time::Duration::MAX);

        match (preferred_retry_interval, self.maximum_interval) {
            (Some(duration), Some(max_interval)) => std::cmp::min(
                std::cmp::max(std::cmp::min(candidate_interval, max_interval), duration),
                max_interval,
            ),
            (Some(duration), None) => std::cmp::max(candidate_interval, duration),
            (None, Some(max_interval)) => std::cmp::min(candidate_interval, max_interval),
            (None, None) => candidate_interval,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::immediate()
    }
}

/// Attempt to parse a Retry-After header, returning None if not possible.
/// Retry-After header can specify a date in RFC2822 or a number of seconds; we try to parse both.
pub fn parse_retry_after_header(header_map: &HeaderMap) -> Option<time::Duration> {
    let retry_after = header_map
        .get(http::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim();

    if let Ok(u) = retry_after.parse::<u64>() {
        return Some(time::Duration::from_secs(u));
    }

    if let Ok(dt) = chrono::DateTime::parse_from_rfc2822(retry_after) {
        let duration =
            chrono::DateTime::<chrono::offset::Utc>::from(dt) - chrono::offset::Utc::now();

        // This can only fail when negative, in which case we return None.
        return duration.to_std().ok();
    }

    None
}
