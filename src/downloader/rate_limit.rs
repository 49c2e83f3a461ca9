//! Byte-rate throttling
//!
//! Keeps a transfer under a bytes/sec ceiling by sleeping after each block.
//! The computation is a pure function of elapsed time and bytes so it can be
//! tested without a clock.

use std::time::{Duration, Instant};

/// Byte-rate limiter for the synchronous engine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimiter {
    rate_limit: Option<u64>,
}

impl RateLimiter {
    /// Limiter with a ceiling in bytes/sec; `None` never sleeps
    pub fn new(rate_limit: Option<u64>) -> Self {
        Self { rate_limit }
    }

    /// Limiter that never sleeps
    pub fn unlimited() -> Self {
        Self { rate_limit: None }
    }

    /// Configured ceiling
    pub fn rate_limit(&self) -> Option<u64> {
        self.rate_limit
    }

    /// Time to sleep so that `bytes` over `elapsed` stays within the ceiling.
    ///
    /// `None` when no sleep is needed: no limit, nothing transferred, no
    /// elapsed time, or already under the ceiling.
    pub fn throttle_delay(&self, elapsed: Duration, bytes: u64) -> Option<Duration> {
        let rate_limit = self.rate_limit.filter(|limit| *limit > 0)?;
        if bytes == 0 || elapsed.is_zero() {
            return None;
        }

        let elapsed = elapsed.as_secs_f64();
        let speed = bytes as f64 / elapsed;
        if speed <= rate_limit as f64 {
            return None;
        }

        let sleep = bytes as f64 / rate_limit as f64 - elapsed;
        (sleep > 0.0).then(|| Duration::from_secs_f64(sleep))
    }

    /// Block the current thread long enough to respect the ceiling.
    ///
    /// Callers sharing a thread stall during the sleep.
    pub fn slow_down(&self, start: Instant, now: Instant, bytes: u64) {
        let elapsed = now.saturating_duration_since(start);
        if let Some(delay) = self.throttle_delay(elapsed, bytes) {
            std::thread::sleep(delay);
        }
    }
}

/// Parse a byte count such as `50K`, `4.2M` or `1GiB` (binary multiples).
pub fn parse_bytes(input: &str) -> Result<u64, RateLimitError> {
    let trimmed = input.trim();
    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);

    let number: f64 = number
        .parse()
        .map_err(|_| RateLimitError::InvalidByteCount(input.to_string()))?;

    let unit = unit.trim().to_ascii_uppercase();
    let unit = unit
        .strip_suffix("IB")
        .or_else(|| unit.strip_suffix('B'))
        .unwrap_or(unit.as_str());
    let exponent = match unit {
        "" => 0,
        "K" => 1,
        "M" => 2,
        "G" => 3,
        "T" => 4,
        "P" => 5,
        _ => return Err(RateLimitError::InvalidByteCount(input.to_string())),
    };

    Ok((number * 1024f64.powi(exponent)).round() as u64)
}

/// Rate limiter errors
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RateLimitError {
    /// Byte count could not be parsed
    #[error("invalid byte count: {0}")]
    InvalidByteCount(String),
}
