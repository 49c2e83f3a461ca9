//! Retry loop with injectable policies
//!
//! One [`RetryManager`] shape serves every retry site (file access, HTTP,
//! fragments). Each site customizes three things independently through
//! [`RetryPolicy`]:
//!
//! - what gets reported ([`RetryPolicy::with_reporter`])
//! - how long to sleep between attempts ([`SleepFunc`])
//! - whether running out of attempts is fatal ([`RetryPolicy::fatal`])

use crate::downloader::progress::format_retries;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Maps a 0-based retry index to the delay before the next attempt.
#[derive(Clone)]
pub struct SleepFunc(Arc<dyn Fn(u32) -> Duration + Send + Sync>);

impl SleepFunc {
    /// Wrap an arbitrary policy
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(u32) -> Duration + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Same delay every time
    pub fn fixed(delay: Duration) -> Self {
        Self::new(move |_| delay)
    }

    /// `start + step * n`, capped at `max` when given
    pub fn linear(start: Duration, step: Duration, max: Option<Duration>) -> Self {
        Self::new(move |n| {
            let delay = start.saturating_add(step.saturating_mul(n));
            max.map_or(delay, |max| delay.min(max))
        })
    }

    /// `base * 2^n`, capped at `max` when given
    pub fn exponential(base: Duration, max: Option<Duration>) -> Self {
        Self::new(move |n| {
            let delay = crate::downloader::config::calculate_backoff(base, n);
            max.map_or(delay, |max| delay.min(max))
        })
    }

    /// Delay before retry number `n` (0-based)
    pub fn delay(&self, n: u32) -> Duration {
        (self.0)(n)
    }
}

impl fmt::Debug for SleepFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SleepFunc(..)")
    }
}

/// Something a retry site may want to tell the user about.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryEvent<'a> {
    /// An attempt failed and another one follows
    Retrying {
        /// Failure message
        error: &'a str,
        /// 1-based number of the failed attempt
        count: u32,
        /// Configured retries, `None` for infinite
        retries: Option<u32>,
        /// Extra context appended to the message
        suffix: Option<&'a str>,
    },
    /// About to sleep before the next attempt
    Sleeping(Duration),
    /// No attempts left
    GivingUp {
        /// Failure message
        error: &'a str,
        /// How many retries were spent
        retries_used: u32,
        /// Whether the failure propagates to the caller
        fatal: bool,
    },
}

impl RetryEvent<'_> {
    /// Message in the wording the downloader prints on screen
    pub fn message(&self) -> String {
        match self {
            RetryEvent::Retrying {
                error,
                count,
                retries,
                suffix,
            } => {
                let suffix = suffix.map(|s| format!(" {s}")).unwrap_or_default();
                format!(
                    "{error}. Retrying{suffix} ({count}/{})...",
                    format_retries(*retries)
                )
            }
            RetryEvent::Sleeping(delay) => {
                format!("Sleeping {:.2} seconds ...", delay.as_secs_f64())
            }
            RetryEvent::GivingUp {
                error,
                retries_used,
                ..
            } => format!("{error}. Giving up after {retries_used} retries"),
        }
    }
}

type Reporter = Arc<dyn Fn(&RetryEvent<'_>) + Send + Sync>;
type Sleeper = Arc<dyn Fn(Duration) + Send + Sync>;

fn log_event(event: &RetryEvent<'_>) {
    match event {
        RetryEvent::Retrying { .. } => warn!("{}", event.message()),
        RetryEvent::Sleeping(_) => info!("{}", event.message()),
        RetryEvent::GivingUp { fatal: true, .. } => error!("{}", event.message()),
        RetryEvent::GivingUp { fatal: false, .. } => warn!("{}", event.message()),
    }
}

/// Policy of one retry site.
#[derive(Clone)]
pub struct RetryPolicy {
    /// Sleep between attempts; `None` retries immediately
    pub sleep_func: Option<SleepFunc>,
    /// Propagate the last error once attempts run out
    pub fatal: bool,
    /// Context appended to "Retrying" messages (e.g. "(fragment 3)")
    pub suffix: Option<String>,
    reporter: Reporter,
    sleeper: Sleeper,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            sleep_func: None,
            fatal: true,
            suffix: None,
            reporter: Arc::new(log_event),
            sleeper: Arc::new(std::thread::sleep),
        }
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("sleep_func", &self.sleep_func)
            .field("fatal", &self.fatal)
            .field("suffix", &self.suffix)
            .finish_non_exhaustive()
    }
}

impl RetryPolicy {
    /// Fatal policy without sleeping
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the sleep policy
    pub fn with_sleep_func(mut self, sleep_func: Option<SleepFunc>) -> Self {
        self.sleep_func = sleep_func;
        self
    }

    /// Choose whether exhaustion propagates the error
    pub fn fatal(mut self, fatal: bool) -> Self {
        self.fatal = fatal;
        self
    }

    /// Append context to "Retrying" messages
    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = Some(suffix.into());
        self
    }

    /// Replace the default tracing reporter
    pub fn with_reporter<F>(mut self, reporter: F) -> Self
    where
        F: Fn(&RetryEvent<'_>) + Send + Sync + 'static,
    {
        self.reporter = Arc::new(reporter);
        self
    }

    /// Replace `std::thread::sleep`, mostly for tests
    pub fn with_sleeper<F>(mut self, sleeper: F) -> Self
    where
        F: Fn(Duration) + Send + Sync + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }
}

/// What [`report_retry`] decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Run another attempt
    Retry,
    /// Stop; `fatal` tells whether to propagate
    GiveUp {
        /// Propagate the error to the caller
        fatal: bool,
    },
}

/// Report a failed attempt and sleep if another one follows.
///
/// `count` is the 1-based number of the attempt that failed.
pub fn report_retry(
    policy: &RetryPolicy,
    error: &dyn fmt::Display,
    count: u32,
    retries: Option<u32>,
) -> RetryDecision {
    let message = error.to_string();
    if retries.is_some_and(|retries| count > retries) {
        (policy.reporter)(&RetryEvent::GivingUp {
            error: &message,
            retries_used: count.saturating_sub(1),
            fatal: policy.fatal,
        });
        return RetryDecision::GiveUp {
            fatal: policy.fatal,
        };
    }

    (policy.reporter)(&RetryEvent::Retrying {
        error: &message,
        count,
        retries,
        suffix: policy.suffix.as_deref(),
    });

    if let Some(sleep_func) = &policy.sleep_func {
        let delay = sleep_func.delay(count.saturating_sub(1));
        if !delay.is_zero() {
            (policy.reporter)(&RetryEvent::Sleeping(delay));
            (policy.sleeper)(delay);
        }
    }
    RetryDecision::Retry
}

/// One try handed to the operation under retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    /// 1-based attempt number
    pub number: u32,
    /// Configured retries, `None` for infinite
    pub retries: Option<u32>,
}

impl Attempt {
    /// Whether this is the first try
    pub fn is_first(&self) -> bool {
        self.number == 1
    }
}

/// How an attempt failed.
#[derive(Debug)]
pub enum AttemptError<E> {
    /// Worth another attempt
    Retry(E),
    /// Not worth retrying; treated as immediately exhausted
    Abort(E),
}

/// Retry loop: runs the operation until it succeeds or attempts run out.
pub struct RetryManager {
    retries: Option<u32>,
    policy: RetryPolicy,
}

impl RetryManager {
    /// `retries` counts tries after the first; `None` retries forever
    pub fn new(retries: Option<u32>, policy: RetryPolicy) -> Self {
        Self { retries, policy }
    }

    /// Configured retries
    pub fn retries(&self) -> Option<u32> {
        self.retries
    }

    /// Run `op` under this manager's policy.
    ///
    /// Returns `Ok(Some(value))` on success, `Ok(None)` when attempts ran out
    /// under a non-fatal policy, and `Err(last_error)` when they ran out under
    /// a fatal one.
    pub fn run<T, E, F>(&self, mut op: F) -> Result<Option<T>, E>
    where
        E: fmt::Display,
        F: FnMut(Attempt) -> Result<T, AttemptError<E>>,
    {
        let mut number = 1;
        loop {
            let attempt = Attempt {
                number,
                retries: self.retries,
            };
            let (error, decision) = match op(attempt) {
                Ok(value) => return Ok(Some(value)),
                Err(AttemptError::Retry(e)) => {
                    let decision = report_retry(&self.policy, &e, number, self.retries);
                    (e, decision)
                }
                Err(AttemptError::Abort(e)) => {
                    let decision = report_retry(&self.policy, &e, 1, Some(0));
                    (e, decision)
                }
            };
            match decision {
                RetryDecision::Retry => number += 1,
                RetryDecision::GiveUp { fatal: true } => return Err(error),
                RetryDecision::GiveUp { fatal: false } => return Ok(None),
            }
        }
    }
}
