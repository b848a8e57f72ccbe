//! Retry policies and the retryable/fatal error boundary.
//!
//! A policy is a pure function from the zero-based attempt count to a delay
//! and a give-up flag; the executor owns the loop. The boundary between
//! "retry with a fresh connection" and "surface immediately" is an explicit
//! [`ErrorClassifier`] rather than hard-coded message matching: defaults are
//! variant-based, and deployments can widen or narrow both sets with regex
//! rules loadable from JSON.

use std::time::Duration;

use regex::RegexSet;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::SessionError;

/// Decides how long to wait before the next attempt, and when to stop.
pub trait RetryPolicy: Send + Sync {
    /// Returns `(delay, give_up)` for the given zero-based attempt count.
    ///
    /// `attempt` is the number of failures observed so far: the first retry
    /// consults `next(0)`.
    fn next(&self, attempt: u32) -> (Duration, bool);
}

/// A policy that never retries.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetry;

impl RetryPolicy for NoRetry {
    fn next(&self, _attempt: u32) -> (Duration, bool) {
        (Duration::ZERO, true)
    }
}

/// Constant delay between attempts.
#[derive(Debug, Clone, Copy)]
pub struct LinearBackoff {
    pub delay: Duration,
    pub max_retries: u32,
}

impl LinearBackoff {
    pub fn new(delay: Duration, max_retries: u32) -> Self {
        Self { delay, max_retries }
    }
}

impl RetryPolicy for LinearBackoff {
    fn next(&self, attempt: u32) -> (Duration, bool) {
        if attempt >= self.max_retries {
            return (Duration::ZERO, true);
        }
        (self.delay, false)
    }
}

/// Exponentially growing delay, capped at `max_delay`.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_retries: u32,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            max_retries: 5,
        }
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn next(&self, attempt: u32) -> (Duration, bool) {
        if attempt >= self.max_retries {
            return (Duration::ZERO, true);
        }
        let factor = 1u32 << attempt.min(16);
        let delay = self.base_delay.saturating_mul(factor).min(self.max_delay);
        (delay, false)
    }
}

/// Regex rules overriding the default retryable/fatal classification.
///
/// Patterns match against the rendered error message. `command_error_patterns`
/// is different in kind: it matches response *lines* and converts a
/// successful send whose output contains a matching line into a
/// non-retryable [`SessionError::CommandFailed`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ClassifierRules {
    /// Error messages to treat as retryable even when the variant is fatal.
    #[serde(default)]
    pub retryable_patterns: Vec<String>,
    /// Error messages to treat as fatal even when the variant is retryable.
    /// Fatal patterns win over retryable ones.
    #[serde(default)]
    pub fatal_patterns: Vec<String>,
    /// Response lines indicating the device rejected the command.
    #[serde(default)]
    pub command_error_patterns: Vec<String>,
}

/// Explicit retryable/fatal boundary consulted by the executor.
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    retryable: RegexSet,
    fatal: RegexSet,
    command_errors: RegexSet,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self {
            retryable: RegexSet::empty(),
            fatal: RegexSet::empty(),
            command_errors: RegexSet::empty(),
        }
    }
}

impl ErrorClassifier {
    /// Builds a classifier from explicit rules.
    pub fn from_rules(rules: &ClassifierRules) -> Result<Self, SessionError> {
        let compile = |patterns: &[String], what: &str| {
            RegexSet::new(patterns).map_err(|err| {
                SessionError::InvalidConfig(format!("bad {what} pattern: {err}"))
            })
        };
        Ok(Self {
            retryable: compile(&rules.retryable_patterns, "retryable")?,
            fatal: compile(&rules.fatal_patterns, "fatal")?,
            command_errors: compile(&rules.command_error_patterns, "command error")?,
        })
    }

    /// Builds a classifier from a JSON rendering of [`ClassifierRules`].
    pub fn from_json(json: &str) -> Result<Self, SessionError> {
        let rules: ClassifierRules = serde_json::from_str(json)
            .map_err(|err| SessionError::InvalidConfig(format!("bad classifier rules: {err}")))?;
        Self::from_rules(&rules)
    }

    /// Whether the executor should retry after this error.
    ///
    /// Pattern overrides are consulted first (fatal wins), then the default
    /// variant-based boundary: only broken-connection errors are transient.
    pub fn is_retryable(&self, err: &SessionError) -> bool {
        let message = err.to_string();
        if self.fatal.is_match(&message) {
            return false;
        }
        if self.retryable.is_match(&message) {
            return true;
        }
        matches!(
            err,
            SessionError::Transport(_)
                | SessionError::Ssh(_)
                | SessionError::Russh(_)
                | SessionError::SessionClosed
        )
    }

    /// Scans response text for a line the device marks as an error.
    ///
    /// Returns the first matching line. With no configured patterns this is
    /// always `None` and error interpretation is left entirely to the
    /// caller's parser.
    pub fn command_failure(&self, output: &[u8]) -> Option<String> {
        if self.command_errors.is_empty() {
            return None;
        }
        let text = String::from_utf8_lossy(output);
        text.lines()
            .find(|line| self.command_errors.is_match(line))
            .map(|line| line.trim().to_string())
    }
}
