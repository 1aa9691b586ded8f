//! Retry classification for remote failures.
//!
//! Classification is structural: a rule looks at the status code, the error
//! code token or the message text an error exposes through [`Classify`], never
//! at its concrete type. Rules are independent and an [`ErrorClassifier`] is
//! just an ordered list of them, so a new transient signature is one more
//! rule in one place.

use serde::{Deserialize, Serialize};

use crate::error::STATUS_NOT_FOUND;

/// Marker the git service returns when a push raced another writer.
pub const CONCURRENT_UPDATE_MARKER: &str = "has already been updated by another client";

/// Marker returned while a dependent resource is still being provisioned.
pub const PROVISIONING_MARKER: &str = "is still being provisioned";

/// Retry policy class for a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Retryable,
    Fatal,
}

/// Structural attributes a classifier may inspect.
pub trait Classify {
    /// Numeric status code, when the failure carried one.
    fn status_code(&self) -> Option<u16>;

    /// Human readable message text.
    fn message(&self) -> &str;

    /// Backend error code / type key token, when present.
    fn error_code(&self) -> Option<&str> {
        None
    }
}

/// A single retryability predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rule {
    /// Exact status code match.
    Status(u16),
    /// Inclusive status code range.
    StatusRange(u16, u16),
    /// Case-insensitive substring of the message.
    MessageContains(String),
    /// Exact (case-insensitive) error code token.
    ErrorCode(String),
}

impl Rule {
    pub fn matches<E: Classify + ?Sized>(&self, err: &E) -> bool {
        match self {
            Rule::Status(status) => err.status_code() == Some(*status),
            Rule::StatusRange(low, high) => err
                .status_code()
                .map(|status| (*low..=*high).contains(&status))
                .unwrap_or(false),
            Rule::MessageContains(marker) => err
                .message()
                .to_ascii_lowercase()
                .contains(&marker.to_ascii_lowercase()),
            Rule::ErrorCode(code) => err
                .error_code()
                .map(|value| value.eq_ignore_ascii_case(code))
                .unwrap_or(false),
        }
    }
}

/// Composable classifier: retryable when any rule matches, fatal otherwise.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorClassifier {
    rules: Vec<Rule>,
}

impl ErrorClassifier {
    /// A classifier with no rules treats every error as fatal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Retries reads that may not yet see a freshly written entity.
    pub fn not_found() -> Self {
        Self::new().retry_status(STATUS_NOT_FOUND)
    }

    /// Retries backend signatures that mean "a dependency is not ready yet".
    pub fn dependency_pending() -> Self {
        Self::new()
            .retry_message(CONCURRENT_UPDATE_MARKER)
            .retry_message(PROVISIONING_MARKER)
    }

    /// Retries throttling, request timeouts and server-side failures.
    pub fn transient_http() -> Self {
        Self::new()
            .retry_status(408)
            .retry_status(429)
            .retry_status_range(500, 599)
    }

    pub fn with_rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn retry_status(self, status: u16) -> Self {
        self.with_rule(Rule::Status(status))
    }

    pub fn retry_status_range(self, low: u16, high: u16) -> Self {
        self.with_rule(Rule::StatusRange(low, high))
    }

    pub fn retry_message(self, marker: impl Into<String>) -> Self {
        self.with_rule(Rule::MessageContains(marker.into()))
    }

    pub fn retry_error_code(self, code: impl Into<String>) -> Self {
        self.with_rule(Rule::ErrorCode(code.into()))
    }

    /// Union of both rule sets.
    pub fn merge(mut self, other: ErrorClassifier) -> Self {
        for rule in other.rules {
            if !self.rules.contains(&rule) {
                self.rules.push(rule);
            }
        }
        self
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Classify error for retry policy.
    pub fn classify<E: Classify + ?Sized>(&self, err: &E) -> Classification {
        if self.rules.iter().any(|rule| rule.matches(err)) {
            Classification::Retryable
        } else {
            Classification::Fatal
        }
    }

    /// Classify the error side of a result. Success is never classified.
    pub fn classify_result<T, E: Classify>(&self, result: &Result<T, E>) -> Option<Classification> {
        result.as_ref().err().map(|err| self.classify(err))
    }
}
