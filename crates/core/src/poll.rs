//! Convergence polling against an eventually consistent backend.
//!
//! A write being accepted does not mean the next read reflects it, and one
//! matching read can still be followed by a stale one. [`Poller`] re-reads
//! the remote state until a predicate holds for
//! `required_consecutive_successes` polls in a row, the timeout elapses, or
//! the refresh itself fails.

use log::{debug, info, warn};
use std::collections::HashSet;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::RetryPolicy;
use crate::diff::DiffResult;

/// Poller state. `Converged` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Waiting { streak: u32 },
    Converged,
    Failed,
}

/// Inputs that drive [`PollState`] transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollEvent {
    Matched,
    Mismatched,
    RefreshFailed,
    DeadlineElapsed,
    Cancelled,
}

impl PollState {
    pub const INITIAL: PollState = PollState::Waiting { streak: 0 };

    pub fn is_terminal(self) -> bool {
        !matches!(self, PollState::Waiting { .. })
    }

    /// Transition function. Terminal states absorb every event.
    pub fn on(self, event: PollEvent, required: u32) -> PollState {
        match (self, event) {
            (PollState::Converged, _) | (PollState::Failed, _) => self,
            (PollState::Waiting { streak }, PollEvent::Matched) => {
                let streak = streak.saturating_add(1);
                if streak >= required.max(1) {
                    PollState::Converged
                } else {
                    PollState::Waiting { streak }
                }
            }
            (PollState::Waiting { .. }, PollEvent::Mismatched) => PollState::Waiting { streak: 0 },
            (
                PollState::Waiting { .. },
                PollEvent::RefreshFailed | PollEvent::DeadlineElapsed | PollEvent::Cancelled,
            ) => PollState::Failed,
        }
    }
}

/// Successful convergence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOutcome {
    pub polls: u32,
    pub elapsed: Duration,
}

/// Why a convergence wait ended in `Failed`.
#[derive(Debug, Error)]
pub enum ConvergenceError<E> {
    #[error("{operation} of {entity} did not converge within {timeout:?} ({polls} polls): {pending}")]
    Timeout {
        operation: String,
        entity: String,
        polls: u32,
        timeout: Duration,
        pending: String,
    },

    #[error("{operation} of {entity}: refreshing state failed after {polls} polls: {source}")]
    Refresh {
        operation: String,
        entity: String,
        polls: u32,
        #[source]
        source: E,
    },

    #[error("{operation} of {entity}: cancelled after {polls} polls")]
    Cancelled {
        operation: String,
        entity: String,
        polls: u32,
    },
}

impl<E> ConvergenceError<E> {
    pub fn polls(&self) -> u32 {
        match self {
            Self::Timeout { polls, .. } | Self::Refresh { polls, .. } | Self::Cancelled { polls, .. } => {
                *polls
            }
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Drives one convergence wait. Built per call site, never shared.
#[derive(Debug, Clone)]
pub struct Poller {
    policy: RetryPolicy,
    operation: String,
    entity: String,
}

impl Poller {
    /// `operation` and `entity` only feed log lines and error messages.
    pub fn new(policy: RetryPolicy, operation: impl Into<String>, entity: impl Into<String>) -> Self {
        Self {
            policy,
            operation: operation.into(),
            entity: entity.into(),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Poll `refresh` until `predicate` holds for enough consecutive reads.
    pub async fn wait_for<A, E, F, Fut, P>(
        &self,
        refresh: F,
        mut predicate: P,
        cancel: &CancellationToken,
    ) -> Result<PollOutcome, ConvergenceError<E>>
    where
        E: Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<A, E>>,
        P: FnMut(&A) -> bool,
    {
        self.run(
            refresh,
            |actual: &A| predicate(actual),
            |_: Option<&A>| "condition not met".to_string(),
            cancel,
        )
        .await
    }

    /// Poll an observed member set against a diff that was just applied.
    /// A timeout error lists the additions and removals that never settled.
    pub async fn wait_for_diff<E, F, Fut, P>(
        &self,
        refresh: F,
        diff: &DiffResult,
        mut predicate: P,
        cancel: &CancellationToken,
    ) -> Result<PollOutcome, ConvergenceError<E>>
    where
        E: Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<HashSet<String>, E>>,
        P: FnMut(&HashSet<String>, &DiffResult) -> bool,
    {
        self.run(
            refresh,
            |actual: &HashSet<String>| predicate(actual, diff),
            |last: Option<&HashSet<String>>| match last {
                Some(actual) => diff.unsettled(actual).to_string(),
                None => diff.to_string(),
            },
            cancel,
        )
        .await
    }

    /// [`Poller::wait_for_diff`] with the standard "diff is reflected" check.
    pub async fn wait_for_reflection<E, F, Fut>(
        &self,
        refresh: F,
        diff: &DiffResult,
        cancel: &CancellationToken,
    ) -> Result<PollOutcome, ConvergenceError<E>>
    where
        E: Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<HashSet<String>, E>>,
    {
        self.wait_for_diff(
            refresh,
            diff,
            |actual, diff| diff.is_reflected_in(actual),
            cancel,
        )
        .await
    }

    /// Poll until `refresh` stops finding the entity.
    pub async fn wait_for_absence<T, E, F, Fut>(
        &self,
        refresh: F,
        cancel: &CancellationToken,
    ) -> Result<PollOutcome, ConvergenceError<E>>
    where
        E: Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
    {
        self.run(
            refresh,
            |found: &Option<T>| found.is_none(),
            |_: Option<&Option<T>>| "entity is still present".to_string(),
            cancel,
        )
        .await
    }

    async fn run<A, E, F, Fut, P, D>(
        &self,
        mut refresh: F,
        mut predicate: P,
        describe_pending: D,
        cancel: &CancellationToken,
    ) -> Result<PollOutcome, ConvergenceError<E>>
    where
        E: Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<A, E>>,
        P: FnMut(&A) -> bool,
        D: Fn(Option<&A>) -> String,
    {
        let required = self.policy.required_successes();
        let started = Instant::now();
        let mut state = PollState::INITIAL;
        let mut polls = 0u32;
        let mut last: Option<A> = None;

        if !self.policy.delay.is_zero() && !self.pause(self.policy.delay, cancel).await {
            return Err(self.cancelled(state, polls));
        }

        loop {
            let elapsed = started.elapsed();
            if elapsed >= self.policy.timeout {
                let next = state.on(PollEvent::DeadlineElapsed, required);
                let pending = describe_pending(last.as_ref());
                warn!(
                    "{} of {}: {:?} -> {:?} after {:?} ({} polls): {}",
                    self.operation, self.entity, state, next, elapsed, polls, pending
                );
                return Err(ConvergenceError::Timeout {
                    operation: self.operation.clone(),
                    entity: self.entity.clone(),
                    polls,
                    timeout: self.policy.timeout,
                    pending,
                });
            }

            polls = polls.saturating_add(1);
            let actual = match refresh().await {
                Ok(actual) => actual,
                Err(source) => {
                    let next = state.on(PollEvent::RefreshFailed, required);
                    warn!(
                        "{} of {}: {:?} -> {:?}, refresh failed: {}",
                        self.operation, self.entity, state, next, source
                    );
                    return Err(ConvergenceError::Refresh {
                        operation: self.operation.clone(),
                        entity: self.entity.clone(),
                        polls,
                        source,
                    });
                }
            };

            let event = if predicate(&actual) {
                PollEvent::Matched
            } else {
                PollEvent::Mismatched
            };
            let next = state.on(event, required);
            debug!(
                "{} of {}: poll {} {:?}, {:?} -> {:?}",
                self.operation, self.entity, polls, event, state, next
            );
            state = next;
            last = Some(actual);

            if state == PollState::Converged {
                let elapsed = started.elapsed();
                info!(
                    "{} of {} converged after {} polls ({:?})",
                    self.operation, self.entity, polls, elapsed
                );
                return Ok(PollOutcome { polls, elapsed });
            }

            let remaining = self.policy.timeout.saturating_sub(started.elapsed());
            if !self.pause(self.policy.min_interval.min(remaining), cancel).await {
                return Err(self.cancelled(state, polls));
            }
        }
    }

    /// Sleep unless cancelled first. Returns false on cancellation.
    async fn pause(&self, duration: Duration, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = sleep(duration) => true,
        }
    }

    fn cancelled<E>(&self, state: PollState, polls: u32) -> ConvergenceError<E> {
        debug!(
            "{} of {}: {:?} -> {:?} (cancelled)",
            self.operation,
            self.entity,
            state,
            state.on(PollEvent::Cancelled, self.policy.required_successes())
        );
        ConvergenceError::Cancelled {
            operation: self.operation.clone(),
            entity: self.entity.clone(),
            polls,
        }
    }
}
