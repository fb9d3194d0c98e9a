//! Retry with fixed backoff
//!
//! Two entry points share one policy:
//! - [`AttemptController`] retries an arbitrary block of code. The caller asks for
//!   attempt handles and reports each outcome back:
//!
//!   ```ignore
//!   let mut attempts = AttemptController::new(policy, TokioSleeper);
//!   while let Some(attempt) = attempts.next_attempt() {
//!       let outcome = download(&url).await;
//!       if let Some(body) = attempt.complete(outcome).await? {
//!           return Ok(body);
//!       }
//!   }
//!   ```
//!
//! - [`retry`] wraps a single callable and re-invokes it with the same arguments.
//!
//! Failures are never wrapped: once attempts run out, the caller gets the last
//! failure back unchanged.

use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::RetryConfigError;
use crate::sleep::Sleeper;

/// Smallest accepted `num_attempts`; one attempt would never retry.
pub const MIN_ATTEMPTS: u32 = 2;

/// How many times to try and how long to wait in between
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    num_attempts: u32,
    sleep: Duration,
}

impl RetryPolicy {
    pub fn new(num_attempts: u32, sleep_seconds: f64) -> Result<Self, RetryConfigError> {
        if num_attempts < MIN_ATTEMPTS {
            return Err(RetryConfigError::TooFewAttempts {
                min: MIN_ATTEMPTS,
                got: num_attempts,
            });
        }
        let sleep = match Duration::try_from_secs_f64(sleep_seconds) {
            Ok(sleep) if !sleep.is_zero() => sleep,
            _ => return Err(RetryConfigError::InvalidSleep(sleep_seconds)),
        };
        Ok(Self {
            num_attempts,
            sleep,
        })
    }

    pub fn num_attempts(&self) -> u32 {
        self.num_attempts
    }

    pub fn sleep(&self) -> Duration {
        self.sleep
    }
}

/// Tagged result of one attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome<T, E> {
    Ok(T),
    /// Worth another try if any remain
    Retryable(E),
    /// Propagate immediately regardless of remaining attempts
    Fatal(E),
}

/// Conversion into an [`AttemptOutcome`]. A plain `Result` treats every error as retryable.
pub trait IntoOutcome {
    type Value;
    type Error;

    fn into_outcome(self) -> AttemptOutcome<Self::Value, Self::Error>;
}

impl<T, E> IntoOutcome for AttemptOutcome<T, E> {
    type Value = T;
    type Error = E;

    fn into_outcome(self) -> AttemptOutcome<T, E> {
        self
    }
}

impl<T, E> IntoOutcome for Result<T, E> {
    type Value = T;
    type Error = E;

    fn into_outcome(self) -> AttemptOutcome<T, E> {
        match self {
            Ok(value) => AttemptOutcome::Ok(value),
            Err(e) => AttemptOutcome::Retryable(e),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    Ok,
    Retryable,
    Fatal,
}

impl<T, E> AttemptOutcome<T, E> {
    pub fn kind(&self) -> OutcomeKind {
        match self {
            AttemptOutcome::Ok(_) => OutcomeKind::Ok,
            AttemptOutcome::Retryable(_) => OutcomeKind::Retryable,
            AttemptOutcome::Fatal(_) => OutcomeKind::Fatal,
        }
    }
}

/// What the controller does with a finished attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Succeed,
    Retry,
    Propagate,
}

/// Decide the fate of an attempt from its outcome and the attempts left after it.
pub fn decide(kind: OutcomeKind, remaining: u32) -> Decision {
    match kind {
        OutcomeKind::Ok => Decision::Succeed,
        OutcomeKind::Fatal => Decision::Propagate,
        OutcomeKind::Retryable if remaining == 0 => Decision::Propagate,
        OutcomeKind::Retryable => Decision::Retry,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    /// Ready to hand out the next attempt
    Pending,
    /// An attempt handle is checked out
    InAttempt,
    Succeeded,
    /// The last attempt failed and its failure was propagated
    Exhausted,
    /// A fatal outcome, or a handle dropped without an outcome
    Aborted,
}

/// Drives repeated execution of a caller-supplied block.
pub struct AttemptController<S: Sleeper> {
    policy: RetryPolicy,
    sleeper: S,
    current_attempt: u32,
    state: ControllerState,
}

impl<S: Sleeper> AttemptController<S> {
    pub fn new(policy: RetryPolicy, sleeper: S) -> Self {
        Self {
            policy,
            sleeper,
            current_attempt: 0,
            state: ControllerState::Pending,
        }
    }

    /// Check out the next attempt, or `None` once the controller has finished.
    pub fn next_attempt(&mut self) -> Option<Attempt<'_, S>> {
        if self.state != ControllerState::Pending {
            return None;
        }
        Some(self.begin_attempt())
    }

    fn begin_attempt(&mut self) -> Attempt<'_, S> {
        self.current_attempt += 1;
        self.state = ControllerState::InAttempt;
        Attempt {
            controller: self,
            reported: false,
        }
    }

    /// Run `op` until it succeeds, fails fatally, or attempts run out.
    ///
    /// `op` receives the 1-based attempt number.
    pub async fn run<F, Fut, O>(mut self, mut op: F) -> Result<O::Value, O::Error>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = O>,
        O: IntoOutcome,
        O::Error: Debug,
    {
        // Every outcome either returns or leaves the controller Pending
        loop {
            let attempt = self.begin_attempt();
            let outcome = op(attempt.number()).await;
            if let Some(value) = attempt.complete(outcome).await? {
                return Ok(value);
            }
        }
    }

    /// Attempts handed out so far
    pub fn current_attempt(&self) -> u32 {
        self.current_attempt
    }

    pub fn num_attempts(&self) -> u32 {
        self.policy.num_attempts
    }

    /// Attempts left after the current one
    pub fn remaining(&self) -> u32 {
        self.policy.num_attempts.saturating_sub(self.current_attempt)
    }

    pub fn succeeded(&self) -> bool {
        self.state == ControllerState::Succeeded
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn sleeper(&self) -> &S {
        &self.sleeper
    }
}

/// One checked-out attempt. Report its outcome with [`Attempt::complete`].
///
/// Dropping the handle without reporting aborts the controller.
pub struct Attempt<'a, S: Sleeper> {
    controller: &'a mut AttemptController<S>,
    reported: bool,
}

impl<S: Sleeper> Attempt<'_, S> {
    /// 1-based attempt number
    pub fn number(&self) -> u32 {
        self.controller.current_attempt
    }

    /// Report the outcome of this attempt.
    ///
    /// Returns `Ok(Some(value))` on success, `Ok(None)` after a retryable failure
    /// has been logged and slept on, and `Err(e)` when the failure must propagate.
    pub async fn complete<O>(mut self, outcome: O) -> Result<Option<O::Value>, O::Error>
    where
        O: IntoOutcome,
        O::Error: Debug,
    {
        let outcome = outcome.into_outcome();
        let remaining = self.controller.remaining();
        let decision = decide(outcome.kind(), remaining);

        let result = match (decision, outcome) {
            (_, AttemptOutcome::Ok(value)) => {
                self.controller.state = ControllerState::Succeeded;
                Ok(Some(value))
            }
            (Decision::Retry, AttemptOutcome::Retryable(e)) => {
                log_and_sleep(&e, &*self.controller, remaining).await;
                self.controller.state = ControllerState::Pending;
                Ok(None)
            }
            (_, AttemptOutcome::Retryable(e)) => {
                warn!(
                    "Attempt {} of {} failed, no attempts remaining: {:?}",
                    self.controller.current_attempt, self.controller.policy.num_attempts, e
                );
                self.controller.state = ControllerState::Exhausted;
                Err(e)
            }
            (_, AttemptOutcome::Fatal(e)) => {
                warn!(
                    "Attempt {} failed with a non-retryable error: {:?}",
                    self.controller.current_attempt, e
                );
                self.controller.state = ControllerState::Aborted;
                Err(e)
            }
        };
        self.reported = true;
        result
    }
}

impl<S: Sleeper> Drop for Attempt<'_, S> {
    fn drop(&mut self) {
        if !self.reported {
            debug!(
                "Attempt {} dropped without an outcome; no further attempts",
                self.controller.current_attempt
            );
            self.controller.state = ControllerState::Aborted;
        }
    }
}

async fn log_and_sleep<E: Debug, S: Sleeper>(
    error: &E,
    controller: &AttemptController<S>,
    remaining: u32,
) {
    warn!("Caught retryable error: {:?}", error);
    info!(
        "Sleeping for {} second(s), {} attempt(s) remaining...",
        controller.policy.sleep.as_secs_f64(),
        remaining
    );
    controller.sleeper.sleep(controller.policy.sleep).await;
}

/// Wrap `func` so each call is retried according to `policy`.
pub fn retry<F, S>(func: F, policy: RetryPolicy, sleeper: S) -> Retrying<F, S>
where
    S: Sleeper,
{
    Retrying {
        func,
        policy,
        sleeper,
    }
}

/// A callable wrapped by [`retry`]
pub struct Retrying<F, S: Sleeper> {
    func: F,
    policy: RetryPolicy,
    sleeper: S,
}

impl<F, S: Sleeper> Retrying<F, S> {
    /// Call the wrapped function with `args`, cloning them for each attempt.
    pub async fn call<A, Fut, T, E>(&self, args: A) -> Result<T, E>
    where
        F: Fn(A) -> Fut,
        A: Clone,
        Fut: Future<Output = Result<T, E>>,
        E: Debug,
    {
        AttemptController::new(self.policy, &self.sleeper)
            .run(|_| (self.func)(args.clone()))
            .await
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }
}
