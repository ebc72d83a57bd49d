//! Retry engine shared by every pipeline stage.
//!
//! A stage runs one async operation under a [`RetryPolicy`]; its failures
//! are classified into a [`Disposition`] so idempotent conflicts settle the
//! stage instead of retrying it. The cancellation channel is observed at
//! every iteration boundary, including mid-sleep.

use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::sync::watch;

use parley_core::broker::{BrokerError, BrokerErrorKind};

/// How one failed attempt should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Transient; retry under the stage policy.
    Retry,
    /// Abort the task.
    Fatal,
    /// The desired effect was already applied; the stage is complete.
    Settled,
}

/// Retry policy for one pipeline stage.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// `None` retries indefinitely.
    pub max_attempts: Option<u32>,
    pub delay: Duration,
    /// Extra uniform delay per retry; nonzero only for unbounded policies.
    pub jitter: Duration,
}

impl RetryPolicy {
    pub fn bounded(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            delay,
            jitter: Duration::ZERO,
        }
    }

    pub fn indefinite(delay: Duration) -> Self {
        Self {
            max_attempts: None,
            delay,
            jitter: delay / 2,
        }
    }
}

/// Outcome of a completed stage.
#[derive(Debug)]
pub enum StageResult<T> {
    Completed(T),
    /// The stage's effect already existed; nothing was done this run.
    AlreadyApplied,
}

impl<T> StageResult<T> {
    pub fn into_completed(self) -> Option<T> {
        match self {
            StageResult::Completed(value) => Some(value),
            StageResult::AlreadyApplied => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum StageError {
    #[error("cancelled")]
    Cancelled,

    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: anyhow::Error },

    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
}

/// Drive `op` under `policy` until it succeeds, settles, or gives up.
///
/// A settled stage is never retried again: classification short-circuits the
/// loop immediately.
pub async fn run_stage<T, F, Fut>(
    stage: &'static str,
    policy: RetryPolicy,
    cancel: &mut watch::Receiver<bool>,
    classify: impl Fn(&anyhow::Error) -> Disposition,
    mut op: F,
) -> Result<StageResult<T>, StageError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        if *cancel.borrow() {
            return Err(StageError::Cancelled);
        }
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(StageResult::Completed(value)),
            Err(err) => match classify(&err) {
                Disposition::Settled => {
                    tracing::info!(
                        event = "gateway.stage.settled",
                        stage,
                        error = %err,
                        "effect already applied; advancing"
                    );
                    return Ok(StageResult::AlreadyApplied);
                }
                Disposition::Fatal => return Err(StageError::Fatal(err)),
                Disposition::Retry => {
                    if let Some(max) = policy.max_attempts {
                        if attempt >= max {
                            return Err(StageError::Exhausted {
                                attempts: attempt,
                                last: err,
                            });
                        }
                    }
                    tracing::debug!(
                        event = "gateway.stage.retry",
                        stage,
                        attempt,
                        error = %err,
                        "attempt failed; retrying"
                    );
                    let delay = policy.delay + jitter(policy.jitter);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.changed() => {}
                    }
                }
            },
        }
    }
}

fn jitter(max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    rand::thread_rng().gen_range(Duration::ZERO..max)
}

/// Classifier settling on the given broker error kinds, retrying otherwise.
pub fn settled_on(kinds: &'static [BrokerErrorKind]) -> impl Fn(&anyhow::Error) -> Disposition {
    move |err: &anyhow::Error| match err.downcast_ref::<BrokerError>() {
        Some(broker) if kinds.contains(&broker.kind) => Disposition::Settled,
        _ => Disposition::Retry,
    }
}

pub fn retry_all(_err: &anyhow::Error) -> Disposition {
    Disposition::Retry
}
