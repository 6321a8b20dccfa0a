//! Retrying asynchronous calls
//!
//! [`RetryingCall`] runs an operation, hands each failure to a
//! [`FailureClassifier`], and waits for the next backoff delay before trying
//! again. Exactly one attempt is in flight at a time.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::RelayError;
use crate::retry::classifier::{ClassifierError, Decision, FailureClassifier};

/// Outcome of a retrying call that did not succeed
#[derive(Error, Debug)]
pub enum RetryError<E> {
    /// The classifier propagated this failure
    #[error("{0}")]
    Failed(E),

    /// The backoff ran out; carries the first failure that was ignored
    #[error("{first_failure} (gave up after {attempts} attempts)")]
    Exhausted { first_failure: E, attempts: u32 },

    #[error("failure classifier error: {0}")]
    Classifier(#[from] ClassifierError),

    #[error("retrying call cancelled")]
    Cancelled,

    #[error("backoff sequence produced no attempts")]
    NoAttempts,
}

impl<E> RetryError<E> {
    /// The failure the call resolved with, if any
    pub fn failure(&self) -> Option<&E> {
        match self {
            RetryError::Failed(e) => Some(e),
            RetryError::Exhausted { first_failure, .. } => Some(first_failure),
            _ => None,
        }
    }

    pub fn into_failure(self) -> Option<E> {
        match self {
            RetryError::Failed(e) => Some(e),
            RetryError::Exhausted { first_failure, .. } => Some(first_failure),
            _ => None,
        }
    }
}

impl From<RetryError<RelayError>> for RelayError {
    fn from(err: RetryError<RelayError>) -> Self {
        match err {
            RetryError::Failed(e) => e,
            RetryError::Exhausted {
                first_failure,
                attempts,
            } => RelayError::RetryExhausted {
                first_failure: Box::new(first_failure),
                attempts,
            },
            RetryError::Classifier(e) => RelayError::ClassifierError(e.0),
            RetryError::Cancelled => RelayError::Cancelled,
            RetryError::NoAttempts => {
                RelayError::Internal("backoff sequence produced no attempts".into())
            }
        }
    }
}

/// Calls an operation repeatedly until it succeeds, the classifier gives up,
/// or the backoff runs out
pub struct RetryingCall<F> {
    operation: F,
    cancel: Option<watch::Receiver<bool>>,
}

impl<F> RetryingCall<F> {
    pub fn new(operation: F) -> Self {
        Self {
            operation,
            cancel: None,
        }
    }

    /// Resolve with [`RetryError::Cancelled`] once `cancel` reads `true`.
    ///
    /// A pending backoff wait is released immediately; an attempt already in
    /// flight runs to completion first.
    pub fn with_cancellation(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Run the call to completion.
    ///
    /// The first backoff value is awaited before the first attempt, so an
    /// `immediate` policy starts right away.
    pub async fn start<Fut, T, E, B, C>(
        mut self,
        backoff: B,
        mut classifier: C,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
        B: IntoIterator<Item = Duration>,
        C: FailureClassifier<E>,
    {
        let mut delays = backoff.into_iter();
        let mut first_failure: Option<E> = None;
        let mut attempts: u32 = 0;

        loop {
            let Some(delay) = delays.next() else {
                return match first_failure {
                    Some(first_failure) => {
                        warn!(attempts, "Retrying call ran out of attempts");
                        Err(RetryError::Exhausted {
                            first_failure,
                            attempts,
                        })
                    }
                    None => Err(RetryError::NoAttempts),
                };
            };

            self.pause::<E>(delay).await?;
            attempts += 1;
            debug!(
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                "Invoking operation"
            );

            let failure = match (self.operation)().await {
                Ok(value) => return Ok(value),
                Err(failure) => failure,
            };

            match classifier.classify(&failure)? {
                Decision::Retry => {
                    info!(attempt = attempts, "Ignoring failure: {}", failure);
                    if first_failure.is_none() {
                        first_failure = Some(failure);
                    }
                }
                Decision::Propagate => return Err(RetryError::Failed(failure)),
                Decision::Substitute(other) => {
                    debug!(attempt = attempts, "Classifier replaced failure: {}", failure);
                    return Err(RetryError::Failed(other));
                }
            }
        }
    }

    async fn pause<E>(&mut self, delay: Duration) -> Result<(), RetryError<E>> {
        let Some(cancel) = self.cancel.as_mut() else {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            return Ok(());
        };

        if *cancel.borrow_and_update() {
            return Err(RetryError::Cancelled);
        }
        if delay.is_zero() {
            return Ok(());
        }

        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = cancelled(cancel) => {
                debug!("Backoff wait cancelled");
                Err(RetryError::Cancelled)
            }
        }
    }
}

/// Completes once the receiver observes `true`; never completes if the
/// sender goes away without cancelling.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
