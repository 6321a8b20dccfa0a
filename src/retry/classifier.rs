//! Failure classification for retried calls
//!
//! A classifier is handed every failure of a [`RetryingCall`](super::RetryingCall)
//! and answers with a [`Decision`]. Classifiers are moved into the call that
//! uses them, so any state they keep lives exactly as long as that call.

use hyper::StatusCode;
use thiserror::Error;

use crate::error::RelayError;

/// What to do with a failed attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision<E> {
    /// Ignore the failure and run the next attempt after the next backoff delay
    Retry,
    /// Stop and resolve the call with this failure
    Propagate,
    /// Stop and resolve the call with a different failure
    Substitute(E),
}

/// Raised by a classifier that cannot evaluate a failure; never retried
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ClassifierError(pub String);

/// Decides retry vs. propagate for failures of type `E`
pub trait FailureClassifier<E> {
    fn classify(&mut self, failure: &E) -> Result<Decision<E>, ClassifierError>;
}

impl<E, F> FailureClassifier<E> for F
where
    F: FnMut(&E) -> Result<Decision<E>, ClassifierError>,
{
    fn classify(&mut self, failure: &E) -> Result<Decision<E>, ClassifierError> {
        self(failure)
    }
}

/// Retries every failure until the backoff runs out
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryAll;

impl<E> FailureClassifier<E> for RetryAll {
    fn classify(&mut self, _failure: &E) -> Result<Decision<E>, ClassifierError> {
        Ok(Decision::Retry)
    }
}

/// Propagates every failure on first sight
#[derive(Debug, Clone, Copy, Default)]
pub struct PropagateAll;

impl<E> FailureClassifier<E> for PropagateAll {
    fn classify(&mut self, _failure: &E) -> Result<Decision<E>, ClassifierError> {
        Ok(Decision::Propagate)
    }
}

/// HTTP-aware classifier for upstream fetches.
///
/// - connection refused counts as a 500
/// - 500, 502, 400 and 503 are retried
/// - timeouts are retried
/// - 404 is retried once; the second 404 propagates
/// - every other status, and every other failure kind, propagates
#[derive(Debug, Clone, Default)]
pub struct HttpStatusClassifier {
    seen_not_found: bool,
}

impl HttpStatusClassifier {
    const RETRYABLE: [StatusCode; 4] = [
        StatusCode::INTERNAL_SERVER_ERROR,
        StatusCode::BAD_GATEWAY,
        StatusCode::BAD_REQUEST,
        StatusCode::SERVICE_UNAVAILABLE,
    ];

    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a 404 has already been tolerated
    pub fn seen_not_found(&self) -> bool {
        self.seen_not_found
    }

    fn classify_status(&mut self, status: u16) -> Decision<RelayError> {
        if status == StatusCode::NOT_FOUND.as_u16() {
            if self.seen_not_found {
                return Decision::Propagate;
            }
            self.seen_not_found = true;
            return Decision::Retry;
        }

        if Self::RETRYABLE.iter().any(|s| s.as_u16() == status) {
            Decision::Retry
        } else {
            Decision::Propagate
        }
    }
}

impl FailureClassifier<RelayError> for HttpStatusClassifier {
    fn classify(&mut self, failure: &RelayError) -> Result<Decision<RelayError>, ClassifierError> {
        let decision = match failure {
            RelayError::UpstreamConnectionRefused { .. } => {
                self.classify_status(StatusCode::INTERNAL_SERVER_ERROR.as_u16())
            }
            RelayError::UpstreamHttpError { status } => self.classify_status(*status),
            RelayError::Timeout => Decision::Retry,
            _ => Decision::Propagate,
        };
        Ok(decision)
    }
}
