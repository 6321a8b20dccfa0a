//! Generic retry-with-backoff
//!
//! - `backoff`: finite delay schedules
//! - `classifier`: retry/propagate decisions over failures
//! - `call`: the combinator tying the two together

pub mod backoff;
pub mod call;
pub mod classifier;

pub use backoff::{BackoffPolicy, BackoffSequence};
pub use call::{RetryError, RetryingCall};
pub use classifier::{
    ClassifierError, Decision, FailureClassifier, HttpStatusClassifier, PropagateAll, RetryAll,
};
