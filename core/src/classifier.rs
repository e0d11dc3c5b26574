//! Failure classification for error and result filtering
//!
//! A reported error is checked against the ignore classifier first, then the
//! record classifier:
//! - ignored errors release the caller's permit and are not recorded
//! - recorded errors count as failures
//! - anything else counts as a success
//!
//! A successful return value can still be recorded as a failure by a result
//! classifier. A classifier that panics is treated as "record as failure".

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Duration;

/// Context provided to failure classifiers for error evaluation
#[derive(Debug)]
pub struct FailureContext<'a> {
    /// Circuit name
    pub circuit_name: &'a str,
    /// The error that occurred (can be downcast to specific types)
    pub error: &'a dyn Any,
    /// Duration of the failed call
    pub duration: Duration,
}

/// Selects errors for one role: the record classifier picks the errors that
/// count as failures, the ignore classifier picks the errors that are dropped
///
/// # Examples
///
/// ```rust
/// use circuit_guard::{FailureClassifier, FailureContext};
///
/// /// Records 5xx statuses (and anything that is not a status) as failures
/// #[derive(Debug)]
/// struct ServerErrors;
///
/// impl FailureClassifier for ServerErrors {
///     fn matches(&self, ctx: &FailureContext<'_>) -> bool {
///         ctx.error
///             .downcast_ref::<u16>()
///             .map(|status| *status >= 500)
///             .unwrap_or(true)
///     }
/// }
/// ```
pub trait FailureClassifier: Send + Sync + std::fmt::Debug {
    /// Whether this error belongs to the classifier's selection
    fn matches(&self, ctx: &FailureContext<'_>) -> bool;
}

/// Selects every error; the default record classifier
#[derive(Debug, Clone, Copy, Default)]
pub struct MatchAllErrors;

impl FailureClassifier for MatchAllErrors {
    fn matches(&self, _ctx: &FailureContext<'_>) -> bool {
        true
    }
}

/// Selects no error; the default ignore classifier
#[derive(Debug, Clone, Copy, Default)]
pub struct MatchNoErrors;

impl FailureClassifier for MatchNoErrors {
    fn matches(&self, _ctx: &FailureContext<'_>) -> bool {
        false
    }
}

/// Closure-backed error classifier
pub struct ErrorPredicate<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    predicate: F,
}

impl<F> ErrorPredicate<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    pub fn new(predicate: F) -> Self {
        Self { predicate }
    }
}

impl<F> FailureClassifier for ErrorPredicate<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    fn matches(&self, ctx: &FailureContext<'_>) -> bool {
        (self.predicate)(ctx)
    }
}

impl<F> std::fmt::Debug for ErrorPredicate<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorPredicate")
            .field("predicate", &"<closure>")
            .finish()
    }
}

/// Context provided to result classifiers
#[derive(Debug)]
pub struct ResultContext<'a> {
    pub circuit_name: &'a str,
    /// The returned value (can be downcast to specific types)
    pub result: &'a dyn Any,
    pub duration: Duration,
}

/// Decides whether a successful return value should be recorded as a failure
pub trait ResultClassifier: Send + Sync + std::fmt::Debug {
    fn is_failure(&self, ctx: &ResultContext<'_>) -> bool;
}

/// Default result classifier: no result is a failure
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAllResults;

impl ResultClassifier for AcceptAllResults {
    fn is_failure(&self, _ctx: &ResultContext<'_>) -> bool {
        false
    }
}

/// Closure-backed result classifier
pub struct ResultPredicate<F>
where
    F: Fn(&ResultContext<'_>) -> bool + Send + Sync,
{
    predicate: F,
}

impl<F> ResultPredicate<F>
where
    F: Fn(&ResultContext<'_>) -> bool + Send + Sync,
{
    pub fn new(predicate: F) -> Self {
        Self { predicate }
    }
}

impl<F> ResultClassifier for ResultPredicate<F>
where
    F: Fn(&ResultContext<'_>) -> bool + Send + Sync,
{
    fn is_failure(&self, ctx: &ResultContext<'_>) -> bool {
        (self.predicate)(ctx)
    }
}

impl<F> std::fmt::Debug for ResultPredicate<F>
where
    F: Fn(&ResultContext<'_>) -> bool + Send + Sync,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultPredicate")
            .field("predicate", &"<closure>")
            .finish()
    }
}

/// What the breaker does with a reported error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ErrorDisposition {
    /// Matched the ignore classifier
    Ignore,
    /// Matched the record classifier
    RecordFailure,
    /// Matched neither; counts as a success
    RecordSuccess,
}

/// Ignore wins over record; a panicking classifier records a failure
pub(crate) fn classify_error(
    record: &dyn FailureClassifier,
    ignore: &dyn FailureClassifier,
    ctx: &FailureContext<'_>,
) -> ErrorDisposition {
    if guarded(ctx.circuit_name, "ignore", || ignore.matches(ctx)) == Some(true) {
        return ErrorDisposition::Ignore;
    }
    match guarded(ctx.circuit_name, "record", || record.matches(ctx)) {
        Some(false) => ErrorDisposition::RecordSuccess,
        Some(true) | None => ErrorDisposition::RecordFailure,
    }
}

pub(crate) fn is_failure_result(classifier: &dyn ResultClassifier, ctx: &ResultContext<'_>) -> bool {
    guarded(ctx.circuit_name, "result", || classifier.is_failure(ctx)).unwrap_or(true)
}

fn guarded(circuit: &str, which: &str, f: impl FnOnce() -> bool) -> Option<bool> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(matched) => Some(matched),
        Err(_) => {
            tracing::warn!(circuit = %circuit, classifier = which, "classifier panicked, recording failure");
            None
        }
    }
}
