use crate::error::{ErrorKind, MirrorError};

/// Retry behavior for a classified error.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RetryDirective {
    /// The operation can be retried automatically with worker-defined timing.
    Timed,
    /// The operation should only be retried after manual intervention.
    Manual,
    /// The operation should not be retried.
    NoRetry,
}

/// Policy describing how a [`MirrorError`] should be handled by workers and callers.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ErrorHandlingPolicy {
    retry_directive: RetryDirective,
    solution: Option<&'static str>,
}

impl ErrorHandlingPolicy {
    const fn new(retry_directive: RetryDirective, solution: Option<&'static str>) -> Self {
        Self {
            retry_directive,
            solution,
        }
    }

    /// Returns the retry directive for this policy.
    pub fn retry_directive(&self) -> RetryDirective {
        self.retry_directive
    }

    /// Returns an optional operator-facing solution message.
    pub fn solution(&self) -> Option<&'static str> {
        self.solution
    }
}

/// Builds an [`ErrorHandlingPolicy`] from a [`MirrorError`], deciding in a single place which
/// failures are retry-safe and which need an operator.
pub fn build_error_handling_policy(error: &MirrorError) -> ErrorHandlingPolicy {
    match error.kind() {
        // Transient connectivity failures and rejected batches recover on a later attempt from the
        // same checkpoint.
        ErrorKind::SourceConnectionFailed
        | ErrorKind::DestinationConnectionFailed
        | ErrorKind::SourceReadFailed
        | ErrorKind::ApplyFailed => ErrorHandlingPolicy::new(RetryDirective::Timed, None),

        // Request errors never succeed when retried unchanged.
        ErrorKind::ValidationError => ErrorHandlingPolicy::new(
            RetryDirective::NoRetry,
            Some("Fix the rejected configuration values and submit the request again."),
        ),
        ErrorKind::IllegalTransition => ErrorHandlingPolicy::new(
            RetryDirective::NoRetry,
            Some("Move the mirror into the required state before submitting the request."),
        ),
        ErrorKind::MirrorNotFound
        | ErrorKind::MirrorAlreadyExists
        | ErrorKind::PeerNotFound
        | ErrorKind::PeerAlreadyExists => ErrorHandlingPolicy::new(RetryDirective::NoRetry, None),

        ErrorKind::ChangesDiscarded => ErrorHandlingPolicy::new(
            RetryDirective::Manual,
            Some(
                "The source no longer retains the changes the mirror needs. Drop the mirror and create it again with an initial snapshot.",
            ),
        ),
        ErrorKind::CheckpointConflict => ErrorHandlingPolicy::new(
            RetryDirective::Manual,
            Some("Another worker advanced the checkpoint of this mirror. Make sure the mirror is run by a single control plane."),
        ),
        ErrorKind::SnapshotFailed | ErrorKind::PartialSnapshotFailure => ErrorHandlingPolicy::new(
            RetryDirective::Manual,
            Some("Resolve the snapshot failure and retry the snapshot of the affected tables."),
        ),

        // Special handling for fault injection tests.
        #[cfg(feature = "failpoints")]
        ErrorKind::WithNoRetry => {
            ErrorHandlingPolicy::new(RetryDirective::NoRetry, Some("Cannot retry this error."))
        }
        #[cfg(feature = "failpoints")]
        ErrorKind::WithManualRetry => ErrorHandlingPolicy::new(
            RetryDirective::Manual,
            Some("Manually trigger retry after resolving the issue."),
        ),
        #[cfg(feature = "failpoints")]
        ErrorKind::WithTimedRetry => ErrorHandlingPolicy::new(
            RetryDirective::Timed,
            Some("Will automatically retry after the configured delay."),
        ),

        _ => ErrorHandlingPolicy::new(
            RetryDirective::Manual,
            Some(
                "There is no single prescribed solution for this error. Inspect the mirror status and resume the mirror once the cause is fixed.",
            ),
        ),
    }
}
