use fail::fail_point;

use crate::bail;
use crate::error::{ErrorKind, MirrorResult};

pub const APPLY_BATCH__BEFORE_APPLY: &str = "apply_batch.before_apply";
pub const APPLY_BATCH__AFTER_APPLY: &str = "apply_batch.after_apply";
pub const SNAPSHOT__AFTER_EXPORT: &str = "snapshot.after_export";
pub const SNAPSHOT__BEFORE_DONE: &str = "snapshot.before_done";

/// Returns an error when the failpoint `name` is configured to fail.
///
/// The failpoint parameter selects the error kind, and through it the retry policy of the failure:
/// `no_retry`, `manual_retry` or `timed_retry`.
pub fn mirror_fail_point(name: &str) -> MirrorResult<()> {
    fail_point!(name, |parameter| {
        let error_kind = match parameter.as_deref() {
            Some("manual_retry") => ErrorKind::WithManualRetry,
            Some("timed_retry") => ErrorKind::WithTimedRetry,
            _ => ErrorKind::WithNoRetry,
        };

        bail!(
            error_kind,
            "An error occurred in a fail point",
            format!("The failpoint '{name}' returned an error")
        );
    });

    Ok(())
}
