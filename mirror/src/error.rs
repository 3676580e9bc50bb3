//! Error types and result definitions for mirror operations.
//!
//! Every error produced by the control plane is a [`MirrorError`]: a kind tag used to decide
//! whether the failure is retry-safe, a static description, optional dynamic detail, the mirror the
//! error concerns, and captured diagnostic metadata. Failures of several per-table workers are
//! aggregated into a single error.

use std::backtrace::Backtrace;
use std::borrow::Cow;
use std::error;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::panic::Location;
use std::sync::Arc;

use mirror_config::shared::ValidationError;

use crate::workers::policy::{RetryDirective, build_error_handling_policy};

/// Convenient result type for mirror operations using [`MirrorError`] as the error type.
pub type MirrorResult<T> = Result<T, MirrorError>;

/// Detailed payload stored for single [`MirrorError`] instances.
#[derive(Debug, Clone)]
struct ErrorPayload {
    kind: ErrorKind,
    description: Cow<'static, str>,
    detail: Option<Cow<'static, str>>,
    mirror_name: Option<Arc<str>>,
    source: Option<Arc<dyn error::Error + Send + Sync>>,
    location: &'static Location<'static>,
    backtrace: Arc<Backtrace>,
}

/// Main error type for mirror operations.
///
/// A [`MirrorError`] is either a single error or an aggregation of errors, the latter being used
/// when several snapshot workers fail at once.
#[derive(Debug, Clone)]
pub struct MirrorError {
    repr: ErrorRepr,
}

#[derive(Debug, Clone)]
enum ErrorRepr {
    Single(ErrorPayload),
    Many {
        errors: Vec<MirrorError>,
        mirror_name: Option<Arc<str>>,
        location: &'static Location<'static>,
    },
}

/// Categories of errors that can occur in the control plane.
#[derive(PartialEq, Eq, Copy, Clone, Debug, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    // Connection Errors
    SourceConnectionFailed,
    DestinationConnectionFailed,

    // Request Errors
    ValidationError,
    IllegalTransition,
    MirrorNotFound,
    MirrorAlreadyExists,
    PeerNotFound,
    PeerAlreadyExists,

    // Replication Errors
    ApplyFailed,
    SourceReadFailed,
    ChangesDiscarded,
    CheckpointConflict,

    // Snapshot Errors
    SnapshotFailed,
    PartialSnapshotFailure,

    // State & Workflow Errors
    InvalidState,
    MirrorWorkerPanic,
    SnapshotWorkerPanic,

    // Serialization & Configuration Errors
    SerializationError,
    DeserializationError,
    ConfigError,

    // Unknown / Uncategorized
    Unknown,

    // Special error kinds used for tests that trigger specific retry behaviors via fault injection.
    #[cfg(feature = "failpoints")]
    WithNoRetry,
    #[cfg(feature = "failpoints")]
    WithManualRetry,
    #[cfg(feature = "failpoints")]
    WithTimedRetry,
}

impl ErrorKind {
    /// Returns `true` for the connection failure kinds of either side of a mirror.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            ErrorKind::SourceConnectionFailed | ErrorKind::DestinationConnectionFailed
        )
    }
}

impl MirrorError {
    /// Returns the [`ErrorKind`] of this error.
    ///
    /// For multiple errors, returns the kind of the first error or [`ErrorKind::Unknown`] if the
    /// error list is empty.
    pub fn kind(&self) -> ErrorKind {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.kind,
            ErrorRepr::Many { ref errors, .. } => errors
                .first()
                .map(|err| err.kind())
                .unwrap_or(ErrorKind::Unknown),
        }
    }

    /// Returns all [`ErrorKind`]s present in this error.
    pub fn kinds(&self) -> Vec<ErrorKind> {
        match self.repr {
            ErrorRepr::Single(ref payload) => vec![payload.kind],
            ErrorRepr::Many { ref errors, .. } => errors
                .iter()
                .flat_map(|err| err.kinds())
                .collect::<Vec<_>>(),
        }
    }

    /// Returns the static description of this error.
    ///
    /// For multiple errors, returns the description of the first error.
    pub fn description(&self) -> Option<&str> {
        match self.repr {
            ErrorRepr::Single(ref payload) => Some(payload.description.as_ref()),
            ErrorRepr::Many { ref errors, .. } => errors.first().and_then(|e| e.description()),
        }
    }

    /// Returns the detailed error information if available.
    ///
    /// For multiple errors, returns the detail of the first error that has one.
    pub fn detail(&self) -> Option<&str> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.detail.as_deref(),
            ErrorRepr::Many { ref errors, .. } => errors.iter().find_map(|e| e.detail()),
        }
    }

    /// Returns the name of the mirror this error concerns, if known.
    pub fn mirror_name(&self) -> Option<&str> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.mirror_name.as_deref(),
            ErrorRepr::Many {
                ref mirror_name, ..
            } => mirror_name.as_deref(),
        }
    }

    /// Returns the errors aggregated by this error, or a single-element slice.
    pub fn errors(&self) -> &[MirrorError] {
        match self.repr {
            ErrorRepr::Single(_) => std::slice::from_ref(self),
            ErrorRepr::Many { ref errors, .. } => errors,
        }
    }

    /// Returns the captured backtrace for this error.
    pub fn backtrace(&self) -> Option<&Backtrace> {
        match self.repr {
            ErrorRepr::Single(ref payload) => Some(payload.backtrace.as_ref()),
            ErrorRepr::Many { .. } => None,
        }
    }

    /// Returns the captured callsite location for this error.
    pub fn location(&self) -> &'static Location<'static> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.location,
            ErrorRepr::Many { location, .. } => location,
        }
    }

    /// Returns `true` when the failure can be retried without operator intervention.
    pub fn is_retryable(&self) -> bool {
        build_error_handling_policy(self).retry_directive() == RetryDirective::Timed
    }

    /// Tags this error, and every aggregated error without a mirror, with `mirror_name`.
    ///
    /// An already tagged error keeps its original mirror name.
    pub fn with_mirror(mut self, mirror_name: &str) -> Self {
        self.set_mirror(&Arc::from(mirror_name));
        self
    }

    /// Attaches an originating [`error::Error`] to this error and returns the modified instance.
    ///
    /// Has no effect when called on aggregated errors because aggregates forward the first
    /// contained error as their source.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: error::Error + Send + Sync + 'static,
    {
        if let ErrorRepr::Single(ref mut payload) = self.repr {
            payload.source = Some(Arc::new(source));
        }
        self
    }

    #[track_caller]
    fn from_components(
        kind: ErrorKind,
        description: Cow<'static, str>,
        detail: Option<Cow<'static, str>>,
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    ) -> Self {
        MirrorError {
            repr: ErrorRepr::Single(ErrorPayload {
                kind,
                description,
                detail,
                mirror_name: None,
                source,
                location: Location::caller(),
                backtrace: Arc::new(Backtrace::capture()),
            }),
        }
    }

    fn set_mirror(&mut self, name: &Arc<str>) {
        match self.repr {
            ErrorRepr::Single(ref mut payload) => {
                if payload.mirror_name.is_none() {
                    payload.mirror_name = Some(name.clone());
                }
            }
            ErrorRepr::Many {
                ref mut errors,
                ref mut mirror_name,
                ..
            } => {
                if mirror_name.is_none() {
                    *mirror_name = Some(name.clone());
                }
                for error in errors {
                    error.set_mirror(name);
                }
            }
        }
    }
}

impl PartialEq for MirrorError {
    fn eq(&self, other: &MirrorError) -> bool {
        match (&self.repr, &other.repr) {
            (ErrorRepr::Single(a), ErrorRepr::Single(b)) => a.kind == b.kind,
            (
                ErrorRepr::Many {
                    errors: errors_a, ..
                },
                ErrorRepr::Many {
                    errors: errors_b, ..
                },
            ) => {
                errors_a.len() == errors_b.len()
                    && errors_a.iter().zip(errors_b.iter()).all(|(a, b)| a == b)
            }
            _ => false,
        }
    }
}

impl Hash for MirrorError {
    /// Hashes the error using only its stable identifying components: the kind and the static
    /// description.
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(&self.repr).hash(state);
        match &self.repr {
            ErrorRepr::Single(payload) => {
                payload.kind.hash(state);
                payload.description.hash(state);
            }
            ErrorRepr::Many { errors, .. } => {
                errors.len().hash(state);
                for error in errors {
                    error.hash(state);
                }
            }
        }
    }
}

impl fmt::Display for MirrorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match &self.repr {
            ErrorRepr::Single(payload) => {
                let location = payload.location;
                write!(f, "[{:?}]", payload.kind)?;
                if let Some(mirror_name) = &payload.mirror_name {
                    write!(f, " mirror `{mirror_name}`:")?;
                }
                write!(
                    f,
                    " {} @ {}:{}:{}",
                    payload.description,
                    location.file(),
                    location.line(),
                    location.column()
                )?;

                write_detail(payload.detail.as_deref(), f, 1)?;
                write_backtrace(payload.backtrace.as_ref(), f, 1)?;

                Ok(())
            }
            ErrorRepr::Many {
                errors,
                mirror_name,
                location,
            } => {
                let count = errors.len();
                write!(f, "[Many]")?;
                if let Some(mirror_name) = mirror_name {
                    write!(f, " mirror `{mirror_name}`:")?;
                }
                write!(
                    f,
                    " {} error{} aggregated @ {}:{}:{}",
                    count,
                    if count == 1 { "" } else { "s" },
                    location.file(),
                    location.line(),
                    location.column()
                )?;

                if errors.is_empty() {
                    write!(f, "\n  (no inner errors provided)")?;
                }

                for (index, error) in errors.iter().enumerate() {
                    let rendered = format!("{error}");
                    let mut lines = rendered.lines();
                    match lines.next() {
                        Some(first_line) => write!(f, "\n  {}. {}", index + 1, first_line)?,
                        None => write!(f, "\n  {}.", index + 1)?,
                    }

                    for line in lines {
                        if line.is_empty() {
                            write!(f, "\n     ")?;
                        } else {
                            write!(f, "\n     {line}")?;
                        }
                    }
                }

                Ok(())
            }
        }
    }
}

impl error::Error for MirrorError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self.repr {
            ErrorRepr::Single(payload) => payload
                .source
                .as_ref()
                .map(|source| source as &(dyn error::Error + 'static)),
            ErrorRepr::Many { errors, .. } => errors
                .first()
                .map(|error| error as &(dyn error::Error + 'static)),
        }
    }
}

fn write_backtrace(
    backtrace: &Backtrace,
    f: &mut fmt::Formatter<'_>,
    indent: usize,
) -> fmt::Result {
    let indent_str = "  ".repeat(indent);

    let rendered_backtrace = format!("{backtrace}");
    if !rendered_backtrace.trim().is_empty() {
        write!(f, "\n{indent_str}Backtrace:")?;
        for line in rendered_backtrace.lines() {
            if line.trim().is_empty() {
                write!(f, "\n{indent_str}  ")?;
            } else {
                write!(f, "\n{indent_str}  {line}")?;
            }
        }
    }

    Ok(())
}

fn write_detail(detail: Option<&str>, f: &mut fmt::Formatter<'_>, indent: usize) -> fmt::Result {
    let Some(detail) = detail else {
        return Ok(());
    };

    let indent_str = "  ".repeat(indent);
    if detail.trim().is_empty() {
        return write!(f, "\n{indent_str}Detail: <empty>");
    }

    write!(f, "\n{indent_str}Detail:")?;
    for line in detail.lines() {
        if line.trim().is_empty() {
            write!(f, "\n{indent_str}  ")?;
        } else {
            write!(f, "\n{indent_str}  {line}")?;
        }
    }

    Ok(())
}

/// Creates a [`MirrorError`] from an error kind and static description.
impl From<(ErrorKind, &'static str)> for MirrorError {
    #[track_caller]
    fn from((kind, desc): (ErrorKind, &'static str)) -> MirrorError {
        MirrorError::from_components(kind, Cow::Borrowed(desc), None, None)
    }
}

/// Creates a [`MirrorError`] from an error kind, static description, and dynamic detail.
impl<D> From<(ErrorKind, &'static str, D)> for MirrorError
where
    D: Into<Cow<'static, str>>,
{
    #[track_caller]
    fn from((kind, desc, detail): (ErrorKind, &'static str, D)) -> MirrorError {
        MirrorError::from_components(kind, Cow::Borrowed(desc), Some(detail.into()), None)
    }
}

/// Aggregates errors.
///
/// A vector with exactly one error returns that error directly.
impl<E> From<Vec<E>> for MirrorError
where
    E: Into<MirrorError>,
{
    #[track_caller]
    fn from(errors: Vec<E>) -> MirrorError {
        let location = Location::caller();

        let mut errors: Vec<MirrorError> = errors.into_iter().map(Into::into).collect();
        if errors.len() == 1
            && let Some(error) = errors.pop()
        {
            return error;
        }

        MirrorError {
            repr: ErrorRepr::Many {
                errors,
                mirror_name: None,
                location,
            },
        }
    }
}

/// Converts a configuration [`ValidationError`] to [`MirrorError`] with
/// [`ErrorKind::ValidationError`].
impl From<ValidationError> for MirrorError {
    #[track_caller]
    fn from(err: ValidationError) -> MirrorError {
        let detail = err.to_string();
        MirrorError::from_components(
            ErrorKind::ValidationError,
            Cow::Borrowed("Mirror configuration is invalid"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

/// Converts [`serde_json::Error`] to [`MirrorError`] with the appropriate error kind.
impl From<serde_json::Error> for MirrorError {
    #[track_caller]
    fn from(err: serde_json::Error) -> MirrorError {
        let (kind, description) = match err.classify() {
            serde_json::error::Category::Io => {
                (ErrorKind::SerializationError, "JSON I/O operation failed")
            }
            serde_json::error::Category::Syntax
            | serde_json::error::Category::Data
            | serde_json::error::Category::Eof => (
                ErrorKind::DeserializationError,
                "JSON deserialization failed",
            ),
        };

        let detail = err.to_string();
        MirrorError::from_components(
            kind,
            Cow::Borrowed(description),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

/// Converts [`mirror_config::LoadConfigError`] to [`MirrorError`] with [`ErrorKind::ConfigError`].
impl From<mirror_config::LoadConfigError> for MirrorError {
    #[track_caller]
    fn from(err: mirror_config::LoadConfigError) -> MirrorError {
        let detail = err.to_string();
        MirrorError::from_components(
            ErrorKind::ConfigError,
            Cow::Borrowed("Configuration loading failed"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}
