//! Error types and result definitions for audience operations.
//!
//! [`AudienceError`] carries a classification ([`ErrorKind`]), a static description, optional
//! dynamic detail, the originating error and the call site. Worker failures can be aggregated
//! into a single error. The kind drives how a failed task is settled, see
//! [`crate::workers::policy`].

use std::backtrace::Backtrace;
use std::borrow::Cow;
use std::error;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::panic::Location;
use std::sync::Arc;

/// Result type for audience operations.
pub type AudienceResult<T> = Result<T, AudienceError>;

/// Detailed payload stored for single [`AudienceError`] instances.
#[derive(Debug, Clone)]
struct ErrorPayload {
    kind: ErrorKind,
    description: Cow<'static, str>,
    detail: Option<Cow<'static, str>>,
    source: Option<Arc<dyn error::Error + Send + Sync>>,
    location: &'static Location<'static>,
    backtrace: Arc<Backtrace>,
}

/// Main error type for audience operations.
#[derive(Debug, Clone)]
pub struct AudienceError {
    repr: ErrorRepr,
}

#[derive(Debug, Clone)]
enum ErrorRepr {
    Single(ErrorPayload),
    /// Multiple aggregated errors, used when several workers fail.
    Many {
        errors: Vec<AudienceError>,
        location: &'static Location<'static>,
    },
}

/// Classification of audience errors.
#[derive(PartialEq, Eq, Copy, Clone, Debug, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    // Filter & Validation Errors
    InvalidFilter,
    ValidationError,

    // Analytical Source Errors
    SourceUnavailable,
    SourceTimeout,
    SourceQueryFailed,

    // Audience Store Errors
    StoreUnavailable,
    PersistenceFailed,
    AudienceNotFound,

    // Queue Errors
    QueueConnectionFailed,
    QueueOperationFailed,
    MalformedMessage,
    PublishFailed,

    // IO & Serialization Errors
    IoError,
    SerializationError,
    DeserializationError,

    // Configuration Errors
    ConfigError,

    // State & Workflow Errors
    InvalidState,
    TaskWorkerPanic,
    TaskWorkersStopped,
    SchedulerPanic,

    // Unknown / Uncategorized
    Unknown,

    // Error kinds raised by fail points to force a specific task outcome.
    #[cfg(feature = "failpoints")]
    WithRequeue,
    #[cfg(feature = "failpoints")]
    WithDrop,
}

impl AudienceError {
    /// Returns the [`ErrorKind`] of this error.
    ///
    /// For aggregated errors, returns the kind of the first error or [`ErrorKind::Unknown`]
    /// if the aggregate is empty.
    pub fn kind(&self) -> ErrorKind {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.kind,
            ErrorRepr::Many { ref errors, .. } => errors
                .first()
                .map(|err| err.kind())
                .unwrap_or(ErrorKind::Unknown),
        }
    }

    /// Returns every [`ErrorKind`] contained in this error, flattened.
    pub fn kinds(&self) -> Vec<ErrorKind> {
        match self.repr {
            ErrorRepr::Single(ref payload) => vec![payload.kind],
            ErrorRepr::Many { ref errors, .. } => errors.iter().flat_map(|err| err.kinds()).collect(),
        }
    }

    /// Returns the static description of a single error.
    pub fn description(&self) -> Option<&str> {
        match self.repr {
            ErrorRepr::Single(ref payload) => Some(payload.description.as_ref()),
            ErrorRepr::Many { .. } => None,
        }
    }

    /// Returns the dynamic detail, or the first available detail of an aggregate.
    pub fn detail(&self) -> Option<&str> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.detail.as_deref(),
            ErrorRepr::Many { ref errors, .. } => errors.iter().find_map(|e| e.detail()),
        }
    }

    /// Returns the aggregated errors, or `None` for a single error.
    pub fn errors(&self) -> Option<&[AudienceError]> {
        match self.repr {
            ErrorRepr::Single(_) => None,
            ErrorRepr::Many { ref errors, .. } => Some(errors),
        }
    }

    pub fn backtrace(&self) -> Option<&Backtrace> {
        match self.repr {
            ErrorRepr::Single(ref payload) => Some(payload.backtrace.as_ref()),
            ErrorRepr::Many { .. } => None,
        }
    }

    pub fn location(&self) -> &'static Location<'static> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.location,
            ErrorRepr::Many { location, .. } => location,
        }
    }

    /// Attaches an originating error, exposed through [`error::Error::source`].
    ///
    /// Has no effect on aggregates, which forward their first error as the source.
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
        AudienceError {
            repr: ErrorRepr::Single(ErrorPayload {
                kind,
                description,
                detail,
                source,
                location: Location::caller(),
                backtrace: Arc::new(Backtrace::capture()),
            }),
        }
    }
}

impl PartialEq for AudienceError {
    fn eq(&self, other: &AudienceError) -> bool {
        match (&self.repr, &other.repr) {
            (ErrorRepr::Single(a), ErrorRepr::Single(b)) => a.kind == b.kind,
            (ErrorRepr::Many { errors: a, .. }, ErrorRepr::Many { errors: b, .. }) => a == b,
            _ => false,
        }
    }
}

impl Hash for AudienceError {
    /// Hashes only the kind and static description so that occurrences of the same
    /// failure group together regardless of detail or call site.
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

impl fmt::Display for AudienceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.repr {
            ErrorRepr::Single(payload) => {
                let location = payload.location;
                write!(
                    f,
                    "[{:?}] {} @ {}:{}:{}",
                    payload.kind,
                    payload.description,
                    location.file(),
                    location.line(),
                    location.column()
                )?;

                if let Some(detail) = payload.detail.as_deref() {
                    write!(f, "\n  Detail:")?;
                    for line in detail.lines() {
                        write!(f, "\n    {line}")?;
                    }
                }

                Ok(())
            }
            ErrorRepr::Many { errors, location } => {
                let count = errors.len();
                write!(
                    f,
                    "[Many] {} error{} aggregated @ {}:{}:{}",
                    count,
                    if count == 1 { "" } else { "s" },
                    location.file(),
                    location.line(),
                    location.column()
                )?;

                for (index, error) in errors.iter().enumerate() {
                    let rendered = error.to_string();
                    let mut lines = rendered.lines();
                    write!(f, "\n  {}. {}", index + 1, lines.next().unwrap_or_default())?;
                    for line in lines {
                        write!(f, "\n     {line}")?;
                    }
                }

                Ok(())
            }
        }
    }
}

impl error::Error for AudienceError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self.repr {
            ErrorRepr::Single(payload) => payload
                .source
                .as_ref()
                .map(|source| source.as_ref() as &(dyn error::Error + 'static)),
            ErrorRepr::Many { errors, .. } => errors
                .first()
                .map(|error| error as &(dyn error::Error + 'static)),
        }
    }
}

impl From<(ErrorKind, &'static str)> for AudienceError {
    #[track_caller]
    fn from((kind, desc): (ErrorKind, &'static str)) -> AudienceError {
        AudienceError::from_components(kind, Cow::Borrowed(desc), None, None)
    }
}

impl<D> From<(ErrorKind, &'static str, D)> for AudienceError
where
    D: Into<Cow<'static, str>>,
{
    #[track_caller]
    fn from((kind, desc, detail): (ErrorKind, &'static str, D)) -> AudienceError {
        AudienceError::from_components(kind, Cow::Borrowed(desc), Some(detail.into()), None)
    }
}

/// Aggregates errors. A vector holding exactly one error yields that error unchanged.
impl<E> From<Vec<E>> for AudienceError
where
    E: Into<AudienceError>,
{
    #[track_caller]
    fn from(errors: Vec<E>) -> AudienceError {
        let location = Location::caller();
        let mut errors: Vec<AudienceError> = errors.into_iter().map(Into::into).collect();

        if errors.len() == 1 {
            if let Some(error) = errors.pop() {
                return error;
            }
        }

        AudienceError {
            repr: ErrorRepr::Many { errors, location },
        }
    }
}

impl From<std::io::Error> for AudienceError {
    #[track_caller]
    fn from(err: std::io::Error) -> AudienceError {
        let detail = err.to_string();
        AudienceError::from_components(
            ErrorKind::IoError,
            Cow::Borrowed("I/O operation failed"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

/// Maps syntax and data failures to [`ErrorKind::DeserializationError`], everything else
/// to [`ErrorKind::SerializationError`] or [`ErrorKind::IoError`].
impl From<serde_json::Error> for AudienceError {
    #[track_caller]
    fn from(err: serde_json::Error) -> AudienceError {
        let (kind, description) = match err.classify() {
            serde_json::error::Category::Io => (ErrorKind::IoError, "JSON I/O operation failed"),
            serde_json::error::Category::Syntax
            | serde_json::error::Category::Data
            | serde_json::error::Category::Eof => (
                ErrorKind::DeserializationError,
                "JSON deserialization failed",
            ),
        };

        let detail = err.to_string();
        AudienceError::from_components(
            kind,
            Cow::Borrowed(description),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

/// Converts audience store failures.
///
/// Pool and transport failures map to [`ErrorKind::StoreUnavailable`], every other failure
/// to [`ErrorKind::PersistenceFailed`]. Analytical source failures are classified separately
/// in [`crate::source::mysql`].
impl From<sqlx::Error> for AudienceError {
    #[track_caller]
    fn from(err: sqlx::Error) -> AudienceError {
        let kind = match &err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolClosed
            | sqlx::Error::PoolTimedOut => ErrorKind::StoreUnavailable,
            _ => ErrorKind::PersistenceFailed,
        };

        let detail = err.to_string();
        AudienceError::from_components(
            kind,
            Cow::Borrowed("Audience store operation failed"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

impl From<lapin::Error> for AudienceError {
    #[track_caller]
    fn from(err: lapin::Error) -> AudienceError {
        let kind = match &err {
            lapin::Error::IOError(_) | lapin::Error::InvalidConnectionState(_) => {
                ErrorKind::QueueConnectionFailed
            }
            _ => ErrorKind::QueueOperationFailed,
        };

        let detail = err.to_string();
        AudienceError::from_components(
            kind,
            Cow::Borrowed("Message queue operation failed"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}
