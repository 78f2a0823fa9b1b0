use std::backtrace::Backtrace;
use std::error::Error;
use std::fmt;

use audience::error::AudienceError;
use sqlx::migrate::MigrateError;

/// Returns whether terminal output should include backtraces.
fn should_render_backtrace() -> bool {
    matches!(
        std::env::var("RUST_BACKTRACE").as_deref(),
        Ok("1") | Ok("full")
    )
}

/// Result type for updater operations.
pub type UpdaterResult<T> = Result<T, UpdaterError>;

/// Backtrace captured when an infrastructure error is created.
pub struct CapturedBacktrace(Backtrace);

impl CapturedBacktrace {
    fn capture() -> Self {
        Self(Backtrace::capture())
    }
}

impl fmt::Debug for CapturedBacktrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Error type of the updater binary.
///
/// Wraps [`AudienceError`] for pipeline errors and adds variants for startup failures.
#[derive(Debug)]
pub enum UpdaterError {
    /// Pipeline, store, source or queue error.
    Audience(AudienceError),
    /// Configuration or telemetry setup error.
    Config(Box<dyn Error + Send + Sync>, CapturedBacktrace),
    /// Audience store migration error.
    Migration(MigrateError, CapturedBacktrace),
    /// I/O error, e.g. while building the runtime or registering signal handlers.
    Io(std::io::Error, CapturedBacktrace),
}

impl UpdaterError {
    /// Returns a short category label for this error.
    pub fn category(&self) -> &'static str {
        match self {
            UpdaterError::Audience(_) => "updater error",
            UpdaterError::Config(_, _) => "configuration error",
            UpdaterError::Migration(_, _) => "migration error",
            UpdaterError::Io(_, _) => "i/o error",
        }
    }

    pub fn backtrace(&self) -> Option<&Backtrace> {
        match self {
            UpdaterError::Audience(err) => err.backtrace(),
            UpdaterError::Config(_, cb) => Some(&cb.0),
            UpdaterError::Migration(_, cb) => Some(&cb.0),
            UpdaterError::Io(_, cb) => Some(&cb.0),
        }
    }

    /// Creates a configuration error from any error.
    pub fn config<E: Error + Send + Sync + 'static>(err: E) -> Self {
        UpdaterError::Config(Box::new(err), CapturedBacktrace::capture())
    }

    /// Returns a multi-line report for terminal output.
    pub fn render_report(&self) -> String {
        let mut out = String::new();
        out.push_str("audience updater failed\n");
        out.push_str(&format!("category: {}\n", self.category()));
        out.push_str(&format!("error: {self}\n"));

        // Aggregated errors already list their members in the display output.
        if !matches!(self, UpdaterError::Audience(err) if err.errors().is_some()) {
            let mut source = Error::source(self);
            let mut idx = 1usize;
            while let Some(err) = source {
                out.push_str(&format!("cause {idx}: {err}\n"));
                source = err.source();
                idx += 1;
            }
        }

        if should_render_backtrace()
            && let Some(backtrace) = self.backtrace()
        {
            out.push_str("backtrace:\n");
            out.push_str(&backtrace.to_string());
            if !out.ends_with('\n') {
                out.push('\n');
            }
        }

        out
    }
}

impl fmt::Display for UpdaterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdaterError::Audience(err) => write!(f, "{err}"),
            UpdaterError::Config(source, _) => write!(f, "configuration error: {source}"),
            UpdaterError::Migration(source, _) => write!(f, "migration error: {source}"),
            UpdaterError::Io(source, _) => write!(f, "i/o error: {source}"),
        }
    }
}

impl Error for UpdaterError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            UpdaterError::Audience(err) => err.source(),
            UpdaterError::Config(source, _) => Some(source.as_ref()),
            UpdaterError::Migration(source, _) => Some(source),
            UpdaterError::Io(source, _) => Some(source),
        }
    }
}

impl From<MigrateError> for UpdaterError {
    fn from(err: MigrateError) -> Self {
        UpdaterError::Migration(err, CapturedBacktrace::capture())
    }
}

impl From<std::io::Error> for UpdaterError {
    fn from(err: std::io::Error) -> Self {
        UpdaterError::Io(err, CapturedBacktrace::capture())
    }
}

impl From<AudienceError> for UpdaterError {
    fn from(err: AudienceError) -> Self {
        UpdaterError::Audience(err)
    }
}
