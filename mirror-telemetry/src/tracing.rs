use std::io;
use std::sync::Once;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_log::LogTracer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Filter used when `RUST_LOG` is not set.
const DEFAULT_FILTER: &str = "info";

static INIT_TEST_TRACING: Once = Once::new();

/// Errors raised while installing the global subscriber.
#[derive(Debug)]
pub enum TracingError {
    LogTracer(tracing_log::log::SetLoggerError),
    Init(tracing_subscriber::util::TryInitError),
}

impl std::fmt::Display for TracingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TracingError::LogTracer(err) => write!(f, "failed to install log bridge: {err}"),
            TracingError::Init(err) => write!(f, "failed to initialize tracing: {err}"),
        }
    }
}

impl std::error::Error for TracingError {}

/// Keeps the non-blocking file writer alive; logs are flushed when it is dropped.
#[must_use = "dropping the flusher stops writing logs to file"]
pub struct LogFlusher {
    _guard: Option<WorkerGuard>,
}

/// Installs the global tracing subscriber for `app_name`.
///
/// Logs always go to stdout. In release builds they are additionally written to a daily rolling
/// file named after `app_name` inside `log_dir`. The returned [`LogFlusher`] must be held for the
/// lifetime of the process.
pub fn init_tracing(app_name: &str, log_dir: &str) -> Result<LogFlusher, TracingError> {
    LogTracer::init().map_err(TracingError::LogTracer)?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let stdout_layer = fmt::layer().with_target(false).with_writer(io::stdout);

    if cfg!(debug_assertions) {
        tracing_subscriber::registry()
            .with(filter)
            .with(stdout_layer)
            .try_init()
            .map_err(TracingError::Init)?;

        return Ok(LogFlusher { _guard: None });
    }

    let file_appender = rolling::daily(log_dir, app_name);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer)
        .json();

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .map_err(TracingError::Init)?;

    Ok(LogFlusher {
        _guard: Some(guard),
    })
}

/// Installs a test subscriber once per process, honouring `RUST_LOG`.
///
/// Output goes through the test writer so it is captured per test.
pub fn init_test_tracing() {
    INIT_TEST_TRACING.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_test_writer())
            .try_init();
    });
}
