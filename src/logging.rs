use std::env;
use std::sync::Once;

use tracing_subscriber::EnvFilter;

/// Environment variable holding the log level (`ERROR` .. `TRACE`).
pub const LOG_LEVEL_ENV: &str = "S3_CLUSTER_LOG_LEVEL";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    pub fn parse(s: &str) -> LogLevel {
        match s.trim().to_uppercase().as_str() {
            "ERROR" => LogLevel::Error,
            "WARN" | "WARNING" => LogLevel::Warn,
            "INFO" => LogLevel::Info,
            "DEBUG" => LogLevel::Debug,
            "TRACE" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    }

    pub fn current() -> LogLevel {
        env::var(LOG_LEVEL_ENV)
            .map(|s| LogLevel::parse(&s))
            .unwrap_or(LogLevel::Info)
    }

    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

static INIT: Once = Once::new();

/// Install the global `tracing` subscriber, writing to stderr.
///
/// Safe to call more than once; only the first call has an effect, and an
/// already-installed subscriber (e.g. from the embedding application) is left
/// in place.
pub fn init() {
    INIT.call_once(|| {
        let filter = EnvFilter::new(format!("s3_cluster={}", LogLevel::current().as_filter()));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .try_init();
    });
}

/// Emit one event with `key=value` context rendered in front of the message.
pub fn log_with_context(level: LogLevel, category: &str, context: &[(&str, &str)], message: &str) {
    let ctx_str = context
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(" ");
    match level {
        LogLevel::Error => tracing::error!(category, "[{}] {}", ctx_str, message),
        LogLevel::Warn => tracing::warn!(category, "[{}] {}", ctx_str, message),
        LogLevel::Info => tracing::info!(category, "[{}] {}", ctx_str, message),
        LogLevel::Debug => tracing::debug!(category, "[{}] {}", ctx_str, message),
        LogLevel::Trace => tracing::trace!(category, "[{}] {}", ctx_str, message),
    }
}

#[macro_export]
macro_rules! cluster_error {
    ($category:expr, $($arg:tt)*) => {
        ::tracing::error!(category = $category, "{}", format!($($arg)*))
    };
}

#[macro_export]
macro_rules! cluster_warn {
    ($category:expr, $($arg:tt)*) => {
        ::tracing::warn!(category = $category, "{}", format!($($arg)*))
    };
}

#[macro_export]
macro_rules! cluster_info {
    ($category:expr, $($arg:tt)*) => {
        ::tracing::info!(category = $category, "{}", format!($($arg)*))
    };
}

#[macro_export]
macro_rules! cluster_debug {
    ($category:expr, $($arg:tt)*) => {
        ::tracing::debug!(category = $category, "{}", format!($($arg)*))
    };
}

#[macro_export]
macro_rules! cluster_trace {
    ($category:expr, $($arg:tt)*) => {
        ::tracing::trace!(category = $category, "{}", format!($($arg)*))
    };
}
