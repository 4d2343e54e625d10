//! depwatch structured logging.
//!
//! [`Logger`] is the user-facing record stream (stdout, JSON or console lines)
//! carrying namespace/deployment context. Library diagnostics from kube-rs and
//! the HTTP stack go through `tracing`, initialised by [`init_tracing`].

#![forbid(unsafe_code)]

use std::str::FromStr;

mod fields;
mod logger;
mod sink;

pub use fields::{FieldValue, Fields};
pub use logger::{Logger, SERVICE_NAME};
pub use sink::{Format, LogEvent, MemorySink, Sink, WriterSink};

/// Environment variable selecting the logging mode.
pub const MODE_ENV: &str = "ENV";

/// Environment variable holding the `tracing` filter for library diagnostics.
pub const TRACING_ENV: &str = "DEPWATCH_LOG";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Fatal => "fatal",
        }
    }

    pub fn glyph(self) -> &'static str {
        match self {
            Level::Debug => "🔍",
            Level::Info => "ℹ️",
            Level::Warn => "⚠️",
            Level::Error => "❌",
            Level::Fatal => "💀",
        }
    }
}

/// Production-like or development-like logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Production,
    Development,
}

impl Mode {
    /// Unrecognized or missing values select development.
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
            Some("prod") | Some("production") => Mode::Production,
            _ => Mode::Development,
        }
    }

    pub fn from_env() -> Self {
        Self::parse(std::env::var(MODE_ENV).ok().as_deref())
    }

    pub fn name(self) -> &'static str {
        match self {
            Mode::Production => "production",
            Mode::Development => "development",
        }
    }

    pub fn min_level(self) -> Level {
        match self {
            Mode::Production => Level::Info,
            Mode::Development => Level::Debug,
        }
    }

    pub fn format(self) -> Format {
        match self {
            Mode::Production => Format::Json,
            Mode::Development => Format::Console,
        }
    }
}

/// Install the global `tracing` subscriber (stderr). Safe to call more than once.
pub fn init_tracing(mode: Mode) {
    let env = std::env::var(TRACING_ENV).unwrap_or_else(|_| "warn".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);
    let res = match mode {
        Mode::Production => builder.json().try_init(),
        Mode::Development => builder.try_init(),
    };
    if let Err(e) = res {
        tracing::debug!(error = %e, "tracing subscriber already installed");
    }
}
