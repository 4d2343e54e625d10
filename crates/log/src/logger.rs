use std::fmt;
use std::sync::Arc;

use chrono::Utc;

use crate::sink::{LogEvent, Sink, WriterSink};
use crate::{Fields, FieldValue, Level, Mode};

/// Service identifier attached to every record.
pub const SERVICE_NAME: &str = "depwatch";

/// Leveled logger carrying a set of base fields.
///
/// Deriving (`with_field`, `with_namespace`, `with_deployment`) copies the
/// base fields into a new logger that shares the sink; the receiver is never
/// modified.
#[derive(Clone)]
pub struct Logger {
    base: Arc<Fields>,
    sink: Arc<dyn Sink>,
    min_level: Level,
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger").field("base", &self.base).field("min_level", &self.min_level).finish()
    }
}

impl Logger {
    /// Logger for the mode selected by the `ENV` variable, writing to stdout.
    pub fn from_env() -> Self {
        Self::for_mode(Mode::from_env())
    }

    pub fn for_mode(mode: Mode) -> Self {
        Self::with_sink(mode, Arc::new(WriterSink::stdout(mode.format())))
    }

    pub fn with_sink(mode: Mode, sink: Arc<dyn Sink>) -> Self {
        let base = crate::fields! { "service" => SERVICE_NAME, "environment" => mode.name() };
        Self { base: Arc::new(base), sink, min_level: mode.min_level() }
    }

    pub fn fields(&self) -> &Fields {
        &self.base
    }

    pub fn enabled(&self, level: Level) -> bool {
        level >= self.min_level
    }

    pub fn with_field(&self, key: impl Into<String>, value: impl Into<FieldValue>) -> Logger {
        let mut base = (*self.base).clone();
        base.insert(key, value);
        Logger { base: Arc::new(base), sink: Arc::clone(&self.sink), min_level: self.min_level }
    }

    pub fn with_namespace(&self, namespace: &str) -> Logger {
        self.with_field("namespace", namespace)
    }

    pub fn with_deployment(&self, name: &str) -> Logger {
        self.with_field("deployment", name)
    }

    /// Emit one record with `base ∪ fields` (call-site fields win).
    pub fn log(&self, level: Level, message: &str, fields: Fields) {
        if !self.enabled(level) {
            return;
        }
        let event = LogEvent {
            level,
            message: message.to_string(),
            fields: self.base.merged(&fields),
            timestamp: Utc::now(),
        };
        self.sink.emit(&event);
    }

    pub fn debug(&self, message: &str, fields: Fields) {
        self.log(Level::Debug, message, fields)
    }

    pub fn info(&self, message: &str, fields: Fields) {
        self.log(Level::Info, message, fields)
    }

    pub fn warn(&self, message: &str, fields: Fields) {
        self.log(Level::Warn, message, fields)
    }

    pub fn error(&self, message: &str, err: Option<&dyn fmt::Display>, fields: Fields) {
        self.log(Level::Error, message, with_error(fields, err))
    }

    /// Emit a Fatal record. Terminating the process is left to the binary's
    /// driver, which must do so right after this call.
    pub fn fatal(&self, message: &str, err: Option<&dyn fmt::Display>, fields: Fields) {
        self.log(Level::Fatal, message, with_error(fields, err))
    }
}

fn with_error(mut fields: Fields, err: Option<&dyn fmt::Display>) -> Fields {
    if let Some(err) = err {
        // `{:#}` prints the whole context chain for anyhow errors
        fields.insert("error", format!("{err:#}"));
    }
    fields
}
