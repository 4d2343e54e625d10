use std::io::{self, Write};
use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

use crate::{Fields, Level};

/// One emitted log record. Built per call, never mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEvent {
    pub level: Level,
    pub message: String,
    pub fields: Fields,
    pub timestamp: DateTime<Utc>,
}

/// Output rendering of a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// One JSON object per line, RFC3339 timestamps.
    Json,
    /// `HH:MM:SS <glyph> message key=value ...`
    Console,
}

impl Format {
    /// Render a record as a single newline-terminated line.
    pub fn render(self, event: &LogEvent) -> String {
        match self {
            Format::Json => {
                let mut line = serde_json::to_string(&JsonRecord(event))
                    .unwrap_or_else(|e| format!(r#"{{"level":"error","message":"unrenderable log record: {e}"}}"#));
                line.push('\n');
                line
            }
            Format::Console => {
                let mut line = format!(
                    "{} {} {}",
                    event.timestamp.format("%H:%M:%S"),
                    event.level.glyph(),
                    event.message
                );
                for (k, v) in event.fields.iter() {
                    line.push(' ');
                    line.push_str(k);
                    line.push('=');
                    line.push_str(&v.to_string());
                }
                line.push('\n');
                line
            }
        }
    }
}

struct JsonRecord<'a>(&'a LogEvent);

impl Serialize for JsonRecord<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let ev = self.0;
        let mut map = serializer.serialize_map(Some(ev.fields.len() + 3))?;
        map.serialize_entry("level", ev.level.as_str())?;
        map.serialize_entry("time", &ev.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true))?;
        map.serialize_entry("message", &ev.message)?;
        for (k, v) in ev.fields.iter() {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

/// Destination for log records. Implementations must write each record atomically.
pub trait Sink: Send + Sync {
    fn emit(&self, event: &LogEvent);
}

/// Renders records and writes them to a shared writer, one `write_all` per record.
pub struct WriterSink<W> {
    format: Format,
    out: Mutex<W>,
}

impl<W: Write + Send> WriterSink<W> {
    pub fn new(format: Format, out: W) -> Self {
        Self { format, out: Mutex::new(out) }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner().unwrap_or_else(|e| e.into_inner())
    }
}

impl WriterSink<io::Stdout> {
    pub fn stdout(format: Format) -> Self {
        Self::new(format, io::stdout())
    }
}

impl<W: Write + Send> Sink for WriterSink<W> {
    fn emit(&self, event: &LogEvent) {
        let line = self.format.render(event);
        let mut out = self.out.lock().unwrap_or_else(|e| e.into_inner());
        // Best effort: a broken stdout must not take the caller down.
        let _ = out.write_all(line.as_bytes());
        let _ = out.flush();
    }
}

/// Keeps records in memory; used by tests and embedders that inspect output.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<LogEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LogEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Sink for MemorySink {
    fn emit(&self, event: &LogEvent) {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).push(event.clone());
    }
}
