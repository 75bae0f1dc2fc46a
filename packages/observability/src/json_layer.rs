//! JSONL layer for sync tooling.
//!
//! One object per event. Fields named `conversation` and `channel` are
//! lifted to the top level so a single `jq 'select(.conversation == ...)'`
//! follows one chat across reconnects and polls; everything else lands in
//! `fields`.

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;
use std::io::Write;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

const LIFTED: [&str; 2] = ["conversation", "channel"];

/// A single JSONL line.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub ts: String,
    pub level: &'static str,
    pub service: String,
    pub pid: u32,
    pub target: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub fields: Map<String, Value>,
    /// Enclosing spans, outermost first.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub spans: Vec<&'static str>,
}

#[derive(Default)]
struct Collected {
    message: String,
    lifted: [Option<String>; 2],
    fields: Map<String, Value>,
}

impl Collected {
    fn put(&mut self, field: &Field, value: Value) {
        let name = field.name();
        if name == "message" {
            self.message = match value {
                Value::String(s) => s,
                other => other.to_string(),
            };
            return;
        }
        if let Some(slot) = LIFTED.iter().position(|lifted| *lifted == name) {
            self.lifted[slot] = Some(match value {
                Value::String(s) => s,
                other => other.to_string(),
            });
            return;
        }
        self.fields.insert(name.to_string(), value);
    }
}

impl Visit for Collected {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.put(field, Value::String(format!("{value:?}")));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field, Value::from(value));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field, Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field, Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field, Value::from(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        // NaN and infinities have no JSON number form.
        let value = serde_json::Number::from_f64(value)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(value.to_string()));
        self.put(field, value);
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.put(field, Value::String(value.to_string()));
    }
}

/// Layer writing [`LogEntry`] lines to `make_writer`.
pub struct JsonLayer<W> {
    service: String,
    pid: u32,
    make_writer: W,
}

impl<W> JsonLayer<W> {
    pub fn new(service: impl Into<String>, make_writer: W) -> Self {
        Self {
            service: service.into(),
            pid: std::process::id(),
            make_writer,
        }
    }

    fn entry(&self, event: &Event<'_>, spans: Vec<&'static str>) -> LogEntry {
        let mut collected = Collected::default();
        event.record(&mut collected);
        let [conversation, channel] = collected.lifted;
        let meta = event.metadata();
        LogEntry {
            ts: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            level: meta.level().as_str(),
            service: self.service.clone(),
            pid: self.pid,
            target: meta.target().to_string(),
            message: collected.message,
            conversation,
            channel,
            fields: collected.fields,
            spans,
        }
    }
}

impl<S, W> Layer<S> for JsonLayer<W>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'writer> MakeWriter<'writer> + 'static,
{
    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let spans = ctx
            .event_scope(event)
            .map(|scope| scope.from_root().map(|span| span.name()).collect())
            .unwrap_or_default();

        let Ok(mut line) = serde_json::to_vec(&self.entry(event, spans)) else {
            return;
        };
        line.push(b'\n');
        let _ = self.make_writer.make_writer().write_all(&line);
    }
}
