//! Change events for external integrations.
//!
//! Events are emitted as JSON lines to stdout or appended to a file. They
//! describe what a command changed; subscribers of the combined task store
//! get the full view instead.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{Error, Result};
use crate::occurrence::{FieldValue, TaskField};
use crate::reconcile::ReconcileReport;

pub const EVENT_SCHEMA_VERSION: &str = "recur.event.v1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventDestination {
    Stdout,
    File(PathBuf),
}

impl EventDestination {
    pub fn parse(raw: Option<&str>) -> Option<Self> {
        raw.and_then(|value| {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                return None;
            }
            if trimmed == "-" {
                return Some(EventDestination::Stdout);
            }
            Some(EventDestination::File(PathBuf::from(trimmed)))
        })
    }

    pub fn open(&self) -> Result<EventSink> {
        match self {
            EventDestination::Stdout => Ok(EventSink::stdout()),
            EventDestination::File(path) => EventSink::file(path),
        }
    }
}

/// Event kinds emitted by recur
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    OccurrenceWritten,
    OccurrenceDeleted,
    TemplateAdded,
    TemplateUpdated,
    TemplateRemoved,
    OverrideSet,
    Reconciled,
}

/// A structured event with optional payload
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub schema_version: &'static str,
    pub event: EventKind,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Event {
    pub fn new(event: EventKind, id: Option<String>) -> Self {
        Self {
            schema_version: EVENT_SCHEMA_VERSION,
            event,
            timestamp: Utc::now(),
            id,
            data: None,
        }
    }

    /// Attach a serializable payload
    pub fn with_data<T: Serialize>(mut self, data: T) -> Result<Self> {
        self.data = Some(serde_json::to_value(data)?);
        Ok(self)
    }

    pub fn override_set(occurrence_id: &str, field: TaskField, value: &FieldValue) -> Result<Self> {
        Event::new(EventKind::OverrideSet, Some(occurrence_id.to_string())).with_data(
            serde_json::json!({
                "field": field,
                "value": value,
            }),
        )
    }

    /// One event per written or deleted occurrence, then a summary
    pub fn from_reconcile(report: &ReconcileReport) -> Result<Vec<Self>> {
        let mut events: Vec<Self> = report
            .written
            .iter()
            .map(|id| Event::new(EventKind::OccurrenceWritten, Some(id.clone())))
            .chain(
                report
                    .deleted
                    .iter()
                    .map(|id| Event::new(EventKind::OccurrenceDeleted, Some(id.clone()))),
            )
            .collect();
        events.push(Event::new(EventKind::Reconciled, None).with_data(serde_json::json!({
            "instance_count": report.instance_count,
            "regenerated": report.regenerated,
            "cascaded": report.cascaded,
            "removed": report.removed,
            "failures": report.failures.len(),
        }))?);
        Ok(events)
    }
}

/// Event sink that writes JSONL output to a destination
pub struct EventSink {
    writer: Box<dyn Write + Send>,
}

impl EventSink {
    pub fn stdout() -> Self {
        Self {
            writer: Box::new(std::io::stdout()),
        }
    }

    /// Append to a file, creating it if necessary
    pub fn file(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            writer: Box::new(file),
        })
    }

    /// Write a single event as JSONL
    pub fn emit(&mut self, event: &Event) -> Result<()> {
        let serialized = serde_json::to_vec(event)?;
        self.writer.write_all(&serialized)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush().map_err(Error::Io)?;
        Ok(())
    }

    pub fn emit_all(&mut self, events: &[Event]) -> Result<()> {
        for event in events {
            self.emit(event)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destination_parsing() {
        assert_eq!(EventDestination::parse(Some("-")), Some(EventDestination::Stdout));
        assert_eq!(EventDestination::parse(Some("  ")), None);
        assert_eq!(
            EventDestination::parse(Some("out.jsonl")),
            Some(EventDestination::File(PathBuf::from("out.jsonl")))
        );
    }

    #[test]
    fn file_sink_appends_jsonl() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("events.jsonl");
        let mut sink = EventSink::file(&path).expect("sink");
        let event = Event::override_set("T1#2024-01-15", TaskField::Completed, &FieldValue::Flag(true))
            .expect("event");
        sink.emit(&event).expect("emit");
        sink.emit(&Event::new(EventKind::TemplateRemoved, Some("T1".to_string())))
            .expect("emit");

        let content = std::fs::read_to_string(&path).expect("read");
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|line| serde_json::from_str(line).expect("json line"))
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["schema_version"], EVENT_SCHEMA_VERSION);
        assert_eq!(lines[0]["event"], "override_set");
        assert_eq!(lines[0]["data"]["field"], "completed");
        assert_eq!(lines[0]["data"]["value"]["value"], true);
        assert_eq!(lines[1]["id"], "T1");
    }
}
