//! Compact, displayable log of protocol traffic.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSource {
    Client,
    Server,
}

/// One log entry. `count` is `None` for a single event and otherwise the
/// number of consecutive same-type events it stands for.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RealtimeEvent {
    pub time: DateTime<Utc>,
    pub source: EventSource,
    pub count: Option<u32>,
    pub event: Value,
}

impl RealtimeEvent {
    pub fn new(source: EventSource, event: Value) -> Self {
        Self::at(Utc::now(), source, event)
    }

    pub fn at(time: DateTime<Utc>, source: EventSource, event: Value) -> Self {
        Self {
            time,
            source,
            count: None,
            event,
        }
    }

    pub fn kind(&self) -> &str {
        self.event.get("type").and_then(Value::as_str).unwrap_or_default()
    }
}

/// Folds `event` into `entries`: a run of events with the same type tag
/// collapses into the last entry, anything else is appended.
pub fn collapse(entries: &mut Vec<RealtimeEvent>, event: RealtimeEvent) {
    match entries.last_mut() {
        Some(last) if last.kind() == event.kind() => {
            last.count = Some(last.count.unwrap_or(1) + 1);
        }
        _ => entries.push(event),
    }
}

/// Formats `time` relative to `start` as `mm:ss.hh`.
pub fn format_elapsed(start: DateTime<Utc>, time: DateTime<Utc>) -> String {
    let delta = (time - start).num_milliseconds().max(0);
    let hundredths = (delta / 10) % 100;
    let seconds = (delta / 1000) % 60;
    let minutes = (delta / 60_000) % 60;
    format!("{minutes:02}:{seconds:02}.{hundredths:02}")
}

#[derive(Debug, Clone)]
pub struct EventLog {
    started: DateTime<Utc>,
    entries: Vec<RealtimeEvent>,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl EventLog {
    pub fn new(started: DateTime<Utc>) -> Self {
        Self {
            started,
            entries: Vec::new(),
        }
    }

    pub fn record(&mut self, source: EventSource, event: Value) {
        collapse(&mut self.entries, RealtimeEvent::new(source, event));
    }

    pub fn entries(&self) -> &[RealtimeEvent] {
        &self.entries
    }

    pub fn started(&self) -> DateTime<Utc> {
        self.started
    }

    /// Drops every entry and restarts the relative clock.
    pub fn reset(&mut self, started: DateTime<Utc>) {
        self.started = started;
        self.entries.clear();
    }

    /// One line per entry: elapsed time, source, type and repetition count.
    pub fn lines(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|entry| {
                let source = match entry.source {
                    EventSource::Client => "client",
                    EventSource::Server => "server",
                };
                let mut line = format!("{} {:<6} {}", format_elapsed(self.started, entry.time), source, entry.kind());
                if let Some(count) = entry.count {
                    line.push_str(&format!(" ({count})"));
                }
                line
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use serde_json::json;

    fn event(kind: &str) -> RealtimeEvent {
        RealtimeEvent::new(EventSource::Server, json!({ "type": kind }))
    }

    #[test]
    fn test_run_of_same_type_collapses_with_count() {
        let mut entries = Vec::new();
        for _ in 0..5 {
            collapse(&mut entries, event("response.audio.delta"));
        }
        collapse(&mut entries, event("error"));

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].count, Some(5));
        assert_eq!(entries[1].count, None);
        assert_eq!(entries[1].kind(), "error");
    }

    #[test]
    fn test_interleaved_types_do_not_collapse() {
        let mut entries = Vec::new();
        collapse(&mut entries, event("a"));
        collapse(&mut entries, event("b"));
        collapse(&mut entries, event("a"));
        assert_eq!(entries.len(), 3);
        assert!(entries.iter().all(|e| e.count.is_none()));
    }

    #[test]
    fn test_source_does_not_split_runs() {
        let mut log = EventLog::default();
        log.record(EventSource::Client, json!({ "type": "input_audio_buffer.append" }));
        log.record(EventSource::Client, json!({ "type": "input_audio_buffer.append" }));
        assert_eq!(log.entries().len(), 1);
        assert_eq!(log.entries()[0].count, Some(2));
        assert_eq!(log.entries()[0].source, EventSource::Client);
    }

    #[test]
    fn test_format_elapsed() {
        let start = Utc::now();
        let time = start + TimeDelta::milliseconds(61_234);
        assert_eq!(format_elapsed(start, time), "01:01.23");
        assert_eq!(format_elapsed(time, start), "00:00.00");
    }

    #[test]
    fn test_reset_clears_entries() {
        let mut log = EventLog::default();
        log.record(EventSource::Server, json!({ "type": "session.created" }));
        assert_eq!(log.lines().len(), 1);
        assert!(log.lines()[0].contains("server session.created"));
        log.reset(Utc::now());
        assert!(log.entries().is_empty());
    }
}
