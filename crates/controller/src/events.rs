use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use time::OffsetDateTime;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub level: Level,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Level {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Zone,
    Program,
    Scheduler,
    Supervisor,
    System,
}

/// Bounded history of state transitions, errors and corrective actions.
///
/// Every event is also emitted through `tracing`; the buffer only exists so
/// the status endpoint can show recent activity.
#[derive(Clone)]
pub struct EventLog {
    started_at: Instant,
    events: Arc<Mutex<VecDeque<SystemEvent>>>,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl EventLog {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            events: Arc::new(Mutex::new(VecDeque::with_capacity(MAX_EVENTS))),
        }
    }

    pub fn info(&self, kind: EventKind, detail: impl Into<String>) {
        let detail = detail.into();
        tracing::info!(kind = ?kind, "{detail}");
        self.push(Level::Info, kind, detail);
    }

    pub fn warn(&self, kind: EventKind, detail: impl Into<String>) {
        let detail = detail.into();
        tracing::warn!(kind = ?kind, "{detail}");
        self.push(Level::Warning, kind, detail);
    }

    pub fn error(&self, kind: EventKind, detail: impl Into<String>) {
        let detail = detail.into();
        tracing::error!(kind = ?kind, "{detail}");
        self.push(Level::Error, kind, detail);
    }

    /// Most recent first.
    pub fn recent(&self) -> Vec<SystemEvent> {
        self.lock().iter().rev().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Drop all but the newest `keep` events and release the spare capacity.
    /// Returns how many were discarded.
    pub fn trim(&self, keep: usize) -> usize {
        let mut events = self.lock();
        let excess = events.len().saturating_sub(keep);
        events.drain(..excess);
        events.shrink_to_fit();
        excess
    }

    fn push(&self, level: Level, kind: EventKind, detail: String) {
        let mut events = self.lock();
        if events.len() >= MAX_EVENTS {
            events.pop_front();
        }
        events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            level,
            kind,
            detail,
        });
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<SystemEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recent_is_newest_first() {
        let log = EventLog::new();
        log.info(EventKind::System, "first");
        log.warn(EventKind::Zone, "second");
        let recent = log.recent();
        assert_eq!(recent[0].detail, "second");
        assert_eq!(recent[0].level, Level::Warning);
        assert_eq!(recent[1].detail, "first");
    }

    #[test]
    fn ring_buffer_is_bounded() {
        let log = EventLog::new();
        for i in 0..(MAX_EVENTS + 25) {
            log.info(EventKind::System, format!("event {i}"));
        }
        assert_eq!(log.len(), MAX_EVENTS);
        assert_eq!(log.recent()[0].detail, format!("event {}", MAX_EVENTS + 24));
    }

    #[test]
    fn trim_keeps_newest() {
        let log = EventLog::new();
        for i in 0..10 {
            log.error(EventKind::Program, format!("e{i}"));
        }
        assert_eq!(log.trim(3), 7);
        let recent = log.recent();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[2].detail, "e7");
    }

    #[test]
    fn event_serializes_with_level_and_kind() {
        let log = EventLog::new();
        log.warn(EventKind::Supervisor, "zone 2 forced off");
        let json = serde_json::to_value(&log.recent()[0]).unwrap();
        assert_eq!(json["level"], "WARNING");
        assert_eq!(json["kind"], "supervisor");
        assert!(json["ts"].is_string());
    }
}
