//! User-visible events about reconciliation outcomes.
//!
//! Events are always logged via tracing under the `events` target. Recorders
//! may additionally keep or forward them.

use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::resource::ResourceKey;

/// Severity of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

/// A recorded event.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub kind: &'static str,
    pub key: ResourceKey,
    pub event_type: EventType,
    pub reason: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Sink for reconciliation events.
pub trait EventRecorder: Send + Sync {
    fn record(&self, event: Event);

    fn normal(&self, kind: &'static str, key: &ResourceKey, reason: &str, message: &str) {
        self.record(Event::new(kind, key, EventType::Normal, reason, message));
    }

    fn warning(&self, kind: &'static str, key: &ResourceKey, reason: &str, message: &str) {
        self.record(Event::new(kind, key, EventType::Warning, reason, message));
    }
}

impl Event {
    pub fn new(
        kind: &'static str,
        key: &ResourceKey,
        event_type: EventType,
        reason: &str,
        message: &str,
    ) -> Self {
        Self {
            kind,
            key: key.clone(),
            event_type,
            reason: reason.to_string(),
            message: message.to_string(),
            timestamp: Utc::now(),
        }
    }
}

fn log_event(event: &Event) {
    match event.event_type {
        EventType::Normal => {
            tracing::info!(target: "events", kind = event.kind, resource = %event.key, reason = %event.reason, "{}", event.message)
        }
        EventType::Warning => {
            tracing::warn!(target: "events", kind = event.kind, resource = %event.key, reason = %event.reason, "{}", event.message)
        }
    }
}

/// Recorder that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingRecorder;

impl EventRecorder for TracingRecorder {
    fn record(&self, event: Event) {
        log_event(&event);
    }
}

/// Recorder that logs and keeps every event (for tests and inspection).
#[derive(Debug, Default)]
pub struct MemoryRecorder {
    events: Mutex<Vec<Event>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// All events recorded so far.
    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Reasons of the events recorded for `key`, oldest first.
    pub fn reasons_for(&self, key: &ResourceKey) -> Vec<String> {
        self.events()
            .into_iter()
            .filter(|e| &e.key == key)
            .map(|e| e.reason)
            .collect()
    }
}

impl EventRecorder for MemoryRecorder {
    fn record(&self, event: Event) {
        log_event(&event);
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
