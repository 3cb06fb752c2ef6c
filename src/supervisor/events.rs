//! Capped ring of operational events, consumed by the external admin API.

use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::SystemTime;

use serde::Serialize;

/// Ring capacity; older events are discarded.
const MAX_EVENTS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Ban,
    Unblock,
    UnblockAll,
    DrainOn,
    DrainOff,
    OverloadStart,
    OverloadEnd,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Ban => "ban",
            EventKind::Unblock => "unblock",
            EventKind::UnblockAll => "unblock_all",
            EventKind::DrainOn => "drain_on",
            EventKind::DrainOff => "drain_off",
            EventKind::OverloadStart => "overload_start",
            EventKind::OverloadEnd => "overload_end",
        }
    }
}

/// One operational event.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub at: SystemTime,
    pub kind: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<IpAddr>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub detail: String,
}

/// Thread-safe event ring.
pub struct EventLog {
    inner: Mutex<VecDeque<Event>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(MAX_EVENTS)),
        }
    }

    pub fn push(&self, kind: EventKind, ip: Option<IpAddr>, detail: impl Into<String>) {
        let mut events = self.inner.lock().expect("event log lock poisoned");
        if events.len() == MAX_EVENTS {
            events.pop_front();
        }
        events.push_back(Event {
            at: SystemTime::now(),
            kind,
            ip,
            detail: detail.into(),
        });
    }

    pub fn snapshot(&self) -> Vec<Event> {
        self.inner
            .lock()
            .expect("event log lock poisoned")
            .iter()
            .cloned()
            .collect()
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_caps_at_max_events() {
        let log = EventLog::new();
        for i in 0..(MAX_EVENTS + 50) {
            log.push(EventKind::Ban, None, format!("{i}"));
        }
        let events = log.snapshot();
        assert_eq!(events.len(), MAX_EVENTS);
        // Oldest entries were discarded.
        assert_eq!(events[0].detail, "50");
    }
}
