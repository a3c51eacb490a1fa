use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

pub fn shared() -> SharedState {
    Arc::new(RwLock::new(SystemState::new()))
}

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// Ephemeral activity feed for operators. The database stays the source of
/// truth for plot state.
pub struct SystemState {
    pub started_at: Instant,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub plot_id: Option<i64>,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Irrigation,
    Retry,
    Alert,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl SystemState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn record_irrigation(&mut self, plot_id: i64, detail: String) {
        self.push_event(EventKind::Irrigation, Some(plot_id), detail);
    }

    pub fn record_retry(&mut self, plot_id: i64, detail: String) {
        self.push_event(EventKind::Retry, Some(plot_id), detail);
    }

    pub fn record_alert(&mut self, plot_id: i64, detail: String) {
        self.push_event(EventKind::Alert, Some(plot_id), detail);
    }

    pub fn record_error(&mut self, plot_id: Option<i64>, detail: String) {
        self.push_event(EventKind::Error, plot_id, detail);
    }

    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, None, detail);
    }

    /// Events for one plot, oldest first.
    pub fn plot_events(&self, plot_id: i64) -> Vec<&SystemEvent> {
        self.events
            .iter()
            .filter(|e| e.plot_id == Some(plot_id))
            .collect()
    }

    /// Build the JSON-serialisable status snapshot, newest event first.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, plot_id: Option<i64>, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            plot_id,
            detail,
        });
    }
}

impl Default for SystemState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_buffer_drops_oldest() {
        let mut st = SystemState::new();
        for i in 0..(MAX_EVENTS + 5) {
            st.record_system(format!("event {i}"));
        }
        assert_eq!(st.events.len(), MAX_EVENTS);
        assert_eq!(st.events.front().unwrap().detail, "event 5");
    }

    #[test]
    fn status_lists_newest_first() {
        let mut st = SystemState::new();
        st.record_irrigation(1, "first".into());
        st.record_alert(1, "second".into());
        let status = st.to_status();
        assert_eq!(status.events[0].detail, "second");
        assert_eq!(status.events[0].kind, EventKind::Alert);
    }

    #[test]
    fn plot_events_filters_by_plot() {
        let mut st = SystemState::new();
        st.record_retry(1, "a".into());
        st.record_retry(2, "b".into());
        st.record_system("c".into());
        let events = st.plot_events(2);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].detail, "b");
    }
}
