use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::device::DeviceId;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// Ephemeral bookkeeping for the status surface: what the controller last
/// reported and a rolling log of what happened.
pub struct SystemState {
    pub started_at: Instant,
    pub last_runtimes: LastRuntimes,
    pub frames_received: u64,
    pub events: VecDeque<SystemEvent>,
}

/// Most recent runtime seen on the wire per device, for point-in-time display.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LastRuntimes {
    pub motor: u32,
    pub light: u32,
}

impl LastRuntimes {
    fn set(&mut self, device: DeviceId, runtime_sec: u32) {
        match device {
            DeviceId::Motor => self.motor = runtime_sec,
            DeviceId::Light => self.light = runtime_sec,
        }
    }
}

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Frame,
    Relay,
    Serial,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl SystemState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            last_runtimes: LastRuntimes::default(),
            frames_received: 0,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn shared() -> SharedState {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Record a telemetry frame that was committed to the usage store.
    pub fn record_frame(&mut self, device: DeviceId, runtime_sec: u32) {
        self.last_runtimes.set(device, runtime_sec);
        self.frames_received += 1;
        self.push_event(EventKind::Frame, format!("{device}: ran {runtime_sec}s"));
    }

    /// Record a relay change confirmed by a successful send.
    pub fn record_relay(&mut self, device: DeviceId, on: bool) {
        let state_str = if on { "ON" } else { "OFF" };
        self.push_event(EventKind::Relay, format!("{device} set {state_str}"));
    }

    pub fn record_serial(&mut self, detail: String) {
        self.push_event(EventKind::Serial, detail);
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Events, newest first.
    pub fn recent_events(&self) -> Vec<SystemEvent> {
        self.events.iter().rev().cloned().collect()
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

impl Default for SystemState {
    fn default() -> Self {
        Self::new()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_frame_updates_last_runtime() {
        let mut st = SystemState::new();
        st.record_frame(DeviceId::Motor, 42);
        st.record_frame(DeviceId::Motor, 7);
        st.record_frame(DeviceId::Light, 3);

        assert_eq!(st.last_runtimes.motor, 7);
        assert_eq!(st.last_runtimes.light, 3);
        assert_eq!(st.frames_received, 3);
    }

    #[test]
    fn recent_events_are_newest_first() {
        let mut st = SystemState::new();
        st.record_system("hub started".into());
        st.record_relay(DeviceId::Light, true);

        let events = st.recent_events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventKind::Relay);
        assert_eq!(events[0].detail, "light set ON");
        assert_eq!(events[1].kind, EventKind::System);
    }

    #[test]
    fn ring_buffer_is_bounded() {
        let mut st = SystemState::new();
        for i in 0..(MAX_EVENTS + 25) {
            st.record_error(format!("e{i}"));
        }
        assert_eq!(st.events.len(), MAX_EVENTS);
        assert_eq!(st.events.front().unwrap().detail, "e25");
        assert_eq!(
            st.recent_events()[0].detail,
            format!("e{}", MAX_EVENTS + 24)
        );
    }

    #[test]
    fn event_serializes_with_lowercase_kind() {
        let mut st = SystemState::new();
        st.record_serial("serial port opened: fake0".into());
        let json = serde_json::to_value(st.recent_events()).unwrap();
        assert_eq!(json[0]["kind"], "serial");
        assert!(json[0]["ts"].is_string());
    }
}
